//! Settings persistence and platform paths for the desktop shell.

use std::path::{Path, PathBuf};

use services::process::DataPaths;
use shared::settings::ShellSettings;

const SETTINGS_FILE: &str = "shell.json";

pub const ENV_BACKEND_PROGRAM: &str = "DOCQA_BACKEND_PROGRAM";
pub const ENV_BACKEND_PORT: &str = "DOCQA_BACKEND_PORT";

fn project_dirs() -> Option<directories::ProjectDirs> {
    directories::ProjectDirs::from("com.local", "DocQA", "DocQA")
}

pub fn config_dir() -> Option<PathBuf> {
    project_dirs().map(|p| p.config_dir().to_path_buf())
}

pub fn config_path() -> Option<PathBuf> {
    config_dir().map(|dir| dir.join(SETTINGS_FILE))
}

/// Knowledge base and vector store live under here unless `data_dir` is set.
pub fn data_root(settings: &ShellSettings) -> PathBuf {
    if let Some(dir) = &settings.data_dir {
        return dir.clone();
    }
    project_dirs()
        .map(|p| p.data_dir().to_path_buf())
        .unwrap_or_else(|| PathBuf::from("data"))
}

pub fn data_paths(settings: &ShellSettings) -> DataPaths {
    let config = config_dir().unwrap_or_else(|| PathBuf::from("config"));
    DataPaths::new(&data_root(settings), &config)
}

/// Read settings from `path`; a missing or unreadable file gives defaults.
pub fn load_settings_from(path: &Path) -> ShellSettings {
    let bytes = match std::fs::read(path) {
        Ok(bytes) => bytes,
        Err(_) => return ShellSettings::default(),
    };
    match serde_json::from_slice(&bytes) {
        Ok(settings) => settings,
        Err(e) => {
            tracing::warn!("Ignoring unreadable {}: {}", path.display(), e);
            ShellSettings::default()
        }
    }
}

pub fn load_settings_or_default() -> ShellSettings {
    let mut settings = config_path()
        .map(|p| load_settings_from(&p))
        .unwrap_or_default();
    apply_env_overrides(&mut settings, |key| std::env::var(key).ok());
    settings
}

pub fn save_settings_to(path: &Path, settings: &ShellSettings) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(path, json)
}

pub fn save_settings(settings: &ShellSettings) {
    if let Some(path) = config_path() {
        if let Err(e) = save_settings_to(&path, settings) {
            tracing::warn!("Failed to save settings to {}: {}", path.display(), e);
        }
    }
}

/// Environment variables win over the settings file.
pub fn apply_env_overrides(settings: &mut ShellSettings, var: impl Fn(&str) -> Option<String>) {
    if let Some(program) = var(ENV_BACKEND_PROGRAM).filter(|p| !p.trim().is_empty()) {
        settings.service.program = program;
    }
    if let Some(port) = var(ENV_BACKEND_PORT) {
        match port.trim().parse::<u16>() {
            Ok(port) => settings.service.preferred_port = port,
            Err(_) => tracing::warn!("Ignoring {}={:?}: not a port", ENV_BACKEND_PORT, port),
        }
    }
}

/// Human-readable byte count for the file list.
pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KB", "MB", "GB"];
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", value, UNITS[unit])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn missing_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = load_settings_from(&dir.path().join("nope.json"));
        assert_eq!(settings.service.preferred_port, 8000);
        assert!(settings.dark_mode);
    }

    #[test]
    fn corrupt_file_gives_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(SETTINGS_FILE);
        std::fs::write(&path, "{not json").unwrap();
        assert_eq!(load_settings_from(&path).service.port_span, 100);
    }

    #[test]
    fn settings_survive_a_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join(SETTINGS_FILE);
        let mut settings = ShellSettings::default();
        settings.stream_idle_timeout_secs = Some(45);
        settings.dark_mode = false;
        save_settings_to(&path, &settings).unwrap();

        let loaded = load_settings_from(&path);
        assert_eq!(loaded.stream_idle_timeout_secs, Some(45));
        assert!(!loaded.dark_mode);
    }

    #[test]
    fn env_overrides_program_and_port() {
        let env: HashMap<&str, &str> = [
            (ENV_BACKEND_PROGRAM, "/opt/backend/run"),
            (ENV_BACKEND_PORT, "9300"),
        ]
        .into_iter()
        .collect();
        let mut settings = ShellSettings::default();
        apply_env_overrides(&mut settings, |k| env.get(k).map(|v| v.to_string()));
        assert_eq!(settings.service.program, "/opt/backend/run");
        assert_eq!(settings.service.preferred_port, 9300);
    }

    #[test]
    fn bad_port_override_is_ignored() {
        let mut settings = ShellSettings::default();
        apply_env_overrides(&mut settings, |k| {
            (k == ENV_BACKEND_PORT).then(|| "eighty".to_string())
        });
        assert_eq!(settings.service.preferred_port, 8000);
    }

    #[test]
    fn explicit_data_dir_is_used() {
        let mut settings = ShellSettings::default();
        settings.data_dir = Some(PathBuf::from("/srv/docqa"));
        let paths = data_paths(&settings);
        assert_eq!(paths.knowledge_base, PathBuf::from("/srv/docqa/knowledge_base"));
        assert_eq!(paths.vector_store, PathBuf::from("/srv/docqa/chroma_db"));
    }

    #[test]
    fn sizes_are_readable() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MB");
    }
}
