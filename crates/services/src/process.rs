//! Spawning the backend process and talking to it as a child.

use shared::settings::ServiceLaunchSettings;
use std::fmt;
use std::io;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};

/// Host the backend is told to bind.
pub const BACKEND_HOST: &str = "127.0.0.1";

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExitInfo {
    /// `None` when terminated by a signal.
    pub code: Option<i32>,
}

impl fmt::Display for ExitInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit code {}", code),
            None => f.write_str("terminated by signal"),
        }
    }
}

/// Directories handed to the backend through its environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataPaths {
    pub knowledge_base: PathBuf,
    pub vector_store: PathBuf,
    pub config: PathBuf,
}

impl DataPaths {
    pub fn new(data_root: &Path, config_dir: &Path) -> Self {
        Self {
            knowledge_base: data_root.join("knowledge_base"),
            vector_store: data_root.join("chroma_db"),
            config: config_dir.to_path_buf(),
        }
    }

    pub fn ensure(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.knowledge_base)?;
        std::fs::create_dir_all(&self.vector_store)?;
        std::fs::create_dir_all(&self.config)?;
        Ok(())
    }
}

/// Everything needed to spawn one instance of the backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchSpec {
    pub program: String,
    pub args: Vec<String>,
    pub working_dir: Option<PathBuf>,
    pub env: Vec<(String, String)>,
}

impl LaunchSpec {
    pub fn for_backend(settings: &ServiceLaunchSettings, paths: &DataPaths, port: u16) -> Self {
        let env = vec![
            ("BACKEND_PORT".to_string(), port.to_string()),
            ("BACKEND_HOST".to_string(), BACKEND_HOST.to_string()),
            (
                "KNOWLEDGE_BASE_DIR".to_string(),
                paths.knowledge_base.to_string_lossy().to_string(),
            ),
            (
                "CHROMA_DB_DIR".to_string(),
                paths.vector_store.to_string_lossy().to_string(),
            ),
            (
                "CONFIG_DIR".to_string(),
                paths.config.to_string_lossy().to_string(),
            ),
            ("PYTHONUNBUFFERED".to_string(), "1".to_string()),
        ];
        Self {
            program: settings.program.clone(),
            args: settings.args.clone(),
            working_dir: settings.working_dir.clone(),
            env,
        }
    }

    pub fn env_var(&self, key: &str) -> Option<&str> {
        self.env
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }
}

/// A running child. Only the supervisor holds one.
#[async_trait::async_trait]
pub trait ServiceProcess: Send {
    fn id(&self) -> Option<u32>;

    /// Resolves when the process exits on its own.
    async fn wait(&mut self) -> io::Result<ExitInfo>;

    /// Ask the process to exit, escalating to a kill after `grace`.
    async fn terminate(&mut self, grace: Duration) -> io::Result<ExitInfo>;
}

/// Creates child processes. A seam so the supervisor can be driven by fakes.
pub trait Launcher: Send + Sync {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ServiceProcess>>;
}

/// Spawns real OS processes with tokio, forwarding their output to tracing.
#[derive(Debug, Default, Clone, Copy)]
pub struct TokioLauncher;

impl Launcher for TokioLauncher {
    fn launch(&self, spec: &LaunchSpec) -> io::Result<Box<dyn ServiceProcess>> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(spec.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            // Reaped if the handle is dropped without a clean stop.
            .kill_on_drop(true);
        if let Some(dir) = &spec.working_dir {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn()?;
        tracing::info!(
            "Spawned {} {:?} (pid {:?})",
            spec.program,
            spec.args,
            child.id()
        );

        if let Some(out) = child.stdout.take() {
            tokio::spawn(pump_lines(out, false));
        }
        if let Some(err) = child.stderr.take() {
            tokio::spawn(pump_lines(err, true));
        }

        Ok(Box::new(ChildProcess { child }))
    }
}

async fn pump_lines<R: AsyncRead + Unpin>(reader: R, is_stderr: bool) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if is_stderr {
            tracing::warn!(target: "backend", "{}", line);
        } else {
            tracing::info!(target: "backend", "{}", line);
        }
    }
}

struct ChildProcess {
    child: Child,
}

impl ChildProcess {
    #[cfg(unix)]
    fn signal_term(&self) -> bool {
        let Some(pid) = self.child.id() else {
            return false;
        };
        // SAFETY: plain kill(2) on a pid we spawned and have not reaped yet.
        unsafe { libc::kill(pid as libc::pid_t, libc::SIGTERM) == 0 }
    }

    #[cfg(not(unix))]
    fn signal_term(&self) -> bool {
        false
    }
}

#[async_trait::async_trait]
impl ServiceProcess for ChildProcess {
    fn id(&self) -> Option<u32> {
        self.child.id()
    }

    async fn wait(&mut self) -> io::Result<ExitInfo> {
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
        })
    }

    async fn terminate(&mut self, grace: Duration) -> io::Result<ExitInfo> {
        if self.signal_term() {
            if let Ok(status) = tokio::time::timeout(grace, self.child.wait()).await {
                let status = status?;
                return Ok(ExitInfo {
                    code: status.code(),
                });
            }
            tracing::warn!("Service ignored SIGTERM for {:?}, killing", grace);
        }
        self.child.kill().await?;
        let status = self.child.wait().await?;
        Ok(ExitInfo {
            code: status.code(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_environment_carries_port_dirs_and_unbuffered_flag() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(&tmp.path().join("data"), &tmp.path().join("config"));
        let spec = LaunchSpec::for_backend(&ServiceLaunchSettings::default(), &paths, 8042);

        assert_eq!(spec.env_var("BACKEND_PORT"), Some("8042"));
        assert_eq!(spec.env_var("BACKEND_HOST"), Some("127.0.0.1"));
        assert_eq!(spec.env_var("PYTHONUNBUFFERED"), Some("1"));
        assert!(spec
            .env_var("KNOWLEDGE_BASE_DIR")
            .unwrap()
            .ends_with("knowledge_base"));
        assert!(spec.env_var("CHROMA_DB_DIR").unwrap().ends_with("chroma_db"));
        assert!(spec.env_var("CONFIG_DIR").unwrap().ends_with("config"));
    }

    #[test]
    fn ensure_creates_all_directories() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = DataPaths::new(&tmp.path().join("data"), &tmp.path().join("config"));
        paths.ensure().unwrap();
        assert!(paths.knowledge_base.is_dir());
        assert!(paths.vector_store.is_dir());
        assert!(paths.config.is_dir());
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn terminate_stops_a_real_child() {
        let spec = LaunchSpec {
            program: "sleep".into(),
            args: vec!["30".into()],
            working_dir: None,
            env: vec![],
        };
        let mut child = TokioLauncher.launch(&spec).unwrap();
        assert!(child.id().is_some());
        let exit = child.terminate(Duration::from_secs(2)).await.unwrap();
        // SIGTERM on sleep: killed by signal, no exit code.
        assert_eq!(exit.code, None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn wait_reports_exit_code() {
        let spec = LaunchSpec {
            program: "sh".into(),
            args: vec!["-c".into(), "exit 3".into()],
            working_dir: None,
            env: vec![],
        };
        let mut child = TokioLauncher.launch(&spec).unwrap();
        assert_eq!(child.wait().await.unwrap().code, Some(3));
    }
}
