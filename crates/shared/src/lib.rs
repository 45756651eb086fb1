pub mod error;
pub mod protocol;
pub mod status;

pub mod settings {
    use serde::{Deserialize, Serialize};
    use std::path::PathBuf;
    use std::time::Duration;

    fn default_program() -> String {
        if cfg!(windows) { "python".into() } else { "python3".into() }
    }

    fn default_args() -> Vec<String> {
        vec!["backend/start.py".into()]
    }

    /// How the backend process is launched and supervised.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ServiceLaunchSettings {
        pub program: String,
        pub args: Vec<String>,
        pub working_dir: Option<PathBuf>,
        /// First port tried; later ports are tried sequentially.
        pub preferred_port: u16,
        /// How many ports past `preferred_port` may be tried.
        pub port_span: u16,
        pub probe_interval_ms: u64,
        pub probe_attempts: u32,
        pub restart_delay_ms: u64,
        /// `None` restarts forever (default).
        pub max_restarts: Option<u32>,
        /// Multiplier applied to the restart delay per consecutive failure. 1.0 keeps it fixed.
        pub backoff_factor: f64,
        pub shutdown_grace_ms: u64,
    }

    impl ServiceLaunchSettings {
        pub fn probe_interval(&self) -> Duration {
            Duration::from_millis(self.probe_interval_ms)
        }

        pub fn restart_delay(&self) -> Duration {
            Duration::from_millis(self.restart_delay_ms)
        }

        pub fn shutdown_grace(&self) -> Duration {
            Duration::from_millis(self.shutdown_grace_ms)
        }
    }

    impl Default for ServiceLaunchSettings {
        fn default() -> Self {
            Self {
                program: default_program(),
                args: default_args(),
                working_dir: None,
                preferred_port: 8000,
                port_span: 100,
                probe_interval_ms: 1_000,
                probe_attempts: 30,
                restart_delay_ms: 5_000,
                max_restarts: None,
                backoff_factor: 1.0,
                shutdown_grace_ms: 5_000,
            }
        }
    }

    /// Desktop shell settings, stored as `shell.json` in the config dir.
    #[derive(Debug, Clone, Serialize, Deserialize)]
    #[serde(default)]
    pub struct ShellSettings {
        pub service: ServiceLaunchSettings,
        /// Abort a streamed answer when no bytes arrive for this long. Off by default.
        pub stream_idle_timeout_secs: Option<u64>,
        /// Overrides the platform data directory (knowledge base + vector store).
        pub data_dir: Option<PathBuf>,
        pub dark_mode: bool,
    }

    impl ShellSettings {
        /// Zero means off, same as an absent value.
        pub fn stream_idle_timeout(&self) -> Option<Duration> {
            self.stream_idle_timeout_secs
                .filter(|secs| *secs > 0)
                .map(Duration::from_secs)
        }
    }

    impl Default for ShellSettings {
        fn default() -> Self {
            Self {
                service: ServiceLaunchSettings::default(),
                stream_idle_timeout_secs: None,
                data_dir: None,
                dark_mode: true,
            }
        }
    }

    /// Retrieval/generation settings owned by the service (`GET /settings`).
    ///
    /// Opaque to the shell: edited in the settings window and sent back as-is.
    #[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
    pub struct ServiceSettings {
        pub ollama_base_url: String,
        pub embedding_model: String,
        pub llm_model: String,
        pub chunk_size: u32,
        pub chunk_overlap: u32,
        pub top_k_chunks: u32,
    }

    impl Default for ServiceSettings {
        fn default() -> Self {
            Self {
                ollama_base_url: "http://localhost:11434".into(),
                embedding_model: "nomic-embed-text".into(),
                llm_model: "phi4:14b-fp16".into(),
                chunk_size: 1500,
                chunk_overlap: 150,
                top_k_chunks: 10,
            }
        }
    }

    /// Partial update for `POST /settings`; absent fields are left unchanged.
    #[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
    pub struct SettingsUpdate {
        #[serde(skip_serializing_if = "Option::is_none")]
        pub ollama_base_url: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub embedding_model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub llm_model: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub chunk_size: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub chunk_overlap: Option<u32>,
        #[serde(skip_serializing_if = "Option::is_none")]
        pub top_k_chunks: Option<u32>,
    }

    impl SettingsUpdate {
        /// Only the fields that differ between `current` and `edited`.
        pub fn diff(current: &ServiceSettings, edited: &ServiceSettings) -> Self {
            fn changed<T: PartialEq + Clone>(a: &T, b: &T) -> Option<T> {
                (a != b).then(|| b.clone())
            }
            Self {
                ollama_base_url: changed(&current.ollama_base_url, &edited.ollama_base_url),
                embedding_model: changed(&current.embedding_model, &edited.embedding_model),
                llm_model: changed(&current.llm_model, &edited.llm_model),
                chunk_size: changed(&current.chunk_size, &edited.chunk_size),
                chunk_overlap: changed(&current.chunk_overlap, &edited.chunk_overlap),
                top_k_chunks: changed(&current.top_k_chunks, &edited.top_k_chunks),
            }
        }

        pub fn is_empty(&self) -> bool {
            *self == Self::default()
        }
    }

}
