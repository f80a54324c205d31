//! Configuration for the session tracking service
//!
//! Configuration is loaded in order of precedence:
//! 1. Environment variables (highest priority)
//! 2. Config file (~/.config/consultx/config.toml)
//! 3. Built-in defaults (lowest priority)

use serde::Deserialize;
use std::net::SocketAddr;
use std::path::PathBuf;

/// Version info
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Log file rotation strategy
#[derive(Debug, Clone, Default, PartialEq)]
pub enum LogRotation {
    /// Rotate log files hourly
    Hourly,
    /// Rotate log files daily (default)
    #[default]
    Daily,
    /// Never rotate - single log file
    Never,
}

impl LogRotation {
    pub fn parse(s: &str) -> Self {
        match s.to_lowercase().as_str() {
            "hourly" => Self::Hourly,
            "never" => Self::Never,
            _ => Self::Daily,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hourly => "hourly",
            Self::Daily => "daily",
            Self::Never => "never",
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Log level: trace, debug, info, warn, error
    pub level: String,
    /// Enable file logging in addition to stdout
    pub file_enabled: bool,
    /// Directory for log files
    pub file_dir: PathBuf,
    pub file_rotation: LogRotation,
    /// Prefix for log file names (e.g., "consultx" -> "consultx.2024-01-15.log")
    pub file_prefix: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            file_enabled: false,
            file_dir: PathBuf::from("./logs"),
            file_rotation: LogRotation::Daily,
            file_prefix: "consultx".to_string(),
        }
    }
}

/// External reply pipeline (RAG) settings
#[derive(Debug, Clone)]
pub struct RagConfig {
    /// Run the external pipeline on user messages
    pub enabled: bool,
    /// Store the pipeline's reply as an assistant message
    pub auto_reply: bool,
    /// ISO country code used for crisis hotline selection
    pub country_code: String,
    /// Model identifier forwarded to the pipeline
    pub model: String,
    /// Retrieval depth forwarded to the pipeline
    pub k: usize,
    /// Enforce guardrails locally on the pipeline's raw reply
    pub guardrails: bool,
    /// Pipeline endpoint URL; pipeline is disabled when unset
    pub endpoint: Option<String>,
    /// Per-request timeout for the pipeline call
    pub timeout_secs: u64,
}

impl Default for RagConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            auto_reply: true,
            country_code: "US".to_string(),
            model: "gemini-2.0-flash".to_string(),
            k: 2,
            guardrails: true,
            endpoint: None,
            timeout_secs: 30,
        }
    }
}

/// Application configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Address to bind the HTTP API to
    pub bind_addr: SocketAddr,
    /// SQLite database file
    pub db_path: PathBuf,
    /// Rolling buffer capacity per session
    pub buffer_size: usize,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// External reply pipeline settings
    pub rag: RagConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1:8600".parse().expect("valid default bind addr"),
            db_path: PathBuf::from("./consultx.db"),
            buffer_size: 20,
            logging: LoggingConfig::default(),
            rag: RagConfig::default(),
        }
    }
}

/// Config file structure (subset of Config that makes sense to persist)
#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileConfig {
    pub bind_addr: Option<String>,
    pub db_path: Option<String>,
    pub buffer_size: Option<usize>,

    /// Optional [logging] section
    pub logging: Option<FileLogging>,

    /// Optional [rag] section
    pub rag: Option<FileRag>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileLogging {
    pub level: Option<String>,
    pub file_enabled: Option<bool>,
    pub file_dir: Option<String>,
    pub file_rotation: Option<String>,
    pub file_prefix: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
pub(crate) struct FileRag {
    pub enabled: Option<bool>,
    pub auto_reply: Option<bool>,
    pub country_code: Option<String>,
    pub model: Option<String>,
    pub k: Option<usize>,
    pub guardrails: Option<bool>,
    pub endpoint: Option<String>,
    pub timeout_secs: Option<u64>,
}

/// Parse a boolean flag the way the service's env vars expect it.
fn parse_flag(raw: &str) -> bool {
    matches!(
        raw.trim().to_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name).ok().map(|v| parse_flag(&v))
}

impl Config {
    /// Get the config file path: ~/.config/consultx/config.toml
    /// Uses Unix-style ~/.config on all platforms for consistency
    pub fn config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|p| p.join(".config").join("consultx").join("config.toml"))
    }

    /// Create config file with defaults if it doesn't exist
    /// Called during startup to help users discover configuration options
    pub fn ensure_config_exists() {
        let Some(path) = Self::config_path() else {
            return;
        };
        if path.exists() {
            return;
        }
        if let Some(parent) = path.parent() {
            if std::fs::create_dir_all(parent).is_err() {
                return; // Silently fail - config is optional
            }
        }
        let _ = std::fs::write(&path, Self::default().to_toml());
    }

    /// Load file config if it exists
    ///
    /// A broken config fails fast with a clear error instead of silently
    /// falling back to defaults while the user debugs the wrong thing.
    fn load_file_config() -> FileConfig {
        let Some(path) = Self::config_path() else {
            return FileConfig::default();
        };

        match std::fs::read_to_string(&path) {
            Ok(contents) => match toml::from_str(&contents) {
                Ok(config) => config,
                Err(e) => {
                    eprintln!("Failed to parse configuration file");
                    eprintln!("  File: {}", path.display());
                    eprintln!("  Error: {}", e);
                    eprintln!("  To reset, run: consultx config --reset");
                    std::process::exit(1);
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => FileConfig::default(),
            Err(e) => {
                eprintln!("Cannot read configuration file");
                eprintln!("  File: {}", path.display());
                eprintln!("  Error: {}", e);
                std::process::exit(1);
            }
        }
    }

    /// Load configuration: env > file > defaults
    pub fn from_env() -> Self {
        let file = Self::load_file_config();
        let defaults = Config::default();

        let bind_addr = std::env::var("CONSULTX_BIND")
            .ok()
            .or(file.bind_addr)
            .map(|raw| raw.parse().expect("Invalid bind address"))
            .unwrap_or(defaults.bind_addr);

        let db_path = std::env::var("CONSULTX_DB_PATH")
            .ok()
            .or(file.db_path)
            .map(PathBuf::from)
            .unwrap_or(defaults.db_path);

        let buffer_size = std::env::var("CONSULTX_BUFFER_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .or(file.buffer_size)
            .unwrap_or(defaults.buffer_size);

        let file_logging = file.logging.unwrap_or_default();
        let logging = LoggingConfig {
            level: file_logging.level.unwrap_or(defaults.logging.level),
            file_enabled: file_logging
                .file_enabled
                .unwrap_or(defaults.logging.file_enabled),
            file_dir: file_logging
                .file_dir
                .map(PathBuf::from)
                .unwrap_or(defaults.logging.file_dir),
            file_rotation: file_logging
                .file_rotation
                .map(|raw| LogRotation::parse(&raw))
                .unwrap_or(defaults.logging.file_rotation),
            file_prefix: file_logging
                .file_prefix
                .unwrap_or(defaults.logging.file_prefix),
        };

        let file_rag = file.rag.unwrap_or_default();
        let rag = RagConfig {
            enabled: env_flag("CONSULTX_ENABLE_RAG")
                .or(file_rag.enabled)
                .unwrap_or(defaults.rag.enabled),
            auto_reply: env_flag("CONSULTX_RAG_AUTOREPLY")
                .or(file_rag.auto_reply)
                .unwrap_or(defaults.rag.auto_reply),
            country_code: std::env::var("CONSULTX_RAG_COUNTRY")
                .ok()
                .or(file_rag.country_code)
                .unwrap_or(defaults.rag.country_code),
            model: std::env::var("CONSULTX_RAG_MODEL")
                .ok()
                .or(file_rag.model)
                .unwrap_or(defaults.rag.model),
            k: std::env::var("CONSULTX_RAG_K")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file_rag.k)
                .unwrap_or(defaults.rag.k),
            guardrails: env_flag("CONSULTX_RAG_GUARDRAILS")
                .or(file_rag.guardrails)
                .unwrap_or(defaults.rag.guardrails),
            endpoint: std::env::var("CONSULTX_RAG_URL").ok().or(file_rag.endpoint),
            timeout_secs: std::env::var("CONSULTX_RAG_TIMEOUT")
                .ok()
                .and_then(|v| v.parse().ok())
                .or(file_rag.timeout_secs)
                .unwrap_or(defaults.rag.timeout_secs),
        };

        Self {
            bind_addr,
            db_path,
            buffer_size,
            logging,
            rag,
        }
    }

    /// Render the config as a commented TOML template.
    pub fn to_toml(&self) -> String {
        format!(
            r#"# consultx configuration
# Precedence: environment variables > this file > defaults

# Address for the HTTP API
bind_addr = "{bind_addr}"

# SQLite database file
db_path = "{db_path}"

# Rolling buffer capacity per session
buffer_size = {buffer_size}

[logging]
# Log level: trace, debug, info, warn, error
level = "{log_level}"
# Write logs to files in addition to stdout
file_enabled = {file_enabled}
file_dir = "{file_dir}"
# Rotation: hourly, daily, never
file_rotation = "{file_rotation}"
file_prefix = "{file_prefix}"

[rag]
# Run the external reply pipeline on user messages
enabled = {rag_enabled}
# Store pipeline replies as assistant messages
auto_reply = {rag_auto_reply}
# Country code for crisis hotline selection
country_code = "{rag_country}"
model = "{rag_model}"
k = {rag_k}
# Enforce guardrails locally on raw pipeline replies
guardrails = {rag_guardrails}
# Pipeline endpoint URL; leave unset to disable the pipeline
# endpoint = "http://127.0.0.1:8765/turn"
timeout_secs = {rag_timeout}
"#,
            bind_addr = self.bind_addr,
            db_path = self.db_path.display(),
            buffer_size = self.buffer_size,
            log_level = self.logging.level,
            file_enabled = self.logging.file_enabled,
            file_dir = self.logging.file_dir.display(),
            file_rotation = self.logging.file_rotation.as_str(),
            file_prefix = self.logging.file_prefix,
            rag_enabled = self.rag.enabled,
            rag_auto_reply = self.rag.auto_reply,
            rag_country = self.rag.country_code,
            rag_model = self.rag.model,
            rag_k = self.rag.k,
            rag_guardrails = self.rag.guardrails,
            rag_timeout = self.rag.timeout_secs,
        )
    }

    /// Write the default template to the config path, overwriting.
    pub fn reset_config_file() -> std::io::Result<PathBuf> {
        let path = Self::config_path().ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::NotFound, "no home directory")
        })?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, Self::default().to_toml())?;
        Ok(path)
    }
}
