use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub scripts: ScriptsConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub bridge: BridgeConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

/// Where scripts live and how they are started.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScriptsConfig {
    #[serde(default = "default_scripts_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_interpreter")]
    pub interpreter: String,
    /// Arguments placed between the interpreter and the script path.
    #[serde(default = "default_interpreter_args", alias = "interpreterargs")]
    pub interpreter_args: Vec<String>,
    /// File extension without the leading dot.
    #[serde(default = "default_extension")]
    pub extension: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoggingConfig {
    /// Holds `server.log` and the per-script failure logs.
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
    #[serde(default = "default_server_log", alias = "serverlog")]
    pub server_log: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BridgeConfig {
    #[serde(default, alias = "stdoutpolicy")]
    pub stdout_policy: StdoutPolicy,
    #[serde(default = "default_diagnostic_limit", alias = "diagnosticlimitbytes")]
    pub diagnostic_limit_bytes: usize,
    /// `None` waits on the script forever.
    #[serde(default = "default_timeout_ms", alias = "timeoutms")]
    pub timeout_ms: Option<u64>,
}

/// What happens to script stdout lines that are not the response marker.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StdoutPolicy {
    /// Dropped without a trace.
    #[default]
    Discard,
    /// Emitted through `tracing` with the script name.
    Log,
    /// Kept with the stderr capture and written to the script log on failure.
    Capture,
}

// Default value functions
fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    6565
}

fn default_scripts_dir() -> PathBuf {
    PathBuf::from("scripts")
}

fn default_interpreter() -> String {
    "python".to_string()
}

fn default_interpreter_args() -> Vec<String> {
    vec!["-u".to_string()]
}

fn default_extension() -> String {
    "py".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from(".log")
}

fn default_server_log() -> bool {
    true
}

fn default_diagnostic_limit() -> usize {
    1024 * 1024
}

fn default_timeout_ms() -> Option<u64> {
    Some(30000)
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for ScriptsConfig {
    fn default() -> Self {
        Self {
            dir: default_scripts_dir(),
            interpreter: default_interpreter(),
            interpreter_args: default_interpreter_args(),
            extension: default_extension(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            dir: default_log_dir(),
            server_log: default_server_log(),
        }
    }
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            stdout_policy: StdoutPolicy::default(),
            diagnostic_limit_bytes: default_diagnostic_limit(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl Config {
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.host, self.server.port)
    }

    pub fn script_timeout(&self) -> Option<Duration> {
        self.bridge.timeout_ms.map(Duration::from_millis)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.port, 6565);
        assert_eq!(config.scripts.interpreter, "python");
        assert_eq!(config.scripts.interpreter_args, vec!["-u"]);
        assert_eq!(config.scripts.extension, "py");
        assert_eq!(config.logging.dir, PathBuf::from(".log"));
        assert_eq!(config.bridge.stdout_policy, StdoutPolicy::Discard);
        assert_eq!(config.script_timeout(), Some(Duration::from_secs(30)));
    }

    #[test]
    fn test_partial_json_fills_defaults() {
        let config: Config = serde_json::from_str(
            r#"{"server": {"port": 8080}, "bridge": {"stdoutPolicy": "capture", "timeoutMs": null}}"#,
        )
        .unwrap();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.server.host, "127.0.0.1");
        assert_eq!(config.bridge.stdout_policy, StdoutPolicy::Capture);
        assert_eq!(config.bridge.timeout_ms, None);
        assert_eq!(config.bridge.diagnostic_limit_bytes, 1024 * 1024);
    }
}
