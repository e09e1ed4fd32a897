//! Script process spawning
//!
//! One process per request: spawned, fed, awaited and then dropped. The
//! child is killed if its handle is dropped before it exits.

use crate::config::ScriptsConfig;
use crate::error::BridgeError;
use crate::script::Script;
use std::process::Stdio;
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};

/// Exit code reported for a child that did not exit normally (killed by a signal).
pub const ABNORMAL_EXIT_CODE: i32 = -1;

/// Starts scripts under the configured interpreter
#[derive(Debug, Clone)]
pub struct ScriptLauncher {
    /// Interpreter executable
    interpreter: String,
    /// Arguments placed before the script path
    args: Vec<String>,
}

/// The three standard streams of a freshly started script
pub struct ScriptStreams {
    pub stdin: ChildStdin,
    pub stdout: ChildStdout,
    pub stderr: ChildStderr,
}

/// Represents a running script process
pub struct ScriptProcess {
    /// Process ID, if the OS reported one
    pub pid: Option<u32>,
    /// Child process handle
    child: Child,
}

impl ScriptLauncher {
    pub fn new(interpreter: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            interpreter: interpreter.into(),
            args,
        }
    }

    pub fn from_config(config: &ScriptsConfig) -> Self {
        Self::new(config.interpreter.clone(), config.interpreter_args.clone())
    }

    /// Spawn `script` with all three standard streams piped.
    pub fn launch(&self, script: &Script) -> Result<(ScriptProcess, ScriptStreams), BridgeError> {
        let mut cmd = Command::new(&self.interpreter);
        cmd.args(&self.args)
            .arg(&script.path)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true); // Prevent zombie processes

        let mut child = cmd.spawn().map_err(|e| BridgeError::StartFailed {
            script: script.name.clone(),
            reason: format!("Failed to spawn {}: {}", self.interpreter, e),
        })?;

        let pipe_error = |stream: &'static str| BridgeError::PipeCreationFailed {
            script: script.name.clone(),
            stream,
        };

        let stdin = child.stdin.take().ok_or_else(|| pipe_error("stdin"))?;
        let stdout = child.stdout.take().ok_or_else(|| pipe_error("stdout"))?;
        let stderr = child.stderr.take().ok_or_else(|| pipe_error("stderr"))?;

        let process = ScriptProcess {
            pid: child.id(),
            child,
        };

        Ok((
            process,
            ScriptStreams {
                stdin,
                stdout,
                stderr,
            },
        ))
    }
}

impl ScriptProcess {
    /// Wait for the process to exit and return its exit code.
    pub async fn wait(&mut self) -> std::io::Result<i32> {
        let status = self.child.wait().await?;
        Ok(status.code().unwrap_or(ABNORMAL_EXIT_CODE))
    }

    /// Kill the process and reap it
    pub async fn kill(&mut self) -> std::io::Result<()> {
        self.child.kill().await
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::path::PathBuf;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    fn script_at(path: &str) -> Script {
        Script {
            name: "test".to_string(),
            path: PathBuf::from(path),
            enabled: true,
        }
    }

    #[tokio::test]
    async fn test_launch_pipes_all_streams() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("echo.sh");
        std::fs::write(&path, "cat\necho oops >&2\nexit 3\n").unwrap();

        let launcher = ScriptLauncher::new("sh", vec![]);
        let (mut process, mut streams) = launcher
            .launch(&script_at(path.to_str().unwrap()))
            .expect("Failed to launch script");
        assert!(process.pid.is_some());

        streams.stdin.write_all(b"ping").await.unwrap();
        drop(streams.stdin);

        let mut out = String::new();
        streams.stdout.read_to_string(&mut out).await.unwrap();
        let mut err = String::new();
        streams.stderr.read_to_string(&mut err).await.unwrap();

        assert_eq!(out, "ping");
        assert_eq!(err, "oops\n");
        assert_eq!(process.wait().await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_missing_interpreter_fails_to_start() {
        let launcher = ScriptLauncher::new("definitely-not-an-interpreter-lazycomm", vec![]);
        let result = launcher.launch(&script_at("whatever.py"));

        assert!(matches!(result, Err(BridgeError::StartFailed { .. })));
    }

    #[tokio::test]
    async fn test_killed_process_reports_abnormal_exit() {
        let launcher = ScriptLauncher::new("sh", vec!["-c".to_string(), "exec sleep 30".to_string()]);
        let (mut process, _streams) = launcher.launch(&script_at("unused")).unwrap();

        process.kill().await.unwrap();
        assert_eq!(process.wait().await.unwrap(), ABNORMAL_EXIT_CODE);
    }
}
