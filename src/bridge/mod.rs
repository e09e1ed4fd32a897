//! Script bridge: one HTTP request in, one child process, one response out
//!
//! # Architecture
//!
//! - **Resolution**: the script name is mapped to a file (see [`crate::script`])
//! - **Launch**: the script is started with stdin, stdout and stderr piped
//! - **Request**: the framed request is written to stdin, which is then closed
//! - **Decoding**: a task scans stdout for the response marker and publishes
//!   its outcome exactly once over a oneshot channel
//! - **Diagnostics**: a task captures stderr, flushed to a per-script log
//!   only when the script exits non-zero
//! - **Completion**: the coordinator waits for exit, then for the decoder's
//!   outcome, and is the only place that decides the reply
//!
//! # Modules
//!
//! - `protocol`: request encoding and response decoding
//! - `process`: process spawning
//! - `diagnostics`: stderr capture and failure logs

pub mod diagnostics;
pub mod process;
pub mod protocol;

pub use process::{ScriptLauncher, ScriptProcess, ScriptStreams};
pub use protocol::{BridgeRequest, EncodedRequest, ResponseFrame};

use crate::config::{Config, StdoutPolicy};
use crate::error::BridgeError;
use crate::script::ScriptResolver;
use crate::state::metrics::{InvocationTimer, Metrics};
use diagnostics::{DiagnosticBuffer, SharedDiagnostics};
use process::ABNORMAL_EXIT_CODE;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::BufReader;
use tokio::process::ChildStdout;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, warn, Instrument};

/// What the stdout decoder publishes once per invocation
type DecodeOutcome = Result<Option<ResponseFrame>, BridgeError>;

/// How the process ended, as seen by the coordinator
#[derive(Debug, Clone, Copy)]
enum Exit {
    Code(i32),
    TimedOut,
}

/// Runs scripts on behalf of HTTP requests
pub struct Bridge {
    resolver: ScriptResolver,
    launcher: ScriptLauncher,
    /// Directory for per-script failure logs
    log_dir: PathBuf,
    stdout_policy: StdoutPolicy,
    diagnostic_limit: usize,
    timeout: Option<Duration>,
    /// Metrics for observability
    metrics: Option<Arc<Metrics>>,
}

impl Bridge {
    pub fn new(config: &Config) -> Self {
        Self {
            resolver: ScriptResolver::from_config(&config.scripts),
            launcher: ScriptLauncher::from_config(&config.scripts),
            log_dir: config.logging.dir.clone(),
            stdout_policy: config.bridge.stdout_policy,
            diagnostic_limit: config.bridge.diagnostic_limit_bytes,
            timeout: config.script_timeout(),
            metrics: None,
        }
    }

    /// Set metrics for invocation tracking
    pub fn with_metrics(mut self, metrics: Arc<Metrics>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn resolver(&self) -> &ScriptResolver {
        &self.resolver
    }

    /// Run the script `name` for `request` and return its response.
    ///
    /// Every failure, including a script that responded with a malformed
    /// frame, comes back as a [`BridgeError`] whose status code and display
    /// text form the reply.
    pub async fn invoke(
        &self,
        name: &str,
        request: BridgeRequest,
    ) -> Result<ResponseFrame, BridgeError> {
        let span = tracing::info_span!("script_invocation", script = %name);
        let timer = self.metrics.clone().map(InvocationTimer::new);
        let started = std::time::Instant::now();

        let result = self.run(name, request).instrument(span.clone()).await;

        span.in_scope(|| {
            let duration_ms = started.elapsed().as_millis() as u64;
            match &result {
                Ok(frame) => debug!(duration_ms, status = frame.status.as_u16(), "Invocation finished"),
                Err(e) => debug!(duration_ms, kind = e.kind(), "Invocation failed"),
            }
        });

        if let Some(timer) = timer {
            match &result {
                Ok(_) => timer.finish(),
                Err(e) => timer.fail(e.kind()),
            }
        }

        result
    }

    async fn run(&self, name: &str, request: BridgeRequest) -> Result<ResponseFrame, BridgeError> {
        let script = self.resolver.resolve(name)?;
        let encoded = EncodedRequest::new(&request)?;

        let (mut process, streams) = self.launcher.launch(&script)?;
        info!(pid = ?process.pid, "Started script");

        let deadline = self.timeout.map(|timeout| Instant::now() + timeout);
        let diagnostics = DiagnosticBuffer::shared(self.diagnostic_limit);

        let (outcome_tx, mut outcome_rx) = oneshot::channel();
        let decoder = tokio::spawn(
            decode_stdout(
                streams.stdout,
                self.stdout_policy,
                diagnostics.clone(),
                outcome_tx,
            )
            .in_current_span(),
        );
        let collector = tokio::spawn(
            diagnostics::collect(streams.stderr, diagnostics.clone()).in_current_span(),
        );

        let mut stdin = streams.stdin;
        let exchange = async {
            if let Err(e) = encoded.write_to(&mut stdin).await {
                warn!(error = %e, "Failed to write request to script");
            }
            // Closing stdin is the end-of-request signal
            drop(stdin);
            process.wait().await
        };

        let exit = match until(deadline, exchange).await {
            Some(Ok(code)) => Exit::Code(code),
            Some(Err(e)) => {
                error!(error = %e, "Failed to wait for script");
                Exit::Code(ABNORMAL_EXIT_CODE)
            }
            None => {
                if let Err(e) = process.kill().await {
                    warn!(error = %e, "Failed to kill timed out script");
                }
                Exit::TimedOut
            }
        };

        let outcome = match exit {
            // The decoder may already hold a complete frame; the script just lingered
            Exit::TimedOut => match outcome_rx.try_recv() {
                Ok(outcome) => Some(outcome),
                Err(_) => None,
            },
            Exit::Code(_) => until(deadline, &mut outcome_rx)
                .await
                .map(|received| received.unwrap_or(Ok(None))),
        };
        if outcome.is_none() {
            decoder.abort();
        }

        let exit_code = match exit {
            Exit::Code(code) => code,
            Exit::TimedOut => ABNORMAL_EXIT_CODE,
        };

        if exit_code != 0 {
            if let Some(metrics) = &self.metrics {
                metrics.record_nonzero_exit();
            }
            if until(deadline, wait_quietly(collector)).await.is_none() {
                debug!("Script stderr still open after exit, logging what was captured");
            }
            self.flush_diagnostics(&script.name, exit_code, &diagnostics).await;
        } else {
            collector.abort();
        }

        match (exit, outcome) {
            (_, Some(Ok(Some(frame)))) => {
                if exit_code != 0 {
                    warn!(exit_code, "Script exited non-zero after responding");
                }
                info!(status = frame.status.as_u16(), "Script responded");
                Ok(frame)
            }
            (_, Some(Err(e))) => {
                error!(error = %e, "Script sent an unusable response");
                Err(e)
            }
            (Exit::TimedOut, _) | (_, None) => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_timeout();
                }
                let timeout_ms = self.timeout.map(|t| t.as_millis() as u64).unwrap_or(0);
                error!(timeout_ms, "Script timed out and was killed");
                Err(BridgeError::Timeout { timeout_ms })
            }
            (Exit::Code(0), Some(Ok(None))) => {
                error!("Script exited without sending a response");
                Err(BridgeError::NoResponse)
            }
            (Exit::Code(code), Some(Ok(None))) => {
                error!(exit_code = code, "Script exited with a non-zero code. stderr was logged");
                Err(BridgeError::ScriptExitedNonZero { code })
            }
        }
    }

    async fn flush_diagnostics(&self, script: &str, exit_code: i32, diagnostics: &SharedDiagnostics) {
        let buffer = {
            let mut guard = diagnostics
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            std::mem::replace(&mut *guard, DiagnosticBuffer::new(self.diagnostic_limit))
        };

        match diagnostics::write_failure_log(&self.log_dir, script, exit_code, &buffer).await {
            Ok(path) => debug!(path = %path.display(), bytes = buffer.len(), "Wrote script log"),
            Err(e) => error!(
                log_dir = %self.log_dir.display(),
                error = %e,
                "Failed to write script log"
            ),
        }
    }
}

/// Read the script's stdout, publish the outcome once, then drain the rest.
async fn decode_stdout(
    stdout: ChildStdout,
    policy: StdoutPolicy,
    diagnostics: SharedDiagnostics,
    outcome_tx: oneshot::Sender<DecodeOutcome>,
) {
    let mut reader = BufReader::new(stdout);

    let outcome = protocol::read_response(&mut reader, |line| match policy {
        StdoutPolicy::Discard => {}
        StdoutPolicy::Log => {
            info!(output = %String::from_utf8_lossy(line), "Script output");
        }
        StdoutPolicy::Capture => diagnostics::push_shared(&diagnostics, line),
    })
    .await;

    // The receiver is gone only if the coordinator already gave up
    let _ = outcome_tx.send(outcome);

    // Keep the pipe flowing so the script never blocks on a full stdout
    if let Err(e) = tokio::io::copy(&mut reader, &mut tokio::io::sink()).await {
        debug!(error = %e, "Stopped draining script stdout");
    }
}

async fn wait_quietly(handle: JoinHandle<()>) {
    if let Err(e) = handle.await {
        if e.is_panic() {
            error!("Diagnostic collector panicked");
        }
    }
}

/// Run `future` to completion, or until `deadline` passes.
async fn until<F: Future>(deadline: Option<Instant>, future: F) -> Option<F::Output> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, future).await.ok(),
        None => Some(future.await),
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::error::{MalformedResponse, TruncatedFrame};
    use bytes::Bytes;
    use std::collections::HashMap;
    use tempfile::TempDir;
    use warp::http::StatusCode;

    struct Fixture {
        dir: TempDir,
        config: Config,
    }

    impl Fixture {
        fn new() -> Self {
            let dir = TempDir::new().unwrap();
            std::fs::create_dir(dir.path().join("scripts")).unwrap();

            let mut config = Config::default();
            config.scripts.dir = dir.path().join("scripts");
            config.scripts.interpreter = "sh".to_string();
            config.scripts.interpreter_args = vec![];
            config.scripts.extension = "sh".to_string();
            config.logging.dir = dir.path().join("logs");
            config.bridge.timeout_ms = Some(5000);

            Self { dir, config }
        }

        fn script(self, name: &str, body: &str) -> Self {
            std::fs::write(self.config.scripts.dir.join(format!("{name}.sh")), body).unwrap();
            self
        }

        fn bridge(&self) -> Bridge {
            Bridge::new(&self.config).with_metrics(Arc::new(Metrics::new()))
        }

        fn log(&self, name: &str) -> Option<String> {
            std::fs::read_to_string(self.dir.path().join("logs").join(format!("{name}.log"))).ok()
        }
    }

    fn request() -> BridgeRequest {
        BridgeRequest::new(HashMap::new(), HashMap::new(), Bytes::new()).with_route("", "GET")
    }

    #[tokio::test]
    async fn test_successful_response() {
        let fixture = Fixture::new().script(
            "hello",
            "cat >/dev/null\necho starting\nprintf 'LZY-:200 2 5\\n{}hello'\n",
        );

        let frame = fixture.bridge().invoke("hello", request()).await.unwrap();
        assert_eq!(frame.status, StatusCode::OK);
        assert_eq!(frame.body.as_ref(), b"hello");
        assert!(fixture.log("hello").is_none());
    }

    #[tokio::test]
    async fn test_script_sees_framed_request() {
        // Responds with the preamble line it received as the body
        let fixture = Fixture::new().script(
            "preamble",
            "read -r line\ncat >/dev/null\nprintf 'LZY-:200 2 %s\\n{}%s' \"${#line}\" \"$line\"\n",
        );

        let req = BridgeRequest::new(
            HashMap::new(),
            HashMap::from([("q".to_string(), "1".to_string())]),
            Bytes::from_static(b"abc"),
        );
        let frame = fixture.bridge().invoke("preamble", req).await.unwrap();
        assert_eq!(frame.body.as_ref(), b"2 9 3");
    }

    #[tokio::test]
    async fn test_nonzero_exit_before_response_is_logged() {
        let fixture = Fixture::new().script(
            "crash",
            "echo 'Traceback: something broke' >&2\nexit 2\n",
        );

        let err = fixture.bridge().invoke("crash", request()).await.unwrap_err();
        assert_eq!(err, BridgeError::ScriptExitedNonZero { code: 2 });
        assert!(err.to_string().contains('2'));

        let log = fixture.log("crash").expect("script log written");
        assert!(log.contains("Traceback: something broke"));
        assert!(log.contains(diagnostics::ENTRY_SEPARATOR));
    }

    #[tokio::test]
    async fn test_response_survives_nonzero_exit() {
        let fixture = Fixture::new().script(
            "late",
            "cat >/dev/null\nprintf 'LZY-:201 2 2\\n{}ok'\necho 'cleanup failed' >&2\nexit 3\n",
        );

        let frame = fixture.bridge().invoke("late", request()).await.unwrap();
        assert_eq!(frame.status, StatusCode::CREATED);
        assert_eq!(frame.body.as_ref(), b"ok");
        // Diagnostics are still kept for the failed exit
        assert!(fixture.log("late").unwrap().contains("cleanup failed"));
    }

    #[tokio::test]
    async fn test_clean_exit_without_response() {
        let fixture = Fixture::new().script("silent", "cat >/dev/null\necho 'just talking'\n");

        let err = fixture.bridge().invoke("silent", request()).await.unwrap_err();
        assert_eq!(err, BridgeError::NoResponse);
        assert!(fixture.log("silent").is_none());
    }

    #[tokio::test]
    async fn test_malformed_marker() {
        let fixture = Fixture::new().script(
            "bad",
            "cat >/dev/null\nprintf 'LZY-:ok 2 2\\n{}ok'\n",
        );

        let err = fixture.bridge().invoke("bad", request()).await.unwrap_err();
        assert_eq!(
            err,
            BridgeError::ResponseMalformed(MalformedResponse::NotAnInteger("status code"))
        );
    }

    #[tokio::test]
    async fn test_truncated_body() {
        let fixture = Fixture::new().script(
            "short",
            "cat >/dev/null\nprintf 'LZY-:200 2 100\\n{}only a little'\n",
        );

        let err = fixture.bridge().invoke("short", request()).await.unwrap_err();
        assert_eq!(err, BridgeError::ResponseTruncated(TruncatedFrame::Body));
    }

    #[tokio::test]
    async fn test_noisy_stdout_after_response_does_not_block() {
        let fixture = Fixture::new().script(
            "chatty",
            "cat >/dev/null\nprintf 'LZY-:200 2 2\\n{}ok'\nhead -c 1000000 /dev/zero\n",
        );

        let frame = fixture.bridge().invoke("chatty", request()).await.unwrap();
        assert_eq!(frame.body.as_ref(), b"ok");
    }

    #[tokio::test]
    async fn test_timeout_kills_script() {
        let mut fixture = Fixture::new().script("stuck", "exec sleep 30\n");
        fixture.config.bridge.timeout_ms = Some(200);

        let started = std::time::Instant::now();
        let err = fixture.bridge().invoke("stuck", request()).await.unwrap_err();

        assert_eq!(err, BridgeError::Timeout { timeout_ms: 200 });
        assert!(started.elapsed() < Duration::from_secs(10));
    }

    #[tokio::test]
    async fn test_captured_stdout_lands_in_log() {
        let mut fixture = Fixture::new().script(
            "printer",
            "cat >/dev/null\necho 'debug print'\nexit 1\n",
        );
        fixture.config.bridge.stdout_policy = StdoutPolicy::Capture;

        let err = fixture.bridge().invoke("printer", request()).await.unwrap_err();
        assert_eq!(err, BridgeError::ScriptExitedNonZero { code: 1 });
        assert!(fixture.log("printer").unwrap().contains("debug print"));
    }

    #[tokio::test]
    async fn test_resolution_errors_skip_launch() {
        let fixture = Fixture::new();
        let bridge = fixture.bridge();

        assert!(matches!(
            bridge.invoke("ghost", request()).await,
            Err(BridgeError::NotFound { .. })
        ));
        assert!(matches!(
            bridge.invoke("_hidden", request()).await,
            Err(BridgeError::Disabled { .. })
        ));
    }
}
