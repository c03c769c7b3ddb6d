//! Compiler back-end that shells out to an executable.
//!
//! Protocol: the policy document is written to stdin as JSON and
//! `--platform <p>` is appended to the configured command. On success the
//! process prints `{"config": "...", "coverage_score": 90.0,
//! "matched_terms": [...], "diagnostics": [...]}` (all but `config`
//! optional). A non-zero exit is a compilation failure carrying stderr
//! verbatim. Failing to start, a timeout or unreadable output mean the
//! compiler is unavailable.

use std::future::Future;
use std::process::Stdio;
use std::time::Duration;

use serde::Deserialize;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use super::{CompilerFailure, PolicyCompiler, Rendered};

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(120);

#[derive(Debug, Deserialize)]
struct ExternalOutput {
    config: String,
    #[serde(default)]
    coverage_score: Option<f64>,
    #[serde(default)]
    matched_terms: Option<Vec<String>>,
    #[serde(default)]
    diagnostics: Vec<String>,
}

/// Runs `command[0] command[1..] --platform <platform>`.
#[derive(Debug, Clone)]
pub struct ExternalCompiler {
    command: Vec<String>,
    timeout: Duration,
}

impl ExternalCompiler {
    pub fn new(command: Vec<String>) -> Self {
        Self {
            command,
            timeout: DEFAULT_TIMEOUT,
        }
    }

    /// The child is killed once `timeout` elapses.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    async fn run(&self, input: Vec<u8>, platform: &str) -> Result<Rendered, CompilerFailure> {
        let (exe, args) = self
            .command
            .split_first()
            .ok_or_else(|| CompilerFailure::unavailable("compiler command is empty"))?;

        let mut child = Command::new(exe)
            .args(args)
            .arg("--platform")
            .arg(platform)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| CompilerFailure::unavailable(format!("cannot start compiler {exe}: {e}")))?;

        // Feed stdin while the output is drained; a compiler that answers
        // before reading all of its input must not stall on a full pipe.
        let stdin = child.stdin.take();
        let feed = async move {
            if let Some(mut stdin) = stdin {
                match stdin.write_all(&input).await {
                    // The compiler may exit without reading everything.
                    Err(e) if e.kind() != std::io::ErrorKind::BrokenPipe => return Err(e),
                    _ => {}
                }
            }
            Ok(())
        };

        let output = match tokio::time::timeout(
            self.timeout,
            async { tokio::try_join!(feed, child.wait_with_output()) },
        )
        .await
        {
            Ok(Ok(((), output))) => output,
            Ok(Err(e)) => {
                return Err(CompilerFailure::unavailable(format!(
                    "compiler i/o failed: {e}"
                )))
            }
            // Dropping the child kills it.
            Err(_) => {
                return Err(CompilerFailure::unavailable(format!(
                    "compiler did not finish within {:?}",
                    self.timeout
                )))
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).to_string();
            let diagnostics = if stderr.trim().is_empty() {
                format!(
                    "compiler exited with status {}",
                    output.status.code().unwrap_or(-1)
                )
            } else {
                stderr
            };
            return Err(CompilerFailure::Rejected(diagnostics));
        }

        let parsed: ExternalOutput = serde_json::from_slice(&output.stdout).map_err(|e| {
            CompilerFailure::unavailable(format!("unreadable compiler output: {e}"))
        })?;
        Ok(Rendered {
            config_text: parsed.config,
            coverage_score: parsed.coverage_score,
            matched_terms: parsed.matched_terms,
            diagnostics: parsed.diagnostics,
        })
    }
}

impl PolicyCompiler for ExternalCompiler {
    // Called on a blocking thread (see `CompilerAdapter::compile`).
    fn render(
        &self,
        document: &serde_json::Value,
        platform: &str,
    ) -> Result<Rendered, CompilerFailure> {
        let input = serde_json::to_vec(document)
            .map_err(|e| CompilerFailure::new(format!("cannot encode policy: {e}")))?;
        block_on(self.run(input, platform))?
    }
}

/// Drive `fut` to completion from synchronous code: on the surrounding
/// runtime from a blocking thread, else on a private one.
fn block_on<F: Future>(fut: F) -> Result<F::Output, CompilerFailure> {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => Ok(handle.block_on(fut)),
        Err(_) => tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map(|rt| rt.block_on(fut))
            .map_err(|e| CompilerFailure::unavailable(format!("cannot start runtime: {e}"))),
    }
}
