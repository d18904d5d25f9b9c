//! External program as a stage executor
//!
//! The program receives the `StageContext` as JSON on stdin and the run id
//! and stage name in `BOOKFORGE_RUN_ID` / `BOOKFORGE_STAGE`. On success it
//! prints a `StageOutput` JSON object (`data`, `score`, `usage`) to stdout.
//!
//! Exit codes:
//!
//! | Code | Meaning |
//! |------|---------|
//! | 0 | success |
//! | 3 | the metered service throttled the call |
//! | 4 | fatal, do not retry |
//! | other | retryable failure |

use crate::error::{OrchestratorError, Result};
use crate::pipeline::{StageContext, StageHandler, StageOutput};
use crate::stage::StageId;
use async_trait::async_trait;
use std::process::Stdio;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

pub const EXIT_RATE_LIMITED: i32 = 3;
pub const EXIT_FATAL: i32 = 4;

/// Wait applied after a program reports throttling
const THROTTLE_RETRY_AFTER: Duration = Duration::from_secs(30);

/// Characters of stderr kept in error messages
const STDERR_TAIL: usize = 512;

pub struct CommandStage {
    stage: StageId,
    program: String,
    args: Vec<String>,
    service: Option<String>,
}

impl CommandStage {
    pub fn new(stage: StageId, program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            stage,
            program: program.into(),
            args,
            service: None,
        }
    }

    /// Rate-limit the stage under `service`
    pub fn with_service(mut self, service: impl Into<String>) -> Self {
        self.service = Some(service.into());
        self
    }

    fn throttled_service(&self) -> String {
        self.service.clone().unwrap_or_else(|| self.program.clone())
    }
}

#[async_trait]
impl StageHandler for CommandStage {
    fn stage_id(&self) -> StageId {
        self.stage
    }

    fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    async fn execute(&self, ctx: &StageContext) -> Result<StageOutput> {
        let input = serde_json::to_vec(ctx)?;

        let mut child = Command::new(&self.program)
            .args(&self.args)
            .env("BOOKFORGE_RUN_ID", &ctx.run_id)
            .env("BOOKFORGE_STAGE", ctx.stage.as_str())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                OrchestratorError::stage_failed(
                    self.stage,
                    format!("cannot spawn '{}': {}", self.program, e),
                )
            })?;

        // The context grows with every stage; feed it while draining the
        // output pipes or a chatty program and this side block each other.
        let stdin = child.stdin.take();
        let stage = self.stage;
        let feed = async move {
            if let Some(mut stdin) = stdin {
                // A program that ignores its input may close the pipe early
                if let Err(e) = stdin.write_all(&input).await {
                    debug!(stage = %stage, "Stage program did not read its input: {}", e);
                }
            }
        };

        let ((), output) = tokio::join!(feed, child.wait_with_output());
        let output = output?;
        let stderr = String::from_utf8_lossy(&output.stderr);

        match output.status.code() {
            Some(0) => parse_output(self.stage, &output.stdout),
            Some(EXIT_RATE_LIMITED) => Err(OrchestratorError::RateLimited {
                service: self.throttled_service(),
                retry_after: THROTTLE_RETRY_AFTER,
            }),
            Some(EXIT_FATAL) => Err(OrchestratorError::fatal(self.stage, tail(&stderr))),
            code => Err(OrchestratorError::stage_failed(
                self.stage,
                format!(
                    "'{}' exited with {}: {}",
                    self.program,
                    code.map_or_else(|| "signal".to_string(), |c| c.to_string()),
                    tail(&stderr)
                ),
            )),
        }
    }
}

fn parse_output(stage: StageId, stdout: &[u8]) -> Result<StageOutput> {
    let text = String::from_utf8_lossy(stdout);
    let text = text.trim();
    if text.is_empty() {
        return Ok(StageOutput::default());
    }
    serde_json::from_str(text).map_err(|e| {
        OrchestratorError::stage_failed(stage, format!("unreadable stage output: {}", e))
    })
}

fn tail(stderr: &str) -> String {
    let trimmed = stderr.trim();
    let count = trimmed.chars().count();
    if count <= STDERR_TAIL {
        return trimmed.to_string();
    }
    trimmed.chars().skip(count - STDERR_TAIL).collect()
}
