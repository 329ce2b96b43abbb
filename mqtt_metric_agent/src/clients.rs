//! Wireless client count from an external helper program.

use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio::time::timeout;

use crate::error::SampleError;

#[async_trait]
pub trait ClientCounter: Send + Sync {
    async fn count(&self) -> Result<u32, SampleError>;
}

/// Always reports zero clients without touching the system.
#[derive(Debug, Clone, Copy, Default)]
pub struct DisabledClientCounter;

#[async_trait]
impl ClientCounter for DisabledClientCounter {
    async fn count(&self) -> Result<u32, SampleError> {
        Ok(0)
    }
}

/// Runs a helper (e.g. an SNMP query script) whose stdout is a single
/// integer. The helper can be slow, so it is killed after `timeout`.
#[derive(Debug, Clone)]
pub struct CommandClientCounter {
    program: String,
    args: Vec<String>,
    timeout: Duration,
}

impl CommandClientCounter {
    pub fn new(program: impl Into<String>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            timeout,
        }
    }

    pub fn with_args<I, A>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = A>,
        A: Into<String>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }
}

#[async_trait]
impl ClientCounter for CommandClientCounter {
    async fn count(&self) -> Result<u32, SampleError> {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args).kill_on_drop(true);
        let output = timeout(self.timeout, cmd.output())
            .await
            .map_err(|_| SampleError::Timeout(self.timeout))?
            .map_err(|source| SampleError::CounterUnavailable {
                path: self.program.clone(),
                source,
            })?;
        if !output.status.success() {
            return Err(SampleError::InvalidState(format!(
                "{} exited with {}",
                self.program, output.status
            )));
        }
        let text = String::from_utf8_lossy(&output.stdout);
        text.trim()
            .parse::<u32>()
            .map_err(|e| SampleError::ParseFailure(format!("client count {:?}: {e}", text.trim())))
    }
}

/// Either counter, chosen from configuration at startup.
#[derive(Debug, Clone)]
pub enum WifiClients {
    Disabled(DisabledClientCounter),
    Command(CommandClientCounter),
}

#[async_trait]
impl ClientCounter for WifiClients {
    async fn count(&self) -> Result<u32, SampleError> {
        match self {
            WifiClients::Disabled(c) => c.count().await,
            WifiClients::Command(c) => c.count().await,
        }
    }
}
