//! Remote executor trait

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ExecError;
use crate::result::CommandResult;

#[async_trait]
pub trait RemoteExecutor: Send + Sync {
    async fn run(&self, cmd: &str) -> Result<CommandResult, ExecError>;

    async fn run_with_timeout(
        &self,
        cmd: &str,
        timeout: Duration,
    ) -> Result<CommandResult, ExecError>;

    /// Run a command that may call `sudo`, feeding the configured password
    async fn run_privileged(&self, cmd: &str) -> Result<CommandResult, ExecError> {
        self.run(cmd).await
    }

    fn is_connected(&self) -> bool {
        false
    }

    fn executor_type(&self) -> &'static str;
}
