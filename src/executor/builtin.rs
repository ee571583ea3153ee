//! Built-in executors used by the daemon for smoke testing.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;

use crate::error::ConfigError;
use crate::executor::{ExecutionContext, ExecutionError, ExecutorRegistry, TaskExecutor};

/// Returns its payload unchanged.
#[derive(Debug, Default)]
pub struct EchoExecutor;

#[async_trait]
impl TaskExecutor for EchoExecutor {
    async fn execute(
        &self,
        payload: serde_json::Value,
        _ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        Ok(payload)
    }
}

#[derive(Debug, Deserialize)]
struct SleepPayload {
    millis: u64,
}

/// Sleeps for `{"millis": n}`, stopping early when cancelled.
#[derive(Debug, Default)]
pub struct SleepExecutor;

#[async_trait]
impl TaskExecutor for SleepExecutor {
    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &ExecutionContext,
    ) -> Result<serde_json::Value, ExecutionError> {
        let params: SleepPayload =
            serde_json::from_value(payload).map_err(ExecutionError::malformed_payload)?;

        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(params.millis)) => {
                Ok(serde_json::json!({ "slept_ms": params.millis }))
            }
            _ = ctx.cancelled() => Err(ExecutionError::fatal("sleep interrupted by cancellation")),
        }
    }
}

/// Register the built-in executors under `echo` and `sleep`.
pub async fn register_builtins(registry: &ExecutorRegistry) -> Result<(), ConfigError> {
    registry.register("echo", Arc::new(EchoExecutor)).await?;
    registry.register("sleep", Arc::new(SleepExecutor)).await?;
    Ok(())
}
