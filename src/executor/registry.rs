//! Executor registry — maps a job type to its executor.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::error::ConfigError;
use crate::executor::TaskExecutor;

/// Registry of available executors, keyed by job type.
///
/// Populated once at startup, then read concurrently by the API and workers.
pub struct ExecutorRegistry {
    executors: RwLock<HashMap<String, Arc<dyn TaskExecutor>>>,
}

impl ExecutorRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            executors: RwLock::new(HashMap::new()),
        }
    }

    /// Register an executor. A second registration for the same job type
    /// is a configuration error.
    pub async fn register(
        &self,
        job_type: impl Into<String>,
        executor: Arc<dyn TaskExecutor>,
    ) -> Result<(), ConfigError> {
        let job_type = job_type.into();
        if job_type.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                key: "job_type".to_string(),
                message: "executor job type must not be empty".to_string(),
            });
        }

        let mut executors = self.executors.write().await;
        if executors.contains_key(&job_type) {
            tracing::warn!(job_type = %job_type, "Rejected duplicate executor registration");
            return Err(ConfigError::DuplicateExecutor { job_type });
        }
        tracing::debug!("Registered executor: {}", job_type);
        executors.insert(job_type, executor);
        Ok(())
    }

    /// Resolve the executor for a job type.
    pub async fn resolve(&self, job_type: &str) -> Option<Arc<dyn TaskExecutor>> {
        self.executors.read().await.get(job_type).cloned()
    }

    /// Check if an executor exists for a job type.
    pub async fn has(&self, job_type: &str) -> bool {
        self.executors.read().await.contains_key(job_type)
    }

    /// List all registered job types.
    pub async fn job_types(&self) -> Vec<String> {
        let mut types: Vec<String> = self.executors.read().await.keys().cloned().collect();
        types.sort();
        types
    }

    /// Get the number of registered executors.
    pub async fn count(&self) -> usize {
        self.executors.read().await.len()
    }
}

impl Default for ExecutorRegistry {
    fn default() -> Self {
        Self::new()
    }
}
