//! Materialization pipeline.
//!
//! Turns a repository reference into a fresh set of managed children:
//! enumerate the targets, stop anything still running from the previous set,
//! build every target serially, then install the whole set in one atomic
//! swap. Per-target build failures never abort the run; they are collected
//! into the report and the target lands in `build_failed`.

use std::collections::BTreeMap;
use std::time::Duration;

use crate::builder::{Builder, BuilderError};
use crate::supervisor::{RunnableSpec, Supervisor, SupervisorError};

/// Structured outcome of one materialization.
#[derive(Debug, Default)]
pub struct BuildReport {
    /// Keys that built successfully, in build order.
    pub succeeded: Vec<String>,

    /// Keys whose build failed, with the failure.
    pub failed: BTreeMap<String, BuilderError>,
}

impl BuildReport {
    /// Whether every target built.
    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Errors that preclude any materialization.
#[derive(Debug, thiserror::Error)]
pub enum MaterializeError {
    /// Target enumeration failed; nothing was replaced.
    #[error("failed to enumerate targets")]
    Enumerate(#[source] BuilderError),

    /// A running child from the previous set could not be stopped.
    #[error("failed to stop running package '{key}' before rematerializing")]
    Stop {
        /// The child that would not stop.
        key: String,
        /// Underlying stop failure.
        #[source]
        source: SupervisorError,
    },

    /// The overall materialization budget was exceeded.
    #[error("materialization timed out after {budget:?}")]
    Timeout {
        /// The budget that was exceeded.
        budget: Duration,
    },
}

/// Orchestrates the builder client and the supervisor for one repository.
pub struct Materializer<B: Builder> {
    builder: B,
    supervisor: Supervisor,
}

impl<B: Builder> Materializer<B> {
    /// Create a materializer feeding `supervisor`.
    pub fn new(builder: B, supervisor: Supervisor) -> Self {
        Self {
            builder,
            supervisor,
        }
    }

    /// The builder client in use.
    pub fn builder(&self) -> &B {
        &self.builder
    }

    /// Enumerate, build, and install every target of `repo_url`.
    ///
    /// Running children from the previous set are stopped (with the full
    /// SIGTERM/SIGKILL protocol) before the swap, and the swap itself is a
    /// single critical section: observers see the old set or the new set,
    /// never a partial union. Builds run serially to avoid hammering the
    /// external toolchain.
    pub async fn materialize(&self, repo_url: &str) -> Result<BuildReport, MaterializeError> {
        let targets = self
            .builder
            .enumerate(repo_url)
            .await
            .map_err(MaterializeError::Enumerate)?;
        tracing::info!(repo_url, targets = targets.len(), "materializing repository");

        for key in self.supervisor.running_keys() {
            self.supervisor
                .stop(&key)
                .await
                .map_err(|source| MaterializeError::Stop {
                    key: key.clone(),
                    source,
                })?;
        }

        let mut specs = BTreeMap::new();
        let mut report = BuildReport::default();
        for (key, info) in targets {
            let name = if info.name.is_empty() {
                key.clone()
            } else {
                info.name.clone()
            };
            match self.builder.build(repo_url, &key).await {
                Ok(artifact) => {
                    tracing::info!(%key, binary = %artifact.binary_path.display(), "target ready");
                    report.succeeded.push(key.clone());
                    specs.insert(key, RunnableSpec::built(name, artifact.binary_path));
                }
                Err(err) => {
                    tracing::error!(%key, %err, "target build failed");
                    specs.insert(key.clone(), RunnableSpec::failed(name, err.to_string()));
                    report.failed.insert(key, err);
                }
            }
        }

        self.supervisor.replace_all(specs);
        Ok(report)
    }

    /// [`Self::materialize`] bounded by `budget`.
    pub async fn materialize_with_timeout(
        &self,
        repo_url: &str,
        budget: Duration,
    ) -> Result<BuildReport, MaterializeError> {
        tokio::time::timeout(budget, self.materialize(repo_url))
            .await
            .map_err(|_| MaterializeError::Timeout { budget })?
    }
}
