//! A controller issuing one reconfiguration at a time and waiting for the
//! plan gate to report its outcome.

use anyhow::{bail, Context, Result};
use gearshift_plan::{ControlPolicy, KeyStateAllocation};
use parking_lot::Mutex;
use std::error::Error as StdError;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{info, warn};

use crate::job::{DemoCluster, NamedFunction, WORD_COUNT};

/// Woken when the staged change completes.
#[derive(Default)]
struct CompletionSignal {
    done: Notify,
    failure: Mutex<Option<String>>,
}

impl ControlPolicy for CompletionSignal {
    fn on_change_completed(&self, failure: Option<&(dyn StdError + Send + Sync + 'static)>) {
        *self.failure.lock() = failure.map(|e| e.to_string());
        self.done.notify_one();
    }
}

pub struct Controller {
    cluster: Arc<DemoCluster>,
    function_version: u32,
}

impl Controller {
    pub fn new(cluster: Arc<DemoCluster>) -> Self {
        Self {
            cluster,
            function_version: 1,
        }
    }

    async fn apply<F, Fut>(&self, change: &str, f: F) -> Result<()>
    where
        F: FnOnce(Arc<dyn ControlPolicy>) -> Fut,
        Fut: Future<Output = gearshift_coordinator::Result<()>>,
    {
        let signal = Arc::new(CompletionSignal::default());
        let policy: Arc<dyn ControlPolicy> = signal.clone();
        let result = f(policy).await;
        // The gate was never staged if staging itself failed.
        if result.is_ok() {
            signal.done.notified().await;
        }
        if let Some(failure) = signal.failure.lock().take() {
            warn!(change, failure = %failure, "Change rolled back");
        }
        result.with_context(|| format!("{} failed", change))?;
        info!(change, "Change completed");
        Ok(())
    }

    /// Move the upper half of task 0's key groups to task 1.
    pub async fn rebalance(&self) -> Result<()> {
        let current = self
            .cluster
            .api
            .coordinator()
            .workloads()
            .current_allocation(WORD_COUNT)
            .context("word-count has no key allocation")?;
        if current.parallelism() < 2 {
            bail!("rebalance needs at least two tasks");
        }
        let allocation = KeyStateAllocation::from_tasks(current.iter().map(|(task, keys)| {
            let half = keys.len() / 2;
            let keys: Vec<_> = match task {
                0 => keys[..half].to_vec(),
                1 => keys
                    .iter()
                    .chain(current.keys_of(0).map(|k| &k[k.len() / 2..]).unwrap_or_default())
                    .copied()
                    .collect(),
                _ => keys.to_vec(),
            };
            (task, keys)
        }));

        let api = self.cluster.api.clone();
        self.apply("rebalance", |policy| async move {
            api.rebalance(WORD_COUNT, allocation, true, Some(policy)).await
        })
        .await
    }

    /// Rescale word-count to `parallelism` contiguous key ranges, checking that
    /// no count is lost on the way.
    pub async fn scale_to(&self, parallelism: usize) -> Result<()> {
        let before = self.cluster.total_count()?;
        let allocation = KeyStateAllocation::contiguous(parallelism, self.cluster.key_groups());
        let api = self.cluster.api.clone();
        self.apply("rescale", |policy| async move {
            api.rescale(WORD_COUNT, allocation, Some(policy)).await
        })
        .await?;

        let after = self.cluster.total_count()?;
        if before != after {
            bail!("counts changed across rescale: {} before, {} after", before, after);
        }
        info!(parallelism, total = after, "Rescaled with state intact");
        Ok(())
    }

    pub async fn update_function(&mut self) -> Result<()> {
        self.function_version += 1;
        let udf = NamedFunction::word_count(self.function_version);
        let api = self.cluster.api.clone();
        self.apply("update function", |policy| async move {
            api.update_function(WORD_COUNT, udf, Some(policy)).await
        })
        .await
    }

    pub async fn update_min_count(&self, value: u64) -> Result<()> {
        let api = self.cluster.api.clone();
        self.apply("update min_count", |policy| async move {
            api.update_control_attribute(WORD_COUNT, "min_count", serde_json::json!(value), Some(policy))
                .await
        })
        .await?;
        if self.cluster.min_count() != value {
            bail!("min_count is {}, expected {}", self.cluster.min_count(), value);
        }
        Ok(())
    }

    /// Alternate scale-out and scale-in while words keep arriving.
    pub async fn scaling_loop(&self, iterations: usize, corpus: &[&str]) -> Result<()> {
        let base = self.cluster.parallelism()?;
        for iteration in 0..iterations {
            let consumed = self.cluster.feed(corpus.iter().copied())?;
            info!(iteration, consumed, "Fed words");
            let target = if iteration % 2 == 0 { base + 1 } else { base };
            self.scale_to(target).await?;
        }
        if self.cluster.parallelism()? != base {
            self.scale_to(base).await?;
        }
        Ok(())
    }
}
