use std::{future::Future, sync::Arc};

use async_trait::async_trait;
use serde::{Serialize, Serializer};

use crate::{error::BoxError, sample::SampleBatch};

/// What a runner learns about the iteration it is asked to run.
#[derive(Debug, Clone, Serialize)]
pub struct IterationInfo {
    /// Pool-wide VU id, stable for the VU's lifetime.
    pub vu: u64,
    /// Name of the executor driving the iteration.
    #[serde(serialize_with = "serialize_name")]
    pub executor: Arc<str>,
    /// Iteration index within the executor, across all of its VUs.
    pub iteration: u64,
    /// Iteration index on this VU, across every executor it served.
    pub vu_iteration: u64,
}

fn serialize_name<S: Serializer>(name: &Arc<str>, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(name)
}

/// Runs user iterations. This is the boundary to the scripting engine.
///
/// Each VU gets its own `State`, created once by [`setup_vu`](Runner::setup_vu)
/// the first time the pool hands the VU out and torn down when the pool is
/// disposed. Executors never share a VU, so `run_iteration` gets exclusive access
/// to the state.
///
/// Returning an error marks the iteration as failed: it is logged and counted but
/// never stops the VU or the executor.
#[async_trait]
pub trait Runner: Send + Sync + 'static {
    type State: Send + 'static;

    async fn setup_vu(&self, vu: u64) -> Result<Self::State, BoxError>;

    async fn run_iteration(
        &self,
        state: &mut Self::State,
        info: &IterationInfo,
    ) -> Result<SampleBatch, BoxError>;

    async fn teardown_vu(&self, _vu: u64, _state: Self::State) {}
}

/// Stateless runner built from a closure. See [`runner_fn`].
#[derive(Clone)]
pub struct FnRunner<F> {
    action: F,
}

/// Build a [`Runner`] from an async closure.
///
/// The closure is called once per iteration. Never build heavy objects such as
/// HTTP clients inside it; clone them in instead.
///
/// ```rust
/// use tropa::{runner_fn, BoxError, SampleBatch};
///
/// let runner = runner_fn(|_info| async {
///     let mut batch = SampleBatch::new();
///     batch.add("checks", 1.0);
///     Ok::<_, BoxError>(batch)
/// });
/// # let _ = runner;
/// ```
pub fn runner_fn<F, Fut>(action: F) -> FnRunner<F>
where
    F: Fn(IterationInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SampleBatch, BoxError>> + Send + 'static,
{
    FnRunner { action }
}

#[async_trait]
impl<F, Fut> Runner for FnRunner<F>
where
    F: Fn(IterationInfo) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<SampleBatch, BoxError>> + Send + 'static,
{
    type State = ();

    async fn setup_vu(&self, _vu: u64) -> Result<(), BoxError> {
        Ok(())
    }

    async fn run_iteration(
        &self,
        _state: &mut (),
        info: &IterationInfo,
    ) -> Result<SampleBatch, BoxError> {
        (self.action)(info.clone()).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn closure_runner_forwards_iteration_info() {
        let runner = runner_fn(|info: IterationInfo| async move {
            let mut batch = SampleBatch::new();
            batch.add("vu", info.vu as f64);
            Ok::<_, BoxError>(batch)
        });

        runner.setup_vu(7).await.unwrap();
        let info = IterationInfo {
            vu: 7,
            executor: Arc::from("smoke"),
            iteration: 0,
            vu_iteration: 0,
        };
        let batch = runner.run_iteration(&mut (), &info).await.unwrap();
        assert_eq!(batch.samples()[0].value, 7.0);
    }

    #[test]
    fn iteration_info_serializes_the_executor_name() {
        let info = IterationInfo {
            vu: 3,
            executor: Arc::from("checkout"),
            iteration: 41,
            vu_iteration: 7,
        };
        assert_eq!(
            serde_json::to_value(&info).unwrap(),
            serde_json::json!({
                "vu": 3,
                "executor": "checkout",
                "iteration": 41,
                "vu_iteration": 7,
            })
        );
    }
}
