use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;
use tropa::{
    runner_fn, BoxError, Controller, IterationInfo, MetricKind, RunConfig, SampleBatch,
    TracingReporter,
};

const CONFIG: &str = r#"
executors:
  - name: browse
    executor: ramping-vus
    start_vus: 0
    stages:
      - { duration: 5s, target: 20 }
      - { duration: 10s, target: 20 }
      - { duration: 5s, target: 0 }
    graceful_ramp_down: 2s
    tags: { flow: browse }
  - name: checkout
    executor: ramping-arrival-rate
    start_time: 5s
    start_rate: 5
    stages:
      - { duration: 5s, target: 50 }
      - { duration: 5s, target: 5 }
    pre_allocated_vus: 5
    max_vus: 30
options:
  flush_interval: 5s
"#;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info,tropa=info")),
        )
        .init();

    let config = RunConfig::from_yaml_str(CONFIG)?;

    // Pretend to hit an endpoint: latency grows a little with every 10th iteration
    let runner = runner_fn(|info: IterationInfo| async move {
        let latency = Duration::from_millis(40 + (info.iteration % 10) * 8);
        tokio::time::sleep(latency).await;

        let mut batch = SampleBatch::new();
        batch
            .add("http_req_duration", latency.as_secs_f64() * 1_000.0)
            .add("checks", if info.iteration % 50 == 0 { 0.0 } else { 1.0 });
        Ok::<_, BoxError>(batch)
    });

    let controller = Controller::new(config, runner)?
        .with_metric("http_req_duration", MetricKind::Trend)
        .with_metric("checks", MetricKind::Rate)
        .with_reporter(TracingReporter);

    let progress = controller.progress();
    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Interrupted, stopping gracefully");
                cancel.cancel();
            }
        });
    }
    let watcher = tokio::spawn(async move {
        let mut tick = tokio::time::interval(Duration::from_secs(2));
        loop {
            tick.tick().await;
            let snapshot = progress.snapshot();
            tracing::info!(
                active = snapshot.active_vus,
                completed = snapshot.iterations_completed,
                dropped = snapshot.dropped_iterations,
                stage = snapshot.current_stage.as_deref().unwrap_or("-"),
                "Progress"
            );
        }
    });

    let result = controller.run(cancel).await?;
    watcher.abort();

    println!("{}", serde_json::to_string_pretty(&result)?);
    Ok(())
}
