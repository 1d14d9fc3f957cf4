//! Load simulator for the usage write-back path.
//!
//! Spawns producer tasks that each replay the three-step update sequence of
//! a streamed request (start, first token, completion) against an in-memory
//! store with configurable latency and failure rate, then stops the writer
//! and prints a JSON summary followed by the Prometheus metrics rendering.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Context as _;
use clap::Parser;
use metrics_exporter_prometheus::PrometheusBuilder;
use rand::Rng;
use tokio::task::JoinSet;
use tracing::{info, warn};
use usagelog_core::{FinishReason, Money, RecordId, UsagePatch};
use usagelog_server::metrics::register_metrics;
use usagelog_server::observability::{init_logging, LogFormat};
use usagelog_server::{MemoryPatchStore, PatchStore, UsageWriter, WriterConfig};

#[derive(Debug, Parser)]
#[command(name = "usagelog-sim", about = "Drive synthetic usage traffic through the write-back buffer")]
struct Cli {
    #[command(flatten)]
    writer: WriterConfig,

    /// Concurrent producer tasks.
    #[arg(long, default_value_t = 8)]
    producers: u32,

    /// Requests simulated by each producer.
    #[arg(long, default_value_t = 250)]
    requests_per_producer: u32,

    /// Probability that a persistence call fails.
    #[arg(long, default_value_t = 0.0)]
    failure_rate: f64,

    /// Artificial latency of every persistence call.
    #[arg(long, default_value_t = 5)]
    store_latency_ms: u64,

    /// Emit JSON logs instead of pretty output.
    #[arg(long)]
    json_logs: bool,
}

/// The patches one request emits over its lifetime.
struct RequestPlan {
    start: UsagePatch,
    first_token: UsagePatch,
    completion: UsagePatch,
    think_time: Duration,
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .ok()
        .and_then(|d| i64::try_from(d.as_millis()).ok())
        .unwrap_or_default()
}

fn plan_request(producer: u32) -> RequestPlan {
    let mut rng = rand::rng();
    let prompt_tokens = rng.random_range(20..4_000);
    let completion_tokens = rng.random_range(1..2_000);
    let duration_ms = rng.random_range(50..5_000);
    let started_at = now_millis();

    let finish_reason = if rng.random_bool(0.05) {
        FinishReason::Length
    } else {
        FinishReason::Stop
    };
    let cost_micros = i64::try_from((prompt_tokens + completion_tokens * 3) / 2).unwrap_or(i64::MAX);

    RequestPlan {
        start: UsagePatch::default()
            .with_prompt_tokens(prompt_tokens)
            .with_metadata(Some(serde_json::json!({ "producer": producer }))),
        first_token: UsagePatch::default().with_first_token_at(Some(started_at + 40)),
        completion: UsagePatch::default()
            .with_completion_tokens(completion_tokens)
            .with_duration_ms(duration_ms)
            .with_status_code(200)
            .with_cost(Money::from_micros(cost_micros))
            .with_completed_at(Some(started_at + i64::try_from(duration_ms).unwrap_or_default()))
            .with_finish_reason(Some(finish_reason)),
        think_time: Duration::from_millis(rng.random_range(0..3)),
    }
}

async fn produce(writer: Arc<UsageWriter>, producer: u32, requests: u32) {
    for i in 0..requests {
        let id = RecordId(i64::from(producer) * i64::from(requests) + i64::from(i));
        let plan = plan_request(producer);

        writer.record(id, plan.start).await;
        tokio::time::sleep(plan.think_time).await;
        writer.record(id, plan.first_token).await;
        tokio::time::sleep(plan.think_time).await;
        writer.record(id, plan.completion).await;
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(if cli.json_logs {
        LogFormat::Json
    } else {
        LogFormat::Pretty
    });

    let prometheus = PrometheusBuilder::new()
        .install_recorder()
        .context("install prometheus recorder")?;
    register_metrics();

    let store = Arc::new(
        MemoryPatchStore::new()
            .with_latency(Duration::from_millis(cli.store_latency_ms))
            .with_failure_rate(cli.failure_rate),
    );
    let writer = Arc::new(
        UsageWriter::from_config(&cli.writer, Arc::clone(&store) as Arc<dyn PatchStore>)
            .context("invalid writer configuration")?,
    );
    info!(
        mode = writer.mode().as_str(),
        producers = cli.producers,
        requests_per_producer = cli.requests_per_producer,
        "starting simulation"
    );

    let started = Instant::now();
    let mut producers = JoinSet::new();
    for producer in 0..cli.producers {
        producers.spawn(produce(Arc::clone(&writer), producer, cli.requests_per_producer));
    }

    let interrupted = tokio::select! {
        () = async { while producers.join_next().await.is_some() {} } => false,
        result = tokio::signal::ctrl_c() => {
            result.context("listen for ctrl-c")?;
            true
        }
    };
    if interrupted {
        warn!("interrupted, stopping producers");
        producers.abort_all();
    }

    let stop = writer.stop().await.unwrap_or_default();
    let elapsed = started.elapsed();

    let summary = serde_json::json!({
        "mode": writer.mode().as_str(),
        "interrupted": interrupted,
        "elapsed_ms": u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX),
        "records_persisted": store.record_count(),
        "store_calls": store.call_count(),
        "store_failed_calls": store.failed_call_count(),
        "stop": stop,
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);
    println!("{}", prometheus.render());
    Ok(())
}
