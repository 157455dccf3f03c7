mod cli;

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use clap::Parser;
use rand::Rng;
use serde_json::json;
use tracing::{info, warn};

use layerpool_core::observability::init_tracing;
use layerpool_core::pool::detect_cpu_count;
use layerpool_core::ports::TracingEventSink;
use layerpool_core::{
    DispatcherBuilder, DispatcherConfig, HandlerError, Layer, LayerHandler, Priority, TaskContext,
    TaskOptions,
};

use crate::cli::{CliArgs, Command};

const TASK_TYPES: [&str; 8] = [
    "analyze", "process", "transform", "validate", "secure", "optimize", "monitor", "backup",
];

/// Stand-in workload: sleeps a little, fails a configurable share of the
/// time, and gives up early when cancelled.
struct SimulatedWork {
    fail_rate: u8,
}

#[async_trait]
impl LayerHandler for SimulatedWork {
    async fn handle(&self, ctx: TaskContext) -> Result<serde_json::Value, HandlerError> {
        let (delay_ms, fail) = {
            let mut rng = rand::thread_rng();
            (rng.gen_range(1..=20u64), rng.gen_range(0..100u8) < self.fail_rate)
        };

        tokio::select! {
            _ = ctx.cancellation.cancelled() => {
                return Err(HandlerError::new("cancelled"));
            }
            _ = tokio::time::sleep(Duration::from_millis(delay_ms)) => {}
        }

        if fail {
            return Err(HandlerError::new(format!(
                "simulated failure on attempt {}",
                ctx.attempt
            )));
        }
        Ok(json!({
            "layer": ctx.layer,
            "type": ctx.task_type.as_str(),
            "took_ms": delay_ms,
        }))
    }
}

fn print_layers(cpus: Option<usize>) {
    let cpus = cpus.unwrap_or_else(detect_cpu_count);
    println!("cpu_count = {cpus}");
    println!("{:<14} {:>6} {:>8}", "layer", "share", "workers");
    for layer in Layer::ALL {
        println!(
            "{:<14} {:>5.1}% {:>8}",
            layer.as_str(),
            layer.cpu_share_permille() as f64 / 10.0,
            layer.initial_worker_count(cpus)
        );
    }
}

async fn run_demo(config: Option<std::path::PathBuf>, tasks: usize, fail_rate: u8) -> Result<()> {
    let config = match config {
        Some(path) => DispatcherConfig::from_file(&path)
            .with_context(|| format!("failed to load config from {}", path.display()))?,
        None => {
            let mut config = DispatcherConfig::default();
            config.apply_env_overrides();
            config.validate().context("invalid config from environment")?;
            config
        }
    };

    let dispatcher = DispatcherBuilder::new()
        .config(config)
        .handler_for_all(SimulatedWork { fail_rate })
        .sink(TracingEventSink)
        .expect_layers(&Layer::ALL)
        .build()
        .context("failed to start dispatcher")?;

    for i in 0..tasks {
        let (layer, priority, task_type) = {
            let mut rng = rand::thread_rng();
            (
                Layer::ALL[rng.gen_range(0..Layer::ALL.len())],
                Priority::ALL[rng.gen_range(0..Priority::ALL.len())],
                TASK_TYPES[rng.gen_range(0..TASK_TYPES.len())],
            )
        };
        dispatcher.submit(
            layer,
            task_type,
            json!({ "seq": i }),
            TaskOptions::new().priority(priority),
        )?;
    }
    info!(tasks, "submitted demo tasks");

    tokio::select! {
        _ = dispatcher.wait_until_drained() => {}
        _ = tokio::signal::ctrl_c() => warn!("interrupted, shutting down early"),
    }

    let summary = json!({
        "metrics": dispatcher.metrics(),
        "layers": dispatcher.layer_status(),
    });
    println!("{}", serde_json::to_string_pretty(&summary)?);

    let report = dispatcher.shutdown_default().await?;
    println!("{}", serde_json::to_string_pretty(&report)?);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = CliArgs::parse();
    init_tracing(&args.log);

    match args.command {
        Command::Layers { cpus } => print_layers(cpus),
        Command::Demo {
            config,
            tasks,
            fail_rate,
        } => run_demo(config, tasks, fail_rate).await?,
    }
    Ok(())
}
