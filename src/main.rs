// src/main.rs
//
// =============================================================================
// SALUS: COMMANDER & ENTRY POINT
// =============================================================================
//
// The wiring center of the runtime binary.
//
// Modes:
// 1. START:        Boots a Runtime and drives a YAML workload through the
//                  front-end (sessions run concurrently).
// 2. LIST-DEVICES: Prints the devices a runtime would expose.
//
// The RPC transport itself is out of scope; the workload file plays the
// client role through the same request types a transport would carry.

use anyhow::{anyhow, Context, Result};
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;

use salus::core::{GIB, MIB};
use salus::device::PlatformConfig;
use salus::graph::GraphDef;
use salus::session::{
    CloseSessionRequest, CreateSessionRequest, Frontend, RunStepRequest, SalusOptions,
    SessionConfig, TensorData,
};
use salus::{Runtime, RuntimeConfig, SchedulingParam};

// ============================================================================
// 1. CLI DEFINITION
// ============================================================================

#[derive(Parser)]
#[command(name = "salus", version, about = "Fine-grained GPU sharing runtime")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Boot the runtime and drive a workload file.
    Start {
        /// YAML workload describing sessions and steps.
        #[arg(long)]
        workload: Option<PathBuf>,

        /// Simulated GPU count.
        #[arg(long, default_value_t = 1)]
        gpus: usize,

        /// Usable memory cap per GPU, in MiB.
        #[arg(long, default_value_t = 15 * 1024)]
        gpu_memory_mb: u64,

        /// Kernel worker pool size.
        #[arg(long, default_value_t = 4)]
        workers: usize,

        /// Head-of-line waiting limit per lane queue.
        #[arg(long, default_value_t = 50)]
        max_hol_waiting: usize,
    },

    /// Print the device table.
    ListDevices {
        #[arg(long, default_value_t = 1)]
        gpus: usize,

        #[arg(long, default_value_t = 15 * 1024)]
        gpu_memory_mb: u64,
    },
}

// ============================================================================
// 2. WORKLOAD FILE
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WorkloadSession {
    name: String,

    #[serde(default)]
    resource_map: HashMap<String, f64>,

    #[serde(default)]
    is_inference: bool,

    graph: GraphDef,

    #[serde(default = "one")]
    steps: usize,

    #[serde(default)]
    feeds: HashMap<String, TensorData>,

    #[serde(default)]
    fetches: Vec<String>,
}

fn one() -> usize {
    1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Workload {
    sessions: Vec<WorkloadSession>,
}

// ============================================================================
// 3. ENTRY POINT
// ============================================================================

#[tokio::main]
async fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Start { workload, gpus, gpu_memory_mb, workers, max_hol_waiting } => {
            run_start(workload, gpus, gpu_memory_mb, workers, max_hol_waiting).await
        }
        Commands::ListDevices { gpus, gpu_memory_mb } => {
            let runtime = boot(gpus, gpu_memory_mb, 1, 50);
            let devices = runtime.list_devices().await.map_err(|e| anyhow!(e))?;
            for d in devices.devices {
                println!("{}  {:>12} bytes  ({})", d.name, d.memory, d.hostname);
            }
            runtime.shutdown();
            Ok(())
        }
    }
}

fn boot(gpus: usize, gpu_memory_mb: u64, workers: usize, max_hol_waiting: usize) -> Arc<Runtime> {
    let config = RuntimeConfig {
        platform: PlatformConfig {
            gpu_count: gpus,
            gpu_memory_cap: gpu_memory_mb * MIB,
            gpu_reported_memory: Some(gpu_memory_mb * MIB + GIB),
            cpu_memory: None,
        },
        param: SchedulingParam { workers, max_hol_waiting, ..Default::default() },
    };
    Runtime::boot(config)
}

async fn run_start(
    workload: Option<PathBuf>,
    gpus: usize,
    gpu_memory_mb: u64,
    workers: usize,
    max_hol_waiting: usize,
) -> Result<()> {
    let runtime = boot(gpus, gpu_memory_mb, workers, max_hol_waiting);
    log::info!("🚀 Runtime booted: {:?}", runtime);

    let Some(path) = workload else {
        // No workload: stay up until interrupted, like a daemon would.
        log::info!("No workload given; waiting for Ctrl-C.");
        signal::ctrl_c().await.ok();
        log::warn!("🛑 Interrupt received. Stopping...");
        runtime.shutdown();
        return Ok(());
    };

    let text = std::fs::read_to_string(&path)
        .with_context(|| format!("reading workload {:?}", path))?;
    let workload: Workload = serde_yaml::from_str(&text).context("parsing workload YAML")?;
    log::info!("📐 Workload: {} session(s)", workload.sessions.len());

    let mut tasks = Vec::new();
    for spec in workload.sessions {
        let rt = runtime.clone();
        tasks.push(tokio::spawn(async move { drive_session(rt, spec).await }));
    }

    let mut failed = 0usize;
    for t in tasks {
        match t.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                failed += 1;
                log::error!("💥 Session failed: {:#}", e);
            }
            Err(e) => {
                failed += 1;
                log::error!("💥 Session task panicked: {}", e);
            }
        }
    }

    runtime.shutdown();
    if failed > 0 {
        return Err(anyhow!("{} session(s) failed", failed));
    }
    log::info!("🏁 Workload complete.");
    Ok(())
}

async fn drive_session(runtime: Arc<Runtime>, spec: WorkloadSession) -> Result<()> {
    let created = runtime
        .create_session(CreateSessionRequest {
            graph: Some(spec.graph.clone()),
            config: SessionConfig {
                salus_options: SalusOptions {
                    resource_map: spec.resource_map.clone(),
                    is_inference: spec.is_inference,
                },
            },
        })
        .await
        .map_err(|e| anyhow!("{}: create: {}", spec.name, e))?;

    let handle = created.session_handle.clone();
    log::info!("Session '{}' -> {}", spec.name, handle);

    for step in 0..spec.steps {
        let resp = runtime
            .run_step(RunStepRequest {
                session_handle: handle.clone(),
                graph_id: created.graph_id,
                partial_handle: None,
                feeds: spec.feeds.clone(),
                fetches: spec.fetches.clone(),
                is_expensive: !spec.is_inference,
            })
            .await
            .map_err(|e| anyhow!("{}: step {}: {}", spec.name, step, e))?;

        for (name, data) in &resp.fetched {
            log::info!(
                "'{}' step {}: {} = {:?} {}",
                spec.name,
                step,
                name,
                data.dtype,
                if data.f32s.len() <= 8 {
                    format!("{:?}", data.f32s)
                } else {
                    format!("[{} values]", data.f32s.len())
                }
            );
        }
    }

    runtime
        .close_session(CloseSessionRequest { session_handle: handle })
        .await
        .map_err(|e| anyhow!("{}: close: {}", spec.name, e))?;
    log::info!("Session '{}' closed.", spec.name);
    Ok(())
}
