//! Loopkeeper: main entry point.
//!
//! Wires the reference adapters around the loop service and runs the
//! serialized worker.
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                      Adapters (outer ring)                     │
//! │                                                                │
//! │  DirBlobStore    FileEventStore   DirStorage    LogEventSink   │
//! │  (BlobStore)     (EventStore)     (Storage)     (EventSink)    │
//! │  SimulatedPump   SimulatedAnalyteSource   JsonConfigFile       │
//! │                                                                │
//! │  ──────────────── Port Trait Boundary ───────────────────      │
//! │                                                                │
//! │  ┌────────────────────────────────────────────────────────┐    │
//! │  │              LoopService (pure logic)                  │    │
//! │  │  Sync FSM · Supervisor · Pipeline · Scheduler          │    │
//! │  └────────────────────────────────────────────────────────┘    │
//! │                                                                │
//! │  Runtime: heartbeat / tick / glucose timers → command channel  │
//! └────────────────────────────────────────────────────────────────┘
//! ```

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use log::info;

use loopkeeper::adapters::clock::SystemClock;
use loopkeeper::adapters::config_file::JsonConfigFile;
use loopkeeper::adapters::dir_store::{DirBlobStore, DirStorage, FileEventStore};
use loopkeeper::adapters::log_sink::LogEventSink;
use loopkeeper::adapters::memory::{
    MemoryAlertStore, MemoryBlobStore, MemoryEventStore, MemoryStorage,
};
use loopkeeper::adapters::neutral_stages::neutral_stages;
use loopkeeper::adapters::sim_pump::{SimulatedAnalyteSource, SimulatedPump};
use loopkeeper::app::commands::LoopCommand;
use loopkeeper::app::ports::{Clock, CommandQueue, ConfigPort, PumpDriver};
use loopkeeper::app::service::LoopService;
use loopkeeper::config::{PumpFamily, validate_config};
use loopkeeper::runtime::{self, Backends, ChannelQueue, RuntimeOptions};

#[derive(Debug, Parser)]
#[command(name = "loopkeeper", version, about = "Closed-loop insulin delivery orchestration core")]
struct Args {
    /// JSON configuration file (defaults apply if it does not exist)
    #[arg(long, default_value = "loopkeeper.json")]
    config: PathBuf,

    /// Persist stores under this directory; in-memory when omitted
    #[arg(long)]
    data_dir: Option<PathBuf>,

    /// Stop after this many heartbeats
    #[arg(long)]
    max_heartbeats: Option<u64>,

    /// Override the configured heartbeat interval (seconds)
    #[arg(long)]
    heartbeat_secs: Option<u32>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    info!("loopkeeper v{}", env!("CARGO_PKG_VERSION"));

    // ── 1. Configuration ──────────────────────────────────────
    let mut config = JsonConfigFile::new(&args.config)
        .load()
        .with_context(|| format!("loading {}", args.config.display()))?;
    if let Some(secs) = args.heartbeat_secs {
        config.heartbeat_interval_secs = secs;
        validate_config(&config).context("--heartbeat-secs")?;
    }

    // ── 2. Adapters ───────────────────────────────────────────
    let clock = SystemClock;
    let queue = ChannelQueue::global();

    let pump: Option<Box<dyn PumpDriver>> = match config.pump_family {
        PumpFamily::Simulated => Some(Box::new(SimulatedPump::new(
            Arc::new(queue),
            Box::new(clock),
        ))),
        PumpFamily::None => None,
    };
    let source = match config.pump_family {
        PumpFamily::Simulated => Some(SimulatedAnalyteSource::new(Box::new(clock))),
        PumpFamily::None => None,
    };

    let backends = match &args.data_dir {
        Some(dir) => {
            info!("persisting under {}", dir.display());
            Backends {
                blobs: Box::new(DirBlobStore::open(dir.join("blobs"))?),
                events: Box::new(FileEventStore::open(dir.join("events.json"))?),
                alerts: Box::new(MemoryAlertStore::new()),
                storage: Box::new(DirStorage::open(dir.join("bytes"))?),
                pump,
                sink: Box::new(LogEventSink::new()),
            }
        }
        None => Backends {
            blobs: Box::new(MemoryBlobStore::new()),
            events: Box::new(MemoryEventStore::new()),
            alerts: Box::new(MemoryAlertStore::new()),
            storage: Box::new(MemoryStorage::new()),
            pump,
            sink: Box::new(LogEventSink::new()),
        },
    };

    // ── 3. Service ────────────────────────────────────────────
    let mut service = LoopService::new(
        config.clone(),
        neutral_stages(),
        Arc::new(queue),
        backends.storage.as_ref(),
        clock.now(),
    );

    // No actuator is attached: release the dosing flag as soon as a
    // suggestion would otherwise hold it.
    service.signals_mut().suggestions.subscribe(move |s| {
        if s.is_actionable() {
            info!("no actuator attached, releasing suggestion for {}", s.timestamp);
            queue.post(LoopCommand::DosingFinished(s.timestamp));
        }
    });

    queue.post(LoopCommand::SettingsChanged);

    // ── 4. Run ────────────────────────────────────────────────
    runtime::run(
        &config,
        service,
        backends,
        source,
        &clock,
        &RuntimeOptions {
            max_heartbeats: args.max_heartbeats,
        },
    );
    Ok(())
}
