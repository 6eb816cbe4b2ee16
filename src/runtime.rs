//! Serialized worker runtime.
//!
//! One thread, one `edge-executor`, one bounded command channel.  Timer
//! tasks and driver completions only ever post [`LoopCommand`]s; the
//! worker task is the only code that touches the [`LoopService`] and its
//! stores, so commands are handled strictly one at a time.
//!
//! ```text
//!  ┌──────────────────────────────────────────────────────────────┐
//!  │  futures_lite::future::block_on                              │
//!  │  ┌────────────────────────────────────────────────────────┐  │
//!  │  │  edge_executor::LocalExecutor                          │  │
//!  │  │                                                        │  │
//!  │  │  ┌───────────┐ ┌─────────┐ ┌──────────┐                │  │
//!  │  │  │ Heartbeat │ │ Tick ⏱  │ │ Glucose  │ ── post ──┐    │  │
//!  │  │  │ ⏱         │ │         │ │ fetch ⏱  │           │    │  │
//!  │  │  └───────────┘ └─────────┘ └──────────┘           ▼    │  │
//!  │  │                                         COMMAND_CHANNEL│  │
//!  │  │   ┌──────────────────────────────┐                │    │  │
//!  │  │   │ Worker: receive → handle     │◀───────────────┘    │  │
//!  │  │   └──────────────────────────────┘                     │  │
//!  │  └────────────────────────────────────────────────────────┘  │
//!  └──────────────────────────────────────────────────────────────┘
//! ```

use std::cell::Cell;
use std::rc::Rc;
use std::time::Duration;

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::channel::Channel;
use log::{info, warn};

use crate::app::commands::LoopCommand;
use crate::app::ports::{
    AlertStore, AnalyteSource, BlobStore, Clock, CommandQueue, EventSink, EventStore, Ports,
    PumpDriver, StoragePort,
};
use crate::app::service::LoopService;
use crate::config::LoopConfig;
use crate::glucose::GlucoseFetcher;

/// Channel depth for inbound commands.
pub const COMMAND_DEPTH: usize = 32;

pub type CommandChannel = Channel<CriticalSectionRawMutex, LoopCommand, COMMAND_DEPTH>;

/// The process-wide command channel used by the binary.
pub static COMMAND_CHANNEL: CommandChannel = Channel::new();

/// Glucose fetch attempts are this far apart; the fetcher's own
/// watermark decides whether a read actually happens.
const GLUCOSE_POLL: Duration = Duration::from_secs(60);

// ───────────────────────────────────────────────────────────────
// Command queue
// ───────────────────────────────────────────────────────────────

/// [`CommandQueue`] over an embassy channel.  Never blocks.
#[derive(Clone, Copy)]
pub struct ChannelQueue {
    channel: &'static CommandChannel,
}

impl ChannelQueue {
    pub fn new(channel: &'static CommandChannel) -> Self {
        Self { channel }
    }

    /// Queue over [`COMMAND_CHANNEL`].
    pub fn global() -> Self {
        Self::new(&COMMAND_CHANNEL)
    }
}

impl CommandQueue for ChannelQueue {
    fn post(&self, cmd: LoopCommand) {
        if let Err(embassy_sync::channel::TrySendError::Full(cmd)) = self.channel.try_send(cmd) {
            warn!("command queue full, dropping {:?}", cmd);
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Backends
// ───────────────────────────────────────────────────────────────

/// Owned adapters behind every port.
pub struct Backends {
    pub blobs: Box<dyn BlobStore>,
    pub events: Box<dyn EventStore>,
    pub alerts: Box<dyn AlertStore>,
    pub storage: Box<dyn StoragePort>,
    pub pump: Option<Box<dyn PumpDriver>>,
    pub sink: Box<dyn EventSink>,
}

impl Backends {
    /// Borrow every backend as a port bundle for one command.
    pub fn ports(&mut self) -> Ports<'_> {
        Ports {
            blobs: self.blobs.as_mut(),
            events: self.events.as_mut(),
            alerts: self.alerts.as_mut(),
            storage: self.storage.as_mut(),
            pump: self
                .pump
                .as_mut()
                .map(|p| &mut **p as &mut dyn PumpDriver),
            sink: self.sink.as_mut(),
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Tasks
// ───────────────────────────────────────────────────────────────

async fn heartbeat_loop(
    queue: ChannelQueue,
    clock: &dyn Clock,
    interval: Duration,
    max_heartbeats: Option<u64>,
    stop: Rc<Cell<bool>>,
) {
    let mut sent: u64 = 0;
    loop {
        queue.post(LoopCommand::Heartbeat(clock.now()));
        sent += 1;
        if max_heartbeats.is_some_and(|max| sent >= max) {
            info!("runtime: {} heartbeat(s) sent, stopping", sent);
            stop.set(true);
            return;
        }
        async_io_mini::Timer::after(interval).await;
    }
}

async fn tick_loop(queue: ChannelQueue, clock: &dyn Clock, interval: Duration) {
    loop {
        async_io_mini::Timer::after(interval).await;
        queue.post(LoopCommand::Tick(clock.now()));
    }
}

async fn glucose_loop<S: AnalyteSource>(
    queue: ChannelQueue,
    clock: &dyn Clock,
    mut fetcher: GlucoseFetcher<S>,
) {
    loop {
        let readings = fetcher.fetch(clock.now()).await;
        if !readings.is_empty() {
            queue.post(LoopCommand::GlucoseFetched(readings));
        }
        async_io_mini::Timer::after(GLUCOSE_POLL).await;
    }
}

/// Drain the channel into the service until a stop is requested and
/// the queue is empty.
async fn worker_loop(
    channel: &'static CommandChannel,
    service: &mut LoopService,
    backends: &mut Backends,
    stop: Rc<Cell<bool>>,
) {
    loop {
        let cmd = channel.receive().await;
        service.handle(cmd, &mut backends.ports());
        if stop.get() && channel.is_empty() {
            return;
        }
    }
}

// ───────────────────────────────────────────────────────────────
// Entry point
// ───────────────────────────────────────────────────────────────

pub struct RuntimeOptions {
    /// Stop after this many heartbeats (and the commands they cause).
    pub max_heartbeats: Option<u64>,
}

/// Run the loop until the heartbeat budget is spent, or forever.
pub fn run<S: AnalyteSource>(
    config: &LoopConfig,
    mut service: LoopService,
    mut backends: Backends,
    source: Option<S>,
    clock: &dyn Clock,
    options: &RuntimeOptions,
) {
    let executor: edge_executor::LocalExecutor<'_, 8> = edge_executor::LocalExecutor::new();
    let queue = ChannelQueue::global();
    let stop = Rc::new(Cell::new(false));

    service.start(&mut backends.ports());

    executor
        .spawn(heartbeat_loop(
            queue,
            clock,
            Duration::from_secs(u64::from(config.heartbeat_interval_secs)),
            options.max_heartbeats,
            stop.clone(),
        ))
        .detach();
    executor
        .spawn(tick_loop(
            queue,
            clock,
            Duration::from_secs(u64::from(config.sync_tick_secs)),
        ))
        .detach();
    if let Some(source) = source {
        executor
            .spawn(glucose_loop(queue, clock, GlucoseFetcher::new(source, config)))
            .detach();
    }

    info!(
        "runtime started (heartbeat {}s, tick {}s)",
        config.heartbeat_interval_secs, config.sync_tick_secs
    );

    futures_lite::future::block_on(executor.run(worker_loop(
        &COMMAND_CHANNEL,
        &mut service,
        &mut backends,
        stop,
    )));

    let m = service.metrics();
    info!(
        "runtime stopped: heartbeats={} ignored={} polls={} cycles ok={} failed={}",
        m.heartbeats, m.heartbeats_ignored, m.polls, m.cycles_ok, m.cycles_failed
    );
}
