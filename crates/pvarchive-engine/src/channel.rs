//! Per-PV archive channel.
//!
//! An [`ArchiveChannel`] is a handle to a single-writer actor task that owns
//! one PV's lifecycle:
//!
//! ```text
//! Created -> Connecting -> Connected <-> Disconnected -> Connecting ... -> Stopped
//! ```
//!
//! Everything that can change the channel (start/stop requests, scheduler
//! retries, transport callbacks) arrives as a message in the actor's
//! mailbox and is handled one message at a time. Connect attempts and sink
//! appends run on their own tasks so slow I/O never stalls state handling.
//!
//! Every start, failed attempt or disconnect, and stop advances the
//! channel's generation. Transport callbacks and scheduler retries carry the
//! generation they were issued under; anything carrying an old generation is
//! a stale callback and is discarded.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender, WeakUnboundedSender};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use crate::error::{ArchiveError, Result};
use crate::metadata::{ChannelInfo, MetadataClient};
use crate::pv_name::PvName;
use crate::sample::{Sample, SampleType, Timestamp};
use crate::scheduler::ReconnectScheduler;
use crate::sink::{SampleSink, SinkWriter, WriterStats};
use crate::transport::{SubscriptionEvents, SubscriptionHandle, Transport, TransportEvent};

/// Lifecycle state of a channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ChannelState {
    /// Constructed, never started.
    Created,
    /// A connect attempt is scheduled or in flight.
    Connecting,
    /// Subscribed; value changes are forwarded.
    Connected,
    /// Connection lost or never established; a retry is scheduled.
    Disconnected,
    /// Torn down by an explicit stop.
    Stopped,
}

impl fmt::Display for ChannelState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelState::Created => "created",
            ChannelState::Connecting => "connecting",
            ChannelState::Connected => "connected",
            ChannelState::Disconnected => "disconnected",
            ChannelState::Stopped => "stopped",
        };
        f.write_str(s)
    }
}

/// Mailbox message for a channel actor.
pub(crate) enum ChannelMsg {
    Start { ack: oneshot::Sender<bool> },
    Stop { ack: oneshot::Sender<()> },
    Attempt { generation: u64 },
    Event { generation: u64, event: TransportEvent },
}

/// Collaborators shared by every channel of one engine.
#[derive(Clone)]
pub struct ChannelContext {
    /// Configuration service.
    pub metadata: Arc<dyn MetadataClient>,
    /// Subscription transport.
    pub transport: Arc<dyn Transport>,
    /// Durable sample sink.
    pub sink: Arc<dyn SampleSink>,
    /// Reconnect coordinator.
    pub scheduler: Arc<ReconnectScheduler>,
    /// Grace period for opening a subscription, and again for its first value.
    pub connect_timeout: Duration,
    /// Per-channel writer queue depth.
    pub sink_queue_depth: usize,
}

/// Point-in-time view of a channel, for status queries.
#[derive(Debug, Clone, Serialize)]
pub struct ChannelStatus {
    /// Canonical PV name.
    pub pv: PvName,
    /// Current state.
    pub state: ChannelState,
    /// Current generation.
    pub generation: u64,
    /// Declared sample type, once known.
    pub sample_type: Option<SampleType>,
    /// Metadata fields being captured.
    pub extra_fields: Vec<String>,
    /// Connect attempts started.
    pub connect_attempts: u64,
    /// Transitions into `Connected`.
    pub connects: u64,
    /// Connection drops observed while connected or connecting.
    pub disconnects: u64,
    /// Samples that passed the filters; each is then written, dropped on a
    /// full queue, or rejected by the sink.
    pub samples_accepted: u64,
    /// Samples the sink accepted.
    pub samples_written: u64,
    /// Samples the sink rejected.
    pub write_failures: u64,
    /// Samples discarded for not being newer than the last one forwarded.
    pub duplicates_dropped: u64,
    /// Samples discarded for not matching the declared type.
    pub type_mismatches: u64,
    /// Samples discarded because the writer or early-value queue was full.
    pub samples_dropped: u64,
    /// Callbacks discarded because they belonged to an older generation.
    pub stale_callbacks: u64,
    /// Timestamp of the last sample forwarded.
    pub last_timestamp: Option<Timestamp>,
    /// Wall-clock time of the current connection.
    pub connected_since: Option<Timestamp>,
    /// Consecutive failed connect attempts, if a retry is pending.
    pub retry_failures: Option<u32>,
}

#[derive(Default)]
struct Counters {
    connect_attempts: AtomicU64,
    connects: AtomicU64,
    disconnects: AtomicU64,
    accepted: AtomicU64,
    duplicates: AtomicU64,
    type_mismatches: AtomicU64,
    overflows: AtomicU64,
    stale_callbacks: AtomicU64,
}

struct Shared {
    pv: PvName,
    owner: u64,
    state: watch::Sender<ChannelState>,
    generation: AtomicU64,
    counters: Counters,
    writer_stats: Arc<WriterStats>,
    info: Mutex<Option<ChannelInfo>>,
    meta_fields: Mutex<HashMap<String, String>>,
    last_timestamp: Mutex<Option<Timestamp>>,
    connected_since: Mutex<Option<Timestamp>>,
}

fn bump(counter: &AtomicU64) {
    counter.fetch_add(1, Ordering::Relaxed);
}

fn read(counter: &AtomicU64) -> u64 {
    counter.load(Ordering::Relaxed)
}

fn set<T>(slot: &Mutex<T>, value: T) {
    if let Ok(mut guard) = slot.lock() {
        *guard = value;
    }
}

fn get<T: Clone + Default>(slot: &Mutex<T>) -> T {
    slot.lock().map(|g| g.clone()).unwrap_or_default()
}

/// Handle to one PV's archive channel. Cloning is cheap; the channel's task
/// ends (tearing everything down) once the last handle is dropped.
#[derive(Clone)]
pub struct ArchiveChannel {
    tx: UnboundedSender<ChannelMsg>,
    shared: Arc<Shared>,
    scheduler: Arc<ReconnectScheduler>,
}

impl ArchiveChannel {
    /// Create a channel in `Created`. Spawns the channel task but does no I/O.
    ///
    /// `info` is what the registry learned when the request was accepted; it
    /// is refreshed from the configuration service on every connect attempt.
    pub fn new(pv: PvName, ctx: ChannelContext, info: Option<ChannelInfo>) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        let (state, _) = watch::channel(ChannelState::Created);
        let owner = ctx.scheduler.register();
        let shared = Arc::new(Shared {
            pv: pv.clone(),
            owner,
            state,
            generation: AtomicU64::new(0),
            counters: Counters::default(),
            writer_stats: Arc::new(WriterStats::default()),
            info: Mutex::new(info.clone()),
            meta_fields: Mutex::new(HashMap::new()),
            last_timestamp: Mutex::new(None),
            connected_since: Mutex::new(None),
        });
        let scheduler = ctx.scheduler.clone();
        let actor = ChannelActor {
            pv,
            owner,
            ctx,
            shared: shared.clone(),
            mailbox: tx.downgrade(),
            generation: 0,
            state: ChannelState::Created,
            info,
            subscription: None,
            connecting: None,
            early: EarlyEvents::default(),
            grace_deadline: None,
            last_timestamp: None,
            writer: None,
        };
        tokio::spawn(actor.run(rx));
        Self {
            tx,
            shared,
            scheduler,
        }
    }

    /// Canonical PV name.
    pub fn pv(&self) -> &PvName {
        &self.shared.pv
    }

    /// Current state.
    pub fn state(&self) -> ChannelState {
        *self.shared.state.borrow()
    }

    /// Whether value changes are currently being forwarded.
    pub fn is_connected(&self) -> bool {
        self.state() == ChannelState::Connected
    }

    /// Current generation.
    pub fn generation(&self) -> u64 {
        self.shared.generation.load(Ordering::SeqCst)
    }

    /// Begin archiving. Returns immediately whether or not the PV is
    /// reachable; the first connect attempt is queued with the scheduler.
    /// Only effective in `Created` or `Stopped`; returns whether it was.
    pub async fn start(&self) -> bool {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(ChannelMsg::Start { ack }).is_err() {
            return false;
        }
        rx.await.unwrap_or(false)
    }

    /// Stop archiving. When this returns the subscription is closed, queued
    /// samples have been handed to the sink, and no later callback can touch
    /// the channel.
    pub async fn stop(&self) {
        let (ack, rx) = oneshot::channel();
        if self.tx.send(ChannelMsg::Stop { ack }).is_ok() {
            let _ = rx.await;
        }
    }

    /// Wait until the channel reaches `target`. Returns `false` on timeout.
    pub async fn wait_for_state(&self, target: ChannelState, timeout: Duration) -> bool {
        let mut rx = self.shared.state.subscribe();
        let reached = matches!(
            tokio::time::timeout(timeout, rx.wait_for(|s| *s == target)).await,
            Ok(Ok(_))
        );
        reached
    }

    /// Copy of the latest metadata field values.
    pub fn current_meta_fields(&self) -> HashMap<String, String> {
        get(&self.shared.meta_fields)
    }

    /// Timestamp of the last sample forwarded to the sink.
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        get(&self.shared.last_timestamp)
    }

    /// Snapshot of state and counters.
    pub fn status(&self) -> ChannelStatus {
        let shared = &self.shared;
        let c = &shared.counters;
        let info = get(&shared.info);
        ChannelStatus {
            pv: shared.pv.clone(),
            state: self.state(),
            generation: self.generation(),
            sample_type: info.as_ref().map(|i| i.sample_type),
            extra_fields: info.map(|i| i.extra_fields).unwrap_or_default(),
            connect_attempts: read(&c.connect_attempts),
            connects: read(&c.connects),
            disconnects: read(&c.disconnects),
            samples_accepted: read(&c.accepted),
            samples_written: shared.writer_stats.written(),
            write_failures: shared.writer_stats.failed(),
            duplicates_dropped: read(&c.duplicates),
            type_mismatches: read(&c.type_mismatches),
            samples_dropped: read(&c.overflows),
            stale_callbacks: read(&c.stale_callbacks),
            last_timestamp: get(&shared.last_timestamp),
            connected_since: get(&shared.connected_since),
            retry_failures: self
                .scheduler
                .entry(&shared.pv)
                .filter(|e| e.owner == shared.owner)
                .map(|e| e.failures),
        }
    }
}

impl fmt::Debug for ArchiveChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ArchiveChannel")
            .field("pv", &self.shared.pv)
            .field("state", &self.state())
            .field("generation", &self.generation())
            .finish()
    }
}

type Opened = (ChannelInfo, SubscriptionHandle);

/// Values buffered while a connect attempt's result is still pending.
const EARLY_VALUE_LIMIT: usize = 64;

/// Callbacks that raced ahead of their own connect attempt's result.
#[derive(Default)]
struct EarlyEvents {
    values: VecDeque<Sample>,
    disconnected: bool,
}

struct ChannelActor {
    pv: PvName,
    owner: u64,
    ctx: ChannelContext,
    shared: Arc<Shared>,
    mailbox: WeakUnboundedSender<ChannelMsg>,
    generation: u64,
    state: ChannelState,
    info: Option<ChannelInfo>,
    subscription: Option<SubscriptionHandle>,
    connecting: Option<JoinHandle<Result<Opened>>>,
    early: EarlyEvents,
    grace_deadline: Option<Instant>,
    last_timestamp: Option<Timestamp>,
    writer: Option<SinkWriter>,
}

async fn connect_outcome(
    pv: &PvName,
    task: &mut Option<JoinHandle<Result<Opened>>>,
) -> Result<Opened> {
    match task.as_mut() {
        Some(handle) => match handle.await {
            Ok(result) => result,
            Err(e) => Err(ArchiveError::Transport {
                pv: pv.to_string(),
                reason: format!("connect task failed: {}", e),
            }),
        },
        None => std::future::pending().await,
    }
}

async fn grace_expired(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn open_subscription(
    ctx: ChannelContext,
    pv: PvName,
    events: SubscriptionEvents,
) -> Result<Opened> {
    let _permit = ctx
        .scheduler
        .acquire_connect_permit()
        .await
        .ok_or(ArchiveError::Shutdown)?;
    let info = ctx
        .metadata
        .lookup(&pv)
        .await?
        .ok_or_else(|| ArchiveError::NotArchivable { pv: pv.to_string() })?
        .resolve(&pv)?;
    let handle = tokio::time::timeout(ctx.connect_timeout, ctx.transport.open(&pv, events))
        .await
        .map_err(|_| ArchiveError::ConnectTimeout {
            pv: pv.to_string(),
            timeout_ms: ctx.connect_timeout.as_millis() as u64,
        })??;
    Ok((info, handle))
}

impl ChannelActor {
    async fn run(mut self, mut rx: UnboundedReceiver<ChannelMsg>) {
        loop {
            tokio::select! {
                msg = rx.recv() => match msg {
                    Some(msg) => self.handle(msg).await,
                    None => break,
                },
                outcome = connect_outcome(&self.pv, &mut self.connecting), if self.connecting.is_some() => {
                    self.connecting = None;
                    self.on_opened(outcome);
                }
                _ = grace_expired(self.grace_deadline), if self.grace_deadline.is_some() => {
                    self.on_grace_expired();
                }
            }
        }
        self.shutdown().await;
        trace!(pv = %self.pv, "channel task exiting");
    }

    async fn handle(&mut self, msg: ChannelMsg) {
        match msg {
            ChannelMsg::Start { ack } => {
                let _ = ack.send(self.on_start());
            }
            ChannelMsg::Stop { ack } => {
                self.shutdown().await;
                let _ = ack.send(());
            }
            ChannelMsg::Attempt { generation } => self.on_attempt(generation),
            ChannelMsg::Event { generation, event } => self.on_event(generation, event),
        }
    }

    fn set_state(&mut self, state: ChannelState) {
        self.state = state;
        self.shared.generation.store(self.generation, Ordering::SeqCst);
        self.shared.state.send_replace(state);
    }

    fn advance_generation(&mut self) {
        self.generation += 1;
        self.shared.generation.store(self.generation, Ordering::SeqCst);
    }

    fn on_start(&mut self) -> bool {
        if !matches!(self.state, ChannelState::Created | ChannelState::Stopped) {
            return false;
        }
        self.advance_generation();
        if self.writer.is_none() {
            self.writer = Some(SinkWriter::spawn(
                self.pv.clone(),
                self.ctx.sink.clone(),
                self.ctx.sink_queue_depth,
                self.shared.writer_stats.clone(),
            ));
        }
        self.set_state(ChannelState::Connecting);
        self.ctx
            .scheduler
            .schedule_initial(&self.pv, self.owner, self.mailbox.clone(), self.generation);
        info!(pv = %self.pv, generation = self.generation, "archiving started");
        true
    }

    fn on_attempt(&mut self, generation: u64) {
        if generation != self.generation {
            self.stale(generation, "retry");
            return;
        }
        let idle = self.connecting.is_none() && self.subscription.is_none();
        match self.state {
            ChannelState::Connecting | ChannelState::Disconnected if idle => self.begin_attempt(),
            _ => trace!(pv = %self.pv, state = %self.state, "retry no longer applies"),
        }
    }

    fn begin_attempt(&mut self) {
        self.set_state(ChannelState::Connecting);
        bump(&self.shared.counters.connect_attempts);
        self.early = EarlyEvents::default();
        let events = SubscriptionEvents::new(self.pv.clone(), self.generation, self.mailbox.clone());
        debug!(pv = %self.pv, generation = self.generation, "connect attempt");
        self.connecting = Some(tokio::spawn(open_subscription(
            self.ctx.clone(),
            self.pv.clone(),
            events,
        )));
    }

    fn on_opened(&mut self, outcome: Result<Opened>) {
        let (info, handle) = match outcome {
            Ok(opened) => opened,
            Err(e) => {
                match &e {
                    ArchiveError::ConnectTimeout { .. } | ArchiveError::NotArchivable { .. } => {
                        debug!(pv = %self.pv, error = %e, "connect attempt failed")
                    }
                    _ if e.is_retryable() => {
                        info!(pv = %self.pv, error = %e, "connect attempt failed")
                    }
                    _ => warn!(pv = %self.pv, error = %e, "cannot archive with current configuration"),
                }
                self.fail_attempt();
                return;
            }
        };

        set(&self.shared.info, Some(info.clone()));
        self.info = Some(info);
        self.subscription = Some(handle);
        let early = std::mem::take(&mut self.early);
        if !early.values.is_empty() {
            self.become_connected();
            for sample in early.values {
                self.forward(sample);
            }
        }
        if early.disconnected {
            debug!(pv = %self.pv, "connection dropped while opening");
            bump(&self.shared.counters.disconnects);
            self.fail_attempt();
        } else if self.state == ChannelState::Connecting {
            self.grace_deadline = Some(Instant::now() + self.ctx.connect_timeout);
        }
    }

    fn on_grace_expired(&mut self) {
        self.grace_deadline = None;
        if self.state == ChannelState::Connecting && self.subscription.is_some() {
            debug!(
                pv = %self.pv,
                timeout_ms = self.ctx.connect_timeout.as_millis() as u64,
                "no initial value within grace period"
            );
            self.fail_attempt();
        }
    }

    /// Give up on the current connection and let the scheduler pick a retry time.
    fn fail_attempt(&mut self) {
        if let Some(sub) = self.subscription.take() {
            sub.close();
        }
        self.grace_deadline = None;
        self.early = EarlyEvents::default();
        set(&self.shared.connected_since, None);
        self.advance_generation();
        self.set_state(ChannelState::Disconnected);
        let delay = self
            .ctx
            .scheduler
            .schedule_retry(&self.pv, self.owner, self.mailbox.clone(), self.generation);
        debug!(pv = %self.pv, delay_ms = delay.as_millis() as u64, "reconnect scheduled");
    }

    fn become_connected(&mut self) {
        self.grace_deadline = None;
        self.set_state(ChannelState::Connected);
        bump(&self.shared.counters.connects);
        set(&self.shared.connected_since, Some(Timestamp::now()));
        self.ctx.scheduler.on_connected(&self.pv, self.owner);
        if let (Some(sub), Some(info)) = (&self.subscription, &self.info) {
            if !info.extra_fields.is_empty() {
                sub.subscribe_fields(&info.extra_fields);
            }
        }
        info!(pv = %self.pv, generation = self.generation, "connected");
    }

    fn stale(&self, generation: u64, what: &str) {
        bump(&self.shared.counters.stale_callbacks);
        trace!(pv = %self.pv, generation, current = self.generation, what, "stale callback");
    }

    fn on_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation || self.state == ChannelState::Stopped {
            self.stale(generation, "transport");
            return;
        }
        match event {
            TransportEvent::Value(sample) => match self.state {
                ChannelState::Connected => self.forward(sample),
                ChannelState::Connecting if self.subscription.is_some() => {
                    self.become_connected();
                    self.forward(sample);
                }
                ChannelState::Connecting if self.connecting.is_some() => self.buffer_early(sample),
                _ => trace!(pv = %self.pv, state = %self.state, "value ignored"),
            },
            TransportEvent::MetaField { name, value } => {
                if let Ok(mut fields) = self.shared.meta_fields.lock() {
                    fields.insert(name, value);
                }
            }
            TransportEvent::Disconnected => match self.state {
                ChannelState::Connecting if self.connecting.is_some() => {
                    self.early.disconnected = true;
                }
                ChannelState::Connecting | ChannelState::Connected => {
                    info!(pv = %self.pv, "disconnected");
                    bump(&self.shared.counters.disconnects);
                    self.fail_attempt();
                }
                _ => {}
            },
        }
    }

    fn buffer_early(&mut self, sample: Sample) {
        if self.early.values.len() >= EARLY_VALUE_LIMIT {
            if let Some(oldest) = self.early.values.pop_front() {
                bump(&self.shared.counters.overflows);
                warn!(pv = %self.pv, ts = %oldest.timestamp, "early value buffer full, oldest dropped");
            }
        }
        self.early.values.push_back(sample);
    }

    /// Apply the type and monotonic-timestamp filters and queue the sample.
    fn forward(&mut self, sample: Sample) {
        if let Some(last) = self.last_timestamp {
            if sample.timestamp <= last {
                bump(&self.shared.counters.duplicates);
                trace!(pv = %self.pv, ts = %sample.timestamp, last = %last, "not newer, dropped");
                return;
            }
        }
        if let Some(info) = &self.info {
            if !info.sample_type.accepts(&sample.value) {
                bump(&self.shared.counters.type_mismatches);
                warn!(
                    pv = %self.pv,
                    sample_type = %info.sample_type,
                    ts = %sample.timestamp,
                    "value does not match declared type, dropped"
                );
                return;
            }
        }
        self.last_timestamp = Some(sample.timestamp);
        set(&self.shared.last_timestamp, Some(sample.timestamp));
        bump(&self.shared.counters.accepted);
        if let Some(writer) = &self.writer {
            match writer.try_push(sample) {
                Ok(()) => {}
                Err(ArchiveError::QueueFull { depth, .. }) => {
                    bump(&self.shared.counters.overflows);
                    warn!(pv = %self.pv, depth, "sink falling behind, sample dropped");
                }
                Err(_) => warn!(pv = %self.pv, "writer gone, sample dropped"),
            }
        }
    }

    async fn shutdown(&mut self) {
        if self.state == ChannelState::Stopped {
            return;
        }
        self.advance_generation();
        if let Some(task) = self.connecting.take() {
            task.abort();
            // A finished attempt hands back its subscription; dropping it closes it.
            let _ = task.await;
        }
        if let Some(sub) = self.subscription.take() {
            sub.close();
        }
        self.grace_deadline = None;
        self.early = EarlyEvents::default();
        self.ctx.scheduler.cancel(&self.pv, self.owner);
        if let Some(writer) = self.writer.take() {
            writer.close().await;
        }
        set(&self.shared.connected_since, None);
        let was = self.state;
        self.set_state(ChannelState::Stopped);
        if was != ChannelState::Created {
            info!(pv = %self.pv, "archiving stopped");
        }
    }
}
