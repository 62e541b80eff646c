//! Cross-channel reconnect scheduling.
//!
//! Every channel that loses (or never gets) its connection has an entry here
//! recording its consecutive failures. Retries back off exponentially up to a
//! ceiling and are jittered so that a bulk outage does not turn into a
//! synchronized reconnect storm. A semaphore additionally caps how many
//! connect attempts run at once across the whole process.
//!
//! A fired retry is only a suggestion: the channel re-checks its own state and
//! generation and ignores retries that no longer apply.
//!
//! Entries are owned by one channel instance. A stopped channel and its
//! replacement can briefly share a PV name; each only ever clears its own entry.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use rand::Rng;
use tokio::sync::mpsc::WeakUnboundedSender;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::channel::ChannelMsg;
use crate::config::ReconnectConfig;
use crate::pv_name::PvName;

/// Retry bookkeeping for one disconnected channel.
#[derive(Debug, Clone)]
pub struct RetryEntry {
    /// Consecutive failed attempts since the last successful connect.
    pub failures: u32,
    /// Delay chosen for the pending retry.
    pub delay: Duration,
    /// When the pending retry fires.
    pub next_retry: Instant,
    /// Channel instance that armed the retry.
    pub owner: u64,
    ticket: u64,
}

/// Decides when disconnected channels try again.
pub struct ReconnectScheduler {
    config: ReconnectConfig,
    entries: DashMap<PvName, RetryEntry>,
    permits: Arc<Semaphore>,
    tickets: AtomicU64,
    owners: AtomicU64,
}

impl ReconnectScheduler {
    /// Create a scheduler.
    pub fn new(config: ReconnectConfig) -> Arc<Self> {
        debug!(
            "Initializing reconnect scheduler: initial_delay={}ms, max_delay={}ms, max_concurrent_connects={}",
            config.initial_delay_ms, config.max_delay_ms, config.max_concurrent_connects
        );
        let permits = Arc::new(Semaphore::new(config.max_concurrent_connects.max(1)));
        Arc::new(Self {
            config,
            entries: DashMap::new(),
            permits,
            tickets: AtomicU64::new(1),
            owners: AtomicU64::new(1),
        })
    }

    /// A fresh owner id for one channel instance.
    pub fn register(&self) -> u64 {
        self.owners.fetch_add(1, Ordering::Relaxed)
    }

    /// Active configuration.
    pub fn config(&self) -> &ReconnectConfig {
        &self.config
    }

    /// Un-jittered delay after `failures` consecutive failures (`failures >= 1`).
    pub fn base_delay(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(63) as i32;
        let computed =
            self.config.initial_delay_ms as f64 * self.config.backoff_multiplier.powi(exponent);
        let capped = computed.min(self.config.max_delay_ms as f64);
        Duration::from_millis(capped as u64)
    }

    /// Jittered delay after `failures` consecutive failures; never below 1ms.
    pub fn retry_delay(&self, failures: u32) -> Duration {
        let base = self.base_delay(failures).as_millis() as f64;
        let fraction = self.config.jitter_fraction;
        let factor = if fraction > 0.0 {
            1.0 + rand::thread_rng().gen_range(-fraction..=fraction)
        } else {
            1.0
        };
        Duration::from_millis(((base * factor) as u64).max(1))
    }

    fn initial_delay(&self) -> Duration {
        let stagger = self.config.initial_stagger_ms;
        if stagger == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=stagger))
    }

    /// Queue the first connect attempt of a freshly started channel.
    pub(crate) fn schedule_initial(
        self: &Arc<Self>,
        pv: &PvName,
        owner: u64,
        mailbox: WeakUnboundedSender<ChannelMsg>,
        generation: u64,
    ) {
        let delay = self.initial_delay();
        self.arm(pv, owner, 0, delay, mailbox, generation);
    }

    /// Record a failed attempt and queue the next one. Returns the chosen delay.
    pub(crate) fn schedule_retry(
        self: &Arc<Self>,
        pv: &PvName,
        owner: u64,
        mailbox: WeakUnboundedSender<ChannelMsg>,
        generation: u64,
    ) -> Duration {
        let failures = self
            .entries
            .get(pv)
            .filter(|e| e.owner == owner)
            .map(|e| e.failures)
            .unwrap_or(0)
            .saturating_add(1);
        let delay = self.retry_delay(failures);
        self.arm(pv, owner, failures, delay, mailbox, generation);
        delay
    }

    fn arm(
        self: &Arc<Self>,
        pv: &PvName,
        owner: u64,
        failures: u32,
        delay: Duration,
        mailbox: WeakUnboundedSender<ChannelMsg>,
        generation: u64,
    ) {
        let ticket = self.tickets.fetch_add(1, Ordering::Relaxed);
        self.entries.insert(
            pv.clone(),
            RetryEntry {
                failures,
                delay,
                next_retry: Instant::now() + delay,
                owner,
                ticket,
            },
        );
        trace!(pv = %pv, failures, delay_ms = delay.as_millis() as u64, "retry armed");

        let scheduler = Arc::clone(self);
        let pv = pv.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let current = scheduler
                .entries
                .get(&pv)
                .map(|e| e.ticket == ticket)
                .unwrap_or(false);
            if !current {
                return;
            }
            if let Some(tx) = mailbox.upgrade() {
                let _ = tx.send(ChannelMsg::Attempt { generation });
            }
        });
    }

    /// The channel connected: forget its failures so the next outage starts from the base delay.
    pub fn on_connected(&self, pv: &PvName, owner: u64) {
        self.entries.remove_if(pv, |_, e| e.owner == owner);
    }

    /// Drop `owner`'s pending retry for `pv`. Safe if the retry is already firing.
    pub fn cancel(&self, pv: &PvName, owner: u64) {
        self.entries.remove_if(pv, |_, e| e.owner == owner);
    }

    /// Retry bookkeeping for `pv`, if it has any.
    pub fn entry(&self, pv: &PvName) -> Option<RetryEntry> {
        self.entries.get(pv).map(|e| e.value().clone())
    }

    /// Number of channels with retry bookkeeping.
    pub fn pending(&self) -> usize {
        self.entries.len()
    }

    /// Wait for a connect slot. `None` only if the scheduler is being torn down.
    pub async fn acquire_connect_permit(&self) -> Option<OwnedSemaphorePermit> {
        self.permits.clone().acquire_owned().await.ok()
    }

    /// Connect slots currently free.
    pub fn available_permits(&self) -> usize {
        self.permits.available_permits()
    }
}
