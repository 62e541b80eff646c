//! In-process PV server for exercising the engine without a network.
//!
//! [`SimServer`] publishes PVs and pushes value changes to subscribers the way
//! a real server does: a new subscriber immediately receives the current value,
//! closing a PV disconnects every subscriber, and a PV can be re-created under
//! the same name. [`SimTransport`] adapts the server to [`Transport`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::{ArchiveError, Result};
use crate::pv_name::PvName;
use crate::sample::Sample;
use crate::transport::{Subscription, SubscriptionEvents, SubscriptionHandle, Transport};

struct Subscriber {
    id: u64,
    events: SubscriptionEvents,
    fields: Vec<String>,
}

struct SimPv {
    current: Sample,
    fields: HashMap<String, String>,
    subscribers: Vec<Subscriber>,
}

/// Simulated PV server.
#[derive(Default)]
pub struct SimServer {
    pvs: Mutex<HashMap<PvName, SimPv>>,
    created: Notify,
    next_id: AtomicU64,
    fail_opens: AtomicU32,
    opens: AtomicU64,
}

impl SimServer {
    /// Create a server with no PVs.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// A transport that subscribes through this server.
    pub fn transport(self: &Arc<Self>) -> SimTransport {
        SimTransport {
            server: self.clone(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<PvName, SimPv>> {
        self.pvs.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Publish a PV with an initial value. Re-publishing an existing PV
    /// replaces its value and keeps its subscribers.
    pub fn create_pv(&self, name: &str, initial: Sample) -> Result<PvName> {
        let pv = PvName::normalize(name)?;
        {
            let mut pvs = self.lock();
            match pvs.get_mut(&pv) {
                Some(existing) => existing.current = initial,
                None => {
                    pvs.insert(
                        pv.clone(),
                        SimPv {
                            current: initial,
                            fields: HashMap::new(),
                            subscribers: Vec::new(),
                        },
                    );
                }
            }
        }
        debug!(pv = %pv, "sim pv created");
        self.created.notify_waiters();
        Ok(pv)
    }

    /// Post a new value to every subscriber. Returns `false` if the PV does not exist.
    pub fn update(&self, pv: &PvName, sample: Sample) -> bool {
        let mut pvs = self.lock();
        let Some(entry) = pvs.get_mut(pv) else {
            return false;
        };
        entry.current = sample;
        let current = entry.current.clone();
        entry
            .subscribers
            .retain(|s| s.events.on_value_change(current.clone()));
        true
    }

    /// Set a metadata field and notify subscribers that asked for it.
    pub fn set_field(&self, pv: &PvName, field: &str, value: &str) -> bool {
        let mut pvs = self.lock();
        let Some(entry) = pvs.get_mut(pv) else {
            return false;
        };
        entry.fields.insert(field.to_string(), value.to_string());
        entry.subscribers.retain(|s| {
            !s.fields.iter().any(|f| f == field) || s.events.on_meta_field(field, value)
        });
        true
    }

    /// Destroy a PV; its subscribers see a disconnect.
    pub fn close_pv(&self, pv: &PvName) -> bool {
        let removed = self.lock().remove(pv);
        match removed {
            Some(entry) => {
                for s in &entry.subscribers {
                    s.events.on_disconnect();
                }
                debug!(pv = %pv, subscribers = entry.subscribers.len(), "sim pv closed");
                true
            }
            None => false,
        }
    }

    /// Destroy every PV.
    pub fn shutdown(&self) {
        let drained: Vec<(PvName, SimPv)> = self.lock().drain().collect();
        for (_, entry) in drained {
            for s in &entry.subscribers {
                s.events.on_disconnect();
            }
        }
    }

    /// Whether `pv` is currently published.
    pub fn exists(&self, pv: &PvName) -> bool {
        self.lock().contains_key(pv)
    }

    /// Subscriptions currently open on `pv`.
    pub fn subscriber_count(&self, pv: &PvName) -> usize {
        self.lock().get(pv).map(|e| e.subscribers.len()).unwrap_or(0)
    }

    /// Subscriptions currently open across all PVs.
    pub fn open_subscriptions(&self) -> usize {
        self.lock().values().map(|e| e.subscribers.len()).sum()
    }

    /// Subscriptions opened since the server started.
    pub fn total_opens(&self) -> u64 {
        self.opens.load(Ordering::Relaxed)
    }

    /// Refuse the next `n` opens with a transport error.
    pub fn fail_next_opens(&self, n: u32) {
        self.fail_opens.store(n, Ordering::SeqCst);
    }

    fn try_subscribe(&self, pv: &PvName, events: &SubscriptionEvents) -> Option<u64> {
        let mut pvs = self.lock();
        let entry = pvs.get_mut(pv)?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        events.on_value_change(entry.current.clone());
        entry.subscribers.push(Subscriber {
            id,
            events: events.clone(),
            fields: Vec::new(),
        });
        self.opens.fetch_add(1, Ordering::Relaxed);
        Some(id)
    }

    fn set_subscriber_fields(&self, pv: &PvName, id: u64, fields: &[String]) {
        let mut pvs = self.lock();
        let Some(entry) = pvs.get_mut(pv) else {
            return;
        };
        let known = entry.fields.clone();
        if let Some(sub) = entry.subscribers.iter_mut().find(|s| s.id == id) {
            sub.fields = fields.to_vec();
            for field in fields {
                if let Some(value) = known.get(field) {
                    sub.events.on_meta_field(field.as_str(), value.as_str());
                }
            }
        }
    }

    fn unsubscribe(&self, pv: &PvName, id: u64) {
        if let Some(entry) = self.lock().get_mut(pv) {
            entry.subscribers.retain(|s| s.id != id);
        }
    }
}

struct SimSubscription {
    server: Arc<SimServer>,
    pv: PvName,
    id: u64,
}

impl Subscription for SimSubscription {
    fn subscribe_fields(&self, fields: &[String]) {
        self.server.set_subscriber_fields(&self.pv, self.id, fields);
    }

    fn close(&self) {
        self.server.unsubscribe(&self.pv, self.id);
    }
}

/// [`Transport`] over a [`SimServer`].
#[derive(Clone)]
pub struct SimTransport {
    server: Arc<SimServer>,
}

#[async_trait]
impl Transport for SimTransport {
    async fn open(&self, pv: &PvName, events: SubscriptionEvents) -> Result<SubscriptionHandle> {
        let refused = self
            .server
            .fail_opens
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if refused {
            return Err(ArchiveError::Transport {
                pv: pv.to_string(),
                reason: "connection refused".to_string(),
            });
        }

        // Wait for the PV to be published; the caller bounds the wait.
        loop {
            let created = self.server.created.notified();
            tokio::pin!(created);
            created.as_mut().enable();

            if let Some(id) = self.server.try_subscribe(pv, &events) {
                let sub = SimSubscription {
                    server: self.server.clone(),
                    pv: pv.clone(),
                    id,
                };
                return Ok(SubscriptionHandle::new(pv.clone(), Box::new(sub)));
            }
            created.await;
        }
    }
}
