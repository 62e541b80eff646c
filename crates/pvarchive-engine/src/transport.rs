//! Boundary with the network transport.
//!
//! The transport owns the wire protocol. The archive engine only needs four
//! capabilities from it: open a subscription, receive value changes, receive
//! metadata field updates, and learn that the connection dropped. Callbacks
//! are delivered as messages into the owning channel's mailbox, tagged with the
//! generation of the connect attempt that opened the subscription, so a
//! callback from a torn-down subscription can never touch current state.

use async_trait::async_trait;
use tokio::sync::mpsc::WeakUnboundedSender;

use crate::channel::ChannelMsg;
use crate::error::Result;
use crate::pv_name::PvName;
use crate::sample::Sample;

/// Something the transport observed on a live subscription.
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// The PV's value changed.
    Value(Sample),
    /// A metadata field changed.
    MetaField {
        /// Field name, e.g. `HIHI`.
        name: String,
        /// Field value rendered as text.
        value: String,
    },
    /// The connection dropped.
    Disconnected,
}

/// Callback sink handed to [`Transport::open`]. Cheap to clone; every clone
/// reports into the same channel under the same generation.
#[derive(Clone)]
pub struct SubscriptionEvents {
    pv: PvName,
    generation: u64,
    mailbox: WeakUnboundedSender<ChannelMsg>,
}

impl SubscriptionEvents {
    pub(crate) fn new(pv: PvName, generation: u64, mailbox: WeakUnboundedSender<ChannelMsg>) -> Self {
        Self {
            pv,
            generation,
            mailbox,
        }
    }

    /// PV this subscription belongs to.
    pub fn pv(&self) -> &PvName {
        &self.pv
    }

    /// Connect-attempt generation these events are tagged with.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report a value change. Returns `false` once the channel is gone.
    pub fn on_value_change(&self, sample: Sample) -> bool {
        self.deliver(TransportEvent::Value(sample))
    }

    /// Report a metadata field update.
    pub fn on_meta_field(&self, name: impl Into<String>, value: impl Into<String>) -> bool {
        self.deliver(TransportEvent::MetaField {
            name: name.into(),
            value: value.into(),
        })
    }

    /// Report that the connection dropped. Redundant reports are harmless.
    pub fn on_disconnect(&self) -> bool {
        self.deliver(TransportEvent::Disconnected)
    }

    /// Whether the owning channel no longer exists.
    pub fn is_closed(&self) -> bool {
        self.mailbox.upgrade().is_none()
    }

    fn deliver(&self, event: TransportEvent) -> bool {
        match self.mailbox.upgrade() {
            Some(tx) => tx
                .send(ChannelMsg::Event {
                    generation: self.generation,
                    event,
                })
                .is_ok(),
            None => false,
        }
    }
}

/// A live subscription, as implemented by a transport.
pub trait Subscription: Send + Sync {
    /// (Re)subscribe to metadata fields; updates arrive via `on_meta_field`.
    fn subscribe_fields(&self, fields: &[String]);

    /// Release transport resources. Must be safe to call more than once and
    /// after the remote source has vanished.
    fn close(&self);
}

/// Owning wrapper around a [`Subscription`]; closes it when dropped.
pub struct SubscriptionHandle {
    pv: PvName,
    inner: Option<Box<dyn Subscription>>,
}

impl SubscriptionHandle {
    /// Wrap a transport subscription.
    pub fn new(pv: PvName, inner: Box<dyn Subscription>) -> Self {
        Self {
            pv,
            inner: Some(inner),
        }
    }

    /// PV this handle subscribes to.
    pub fn pv(&self) -> &PvName {
        &self.pv
    }

    /// See [`Subscription::subscribe_fields`].
    pub fn subscribe_fields(&self, fields: &[String]) {
        if let Some(inner) = &self.inner {
            inner.subscribe_fields(fields);
        }
    }

    /// Close the subscription now.
    pub fn close(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if let Some(inner) = self.inner.take() {
            inner.close();
        }
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        self.release();
    }
}

impl std::fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("pv", &self.pv)
            .field("open", &self.inner.is_some())
            .finish()
    }
}

/// Opens subscriptions to remote PVs.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open a value-change subscription. Resolves once the remote source has
    /// accepted it; callers bound the wait with their own grace period.
    async fn open(&self, pv: &PvName, events: SubscriptionEvents) -> Result<SubscriptionHandle>;
}
