//! Process-wide map from canonical PV name to its archive channel.

use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::channel::{ArchiveChannel, ChannelContext, ChannelState, ChannelStatus};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::metadata::{ChannelInfo, MetadataClient};
use crate::pv_name::PvName;
use crate::scheduler::ReconnectScheduler;
use crate::sink::SampleSink;
use crate::transport::Transport;

/// Result of an archive request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// A new channel was created and started.
    Created(PvName),
    /// A live channel already covers this name; nothing changed.
    AlreadyArchived(PvName),
}

impl AddOutcome {
    /// Canonical name of the channel covering the request.
    pub fn pv(&self) -> &PvName {
        match self {
            AddOutcome::Created(pv) | AddOutcome::AlreadyArchived(pv) => pv,
        }
    }
}

/// The authoritative set of archive channels; at most one live channel per
/// canonical name. Adding or removing one channel never blocks value delivery
/// on any other.
pub struct ChannelRegistry {
    ctx: ChannelContext,
    channels: DashMap<PvName, ArchiveChannel>,
    aliases: DashMap<PvName, PvName>,
}

impl ChannelRegistry {
    /// Create an empty registry over shared collaborators.
    pub fn new(ctx: ChannelContext) -> Self {
        Self {
            ctx,
            channels: DashMap::new(),
            aliases: DashMap::new(),
        }
    }

    /// Build a registry (and its reconnect scheduler) from configuration.
    pub fn from_config(
        config: &EngineConfig,
        metadata: Arc<dyn MetadataClient>,
        transport: Arc<dyn Transport>,
        sink: Arc<dyn SampleSink>,
    ) -> Result<Self> {
        config.validate()?;
        let ctx = ChannelContext {
            metadata,
            transport,
            sink,
            scheduler: ReconnectScheduler::new(config.reconnect.clone()),
            connect_timeout: config.connect_timeout(),
            sink_queue_depth: config.sink_queue_depth,
        };
        Ok(Self::new(ctx))
    }

    /// The reconnect scheduler shared by this registry's channels.
    pub fn scheduler(&self) -> &Arc<ReconnectScheduler> {
        &self.ctx.scheduler
    }

    fn canonical(&self, requested: &PvName) -> PvName {
        self.aliases
            .get(requested)
            .map(|c| c.value().clone())
            .unwrap_or_else(|| requested.clone())
    }

    /// `REC.FIELD` is already covered when `REC` (or the record `REC` is an
    /// alias of) is archived with `FIELD` as an extra field.
    async fn covering_record(&self, requested: &PvName) -> Option<PvName> {
        let field = requested.field_name()?;
        let record = requested.without_field();
        let record = match self.ctx.metadata.lookup(&record).await {
            Ok(Some(info)) => info.alias_of.unwrap_or(record),
            _ => self.canonical(&record),
        };
        let channel = self.channels.get(&record).map(|c| c.value().clone())?;
        let status = channel.status();
        let covered = status.state != ChannelState::Stopped
            && status.extra_fields.iter().any(|f| f == field);
        covered.then_some(record)
    }

    /// Accept an archive request for `name`.
    ///
    /// Returns as soon as the channel exists and its first connect attempt is
    /// queued; the PV does not have to be reachable. A request for a name
    /// (or alias) that already has a live channel is a no-op. Only
    /// configuration errors, such as an unresolvable sample type, fail.
    pub async fn add(&self, name: &str) -> Result<AddOutcome> {
        let requested = PvName::normalize(name)?;

        let (canonical, info): (PvName, Option<ChannelInfo>) =
            match self.ctx.metadata.lookup(&requested).await {
                Ok(Some(type_info)) => {
                    let canonical = type_info
                        .alias_of
                        .clone()
                        .unwrap_or_else(|| requested.clone());
                    let info = type_info.resolve(&canonical)?;
                    (canonical, Some(info))
                }
                Ok(None) => {
                    if let Some(record) = self.covering_record(&requested).await {
                        debug!(pv = %requested, record = %record, "field already archived with record");
                        return Ok(AddOutcome::AlreadyArchived(record));
                    }
                    debug!(pv = %requested, "not yet known to configuration service");
                    (self.canonical(&requested), None)
                }
                Err(e) => {
                    warn!(pv = %requested, error = %e, "metadata lookup failed, channel will retry");
                    (self.canonical(&requested), None)
                }
            };

        if canonical != requested {
            self.aliases.insert(requested.clone(), canonical.clone());
        }

        let channel = match self.channels.entry(canonical.clone()) {
            Entry::Occupied(mut existing) => {
                if existing.get().state() != ChannelState::Stopped {
                    debug!(pv = %canonical, requested = %requested, "duplicate archive request");
                    return Ok(AddOutcome::AlreadyArchived(canonical));
                }
                let channel = ArchiveChannel::new(canonical.clone(), self.ctx.clone(), info);
                existing.insert(channel.clone());
                channel
            }
            Entry::Vacant(slot) => {
                let channel = ArchiveChannel::new(canonical.clone(), self.ctx.clone(), info);
                slot.insert(channel.clone());
                channel
            }
        };

        channel.start().await;
        info!(pv = %canonical, requested = %requested, "archive request accepted");
        Ok(AddOutcome::Created(canonical))
    }

    /// Stop and discard the channel for `name` (or its alias). Returns whether one existed.
    pub async fn remove(&self, name: &str) -> Result<bool> {
        let requested = PvName::normalize(name)?;
        let canonical = self.canonical(&requested);
        let Some((_, channel)) = self.channels.remove(&canonical) else {
            return Ok(false);
        };
        self.aliases.retain(|_, target| *target != canonical);
        channel.stop().await;
        info!(pv = %canonical, "channel removed");
        Ok(true)
    }

    /// Channel for `name` (or its alias).
    pub fn get(&self, name: &str) -> Option<ArchiveChannel> {
        let requested = PvName::normalize(name).ok()?;
        let canonical = self.canonical(&requested);
        self.channels.get(&canonical).map(|c| c.value().clone())
    }

    /// Whether a channel exists for `name` (or its alias).
    pub fn contains(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Number of channels.
    pub fn len(&self) -> usize {
        self.channels.len()
    }

    /// Whether the registry has no channels.
    pub fn is_empty(&self) -> bool {
        self.channels.is_empty()
    }

    /// Canonical names of every channel, sorted.
    pub fn names(&self) -> Vec<PvName> {
        let mut names: Vec<PvName> = self.channels.iter().map(|e| e.key().clone()).collect();
        names.sort();
        names
    }

    /// Status of every channel, sorted by name.
    pub fn statuses(&self) -> Vec<ChannelStatus> {
        let channels: Vec<ArchiveChannel> =
            self.channels.iter().map(|e| e.value().clone()).collect();
        let mut statuses: Vec<ChannelStatus> = channels.iter().map(|c| c.status()).collect();
        statuses.sort_by(|a, b| a.pv.cmp(&b.pv));
        statuses
    }

    /// Stop and discard every channel.
    pub async fn shutdown(&self) {
        let names: Vec<PvName> = self.channels.iter().map(|e| e.key().clone()).collect();
        for name in names {
            if let Some((_, channel)) = self.channels.remove(&name) {
                channel.stop().await;
            }
        }
        self.aliases.clear();
        info!("registry shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ReconnectConfig;
    use crate::error::ArchiveError;
    use crate::metadata::StaticMetadata;
    use crate::sample::{Sample, SampleValue, Timestamp};
    use crate::sim::SimServer;
    use crate::sink::MemorySink;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn pv(name: &str) -> PvName {
        PvName::normalize(name).unwrap()
    }

    fn setup() -> (Arc<ChannelRegistry>, Arc<StaticMetadata>, Arc<SimServer>) {
        let server = SimServer::new();
        let metadata = Arc::new(StaticMetadata::new());
        let config = EngineConfig {
            connect_timeout_ms: 200,
            reconnect: ReconnectConfig {
                initial_delay_ms: 10,
                max_delay_ms: 50,
                initial_stagger_ms: 0,
                ..ReconnectConfig::default()
            },
            ..EngineConfig::default()
        };
        let registry = ChannelRegistry::from_config(
            &config,
            metadata.clone(),
            Arc::new(server.transport()),
            Arc::new(MemorySink::new()),
        )
        .unwrap();
        (Arc::new(registry), metadata, server)
    }

    #[tokio::test]
    async fn test_add_creates_and_starts_channel() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);

        let outcome = registry.add("A").await.unwrap();
        assert_eq!(outcome, AddOutcome::Created(pv("A")));
        let channel = registry.get("A").unwrap();
        assert_ne!(channel.state(), ChannelState::Created);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_add_twice_is_noop() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);

        registry.add("A").await.unwrap();
        let second = registry.add("A.VAL").await.unwrap();
        assert_eq!(second, AddOutcome::AlreadyArchived(pv("A")));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_alias_maps_to_canonical_channel() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("REAL"), "DBR_SCALAR_DOUBLE", vec![]);
        metadata.add_alias(pv("NICK"), pv("REAL"));

        assert_eq!(registry.add("REAL").await.unwrap(), AddOutcome::Created(pv("REAL")));
        assert_eq!(
            registry.add("NICK").await.unwrap(),
            AddOutcome::AlreadyArchived(pv("REAL"))
        );
        assert_eq!(registry.names(), vec![pv("REAL")]);
        assert_eq!(registry.get("NICK").unwrap().pv(), &pv("REAL"));
    }

    #[tokio::test]
    async fn test_alias_first_then_canonical() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("REAL"), "DBR_SCALAR_DOUBLE", vec![]);
        metadata.add_alias(pv("NICK"), pv("REAL"));

        assert_eq!(registry.add("NICK").await.unwrap(), AddOutcome::Created(pv("REAL")));
        assert_eq!(
            registry.add("REAL").await.unwrap(),
            AddOutcome::AlreadyArchived(pv("REAL"))
        );
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_field_of_archived_record_is_duplicate() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("REC"), "DBR_SCALAR_DOUBLE", vec!["HIHI".into()]);

        registry.add("REC").await.unwrap();
        assert_eq!(
            registry.add("REC.HIHI").await.unwrap(),
            AddOutcome::AlreadyArchived(pv("REC"))
        );
        assert_eq!(registry.len(), 1);

        assert_eq!(
            registry.add("REC.LOLO").await.unwrap(),
            AddOutcome::Created(pv("REC.LOLO"))
        );
        assert_eq!(registry.len(), 2);
    }

    #[tokio::test]
    async fn test_field_of_aliased_record_is_duplicate() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("REC"), "DBR_SCALAR_DOUBLE", vec!["HIHI".into()]);
        metadata.add_alias(pv("NICK"), pv("REC"));

        registry.add("REC").await.unwrap();
        assert_eq!(
            registry.add("NICK.HIHI").await.unwrap(),
            AddOutcome::AlreadyArchived(pv("REC"))
        );
        assert_eq!(registry.names(), vec![pv("REC")]);
    }

    #[tokio::test]
    async fn test_remove_racing_add_leaves_new_channel_recoverable() {
        let (registry, metadata, server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);
        server
            .create_pv("A", Sample::new(Timestamp::new(1, 0), SampleValue::Double(1.0)))
            .unwrap();

        for _ in 0..5 {
            registry.add("A").await.unwrap();
            let old = registry.get("A").unwrap();
            assert!(old.wait_for_state(ChannelState::Connected, WAIT).await);

            server.fail_next_opens(3);
            let remover = {
                let registry = registry.clone();
                tokio::spawn(async move { registry.remove("A").await.unwrap() })
            };
            while !matches!(registry.add("A").await.unwrap(), AddOutcome::Created(_)) {
                tokio::task::yield_now().await;
            }
            assert!(remover.await.unwrap());

            let new = registry.get("A").unwrap();
            assert!(new.wait_for_state(ChannelState::Connected, WAIT).await);
            assert_eq!(old.state(), ChannelState::Stopped);
            server.fail_next_opens(0);
            registry.remove("A").await.unwrap();
        }
        assert_eq!(server.open_subscriptions(), 0);
    }

    #[tokio::test]
    async fn test_unknown_sample_type_fails_creation() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("BAD"), "DBR_SCALAR_QUATERNION", vec![]);

        let err = registry.add("BAD").await.unwrap_err();
        assert!(matches!(err, ArchiveError::UnknownSampleType { .. }));
        assert!(registry.is_empty());
    }

    #[tokio::test]
    async fn test_invalid_name_fails() {
        let (registry, _metadata, _server) = setup();
        assert!(matches!(
            registry.add("  ").await,
            Err(ArchiveError::InvalidPvName { .. })
        ));
    }

    #[tokio::test]
    async fn test_unknown_pv_is_accepted_and_waits() {
        let (registry, _metadata, _server) = setup();
        assert_eq!(registry.add("NEW").await.unwrap(), AddOutcome::Created(pv("NEW")));
        let channel = registry.get("NEW").unwrap();
        assert!(channel.wait_for_state(ChannelState::Disconnected, WAIT).await);
    }

    #[tokio::test]
    async fn test_metadata_outage_does_not_fail_add() {
        let (registry, metadata, _server) = setup();
        metadata.set_unavailable(true);
        assert!(registry.add("A").await.is_ok());
        assert!(registry.contains("A"));
    }

    #[tokio::test]
    async fn test_remove_stops_channel() {
        let (registry, metadata, server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);
        let a = server
            .create_pv("A", Sample::new(Timestamp::new(1, 0), SampleValue::Double(1.0)))
            .unwrap();
        registry.add("A").await.unwrap();
        let channel = registry.get("A").unwrap();
        assert!(channel.wait_for_state(ChannelState::Connected, WAIT).await);

        assert!(registry.remove("A").await.unwrap());
        assert_eq!(channel.state(), ChannelState::Stopped);
        assert_eq!(server.subscriber_count(&a), 0);
        assert!(registry.is_empty());
        assert!(!registry.remove("A").await.unwrap());
    }

    #[tokio::test]
    async fn test_remove_via_alias() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("REAL"), "DBR_SCALAR_DOUBLE", vec![]);
        metadata.add_alias(pv("NICK"), pv("REAL"));
        registry.add("NICK").await.unwrap();

        assert!(registry.remove("NICK").await.unwrap());
        assert!(!registry.contains("REAL"));
        assert!(!registry.contains("NICK"));
    }

    #[tokio::test]
    async fn test_add_after_remove_creates_fresh_channel() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);
        registry.add("A").await.unwrap();
        registry.remove("A").await.unwrap();
        assert_eq!(registry.add("A").await.unwrap(), AddOutcome::Created(pv("A")));
    }

    #[tokio::test]
    async fn test_concurrent_adds_create_one_channel() {
        let (registry, metadata, _server) = setup();
        metadata.insert(pv("A"), "DBR_SCALAR_DOUBLE", vec![]);
        metadata.add_alias(pv("A_ALIAS"), pv("A"));

        let mut tasks = Vec::new();
        for i in 0..16 {
            let registry = registry.clone();
            let name = if i % 2 == 0 { "A" } else { "A_ALIAS" };
            tasks.push(tokio::spawn(async move { registry.add(name).await.unwrap() }));
        }
        let mut created = 0;
        for task in tasks {
            if matches!(task.await.unwrap(), AddOutcome::Created(_)) {
                created += 1;
            }
        }
        assert_eq!(created, 1);
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let (registry, metadata, _server) = setup();
        for name in ["A", "B", "C"] {
            metadata.insert(pv(name), "DBR_SCALAR_DOUBLE", vec![]);
            registry.add(name).await.unwrap();
        }
        let channels: Vec<ArchiveChannel> =
            ["A", "B", "C"].iter().filter_map(|n| registry.get(n)).collect();
        assert_eq!(registry.statuses().len(), 3);

        registry.shutdown().await;
        assert!(registry.is_empty());
        assert!(channels.iter().all(|c| c.state() == ChannelState::Stopped));
        assert_eq!(registry.scheduler().pending(), 0);
    }
}
