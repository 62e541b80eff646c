//! Read-only facade over the configuration service.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};

use crate::config::PvEntry;
use crate::error::{ArchiveError, Result};
use crate::pv_name::PvName;
use crate::sample::SampleType;

/// Archiving parameters of one PV, as stored by the configuration service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PvTypeInfo {
    /// `DBR_*` sample type name.
    pub sample_type: String,
    /// Metadata fields to capture.
    pub extra_fields: Vec<String>,
    /// Canonical name when the looked-up name is an alias.
    pub alias_of: Option<PvName>,
}

/// [`PvTypeInfo`] with the sample type resolved.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelInfo {
    /// Declared sample type.
    pub sample_type: SampleType,
    /// Metadata fields to capture.
    pub extra_fields: Vec<String>,
}

impl PvTypeInfo {
    /// Parse the declared sample type.
    pub fn resolve(&self, pv: &PvName) -> Result<ChannelInfo> {
        let sample_type =
            self.sample_type
                .parse::<SampleType>()
                .map_err(|_| ArchiveError::UnknownSampleType {
                    pv: pv.to_string(),
                    sample_type: self.sample_type.clone(),
                })?;
        Ok(ChannelInfo {
            sample_type,
            extra_fields: self.extra_fields.clone(),
        })
    }
}

/// Configuration service lookups. Shared by every channel; implementations
/// must tolerate concurrent calls.
#[async_trait]
pub trait MetadataClient: Send + Sync {
    /// Look up a PV. `Ok(None)` means "not known yet", not a failure.
    async fn lookup(&self, pv: &PvName) -> Result<Option<PvTypeInfo>>;
}

/// In-memory configuration service.
#[derive(Default)]
pub struct StaticMetadata {
    pvs: DashMap<PvName, PvTypeInfo>,
    aliases: DashMap<PvName, PvName>,
    unavailable: AtomicBool,
    lookups: AtomicU64,
}

impl StaticMetadata {
    /// Create an empty service.
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed from configuration entries.
    pub fn from_entries(entries: &[PvEntry]) -> Result<Self> {
        let metadata = Self::new();
        for entry in entries {
            let name = PvName::normalize(&entry.name)?;
            metadata.insert(name.clone(), &entry.sample_type, entry.extra_fields.clone());
            for alias in &entry.aliases {
                metadata.add_alias(PvName::normalize(alias)?, name.clone());
            }
        }
        Ok(metadata)
    }

    /// Register or replace a PV.
    pub fn insert(&self, pv: PvName, sample_type: &str, extra_fields: Vec<String>) {
        self.pvs.insert(
            pv,
            PvTypeInfo {
                sample_type: sample_type.to_string(),
                extra_fields,
                alias_of: None,
            },
        );
    }

    /// Map `alias` to the canonical `target`.
    pub fn add_alias(&self, alias: PvName, target: PvName) {
        self.aliases.insert(alias, target);
    }

    /// Forget a PV.
    pub fn remove(&self, pv: &PvName) {
        self.pvs.remove(pv);
    }

    /// Make every lookup fail, as if the service were down.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of lookups served so far.
    pub fn lookup_count(&self) -> u64 {
        self.lookups.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl MetadataClient for StaticMetadata {
    async fn lookup(&self, pv: &PvName) -> Result<Option<PvTypeInfo>> {
        self.lookups.fetch_add(1, Ordering::Relaxed);
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(ArchiveError::Metadata {
                reason: "configuration service unavailable".to_string(),
            });
        }
        if let Some(info) = self.pvs.get(pv) {
            return Ok(Some(info.value().clone()));
        }
        let Some(target) = self.aliases.get(pv).map(|t| t.value().clone()) else {
            return Ok(None);
        };
        Ok(self.pvs.get(&target).map(|info| PvTypeInfo {
            alias_of: Some(target.clone()),
            ..info.value().clone()
        }))
    }
}
