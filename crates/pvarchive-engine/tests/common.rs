//! Common fixtures for engine integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use pvarchive_engine::{
    ChannelRegistry, EngineConfig, MemorySink, PvName, ReconnectConfig, Sample, SampleValue,
    SimServer, StaticMetadata, Timestamp,
};

/// Generous upper bound for anything that should happen "soon".
pub const WAIT: Duration = Duration::from_secs(5);

/// Engine settings tuned for fast tests.
pub fn fast_config() -> EngineConfig {
    EngineConfig {
        connect_timeout_ms: 200,
        sink_queue_depth: 64,
        reconnect: ReconnectConfig {
            initial_delay_ms: 10,
            max_delay_ms: 50,
            backoff_multiplier: 2.0,
            jitter_fraction: 0.1,
            initial_stagger_ms: 5,
            max_concurrent_connects: 32,
        },
        pvs: Vec::new(),
    }
}

/// A registry wired to a simulated server, an in-memory configuration
/// service and an in-memory sink.
pub struct TestEngine {
    pub server: Arc<SimServer>,
    pub metadata: Arc<StaticMetadata>,
    pub sink: Arc<MemorySink>,
    pub registry: Arc<ChannelRegistry>,
}

impl TestEngine {
    pub fn new() -> Self {
        Self::with_config(fast_config())
    }

    pub fn with_config(config: EngineConfig) -> Self {
        let server = SimServer::new();
        let metadata = Arc::new(StaticMetadata::new());
        let sink = Arc::new(MemorySink::new());
        let registry = ChannelRegistry::from_config(
            &config,
            metadata.clone(),
            Arc::new(server.transport()),
            sink.clone(),
        )
        .expect("valid test config");
        Self {
            server,
            metadata,
            sink,
            registry: Arc::new(registry),
        }
    }

    /// Register a string PV with the configuration service.
    pub fn declare(&self, name: &str, extra_fields: &[&str]) {
        self.metadata.insert(
            pv(name),
            "DBR_SCALAR_STRING",
            extra_fields.iter().map(|f| f.to_string()).collect(),
        );
    }

    /// Archived values of `name`, in sink order.
    pub fn values(&self, name: &str) -> Vec<String> {
        self.sink
            .samples(&pv(name))
            .iter()
            .map(|s| s.value.to_string())
            .collect()
    }
}

pub fn pv(name: &str) -> PvName {
    PvName::normalize(name).unwrap()
}

pub fn string_sample(secs: i64, v: &str) -> Sample {
    Sample::new(Timestamp::new(secs, 0), SampleValue::Str(v.to_string()))
}

/// Poll `cond` until it holds or `timeout` passes.
pub async fn eventually<F: Fn() -> bool>(cond: F, timeout: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
