#![warn(missing_docs)]

//! PV archiver engine: per-PV archive channels, subscription lifecycle, reconnect scheduling

pub mod channel;
pub mod config;
pub mod error;
pub mod metadata;
pub mod pv_name;
pub mod registry;
pub mod sample;
pub mod scheduler;
pub mod sim;
pub mod sink;
pub mod transport;

pub use channel::{ArchiveChannel, ChannelState, ChannelStatus};
pub use config::{EngineConfig, ReconnectConfig};
pub use error::{ArchiveError, Result};
pub use metadata::{MetadataClient, PvTypeInfo, StaticMetadata};
pub use pv_name::PvName;
pub use registry::{AddOutcome, ChannelRegistry};
pub use sample::{Sample, SampleType, SampleValue, Timestamp};
pub use scheduler::ReconnectScheduler;
pub use sim::{SimServer, SimTransport};
pub use sink::{MemorySink, SampleSink};
pub use transport::{Subscription, SubscriptionEvents, SubscriptionHandle, Transport};
