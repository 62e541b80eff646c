#![warn(missing_docs)]

//! `pvarchive-engine`: validate an archive configuration or run it against a
//! simulated PV server.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use pvarchive_engine::config::PvEntry;
use pvarchive_engine::{
    ChannelRegistry, EngineConfig, MemorySink, PvName, Sample, SampleType, SampleValue,
    SimServer, StaticMetadata, Timestamp,
};
use tokio::time::Instant;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Parser)]
#[command(name = "pvarchive-engine")]
#[command(about = "PV archive engine", long_about = None)]
struct Cli {
    /// Engine configuration (TOML or JSON).
    #[arg(short, long, env = "PVARCHIVE_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Validate the configuration and resolve every PV's sample type.
    Check,
    /// Archive the configured PVs from a simulated server, bouncing it once midway.
    Simulate {
        /// How long to publish values for.
        #[arg(short, long, default_value = "10")]
        duration_secs: u64,
        /// Value updates per PV per second.
        #[arg(short, long, default_value = "5")]
        updates_per_sec: u32,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(fmt::layer())
        .with(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Command::Check => check(&config),
        Command::Simulate {
            duration_secs,
            updates_per_sec,
        } => simulate(config, duration_secs, updates_per_sec).await,
    }
}

fn load_config(path: Option<&Path>) -> Result<EngineConfig> {
    match path {
        Some(path) => EngineConfig::from_file(path)
            .with_context(|| format!("loading {}", path.display())),
        None => {
            tracing::warn!("No config file given, using defaults");
            Ok(EngineConfig::default())
        }
    }
}

fn check(config: &EngineConfig) -> Result<()> {
    let mut bad = 0;
    for entry in &config.pvs {
        let name = PvName::normalize(&entry.name)?;
        match entry.sample_type.parse::<SampleType>() {
            Ok(t) => println!("{:<40} {}", name, t),
            Err(e) => {
                println!("{:<40} ERROR: {}", name, e);
                bad += 1;
            }
        }
    }
    if bad > 0 {
        anyhow::bail!("{} of {} PVs have an unknown sample type", bad, config.pvs.len());
    }
    println!("ok: {} PVs", config.pvs.len());
    Ok(())
}

fn demo_entries() -> Vec<PvEntry> {
    (0..4)
        .map(|i| PvEntry {
            name: format!("SIM:RAMP:{}", i),
            sample_type: "DBR_SCALAR_DOUBLE".to_string(),
            extra_fields: vec!["EGU".to_string()],
            aliases: vec![format!("SIM:RAMP_ALIAS:{}", i)],
        })
        .collect()
}

/// A value of the right shape for `sample_type`.
fn demo_value(sample_type: SampleType, n: u64) -> SampleValue {
    use SampleType::*;
    match sample_type {
        ScalarString => SampleValue::Str(format!("value {}", n)),
        ScalarShort | ScalarEnum | ScalarByte | ScalarInt => SampleValue::Int((n % 100) as i64),
        ScalarFloat | ScalarDouble => SampleValue::Double(n as f64 * 0.5),
        WaveformString => SampleValue::StrArray(vec![n.to_string(); 3]),
        WaveformShort | WaveformEnum | WaveformByte | WaveformInt => {
            SampleValue::IntArray(vec![(n % 100) as i64; 4])
        }
        WaveformFloat | WaveformDouble => SampleValue::DoubleArray(vec![n as f64; 4]),
        V4GenericBytes => SampleValue::Bytes(n.to_le_bytes().to_vec()),
    }
}

async fn simulate(mut config: EngineConfig, duration_secs: u64, updates_per_sec: u32) -> Result<()> {
    if config.pvs.is_empty() {
        config.pvs = demo_entries();
    }

    let server = SimServer::new();
    let metadata = Arc::new(StaticMetadata::from_entries(&config.pvs)?);
    let sink = Arc::new(MemorySink::new());
    let registry = ChannelRegistry::from_config(
        &config,
        metadata,
        Arc::new(server.transport()),
        sink.clone(),
    )?;

    let mut published: Vec<(PvName, SampleType, Sample)> = Vec::new();
    for entry in &config.pvs {
        let Ok(sample_type) = entry.sample_type.parse::<SampleType>() else {
            tracing::warn!(pv = %entry.name, "unknown sample type, not publishing");
            continue;
        };
        let initial = Sample::new(Timestamp::now(), demo_value(sample_type, 0));
        let pv = server.create_pv(&entry.name, initial.clone())?;
        for field in &entry.extra_fields {
            server.set_field(&pv, field, "sim");
        }
        published.push((pv, sample_type, initial));
    }

    for entry in &config.pvs {
        match registry.add(&entry.name).await {
            Ok(outcome) => tracing::debug!(pv = %outcome.pv(), ?outcome, "archive request"),
            Err(e) => tracing::error!(pv = %entry.name, error = %e, "archive request rejected"),
        }
        for alias in &entry.aliases {
            if let Err(e) = registry.add(alias).await {
                tracing::error!(pv = %alias, error = %e, "archive request rejected");
            }
        }
    }

    let period = Duration::from_secs_f64(1.0 / f64::from(updates_per_sec.max(1)));
    let start = Instant::now();
    let deadline = start + Duration::from_secs(duration_secs);
    let bounce_at = start + Duration::from_secs(duration_secs) / 2;
    let mut ticker = tokio::time::interval(period);
    let mut bounced = false;
    let mut n: u64 = 0;

    tracing::info!(pvs = published.len(), duration_secs, updates_per_sec, "simulation running");
    loop {
        tokio::select! {
            _ = ticker.tick() => {}
            _ = tokio::signal::ctrl_c() => {
                tracing::info!("interrupted");
                break;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            break;
        }
        if !bounced && now >= bounce_at {
            // The restarted server resends each PV's last value.
            tracing::info!("restarting simulated server");
            server.shutdown();
            tokio::time::sleep(period).await;
            for (pv, _, last) in &published {
                server.create_pv(pv.as_str(), last.clone())?;
            }
            bounced = true;
            continue;
        }
        n += 1;
        for (pv, t, last) in published.iter_mut() {
            *last = Sample::new(Timestamp::now(), demo_value(*t, n));
            server.update(pv, last.clone());
        }
    }

    // Let reconnects and in-flight writes settle before reporting.
    tokio::time::sleep(Duration::from_millis(config.reconnect.max_delay_ms.min(1_000))).await;
    let statuses = registry.statuses();
    println!("{}", serde_json::to_string_pretty(&statuses)?);
    registry.shutdown().await;
    tracing::info!(samples = sink.total(), "simulation finished");
    Ok(())
}
