use std::path::PathBuf;
use std::str::FromStr;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, fmt};

use kroute::{
    AddOutcome, BucketConfig, ExportOptions, Identifier, Peer, RefreshPolicy, RoutingTable,
    decode_table, encode_table,
};

#[derive(Clone, Debug)]
struct SeedPeer {
    address: String,
    id: Option<String>,
}

impl FromStr for SeedPeer {
    type Err = anyhow::Error;

    /// `HOST:PORT/IDENTIFIER`, or bare `HOST:PORT` for a bootstrap peer.
    fn from_str(s: &str) -> Result<Self> {
        match s.rsplit_once('/') {
            Some((address, id)) => {
                if !kroute::is_valid_hex_id(id) {
                    anyhow::bail!("identifier must be 40 hex characters (20 bytes)");
                }
                Ok(SeedPeer {
                    address: address.to_string(),
                    id: Some(id.to_string()),
                })
            }
            None => Ok(SeedPeer {
                address: s.to_string(),
                id: None,
            }),
        }
    }
}

#[derive(Parser, Debug)]
#[command(name = "kroute")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Local identifier (40 hex chars). Random when omitted.
    #[arg(short, long)]
    id: Option<Identifier>,

    /// Seed peers, `HOST:PORT/IDENTIFIER` or `HOST:PORT`.
    #[arg(short = 'S', long = "seed", value_name = "PEER")]
    seeds: Vec<SeedPeer>,

    /// Random peers to insert.
    #[arg(short, long, default_value = "200")]
    peers: usize,

    /// Bucket capacity.
    #[arg(short, long, default_value_t = kroute::K)]
    k: usize,

    /// Bucket refresh interval in seconds.
    #[arg(short, long, default_value = "3600", value_parser = clap::value_parser!(u64).range(1..))]
    refresh_secs: u64,

    /// Restore the table from this snapshot file before populating.
    #[arg(long, value_name = "FILE")]
    load: Option<PathBuf>,

    /// Write the table snapshot to this file.
    #[arg(short, long, value_name = "FILE")]
    out: Option<PathBuf>,

    /// Keep running and report refresh targets until Ctrl+C.
    #[arg(short, long)]
    watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .with_writer(std::io::stderr)
        .init();

    let self_id = args.id.unwrap_or_else(Identifier::random);
    let config = BucketConfig {
        k: args.k,
        refresh: RefreshPolicy {
            interval: Duration::from_secs(args.refresh_secs),
            ..RefreshPolicy::default()
        },
    };

    let (mut table, mut refresh_rx) = match &args.load {
        Some(path) => {
            let bytes = std::fs::read(path)
                .with_context(|| format!("failed to read snapshot {}", path.display()))?;
            let snapshots = decode_table(&bytes).context("failed to decode snapshot")?;
            RoutingTable::restore(self_id, config, &snapshots).context("failed to restore table")?
        }
        None => RoutingTable::new(self_id, config),
    };
    info!("Local identifier: {}", table.self_id());

    for seed in &args.seeds {
        let peer = match &seed.id {
            Some(id) => Peer::new(seed.address.clone(), id)?,
            None => {
                warn!(address = %seed.address, "bootstrap peer has no identifier, skipping");
                continue;
            }
        };
        match table.insert(peer) {
            Ok(outcome) => info!(address = %seed.address, ?outcome, "seed peer added"),
            Err(e) => warn!(address = %seed.address, error = %e, "seed peer rejected"),
        }
    }

    let mut evicted = 0usize;
    let mut refused = 0usize;
    for n in 0..args.peers {
        let address = format!("10.{}.{}.{}:4000", (n >> 16) & 0xff, (n >> 8) & 0xff, n & 0xff);
        match table.insert(Peer::with_id(address, Identifier::random())) {
            Ok(AddOutcome::Evicted(_)) => evicted += 1,
            Ok(AddOutcome::NeedsSplit) | Err(_) => refused += 1,
            Ok(_) => {}
        }
    }

    info!(
        peers = table.len(),
        buckets = table.buckets().len(),
        evicted,
        refused,
        "routing table populated"
    );
    for bucket in table.buckets() {
        info!(
            bucket = %bucket.id(),
            range = %bucket.range(),
            peers = bucket.len(),
            "{bucket}"
        );
    }

    if let Some(path) = &args.out {
        let bytes = encode_table(&table.export(&ExportOptions::full()))
            .context("failed to encode snapshot")?;
        std::fs::write(path, &bytes)
            .with_context(|| format!("failed to write snapshot {}", path.display()))?;
        info!(path = %path.display(), bytes = bytes.len(), "snapshot written");
    }

    if !args.watch {
        return Ok(());
    }

    // Graceful shutdown on Ctrl+C
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received shutdown signal, exiting gracefully");
                break;
            }
            Some(event) = refresh_rx.recv() => {
                match table.refresh_target(&event) {
                    Some(target) => info!(bucket = %event.bucket, %target, "bucket stale, lookup target"),
                    None => warn!(bucket = %event.bucket, "refresh for unknown bucket"),
                }
            }
        }
    }

    Ok(())
}
