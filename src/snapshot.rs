//! # Bucket Snapshots
//!
//! Persisted form of a single k-bucket:
//!
//! ```text
//! BucketSnapshot {
//!     range:   { min, max },
//!     peers:   [ { address, id, last_seen?, distance? }, ... ],   // freshest first
//!     refresh: unix ms deadline,
//! }
//! ```
//!
//! Snapshots are plain serde types; the byte encoding is bincode with a size
//! limit on decode. Storage media are the caller's business.

use bincode::Options;
use serde::{Deserialize, Serialize};

use crate::identity::B;
use crate::kbucket::BucketRange;
use crate::peer::{Peer, PeerError};

/// Upper bound on an encoded snapshot. A full bucket is well under 4 KiB.
pub const MAX_SNAPSHOT_SIZE: u64 = 64 * 1024;

/// Upper bound on an encoded table: one full snapshot per possible bucket.
pub const MAX_TABLE_SNAPSHOT_SIZE: u64 = MAX_SNAPSHOT_SIZE * B as u64;

fn bincode_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_SNAPSHOT_SIZE)
        .with_fixint_encoding()
}

fn table_options() -> impl Options {
    bincode::DefaultOptions::new()
        .with_limit(MAX_TABLE_SNAPSHOT_SIZE)
        .with_fixint_encoding()
}

/// Encode a whole table export (see [`RoutingTable::export`](crate::RoutingTable::export)).
pub fn encode_table(snapshots: &[BucketSnapshot]) -> Result<Vec<u8>, bincode::Error> {
    table_options().serialize(snapshots)
}

pub fn decode_table(bytes: &[u8]) -> Result<Vec<BucketSnapshot>, bincode::Error> {
    table_options().deserialize(bytes)
}

/// Which optional per-peer fields to include on export.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ExportOptions {
    pub include_last_seen: bool,
    pub include_distance: bool,
}

impl ExportOptions {
    pub fn full() -> Self {
        Self {
            include_last_seen: true,
            include_distance: true,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub address: String,
    pub id: String,
    #[serde(default)]
    pub last_seen: Option<u64>,
    #[serde(default)]
    pub distance: Option<u32>,
}

impl PeerRecord {
    pub fn from_peer(peer: &Peer, options: &ExportOptions) -> Self {
        let (address, id) = peer.triple();
        Self {
            address,
            id,
            last_seen: options.include_last_seen.then(|| peer.last_seen()),
            distance: if options.include_distance { peer.distance() } else { None },
        }
    }

    /// Rebuild the peer. `last_seen` is restored when present; the distance
    /// cache is left empty so the importing bucket recomputes it.
    pub fn to_peer(&self) -> Result<Peer, PeerError> {
        let mut peer = Peer::new(self.address.clone(), &self.id)?;
        if let Some(last_seen) = self.last_seen {
            peer.set_last_seen(last_seen);
        }
        Ok(peer)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSnapshot {
    pub range: BucketRange,
    pub peers: Vec<PeerRecord>,
    /// Refresh deadline, unix ms.
    pub refresh: u64,
}

impl BucketSnapshot {
    pub fn to_bytes(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode_options().serialize(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, bincode::Error> {
        bincode_options().deserialize(bytes)
    }
}

/// Reasons a snapshot could not be (fully) imported.
#[derive(Debug)]
pub enum SnapshotError {
    /// Bytes did not decode to a snapshot.
    Decode(bincode::Error),
    /// Range violates `min < max <= B`.
    InvalidRange { min: u32, max: u32 },
    /// A peer record carried a malformed identifier.
    InvalidPeer(PeerError),
    /// A peer record lies outside the snapshot's own range.
    PeerOutOfRange { peer: String, distance: Option<u32> },
    /// More records than the importing bucket can hold.
    TooManyPeers { count: usize, capacity: usize },
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Decode(e) => write!(f, "snapshot decode failed: {e}"),
            SnapshotError::InvalidRange { min, max } => {
                write!(f, "invalid snapshot range ({min}, {max}]")
            }
            SnapshotError::InvalidPeer(e) => write!(f, "invalid snapshot peer: {e}"),
            SnapshotError::PeerOutOfRange { peer, distance } => {
                write!(f, "snapshot peer {peer} at distance {distance:?} is out of range")
            }
            SnapshotError::TooManyPeers { count, capacity } => {
                write!(f, "snapshot holds {count} peers, bucket capacity is {capacity}")
            }
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Decode(e) => Some(&**e),
            SnapshotError::InvalidPeer(e) => Some(e),
            _ => None,
        }
    }
}

impl From<PeerError> for SnapshotError {
    fn from(e: PeerError) -> Self {
        SnapshotError::InvalidPeer(e)
    }
}

impl From<bincode::Error> for SnapshotError {
    fn from(e: bincode::Error) -> Self {
        SnapshotError::Decode(e)
    }
}
