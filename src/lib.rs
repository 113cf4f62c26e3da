//! # Kroute - Kademlia K-Bucket Routing Core
//!
//! Kroute implements the routing-table core of a Kademlia-style DHT:
//!
//! - **Identity**: 160-bit identifiers with a bit-length-of-XOR distance metric
//! - **Peers**: resolved peers and address-only bootstrap peers
//! - **K-Buckets**: range-owning buckets with LRU eviction and split-on-demand
//! - **Refresh**: per-bucket jittered staleness timers that notify the owner
//! - **Snapshots**: bounded bincode export/import of bucket state
//!
//! ## Architecture
//!
//! Buckets never call back into their owner. Insertion returns an
//! [`AddOutcome`] telling the owner what happened (or that a split is needed),
//! and staleness is reported as [`RefreshEvent`]s on an `mpsc` channel the
//! owner drains. [`RoutingTable`] is a minimal owner that handles both.
//!
//! Transport, RPCs and iterative lookups are left to the embedding node.
//!
//! ## Module Overview
//!
//! | Module | Purpose |
//! |--------|--------|
//! | `identity` | `Identifier`, distance primitive, random and derived identifiers |
//! | `peer` | `Peer` entity, bootstrap resolution, distance cache |
//! | `peers` | `PeerList` ordered container with set semantics |
//! | `refresh` | Refresh timers, policy and events |
//! | `snapshot` | Serializable bucket snapshots |
//! | `kbucket` | `KBucket` insertion, eviction, splitting |
//! | `routing` | `RoutingTable` owner of a bucket tree |

mod identity;
mod kbucket;
mod peer;
mod peers;
mod refresh;
mod routing;
mod snapshot;

pub use identity::{B, ID_HEX_LEN, ID_LEN, Identifier, distance, is_valid_hex_id};
pub use kbucket::{AddOutcome, BucketConfig, BucketError, BucketRange, K, KBucket};
pub use peer::{Peer, PeerError};
pub use peers::{IndexOutOfRange, PeerList};
pub use refresh::{
    BucketId, MIN_REFRESH_INTERVAL, REFRESH_INTERVAL, REFRESH_JITTER, RefreshEvent, RefreshPolicy,
};
pub use routing::{REFRESH_CHANNEL_CAPACITY, RoutingTable};
pub use snapshot::{
    BucketSnapshot, ExportOptions, MAX_SNAPSHOT_SIZE, MAX_TABLE_SNAPSHOT_SIZE, PeerRecord,
    SnapshotError, decode_table, encode_table,
};
