//! # K-Buckets
//!
//! A [`KBucket`] owns one contiguous slice `(min, max]` of the distance space
//! measured from a parent identifier, and holds at most `k` peers from that
//! slice in freshest-first order.
//!
//! ## Insertion Policy
//!
//! [`KBucket::add_peer`] applies, in order:
//!
//! 1. **Refresh**: a known peer is touched and moved to the front.
//! 2. **Accept**: with room left, the peer is range-checked and inserted at the front.
//! 3. **Evict**: a full bucket whose range does not start at 0 drops its
//!    least-recently-seen peer (the tail) to make room.
//! 4. **Split**: a full bucket whose range starts at 0 refuses with
//!    [`AddOutcome::NeedsSplit`] and is left untouched; the owner calls
//!    [`KBucket::split`] and retries.
//!
//! Only the bucket nearest the local identifier can grow the tree; every
//! other bucket behaves as a bounded LRU cache.
//!
//! ## Splitting
//!
//! Splitting peels one bit of resolution off the top of the zero-anchored
//! range: `(0, max]` becomes `(0, max - 1]` (returned) and `(max - 1, max]`
//! (kept). Peers are rehomed by cached distance, preserving relative order.
//!
//! ## Staleness
//!
//! Every mutation calls [`KBucket::touch`], which pushes the refresh deadline
//! out by a jittered interval and restarts the timer. A bucket that goes a
//! full interval without activity emits a [`RefreshEvent`] to its owner.

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;
use tracing::{debug, error, trace, warn};

use crate::identity::{B, Identifier};
use crate::peer::Peer;
use crate::peers::PeerList;
use crate::refresh::{BucketId, RefreshEvent, RefreshPolicy, RefreshTimer};
use crate::snapshot::{BucketSnapshot, ExportOptions, PeerRecord, SnapshotError};

/// Maximum number of peers in a bucket.
pub const K: usize = 8;

/// Half-open distance interval `(min, max]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct BucketRange {
    pub min: u32,
    pub max: u32,
}

impl BucketRange {
    pub const fn new(min: u32, max: u32) -> Self {
        Self { min, max }
    }

    /// `(0, B]`: the whole identifier space except the anchor itself.
    pub const fn full() -> Self {
        Self { min: 0, max: B }
    }

    #[inline]
    pub fn contains(&self, distance: u32) -> bool {
        self.min < distance && distance <= self.max
    }

    /// `min < max <= B`.
    pub fn is_valid(&self) -> bool {
        self.min < self.max && self.max <= B
    }
}

impl std::fmt::Display for BucketRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "({}, {}]", self.min, self.max)
    }
}

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct BucketConfig {
    /// Capacity; values below 1 are treated as 1.
    pub k: usize,
    /// Normalized on bucket construction, see [`RefreshPolicy::normalized`].
    pub refresh: RefreshPolicy,
}

impl Default for BucketConfig {
    fn default() -> Self {
        Self {
            k: K,
            refresh: RefreshPolicy::default(),
        }
    }
}

/// Result of a successful [`KBucket::add_peer`] call.
#[derive(Debug, Clone, PartialEq)]
pub enum AddOutcome {
    /// The peer was already present; it was touched and moved to the front.
    Refreshed,
    /// The peer was inserted at the front.
    Inserted,
    /// The peer was inserted after evicting the returned least-recently-seen peer.
    Evicted(Peer),
    /// The bucket is full and splittable; nothing changed.
    NeedsSplit,
}

#[derive(Debug, Clone, PartialEq)]
pub enum BucketError {
    /// A peer's distance lies outside the bucket's range. Indicates a routing
    /// bug in the caller; the peer was not stored.
    RangeViolation {
        peer: String,
        distance: Option<u32>,
        range: BucketRange,
    },
    /// `split` on a bucket whose range does not start at 0, or is one bit wide.
    NotSplittable { range: BucketRange },
}

impl std::fmt::Display for BucketError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BucketError::RangeViolation { peer, distance, range } => match distance {
                Some(d) => write!(f, "{peer} at distance {d} is not in range {range}"),
                None => write!(f, "{peer} has no distance and cannot be placed in {range}"),
            },
            BucketError::NotSplittable { range } => write!(f, "bucket {range} is not splittable"),
        }
    }
}

impl std::error::Error for BucketError {}

#[derive(Debug)]
pub struct KBucket {
    id: BucketId,
    parent: Identifier,
    range: BucketRange,
    peers: PeerList,
    config: BucketConfig,
    timer: RefreshTimer,
}

impl KBucket {
    /// Create an empty bucket with the default configuration and start its refresh timer.
    pub fn new(parent: Identifier, range: BucketRange, events: mpsc::Sender<RefreshEvent>) -> Self {
        Self::with_config(parent, range, BucketConfig::default(), events)
    }

    pub fn with_config(
        parent: Identifier,
        range: BucketRange,
        config: BucketConfig,
        events: mpsc::Sender<RefreshEvent>,
    ) -> Self {
        let config = BucketConfig {
            k: config.k.max(1),
            refresh: config.refresh.normalized(),
        };
        let id = BucketId::next();
        let mut bucket = Self {
            id,
            parent,
            range,
            peers: PeerList::new(),
            config,
            timer: RefreshTimer::new(id, config.refresh, events),
        };
        bucket.touch();
        bucket
    }

    #[inline]
    pub fn id(&self) -> BucketId {
        self.id
    }

    #[inline]
    pub fn parent(&self) -> &Identifier {
        &self.parent
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.config.k
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    // ========================================================================
    // Insertion / removal
    // ========================================================================

    /// Record contact with `peer`. See the module docs for the policy.
    pub fn add_peer(&mut self, mut peer: Peer) -> Result<AddOutcome, BucketError> {
        if let Some(position) = self.peers.find(&peer) {
            let mut existing = self.peers.remove_at(position);
            existing.touch();
            self.peers.insert_at(0, existing);
            self.touch();
            trace!(bucket = %self.id, %peer, "refreshed known peer");
            return Ok(AddOutcome::Refreshed);
        }

        if !self.is_full() {
            self.insert_front(peer)?;
            return Ok(AddOutcome::Inserted);
        }

        if self.is_splittable() {
            trace!(bucket = %self.id, range = %self.range, %peer, "bucket full, split required");
            return Ok(AddOutcome::NeedsSplit);
        }

        // Range-check before evicting so a rejected peer never costs a live one.
        self.check_range(&mut peer)?;
        let evicted = self.peers.pop_back();
        self.insert_front(peer)?;
        match evicted {
            Some(oldest) => {
                debug!(
                    bucket = %self.id,
                    range = %self.range,
                    evicted = %oldest,
                    last_seen = oldest.last_seen(),
                    "evicted least-recently-seen peer"
                );
                Ok(AddOutcome::Evicted(oldest))
            }
            None => Ok(AddOutcome::Inserted),
        }
    }

    fn check_range(&self, peer: &mut Peer) -> Result<(), BucketError> {
        peer.cache_distance(&self.parent);
        match peer.distance() {
            Some(d) if self.distance_in_range(d) => Ok(()),
            distance => {
                error!(
                    bucket = %self.id,
                    range = %self.range,
                    %peer,
                    ?distance,
                    "peer routed to wrong bucket"
                );
                Err(BucketError::RangeViolation {
                    peer: peer.to_string(),
                    distance,
                    range: self.range,
                })
            }
        }
    }

    fn insert_front(&mut self, mut peer: Peer) -> Result<(), BucketError> {
        self.check_range(&mut peer)?;
        self.peers.insert_at(0, peer);
        self.touch();
        Ok(())
    }

    /// Remove `peer` if present. Absent peers are a no-op.
    pub fn remove_peer(&mut self, peer: &Peer) -> Option<Peer> {
        self.peers.remove_peer(peer)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub fn contains(&self, peer: &Peer) -> bool {
        self.peers.contains(peer)
    }

    pub fn iter(&self) -> std::slice::Iter<'_, Peer> {
        self.peers.iter()
    }

    /// Most recently seen peer.
    pub fn newest_peer(&self) -> Option<&Peer> {
        self.peers.front()
    }

    /// Least recently seen peer; the next eviction candidate.
    pub fn oldest_peer(&self) -> Option<&Peer> {
        self.peers.back()
    }

    /// Freshest-first copy of the peers, minus `exclude`, truncated to `n`.
    pub fn peers(&self, n: Option<usize>, exclude: &[Peer]) -> PeerList {
        let remaining = if exclude.is_empty() {
            self.peers.clone()
        } else {
            self.peers.difference(exclude)
        };
        match n {
            Some(n) => remaining.first(n),
            None => remaining,
        }
    }

    pub fn all_peers(&self) -> &PeerList {
        &self.peers
    }

    fn distance_of(&self, peer: &Peer) -> Option<u32> {
        peer.distance().or_else(|| peer.distance_to(&self.parent))
    }

    /// Range test on the peer's cached distance (computed on the fly if unset).
    pub fn peer_in_range(&self, peer: &Peer) -> bool {
        self.distance_of(peer).is_some_and(|d| self.distance_in_range(d))
    }

    pub fn id_in_range(&self, id: &Identifier) -> bool {
        self.distance_in_range(id.distance(&self.parent))
    }

    /// `min < distance <= max`.
    #[inline]
    pub fn distance_in_range(&self, distance: u32) -> bool {
        self.range.contains(distance)
    }

    // ========================================================================
    // Range
    // ========================================================================

    pub fn range(&self) -> BucketRange {
        self.range
    }

    /// Callers must keep `min < max`; only `split` is trusted to do so unchecked.
    pub fn set_range(&mut self, range: BucketRange) -> &mut Self {
        self.range = range;
        self
    }

    pub fn set_range_min(&mut self, min: u32) -> &mut Self {
        self.range.min = min;
        self
    }

    pub fn set_range_max(&mut self, max: u32) -> &mut Self {
        self.range.max = max;
        self
    }

    #[inline]
    pub fn is_splittable(&self) -> bool {
        self.range.min == 0
    }

    #[inline]
    pub fn is_full(&self) -> bool {
        self.peers.len() >= self.config.k
    }

    /// Split `(0, max]` into `(0, max - 1]` (returned) and `(max - 1, max]` (kept).
    pub fn split(&mut self) -> Result<KBucket, BucketError> {
        if !self.is_splittable() || self.range.max <= 1 {
            return Err(BucketError::NotSplittable { range: self.range });
        }

        let boundary = self.range.max - 1;
        let lower = BucketRange::new(self.range.min, boundary);
        let mut sibling = KBucket::with_config(self.parent, lower, self.config, self.timer.events().clone());
        self.set_range_min(boundary);

        let (moved, kept): (Vec<Peer>, Vec<Peer>) = std::mem::take(&mut self.peers)
            .into_iter()
            .partition(|peer| self.distance_of(peer).is_some_and(|d| lower.contains(d)));
        self.peers = PeerList::from_unique(kept);
        sibling.peers = PeerList::from_unique(moved);

        debug!(
            bucket = %self.id,
            kept_range = %self.range,
            kept = self.peers.len(),
            new_bucket = %sibling.id,
            new_range = %sibling.range,
            moved = sibling.peers.len(),
            "bucket split"
        );
        Ok(sibling)
    }

    // ========================================================================
    // Refresh timer
    // ========================================================================

    /// Push the refresh deadline out by one jittered interval and restart the timer.
    pub fn touch(&mut self) -> &mut Self {
        self.timer.touch();
        self
    }

    /// Arm the timer for the current deadline.
    pub fn set_refresh_timeout(&mut self) -> &mut Self {
        self.timer.arm();
        self
    }

    /// Cancel any pending refresh notification. Idempotent.
    pub fn stop_refresh_timeout(&mut self) -> &mut Self {
        self.timer.stop();
        self
    }

    /// Unix ms at which this bucket is considered stale.
    pub fn refresh_deadline(&self) -> u64 {
        self.timer.deadline()
    }

    pub fn is_refresh_active(&self) -> bool {
        self.timer.is_active()
    }

    // ========================================================================
    // Persistence
    // ========================================================================

    pub fn export(&self, options: &ExportOptions) -> BucketSnapshot {
        BucketSnapshot {
            range: self.range,
            peers: self.peers.map(|peer| PeerRecord::from_peer(peer, options)),
            refresh: self.refresh_deadline(),
        }
    }

    pub fn export_bytes(&self, options: &ExportOptions) -> Result<Vec<u8>, bincode::Error> {
        self.export(options).to_bytes()
    }

    /// Restore range, peers and refresh deadline from `snapshot`.
    ///
    /// Returns `false` on a structurally invalid snapshot. Not transactional:
    /// whatever was applied before the failing record stays applied.
    pub fn import(&mut self, snapshot: &BucketSnapshot) -> bool {
        match self.try_import(snapshot) {
            Ok(()) => true,
            Err(e) => {
                warn!(bucket = %self.id, error = %e, "bucket snapshot import failed");
                false
            }
        }
    }

    pub fn import_bytes(&mut self, bytes: &[u8]) -> bool {
        match BucketSnapshot::from_bytes(bytes) {
            Ok(snapshot) => self.import(&snapshot),
            Err(e) => {
                warn!(bucket = %self.id, error = %e, "bucket snapshot decode failed");
                false
            }
        }
    }

    pub fn try_import(&mut self, snapshot: &BucketSnapshot) -> Result<(), SnapshotError> {
        let range = snapshot.range;
        if !range.is_valid() {
            return Err(SnapshotError::InvalidRange {
                min: range.min,
                max: range.max,
            });
        }
        if snapshot.peers.len() > self.config.k {
            return Err(SnapshotError::TooManyPeers {
                count: snapshot.peers.len(),
                capacity: self.config.k,
            });
        }

        self.set_range(range);
        self.peers = PeerList::new();
        for record in &snapshot.peers {
            let mut peer = record.to_peer()?;
            peer.cache_distance(&self.parent);
            if !self.peer_in_range(&peer) {
                return Err(SnapshotError::PeerOutOfRange {
                    peer: peer.to_string(),
                    distance: peer.distance(),
                });
            }
            self.peers.add_peer(peer);
        }

        self.timer.set_deadline(snapshot.refresh);
        self.stop_refresh_timeout().set_refresh_timeout();
        debug!(
            bucket = %self.id,
            range = %self.range,
            peers = self.peers.len(),
            refresh = snapshot.refresh,
            "bucket snapshot imported"
        );
        Ok(())
    }
}

impl std::fmt::Display for KBucket {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "<{}:{}><#{}>", self.range.min, self.range.max, self.peers.len())
    }
}
