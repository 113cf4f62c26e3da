//! # Routing Table
//!
//! Minimal owner of a k-bucket tree. It starts with one bucket covering
//! `(0, B]` and grows only by splitting the zero-anchored bucket, so the
//! buckets always partition the distance space:
//!
//! ```text
//!   (0, 157] (157, 158] (158, 159] (159, 160]
//!   └─ near ─┘                      └─ far ─┘
//! ```
//!
//! Insertion routes a peer to the unique bucket whose range contains its
//! distance from the local identifier. A [`AddOutcome::NeedsSplit`] answer is
//! handled here by splitting and retrying; every other outcome is passed
//! through to the caller.
//!
//! All buckets share one refresh channel, handed out by [`RoutingTable::new`].
//! The table does not perform lookups itself: [`RoutingTable::refresh_target`]
//! picks an identifier for the caller's lookup, and [`RoutingTable::closest`]
//! serves its candidate lists.

use std::collections::BinaryHeap;

use rand::Rng;
use tokio::sync::mpsc;
use tracing::{debug, trace};

use crate::identity::{B, ID_LEN, Identifier};
use crate::kbucket::{AddOutcome, BucketConfig, BucketError, BucketRange, KBucket};
use crate::peer::Peer;
use crate::refresh::{BucketId, RefreshEvent};
use crate::snapshot::{BucketSnapshot, ExportOptions, SnapshotError};

/// Buffered refresh notifications before timers start dropping them.
pub const REFRESH_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug)]
pub struct RoutingTable {
    self_id: Identifier,
    config: BucketConfig,
    events: mpsc::Sender<RefreshEvent>,
    /// Ordered by range; `buckets[0]` is always the zero-anchored bucket.
    buckets: Vec<KBucket>,
}

impl RoutingTable {
    pub fn new(self_id: Identifier, config: BucketConfig) -> (Self, mpsc::Receiver<RefreshEvent>) {
        let (events, rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        let root = KBucket::with_config(self_id, BucketRange::full(), config, events.clone());
        let table = Self {
            self_id,
            config,
            events,
            buckets: vec![root],
        };
        (table, rx)
    }

    /// Rebuild a table from exported bucket snapshots.
    ///
    /// The snapshot ranges must partition `(0, B]` exactly.
    pub fn restore(
        self_id: Identifier,
        config: BucketConfig,
        snapshots: &[BucketSnapshot],
    ) -> Result<(Self, mpsc::Receiver<RefreshEvent>), SnapshotError> {
        let mut ordered: Vec<&BucketSnapshot> = snapshots.iter().collect();
        ordered.sort_by_key(|s| s.range.min);

        let mut expected_min = 0;
        for snapshot in &ordered {
            if snapshot.range.min != expected_min || !snapshot.range.is_valid() {
                return Err(SnapshotError::InvalidRange {
                    min: snapshot.range.min,
                    max: snapshot.range.max,
                });
            }
            expected_min = snapshot.range.max;
        }
        if expected_min != B {
            return Err(SnapshotError::InvalidRange {
                min: expected_min,
                max: B,
            });
        }

        let (events, rx) = mpsc::channel(REFRESH_CHANNEL_CAPACITY);
        let mut buckets = Vec::with_capacity(ordered.len());
        for snapshot in ordered {
            let mut bucket = KBucket::with_config(self_id, snapshot.range, config, events.clone());
            bucket.try_import(snapshot)?;
            buckets.push(bucket);
        }

        debug!(buckets = buckets.len(), "routing table restored");
        Ok((
            Self {
                self_id,
                config,
                events,
                buckets,
            },
            rx,
        ))
    }

    #[inline]
    pub fn self_id(&self) -> &Identifier {
        &self.self_id
    }

    pub fn config(&self) -> &BucketConfig {
        &self.config
    }

    pub fn buckets(&self) -> &[KBucket] {
        &self.buckets
    }

    pub fn len(&self) -> usize {
        self.buckets.iter().map(KBucket::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.iter().all(KBucket::is_empty)
    }

    fn index_for(&self, distance: u32) -> Option<usize> {
        self.buckets.iter().position(|b| b.distance_in_range(distance))
    }

    /// The bucket responsible for `id`. `None` for the local identifier.
    pub fn bucket_for(&self, id: &Identifier) -> Option<&KBucket> {
        self.index_for(id.distance(&self.self_id)).map(|i| &self.buckets[i])
    }

    pub fn bucket(&self, id: BucketId) -> Option<&KBucket> {
        self.buckets.iter().find(|b| b.id() == id)
    }

    /// Record contact with `peer`, splitting the near bucket as needed.
    ///
    /// Returns [`AddOutcome::NeedsSplit`] only when the near bucket is full
    /// and already one bit wide. The local identifier and bootstrap peers
    /// are refused with [`BucketError::RangeViolation`].
    pub fn insert(&mut self, peer: Peer) -> Result<AddOutcome, BucketError> {
        let distance = peer.distance_to(&self.self_id);
        let Some(mut index) = distance.and_then(|d| self.index_for(d)) else {
            trace!(%peer, ?distance, "peer has no bucket, ignoring");
            return Err(BucketError::RangeViolation {
                peer: peer.to_string(),
                distance,
                range: BucketRange::full(),
            });
        };

        loop {
            match self.buckets[index].add_peer(peer.clone())? {
                AddOutcome::NeedsSplit => match self.buckets[index].split() {
                    Ok(sibling) => {
                        // The sibling owns the lower half and precedes its parent.
                        self.buckets.insert(index, sibling);
                        if !self.buckets[index].peer_in_range(&peer) {
                            index += 1;
                        }
                    }
                    Err(_) => return Ok(AddOutcome::NeedsSplit),
                },
                outcome => return Ok(outcome),
            }
        }
    }

    pub fn remove(&mut self, peer: &Peer) -> Option<Peer> {
        let index = peer.distance_to(&self.self_id).and_then(|d| self.index_for(d))?;
        self.buckets[index].remove_peer(peer)
    }

    pub fn contains(&self, peer: &Peer) -> bool {
        peer.id()
            .and_then(|id| self.bucket_for(id))
            .is_some_and(|bucket| bucket.contains(peer))
    }

    /// Up to `n` peers ordered by XOR distance to `target`, nearest first.
    pub fn closest(&self, target: &Identifier, n: usize) -> Vec<Peer> {
        if n == 0 {
            return Vec::new();
        }

        struct Candidate<'a> {
            xor: [u8; ID_LEN],
            peer: &'a Peer,
        }

        impl PartialEq for Candidate<'_> {
            fn eq(&self, other: &Self) -> bool {
                self.xor == other.xor
            }
        }

        impl Eq for Candidate<'_> {}

        impl Ord for Candidate<'_> {
            fn cmp(&self, other: &Self) -> std::cmp::Ordering {
                self.xor.cmp(&other.xor)
            }
        }

        impl PartialOrd for Candidate<'_> {
            fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
                Some(self.cmp(other))
            }
        }

        let mut heap: BinaryHeap<Candidate<'_>> = BinaryHeap::with_capacity(n + 1);
        for peer in self.buckets.iter().flat_map(KBucket::iter) {
            let Some(id) = peer.id() else { continue };
            let xor = id.xor_distance(target);

            if heap.len() < n {
                heap.push(Candidate { xor, peer });
            } else if let Some(worst) = heap.peek()
                && xor < worst.xor
            {
                heap.push(Candidate { xor, peer });
                heap.pop();
            }
        }

        heap.into_sorted_vec().into_iter().map(|c| c.peer.clone()).collect()
    }

    /// Random identifier inside the stale bucket's range, to be looked up by
    /// the caller. `None` if the bucket no longer exists.
    pub fn refresh_target(&self, event: &RefreshEvent) -> Option<Identifier> {
        let bucket = self.bucket(event.bucket)?;
        let range = bucket.range();
        let distance = rand::thread_rng().gen_range(range.min + 1..=range.max);
        let target = Identifier::random_at_distance(&self.self_id, distance);
        debug!(bucket = %event.bucket, %range, %target, "refresh target chosen");
        Some(target)
    }

    /// Snapshot every bucket, near bucket first.
    pub fn export(&self, options: &ExportOptions) -> Vec<BucketSnapshot> {
        self.buckets.iter().map(|b| b.export(options)).collect()
    }

    /// Sender shared by every bucket's refresh timer.
    pub fn events(&self) -> &mpsc::Sender<RefreshEvent> {
        &self.events
    }
}

impl std::fmt::Display for RoutingTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.self_id)?;
        for bucket in &self.buckets {
            write!(f, " {bucket}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table() -> (RoutingTable, mpsc::Receiver<RefreshEvent>) {
        RoutingTable::new(Identifier::random(), BucketConfig::default())
    }

    fn peer_at(anchor: &Identifier, distance: u32, port: u16) -> Peer {
        Peer::with_id(format!("10.1.0.1:{port}"), Identifier::random_at_distance(anchor, distance))
    }

    fn assert_partition(table: &RoutingTable) {
        let mut expected_min = 0;
        for bucket in table.buckets() {
            assert_eq!(bucket.range().min, expected_min, "gap or overlap at {bucket}");
            assert!(bucket.range().min < bucket.range().max);
            expected_min = bucket.range().max;
        }
        assert_eq!(expected_min, B);
    }

    #[test]
    fn starts_with_single_full_bucket() {
        let (table, _rx) = table();
        assert_eq!(table.buckets().len(), 1);
        assert_eq!(table.buckets()[0].range(), BucketRange::full());
        assert!(table.is_empty());
        assert_partition(&table);
    }

    #[test]
    fn refuses_self_and_bootstrap() {
        let (mut table, _rx) = table();
        let me = Peer::with_id("127.0.0.1:1", *table.self_id());
        assert!(table.insert(me).is_err());
        assert!(table.insert(Peer::bootstrap("127.0.0.1:2")).is_err());
        assert!(table.is_empty());
    }

    #[test]
    fn splits_near_bucket_on_demand() {
        let (mut table, _rx) = table();
        let me = *table.self_id();
        for i in 0..8u16 {
            table.insert(peer_at(&me, 150, i)).unwrap();
        }
        assert_eq!(table.buckets().len(), 1);

        let far = peer_at(&me, 160, 100);
        assert_eq!(table.insert(far.clone()), Ok(AddOutcome::Inserted));
        assert_eq!(table.buckets().len(), 2);
        assert_partition(&table);
        assert!(table.contains(&far));
        assert_eq!(table.len(), 9);
    }

    #[test]
    fn invariants_hold_under_load() {
        let (mut table, _rx) = table();
        let me = *table.self_id();
        let mut rng = rand::thread_rng();
        for i in 0..2_000u16 {
            let peer = if i % 3 == 0 {
                peer_at(&me, rng.gen_range(1..=B), i)
            } else {
                Peer::with_id(format!("10.2.0.1:{i}"), Identifier::random())
            };
            let _ = table.insert(peer);
        }

        assert_partition(&table);
        for bucket in table.buckets() {
            assert!(bucket.len() <= bucket.capacity());
            for peer in bucket.iter() {
                assert!(bucket.peer_in_range(peer));
                let elsewhere = table
                    .buckets()
                    .iter()
                    .filter(|b| b.contains(peer))
                    .count();
                assert_eq!(elsewhere, 1);
            }
        }
    }

    #[test]
    fn closest_is_sorted_by_xor() {
        let (mut table, _rx) = table();
        for i in 0..200u16 {
            let _ = table.insert(Peer::with_id(format!("10.3.0.1:{i}"), Identifier::random()));
        }
        let target = Identifier::random();
        let picked = table.closest(&target, 5);
        assert_eq!(picked.len(), 5.min(table.len()));

        let xors: Vec<_> = picked
            .iter()
            .filter_map(Peer::id)
            .map(|id| id.xor_distance(&target))
            .collect();
        assert!(xors.windows(2).all(|w| w[0] <= w[1]));

        let best = table
            .buckets()
            .iter()
            .flat_map(KBucket::iter)
            .filter_map(Peer::id)
            .map(|id| id.xor_distance(&target))
            .min();
        assert_eq!(xors.first().copied(), best);
        assert!(table.closest(&target, 0).is_empty());
    }

    #[test]
    fn remove_routes_to_owning_bucket() {
        let (mut table, _rx) = table();
        let peer = Peer::with_id("10.4.0.1:1", Identifier::random());
        table.insert(peer.clone()).unwrap();
        assert!(table.contains(&peer));
        assert!(table.remove(&peer).is_some());
        assert!(!table.contains(&peer));
        assert!(table.remove(&peer).is_none());
    }

    #[test]
    fn refresh_target_lands_in_bucket() {
        let (mut table, _rx) = table();
        let me = *table.self_id();
        for i in 0..40u16 {
            let _ = table.insert(peer_at(&me, 140 + (i as u32 % 21), i));
        }
        for bucket in table.buckets() {
            let event = RefreshEvent {
                bucket: bucket.id(),
                deadline: 0,
            };
            let target = table.refresh_target(&event).unwrap();
            assert!(bucket.id_in_range(&target));
        }

        let gone = RefreshEvent {
            bucket: BucketId::next(),
            deadline: 0,
        };
        assert!(table.refresh_target(&gone).is_none());
    }

    #[test]
    fn export_restore_round_trip() {
        let (mut table, _rx) = table();
        for i in 0..100u16 {
            let _ = table.insert(Peer::with_id(format!("10.5.0.1:{i}"), Identifier::random()));
        }
        let snapshots = table.export(&ExportOptions::full());
        let (restored, _rx2) =
            RoutingTable::restore(*table.self_id(), BucketConfig::default(), &snapshots).unwrap();

        assert_eq!(restored.buckets().len(), table.buckets().len());
        assert_eq!(restored.len(), table.len());
        for (a, b) in restored.buckets().iter().zip(table.buckets()) {
            assert_eq!(a.range(), b.range());
            assert!(a.all_peers().set_eq(b.all_peers()));
            assert_eq!(a.refresh_deadline(), b.refresh_deadline());
        }
    }

    #[test]
    fn restore_rejects_gaps() {
        let snapshots = vec![
            BucketSnapshot {
                range: BucketRange::new(0, 150),
                peers: Vec::new(),
                refresh: 0,
            },
            BucketSnapshot {
                range: BucketRange::new(151, B),
                peers: Vec::new(),
                refresh: 0,
            },
        ];
        let result = RoutingTable::restore(Identifier::random(), BucketConfig::default(), &snapshots);
        assert!(matches!(result, Err(SnapshotError::InvalidRange { min: 151, .. })));

        let partial = vec![BucketSnapshot {
            range: BucketRange::new(0, 150),
            peers: Vec::new(),
            refresh: 0,
        }];
        assert!(RoutingTable::restore(Identifier::random(), BucketConfig::default(), &partial).is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn refresh_events_arrive_on_shared_channel() {
        let config = BucketConfig {
            refresh: crate::refresh::RefreshPolicy {
                interval: tokio::time::Duration::from_secs(10),
                jitter: 0.0,
            },
            ..BucketConfig::default()
        };
        let (table, mut rx) = RoutingTable::new(Identifier::random(), config);
        let event = rx.recv().await.expect("refresh event");
        assert_eq!(event.bucket, table.buckets()[0].id());
        assert!(table.refresh_target(&event).is_some());
    }
}
