//! # Peers
//!
//! A [`Peer`] is the routing core's view of a remote node: where to reach it,
//! who it claims to be, when it was last heard from, and (once it has been
//! placed in a bucket) its memoized distance to that bucket's anchor.
//!
//! Two flavours share one type:
//!
//! - **Resolved** peers carry a validated [`Identifier`].
//! - **Bootstrap** peers are known by address only. They can sit in a
//!   [`PeerList`](crate::peers::PeerList) but never compare equal to anything
//!   and cannot be placed in a bucket until [`Peer::resolve`] supplies an
//!   identifier.

use std::time::{SystemTime, UNIX_EPOCH};

use crate::identity::Identifier;

/// Returns current time as milliseconds since Unix epoch.
#[inline]
pub(crate) fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

/// Validation failures when naming a peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PeerError {
    /// Identifier text is not exactly 40 hexadecimal characters.
    InvalidIdentifier(String),
    /// `resolve` was called on a peer that already has an identifier.
    AlreadyResolved(Identifier),
}

impl std::fmt::Display for PeerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PeerError::InvalidIdentifier(raw) => write!(f, "invalid identifier {raw:?}"),
            PeerError::AlreadyResolved(id) => write!(f, "peer already resolved as {id}"),
        }
    }
}

impl std::error::Error for PeerError {}

#[derive(Clone, Debug)]
pub struct Peer {
    address: String,
    id: Option<Identifier>,
    last_seen: u64,
    /// One-shot cache: set on first insertion into a bucket, never recomputed
    /// for a different reference unless explicitly invalidated.
    distance: Option<u32>,
}

impl Peer {
    /// Create a resolved peer from its address and textual identifier.
    pub fn new(address: impl Into<String>, id: &str) -> Result<Self, PeerError> {
        let id = Identifier::from_hex(id)?;
        Ok(Self::with_id(address, id))
    }

    /// Create a resolved peer from an already-validated identifier.
    pub fn with_id(address: impl Into<String>, id: Identifier) -> Self {
        Self {
            address: address.into(),
            id: Some(id),
            last_seen: now_ms(),
            distance: None,
        }
    }

    /// Create a bootstrap peer: contacted by address only, identifier unknown.
    pub fn bootstrap(address: impl Into<String>) -> Self {
        Self {
            address: address.into(),
            id: None,
            last_seen: now_ms(),
            distance: None,
        }
    }

    /// Attach the identifier learned from a protocol exchange.
    pub fn resolve(self, id: &str) -> Result<Self, PeerError> {
        if let Some(existing) = self.id {
            return Err(PeerError::AlreadyResolved(existing));
        }
        let id = Identifier::from_hex(id)?;
        Ok(Self {
            id: Some(id),
            distance: None,
            ..self
        })
    }

    #[inline]
    pub fn is_bootstrap(&self) -> bool {
        self.id.is_none()
    }

    #[inline]
    pub fn id(&self) -> Option<&Identifier> {
        self.id.as_ref()
    }

    #[inline]
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn set_address(&mut self, address: impl Into<String>) {
        self.address = address.into();
    }

    #[inline]
    pub fn last_seen(&self) -> u64 {
        self.last_seen
    }

    pub(crate) fn set_last_seen(&mut self, last_seen: u64) {
        self.last_seen = last_seen;
    }

    /// Mark the peer as seen just now.
    pub fn touch(&mut self) -> &mut Self {
        self.last_seen = now_ms();
        self
    }

    /// Memoize the distance to `reference` unless one is already cached.
    ///
    /// Bootstrap peers have no identifier and keep an empty cache.
    pub fn cache_distance(&mut self, reference: &Identifier) -> &mut Self {
        if self.distance.is_none() {
            self.distance = self.distance_to(reference);
        }
        self
    }

    pub fn invalidate_distance(&mut self) {
        self.distance = None;
    }

    /// The cached distance, if any.
    #[inline]
    pub fn distance(&self) -> Option<u32> {
        self.distance
    }

    /// Fresh distance computation, independent of the cache.
    pub fn distance_to(&self, reference: &Identifier) -> Option<u32> {
        self.id.as_ref().map(|id| id.distance(reference))
    }

    /// `(address, identifier hex)`; bootstrap peers render an empty identifier.
    pub fn triple(&self) -> (String, String) {
        (
            self.address.clone(),
            self.id.map(Identifier::to_hex).unwrap_or_default(),
        )
    }
}

/// Identity equality. Bootstrap peers are never equal to anything, themselves included.
impl PartialEq for Peer {
    fn eq(&self, other: &Self) -> bool {
        match (&self.id, &other.id) {
            (Some(a), Some(b)) => a == b,
            _ => false,
        }
    }
}

impl std::fmt::Display for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match &self.id {
            Some(id) => write!(f, "<{}#{}>", self.address, id),
            None => write!(f, "<{}#?>", self.address),
        }
    }
}
