//! # Identifiers and the Distance Primitive
//!
//! Every peer in the routing core is named by an [`Identifier`]: a fixed-width
//! 160-bit string, written as exactly 40 hexadecimal characters.
//!
//! ## Distance Model
//!
//! Buckets partition the space by *bit-position distance* rather than by raw
//! XOR magnitude:
//!
//! ```text
//! distance(a, b) = B - leading_zeros(a XOR b)
//! ```
//!
//! i.e. the bit length of `a XOR b`. The result lies in `[0, B]`, is zero only
//! for identical identifiers, and is symmetric. Two identifiers sharing a
//! longer prefix are always closer, so nested half-open ranges `(min, max]`
//! over this value tile the identifier space the way a binary routing tree
//! does: each split peels off one bit of resolution next to the anchor.
//!
//! ## Invariants
//!
//! - `Identifier::from_hex(id.to_hex()) == Ok(id)` (text round-trip)
//! - `distance(a, b) == distance(b, a)`
//! - `distance(a, b) == 0` iff `a == b`
//! - `distance(anchor, random_at_distance(anchor, d)) == d`

use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};

use crate::peer::PeerError;

/// Width of the identifier space in bits.
pub const B: u32 = 160;

/// Identifier length in bytes.
pub const ID_LEN: usize = (B / 8) as usize;

/// Length of the canonical hexadecimal form.
pub const ID_HEX_LEN: usize = ID_LEN * 2;

#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Identifier([u8; ID_LEN]);

impl Identifier {
    #[inline]
    pub fn from_bytes(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }

    #[inline]
    pub fn as_bytes(&self) -> &[u8; ID_LEN] {
        &self.0
    }

    /// Generate a uniformly random identifier from the OS RNG.
    pub fn random() -> Self {
        let mut bytes = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self(bytes)
    }

    /// Derive an identifier from arbitrary bytes (BLAKE3, truncated to 160 bits).
    pub fn digest(data: &[u8]) -> Self {
        let hash = blake3::hash(data);
        let mut bytes = [0u8; ID_LEN];
        bytes.copy_from_slice(&hash.as_bytes()[..ID_LEN]);
        Self(bytes)
    }

    pub fn to_hex(self) -> String {
        hex::encode(self.0)
    }

    /// Parse the canonical text form.
    ///
    /// Accepts exactly [`ID_HEX_LEN`] hexadecimal characters, in either case.
    pub fn from_hex(s: &str) -> Result<Self, PeerError> {
        if !is_valid_hex_id(s) {
            return Err(PeerError::InvalidIdentifier(s.to_string()));
        }
        let mut bytes = [0u8; ID_LEN];
        hex::decode_to_slice(s, &mut bytes)
            .map_err(|_| PeerError::InvalidIdentifier(s.to_string()))?;
        Ok(Self(bytes))
    }

    #[inline]
    pub fn xor_distance(&self, other: &Identifier) -> [u8; ID_LEN] {
        let mut out = [0u8; ID_LEN];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = self.0[i] ^ other.0[i];
        }
        out
    }

    /// Bit-position distance to `other`, in `[0, B]`.
    #[inline]
    pub fn distance(&self, other: &Identifier) -> u32 {
        distance(self, other)
    }

    /// Random identifier lying exactly at `distance` from `anchor`.
    ///
    /// `distance == 0` returns the anchor itself. Values above [`B`] are clamped.
    pub fn random_at_distance(anchor: &Identifier, distance: u32) -> Identifier {
        let distance = distance.min(B);
        if distance == 0 {
            return *anchor;
        }

        let mut mask = [0u8; ID_LEN];
        OsRng.fill_bytes(&mut mask);

        // Highest set bit of the XOR mask must sit at bit `distance - 1`
        // counted from the least significant end.
        let top_bit = (B - distance) as usize;
        let byte_idx = top_bit / 8;
        let bit_pos = top_bit % 8;

        for byte in mask.iter_mut().take(byte_idx) {
            *byte = 0;
        }

        let target_bit = 0x80u8 >> bit_pos;
        let random_mask = target_bit.wrapping_sub(1);
        mask[byte_idx] = target_bit | (mask[byte_idx] & random_mask);

        let mut target = [0u8; ID_LEN];
        for i in 0..ID_LEN {
            target[i] = anchor.0[i] ^ mask[i];
        }
        Identifier(target)
    }
}

/// The distance primitive: bit length of `a XOR b`.
pub fn distance(a: &Identifier, b: &Identifier) -> u32 {
    let xor = a.xor_distance(b);
    for (byte_idx, byte) in xor.iter().enumerate() {
        if *byte != 0 {
            let leading = byte_idx as u32 * 8 + byte.leading_zeros();
            return B - leading;
        }
    }
    0
}

/// Identifier-format validator: exactly [`ID_HEX_LEN`] hex characters.
pub fn is_valid_hex_id(s: &str) -> bool {
    s.len() == ID_HEX_LEN && s.bytes().all(|b| b.is_ascii_hexdigit())
}

impl std::fmt::Debug for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Identifier({})", &self.to_hex()[..16])
    }
}

impl std::fmt::Display for Identifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl std::str::FromStr for Identifier {
    type Err = PeerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}

impl From<[u8; ID_LEN]> for Identifier {
    fn from(bytes: [u8; ID_LEN]) -> Self {
        Self(bytes)
    }
}

impl From<Identifier> for [u8; ID_LEN] {
    fn from(id: Identifier) -> Self {
        id.0
    }
}

impl AsRef<[u8]> for Identifier {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}
