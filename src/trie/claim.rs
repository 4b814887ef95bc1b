use std::{cmp::Ordering, fmt, str::FromStr};

use bitcoin::{
    hashes::{hash160, Hash},
    OutPoint, ScriptBuf,
};

/// HASH160 of the outpoint that created a claim. Stays fixed across updates.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClaimHash([u8; 20]);

impl ClaimHash {
    /// Derive the claim hash for a claim-name output.
    pub fn from_outpoint(outpoint: &OutPoint) -> Self {
        let mut data = Vec::with_capacity(36);
        data.extend_from_slice(outpoint.txid.as_byte_array());
        data.extend_from_slice(&outpoint.vout.to_be_bytes());
        Self(hash160::Hash::hash(&data).to_byte_array())
    }

    /// Raw bytes as they appear in update/support scripts.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        <[u8; 20]>::try_from(bytes).ok().map(Self)
    }

    /// Wrap raw bytes.
    pub fn from_byte_array(bytes: [u8; 20]) -> Self {
        Self(bytes)
    }

    /// Raw bytes, script order.
    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }

    /// Byte-reversed hex, the form users see.
    pub fn claim_id(&self) -> String {
        let mut rev = self.0;
        rev.reverse();
        hex::encode(rev)
    }
}

impl fmt::Display for ClaimHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.claim_id())
    }
}

impl fmt::Debug for ClaimHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClaimHash({})", self.claim_id())
    }
}

impl FromStr for ClaimHash {
    type Err = hex::FromHexError;

    /// Parses a claim id (reversed hex).
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(s, &mut bytes)?;
        bytes.reverse();
        Ok(Self(bytes))
    }
}

/// Where the creating output sits inside its block; last tie-breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct TxoPosition {
    /// Transaction index in the block.
    pub tx_index: u32,
    /// Output index in the transaction.
    pub output: u32,
}

/// A claim on a name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Fixed identity of the claim.
    pub claim_hash: ClaimHash,
    /// Claimed name, raw bytes.
    pub name: Vec<u8>,
    /// Output currently holding the claim (moves on update).
    pub outpoint: OutPoint,
    /// Own amount in satoshis.
    pub amount: u64,
    /// Owner script after the claim prefix.
    pub owner: ScriptBuf,
    /// Height of the creating transaction.
    pub created_height: u32,
    /// Position of the creating output.
    pub position: TxoPosition,
    /// Height of the last update, or creation.
    pub updated_height: u32,
    /// First height at which the claim competes.
    pub activation_height: u32,
    /// First height at which the claim no longer counts.
    pub expiration_height: u32,
    /// Own amount plus active supports, or zero while the claim itself is inactive.
    pub effective_amount: u64,
}

impl Claim {
    /// Competing at `height`.
    pub fn is_active_at(&self, height: u32) -> bool {
        self.activation_height <= height && height < self.expiration_height
    }

    /// Accepted but not yet active at `height`.
    pub fn is_pending_at(&self, height: u32) -> bool {
        self.activation_height > height && height < self.expiration_height
    }

    /// Lifetime over at `height`.
    pub fn is_expired_at(&self, height: u32) -> bool {
        height >= self.expiration_height
    }

    /// Pull a pending claim's activation down to `height`. Activation never moves
    /// later; returns whether it moved.
    pub(crate) fn activate_by(&mut self, height: u32) -> bool {
        if !self.is_pending_at(height) {
            return false;
        }
        self.activation_height = height;
        true
    }
}

/// Ranking among active claims: higher effective amount, then older, then earlier in
/// the block. `Ordering::Less` means `a` wins.
pub(crate) fn rank(a: (&Claim, u64), b: (&Claim, u64)) -> Ordering {
    b.1.cmp(&a.1)
        .then(a.0.created_height.cmp(&b.0.created_height))
        .then(a.0.position.cmp(&b.0.position))
}

/// Value attached to a claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Support {
    /// Output holding the support.
    pub outpoint: OutPoint,
    /// Supported name.
    pub name: Vec<u8>,
    /// Claim it backs.
    pub claim_hash: ClaimHash,
    /// Amount in satoshis.
    pub amount: u64,
    /// Height of the support transaction.
    pub created_height: u32,
    /// First height at which it counts.
    pub activation_height: u32,
    /// First height at which it no longer counts.
    pub expiration_height: u32,
}

impl Support {
    /// Counting at `height`.
    pub fn is_active_at(&self, height: u32) -> bool {
        self.activation_height <= height && height < self.expiration_height
    }

    /// Accepted but not yet counting at `height`.
    pub fn is_pending_at(&self, height: u32) -> bool {
        self.activation_height > height && height < self.expiration_height
    }

    /// Pull a pending support's activation down to `height`, never later.
    pub(crate) fn activate_by(&mut self, height: u32) -> bool {
        if !self.is_pending_at(height) {
            return false;
        }
        self.activation_height = height;
        true
    }
}

/// Claim that took control of a name and when.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Takeover {
    /// New controller.
    pub claim_hash: ClaimHash,
    /// Height control changed hands.
    pub height: u32,
}

#[cfg(test)]
mod tests {
    use super::*;
    use bitcoin::Txid;

    #[test]
    fn claim_id_roundtrips_through_display() {
        let op = OutPoint {
            txid: Txid::from_byte_array([3u8; 32]),
            vout: 1,
        };
        let hash = ClaimHash::from_outpoint(&op);
        let parsed: ClaimHash = hash.to_string().parse().unwrap();
        assert_eq!(parsed, hash);
        assert_ne!(hash, ClaimHash::from_outpoint(&OutPoint { vout: 0, ..op }));
    }

    #[test]
    fn activation_only_moves_earlier() {
        let outpoint = OutPoint {
            txid: Txid::from_byte_array([5u8; 32]),
            vout: 0,
        };
        let mut claim = Claim {
            claim_hash: ClaimHash::from_outpoint(&outpoint),
            name: b"foo".to_vec(),
            outpoint,
            amount: 1,
            owner: ScriptBuf::new(),
            created_height: 512,
            position: TxoPosition::default(),
            updated_height: 512,
            activation_height: 524,
            expiration_height: 1112,
            effective_amount: 0,
        };

        // already active by then: nothing to pull in
        assert!(!claim.activate_by(530));
        assert_eq!(claim.activation_height, 524);

        assert!(claim.activate_by(520));
        assert_eq!(claim.activation_height, 520);
        assert!(!claim.activate_by(520));
        assert!(!claim.activate_by(522));
        assert_eq!(claim.activation_height, 520);
    }
}
