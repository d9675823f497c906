// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{account_block::AccountBlock, error::BlockError, Bytes};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use keccak_hash::keccak;
use lattice_types::{Address, Hash, HashHeight};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};
use std::collections::BTreeMap;

/// Per-address confirmed head named by a snapshot. Ordered by address so the
/// content hash is canonical.
pub type SnapshotContent = BTreeMap<Address, HashHeight>;

/// Merkle root over the sorted `(address, hash, height)` triples. Pairs are
/// folded with keccak; an odd leaf is promoted unchanged.
pub fn snapshot_content_hash(content: &SnapshotContent) -> Hash {
    let mut layer: Vec<Hash> = content
        .iter()
        .map(|(addr, hh)| {
            let mut s = RlpStream::new_list(3);
            s.append(addr).append(&hh.hash).append(&hh.height);
            keccak(s.out())
        })
        .collect();
    if layer.is_empty() {
        return Hash::zero();
    }
    while layer.len() > 1 {
        let mut next = Vec::with_capacity((layer.len() + 1) / 2);
        for pair in layer.chunks(2) {
            if pair.len() == 2 {
                let mut buf = [0u8; 64];
                buf[..32].copy_from_slice(pair[0].as_bytes());
                buf[32..].copy_from_slice(pair[1].as_bytes());
                next.push(keccak(buf));
            } else {
                next.push(pair[0]);
            }
        }
        layer = next;
    }
    layer[0]
}

/// A network-wide checkpoint confirming a set of account blocks.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SnapshotBlock {
    pub height: u64,
    pub prev_hash: Hash,
    pub timestamp: u64,
    pub producer: Address,
    pub content: SnapshotContent,

    pub public_key: Bytes,
    pub signature: Bytes,
    pub hash: Hash,
}

impl SnapshotBlock {
    fn rlp_unsigned(&self) -> Bytes {
        let mut s = RlpStream::new_list(5);
        s.append(&self.height)
            .append(&self.prev_hash)
            .append(&self.timestamp)
            .append(&self.producer)
            .append(&snapshot_content_hash(&self.content));
        s.out().to_vec()
    }

    pub fn compute_hash(&self) -> Hash { keccak(self.rlp_unsigned()) }

    pub fn seal(&mut self) -> Hash {
        self.hash = self.compute_hash();
        self.hash
    }

    pub fn check_hash(&self) -> Result<(), BlockError> {
        let expected = self.compute_hash();
        if self.hash != expected {
            return Err(BlockError::InvalidHash {
                expected,
                got: self.hash,
            });
        }
        Ok(())
    }

    pub fn sign(&mut self, key: &SigningKey) {
        self.seal();
        self.public_key = key.verifying_key().to_bytes().to_vec();
        self.signature = key.sign(self.hash.as_bytes()).to_bytes().to_vec();
    }

    pub fn verify_signature(&self) -> Result<(), BlockError> {
        let public = <[u8; 32]>::try_from(self.public_key.as_slice())
            .ok()
            .and_then(|bytes| VerifyingKey::from_bytes(&bytes).ok())
            .ok_or(BlockError::InvalidSignature)?;
        let signature = <[u8; 64]>::try_from(self.signature.as_slice())
            .map(|bytes| ed25519_dalek::Signature::from_bytes(&bytes))
            .map_err(|_| BlockError::InvalidSignature)?;
        public
            .verify(self.hash.as_bytes(), &signature)
            .map_err(|_| BlockError::InvalidSignature)
    }
}

impl Encodable for SnapshotBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(8)
            .append(&self.height)
            .append(&self.prev_hash)
            .append(&self.timestamp)
            .append(&self.producer);
        s.begin_list(self.content.len());
        for (addr, hh) in &self.content {
            s.begin_list(2).append(addr).append(hh);
        }
        s.append(&self.public_key)
            .append(&self.signature)
            .append(&self.hash);
    }
}

impl Decodable for SnapshotBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let mut content = SnapshotContent::new();
        for entry in rlp.at(4)?.iter() {
            content.insert(entry.val_at(0)?, entry.val_at(1)?);
        }
        Ok(SnapshotBlock {
            height: rlp.val_at(0)?,
            prev_hash: rlp.val_at(1)?,
            timestamp: rlp.val_at(2)?,
            producer: rlp.val_at(3)?,
            content,
            public_key: rlp.val_at(5)?,
            signature: rlp.val_at(6)?,
            hash: rlp.val_at(7)?,
        })
    }
}

/// A snapshot block together with the account blocks it confirms, in replay
/// order.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct SnapshotChunk {
    pub snapshot_block: SnapshotBlock,
    pub account_blocks: Vec<AccountBlock>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{H256, ADDRESS_TAG_USER};

    fn addr(n: u8) -> Address { Address::from_id([n; 20], ADDRESS_TAG_USER) }

    #[test]
    fn content_hash_is_order_independent() {
        let mut a = SnapshotContent::new();
        a.insert(
            addr(1),
            HashHeight { hash: H256::repeat_byte(1), height: 1 },
        );
        a.insert(
            addr(2),
            HashHeight { hash: H256::repeat_byte(2), height: 5 },
        );
        let mut b = SnapshotContent::new();
        b.insert(
            addr(2),
            HashHeight { hash: H256::repeat_byte(2), height: 5 },
        );
        b.insert(
            addr(1),
            HashHeight { hash: H256::repeat_byte(1), height: 1 },
        );
        assert_eq!(snapshot_content_hash(&a), snapshot_content_hash(&b));
    }

    #[test]
    fn content_hash_changes_with_height() {
        let mut a = SnapshotContent::new();
        a.insert(
            addr(1),
            HashHeight { hash: H256::repeat_byte(1), height: 1 },
        );
        let mut b = a.clone();
        b.get_mut(&addr(1)).unwrap().height = 2;
        assert_ne!(snapshot_content_hash(&a), snapshot_content_hash(&b));
    }

    #[test]
    fn rlp_round_trip() {
        let mut content = SnapshotContent::new();
        content.insert(
            addr(4),
            HashHeight { hash: H256::repeat_byte(9), height: 12 },
        );
        let mut block = SnapshotBlock {
            height: 100,
            prev_hash: H256::repeat_byte(8),
            timestamp: 1_600_000_000,
            producer: addr(7),
            content,
            ..Default::default()
        };
        block.seal();
        let decoded: SnapshotBlock =
            rlp::decode(&rlp::encode(&block)).unwrap();
        assert_eq!(decoded, block);
        decoded.check_hash().unwrap();
    }
}
