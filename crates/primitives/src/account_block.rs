// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

use crate::{error::BlockError, Bytes};
use ed25519_dalek::{Signer, SigningKey, Verifier, VerifyingKey};
use keccak_hash::keccak;
use lattice_types::{Address, Hash, TokenId, H256, U256};
use rlp::{Decodable, DecoderError, Encodable, Rlp, RlpStream};

/// Transaction kind on an account chain. Send blocks originate value and
/// data; receive blocks consume exactly one send.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BlockType {
    SendCreate = 1,
    SendCall = 2,
    SendReward = 3,
    SendRefund = 4,
    Receive = 5,
    ReceiveError = 6,
}

impl BlockType {
    pub fn from_u8(v: u8) -> Result<Self, BlockError> {
        match v {
            1 => Ok(BlockType::SendCreate),
            2 => Ok(BlockType::SendCall),
            3 => Ok(BlockType::SendReward),
            4 => Ok(BlockType::SendRefund),
            5 => Ok(BlockType::Receive),
            6 => Ok(BlockType::ReceiveError),
            _ => Err(BlockError::UnknownBlockType(v)),
        }
    }

    pub fn is_send(&self) -> bool {
        matches!(
            self,
            BlockType::SendCreate
                | BlockType::SendCall
                | BlockType::SendReward
                | BlockType::SendRefund
        )
    }

    pub fn is_receive(&self) -> bool { !self.is_send() }
}

impl Encodable for BlockType {
    fn rlp_append(&self, s: &mut RlpStream) { s.append(&(*self as u8)); }
}

impl Decodable for BlockType {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        BlockType::from_u8(rlp.as_val::<u8>()?)
            .map_err(|_| DecoderError::Custom("unknown block type"))
    }
}

/// One transaction on a single address's hash chain.
///
/// The `hash` field caches the canonical hash: keccak-256 over the RLP of
/// every field except `signature`, `public_key` and `hash` itself. Embedded
/// child sends (`send_block_list`, present only on contract receives)
/// contribute their own hashes to the parent's preimage.
#[derive(Clone, Debug, PartialEq, Eq, Default)]
pub struct AccountBlock {
    pub block_type: BlockType,
    pub account_address: Address,
    pub height: u64,
    pub prev_hash: Hash,

    // Send-side fields; zero/default on receives.
    pub to_address: Address,
    pub amount: U256,
    pub token_id: TokenId,
    pub fee: U256,

    // Receive-side fields; zero/default on sends.
    pub from_block_hash: Hash,
    pub send_block_list: Vec<AccountBlock>,

    pub data: Bytes,

    // Execution metadata.
    pub quota: u64,
    pub difficulty: Option<U256>,
    pub state_hash: Hash,
    pub log_hash: Option<Hash>,

    // Authentication.
    pub public_key: Bytes,
    pub signature: Bytes,
    pub hash: Hash,
}

impl Default for BlockType {
    fn default() -> Self { BlockType::SendCall }
}

impl AccountBlock {
    pub fn is_send_block(&self) -> bool { self.block_type.is_send() }

    pub fn is_receive_block(&self) -> bool { self.block_type.is_receive() }

    /// RLP of the signature-free fields, the hash preimage.
    fn rlp_unsigned(&self) -> Bytes {
        let mut s = RlpStream::new_list(15);
        s.append(&self.block_type)
            .append(&self.account_address)
            .append(&self.height)
            .append(&self.prev_hash)
            .append(&self.to_address)
            .append(&self.amount)
            .append(&self.token_id)
            .append(&self.fee)
            .append(&self.from_block_hash)
            .append(&self.data)
            .append(&self.quota)
            .append(&self.difficulty.unwrap_or_default())
            .append(&self.state_hash)
            .append(&self.log_hash.unwrap_or_default());
        s.begin_list(self.send_block_list.len());
        for child in &self.send_block_list {
            s.append(&child.hash);
        }
        s.out().to_vec()
    }

    pub fn compute_hash(&self) -> Hash { keccak(self.rlp_unsigned()) }

    /// Recomputes and stores the canonical hash. Must be called after any
    /// field change and before signing.
    pub fn seal(&mut self) -> Hash {
        for child in &mut self.send_block_list {
            child.hash = child.compute_hash();
        }
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

    /// Signs the canonical hash with an Ed25519 key, recording signature and
    /// public key on the block.
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

impl Encodable for AccountBlock {
    fn rlp_append(&self, s: &mut RlpStream) {
        s.begin_list(18)
            .append(&self.block_type)
            .append(&self.account_address)
            .append(&self.height)
            .append(&self.prev_hash)
            .append(&self.to_address)
            .append(&self.amount)
            .append(&self.token_id)
            .append(&self.fee)
            .append(&self.from_block_hash)
            .append_list(&self.send_block_list)
            .append(&self.data)
            .append(&self.quota)
            .append(&self.difficulty.unwrap_or_default())
            .append(&self.state_hash)
            .append(&self.log_hash.unwrap_or_default())
            .append(&self.public_key)
            .append(&self.signature)
            .append(&self.hash);
    }
}

impl Decodable for AccountBlock {
    fn decode(rlp: &Rlp) -> Result<Self, DecoderError> {
        let difficulty: U256 = rlp.val_at(12)?;
        let log_hash: H256 = rlp.val_at(14)?;
        Ok(AccountBlock {
            block_type: rlp.val_at(0)?,
            account_address: rlp.val_at(1)?,
            height: rlp.val_at(2)?,
            prev_hash: rlp.val_at(3)?,
            to_address: rlp.val_at(4)?,
            amount: rlp.val_at(5)?,
            token_id: rlp.val_at(6)?,
            fee: rlp.val_at(7)?,
            from_block_hash: rlp.val_at(8)?,
            send_block_list: rlp.list_at(9)?,
            data: rlp.val_at(10)?,
            quota: rlp.val_at(11)?,
            difficulty: if difficulty.is_zero() {
                None
            } else {
                Some(difficulty)
            },
            state_hash: rlp.val_at(13)?,
            log_hash: if log_hash.is_zero() { None } else { Some(log_hash) },
            public_key: rlp.val_at(15)?,
            signature: rlp.val_at(16)?,
            hash: rlp.val_at(17)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_types::{NATIVE_TOKEN_ID, ADDRESS_TAG_USER};
    use rand::RngCore;

    fn sample_send() -> AccountBlock {
        let mut id = [0u8; 20];
        rand::thread_rng().fill_bytes(&mut id);
        let mut block = AccountBlock {
            block_type: BlockType::SendCall,
            account_address: Address::from_id(id, ADDRESS_TAG_USER),
            height: 7,
            prev_hash: H256::repeat_byte(1),
            to_address: Address::from_id([9u8; 20], ADDRESS_TAG_USER),
            amount: U256::from(30u64),
            token_id: NATIVE_TOKEN_ID,
            fee: U256::zero(),
            data: b"hello".to_vec(),
            ..Default::default()
        };
        block.seal();
        block
    }

    #[test]
    fn hash_excludes_signature() {
        let mut block = sample_send();
        let hash = block.hash;
        block.signature = vec![0xde; 64];
        block.public_key = vec![0xad; 32];
        assert_eq!(block.compute_hash(), hash);
        block.amount = U256::from(31u64);
        assert_ne!(block.compute_hash(), hash);
    }

    #[test]
    fn rlp_round_trip() {
        let block = sample_send();
        let encoded = rlp::encode(&block);
        let decoded: AccountBlock = rlp::decode(&encoded).unwrap();
        assert_eq!(decoded, block);
    }

    #[test]
    fn receive_with_children_round_trip() {
        let mut child = sample_send();
        child.block_type = BlockType::SendRefund;
        child.seal();
        let mut receive = AccountBlock {
            block_type: BlockType::Receive,
            account_address: Address::from_id([3u8; 20], ADDRESS_TAG_USER),
            height: 1,
            from_block_hash: sample_send().hash,
            send_block_list: vec![child],
            ..Default::default()
        };
        receive.seal();
        let decoded: AccountBlock =
            rlp::decode(&rlp::encode(&receive)).unwrap();
        assert_eq!(decoded, receive);
        decoded.check_hash().unwrap();
    }

    #[test]
    fn sign_and_verify() {
        let key = SigningKey::from_bytes(&[7u8; 32]);
        let mut block = sample_send();
        block.sign(&key);
        block.verify_signature().unwrap();
        block.signature[0] ^= 1;
        assert!(block.verify_signature().is_err());
    }
}
