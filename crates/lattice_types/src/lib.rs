// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Fundamental types shared by every crate in the workspace: the 21-byte
//! tagged account address, the 32-byte hash, token identifiers and the
//! (hash, height) pair used in snapshot content.

use serde::{Deserialize, Serialize};
use std::{fmt, str::FromStr};

pub use ethereum_types::{H256, U256};

/// All digests in the system are keccak-256.
pub type Hash = H256;

pub const ADDRESS_SIZE: usize = 21;
pub const TOKEN_ID_SIZE: usize = 10;

/// Tag byte distinguishing user accounts from contract accounts. It is the
/// last byte of the address.
pub const ADDRESS_TAG_USER: u8 = 0x00;
pub const ADDRESS_TAG_CONTRACT: u8 = 0x01;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum TypesError {
    #[error("invalid length: expected {expected}, got {got}")]
    InvalidLength { expected: usize, got: usize },
    #[error("invalid hex string")]
    InvalidHex,
    #[error("invalid address tag byte: {0}")]
    InvalidAddressTag(u8),
}

/// A 21-byte account identifier. The first 20 bytes identify the account,
/// the trailing byte tags it as a user or a contract account.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Address(pub [u8; ADDRESS_SIZE]);

impl Address {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != ADDRESS_SIZE {
            return Err(TypesError::InvalidLength {
                expected: ADDRESS_SIZE,
                got: bytes.len(),
            });
        }
        let tag = bytes[ADDRESS_SIZE - 1];
        if tag != ADDRESS_TAG_USER && tag != ADDRESS_TAG_CONTRACT {
            return Err(TypesError::InvalidAddressTag(tag));
        }
        let mut inner = [0u8; ADDRESS_SIZE];
        inner.copy_from_slice(bytes);
        Ok(Address(inner))
    }

    /// Builds an address from a 20-byte account id and a tag byte.
    pub fn from_id(id: [u8; ADDRESS_SIZE - 1], tag: u8) -> Self {
        let mut inner = [0u8; ADDRESS_SIZE];
        inner[..ADDRESS_SIZE - 1].copy_from_slice(&id);
        inner[ADDRESS_SIZE - 1] = tag;
        Address(inner)
    }

    pub fn zero() -> Self { Address([0u8; ADDRESS_SIZE]) }

    pub fn is_zero(&self) -> bool { self.0.iter().all(|b| *b == 0) }

    pub fn is_contract(&self) -> bool {
        self.0[ADDRESS_SIZE - 1] == ADDRESS_TAG_CONTRACT
    }

    pub fn is_user(&self) -> bool { !self.is_contract() }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl Default for Address {
    fn default() -> Self { Address::zero() }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Address({})", self)
    }
}

impl FromStr for Address {
    type Err = TypesError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let bytes = decode_hex(s)?;
        Address::from_slice(&bytes)
    }
}

impl rlp::Encodable for Address {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl rlp::Decodable for Address {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            Address::from_slice(bytes)
                .map_err(|_| rlp::DecoderError::Custom("invalid address"))
        })
    }
}

/// A 10-byte token identifier. The native token has a fixed well-known id.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct TokenId(pub [u8; TOKEN_ID_SIZE]);

/// The base token of the ledger. Fees are always denominated in it.
pub const NATIVE_TOKEN_ID: TokenId =
    TokenId([0x4c, 0x41, 0x54, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x01]);

impl TokenId {
    pub fn from_slice(bytes: &[u8]) -> Result<Self, TypesError> {
        if bytes.len() != TOKEN_ID_SIZE {
            return Err(TypesError::InvalidLength {
                expected: TOKEN_ID_SIZE,
                got: bytes.len(),
            });
        }
        let mut inner = [0u8; TOKEN_ID_SIZE];
        inner.copy_from_slice(bytes);
        Ok(TokenId(inner))
    }

    pub fn is_native(&self) -> bool { *self == NATIVE_TOKEN_ID }

    pub fn as_bytes(&self) -> &[u8] { &self.0 }
}

impl Default for TokenId {
    fn default() -> Self { NATIVE_TOKEN_ID }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        for byte in &self.0 {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

impl fmt::Debug for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "TokenId({})", self)
    }
}

impl rlp::Encodable for TokenId {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.encoder().encode_value(&self.0);
    }
}

impl rlp::Decodable for TokenId {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        rlp.decoder().decode_value(|bytes| {
            TokenId::from_slice(bytes)
                .map_err(|_| rlp::DecoderError::Custom("invalid token id"))
        })
    }
}

/// The (hash, height) pair a snapshot names per address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HashHeight {
    pub hash: Hash,
    pub height: u64,
}

impl rlp::Encodable for HashHeight {
    fn rlp_append(&self, s: &mut rlp::RlpStream) {
        s.begin_list(2).append(&self.hash).append(&self.height);
    }
}

impl rlp::Decodable for HashHeight {
    fn decode(rlp: &rlp::Rlp) -> Result<Self, rlp::DecoderError> {
        Ok(HashHeight {
            hash: rlp.val_at(0)?,
            height: rlp.val_at(1)?,
        })
    }
}

fn decode_hex(s: &str) -> Result<Vec<u8>, TypesError> {
    let s = s.strip_prefix("0x").unwrap_or(s);
    if s.len() % 2 != 0 {
        return Err(TypesError::InvalidHex);
    }
    (0..s.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&s[i..i + 2], 16)
                .map_err(|_| TypesError::InvalidHex)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::RngCore;

    fn random_address(tag: u8) -> Address {
        let mut id = [0u8; ADDRESS_SIZE - 1];
        rand::thread_rng().fill_bytes(&mut id);
        Address::from_id(id, tag)
    }

    #[test]
    fn address_tag_round_trip() {
        let user = random_address(ADDRESS_TAG_USER);
        assert!(user.is_user());
        let contract = random_address(ADDRESS_TAG_CONTRACT);
        assert!(contract.is_contract());

        let parsed: Address = user.to_string().parse().unwrap();
        assert_eq!(parsed, user);
    }

    #[test]
    fn address_rejects_bad_tag() {
        let mut bytes = [0u8; ADDRESS_SIZE];
        bytes[ADDRESS_SIZE - 1] = 0x7f;
        assert_eq!(
            Address::from_slice(&bytes),
            Err(TypesError::InvalidAddressTag(0x7f))
        );
    }

    #[test]
    fn rlp_round_trip() {
        let addr = random_address(ADDRESS_TAG_USER);
        let encoded = rlp::encode(&addr);
        assert_eq!(rlp::decode::<Address>(&encoded).unwrap(), addr);

        let token = NATIVE_TOKEN_ID;
        let encoded = rlp::encode(&token);
        assert_eq!(rlp::decode::<TokenId>(&encoded).unwrap(), token);

        let hh = HashHeight {
            hash: H256::repeat_byte(3),
            height: 42,
        };
        let encoded = rlp::encode(&hh);
        assert_eq!(rlp::decode::<HashHeight>(&encoded).unwrap(), hh);
    }
}
