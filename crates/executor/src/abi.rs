// Copyright 2019 Conflux Foundation. All rights reserved.
// Conflux is free software and distributed under GNU General Public License.
// See http://www.gnu.org/licenses/

//! Built-in contract call encoding: a 4-byte selector derived from the
//! method signature string, followed by the RLP of the parameter struct.

use crate::error::{VmError, VmResult};
use keccak_hash::keccak;

pub const SELECTOR_SIZE: usize = 4;

/// First four bytes of the keccak of the signature string.
pub fn method_selector(signature: &str) -> [u8; SELECTOR_SIZE] {
    let digest = keccak(signature.as_bytes());
    let mut selector = [0u8; SELECTOR_SIZE];
    selector.copy_from_slice(&digest.as_bytes()[..SELECTOR_SIZE]);
    selector
}

pub fn selector_of(data: &[u8]) -> Option<[u8; SELECTOR_SIZE]> {
    if data.len() < SELECTOR_SIZE {
        return None;
    }
    let mut selector = [0u8; SELECTOR_SIZE];
    selector.copy_from_slice(&data[..SELECTOR_SIZE]);
    Some(selector)
}

pub fn encode_call<T: rlp::Encodable>(
    selector: [u8; SELECTOR_SIZE], params: &T,
) -> Vec<u8> {
    let mut data = selector.to_vec();
    data.extend_from_slice(&rlp::encode(params));
    data
}

/// Decodes the parameter struct following the selector.
pub fn decode_params<T: rlp::Decodable>(data: &[u8]) -> VmResult<T> {
    if data.len() < SELECTOR_SIZE {
        return Err(VmError::InvalidMethodParam("data too short".into()));
    }
    rlp::decode(&data[SELECTOR_SIZE..])
        .map_err(|e| VmError::InvalidMethodParam(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rlp_derive::{RlpDecodable, RlpEncodable};

    #[derive(RlpEncodable, RlpDecodable, PartialEq, Debug)]
    struct Params {
        amount: u64,
        data: Vec<u8>,
    }

    #[test]
    fn selector_is_stable_and_distinct() {
        let a = method_selector("Deposit()");
        let b = method_selector("Withdraw(tokenId,uint256)");
        assert_ne!(a, b);
        assert_eq!(a, method_selector("Deposit()"));
    }

    #[test]
    fn call_round_trip() {
        let selector = method_selector("Test(uint64,bytes)");
        let params = Params { amount: 7, data: vec![1, 2, 3] };
        let call = encode_call(selector, &params);
        assert_eq!(selector_of(&call), Some(selector));
        assert_eq!(decode_params::<Params>(&call).unwrap(), params);
    }

    #[test]
    fn short_data_is_rejected() {
        assert!(decode_params::<Params>(&[1, 2]).is_err());
        assert_eq!(selector_of(&[1, 2]), None);
    }
}
