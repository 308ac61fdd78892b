//! Deterministic addresses for contracts created inside a block.
//!
//! Both derivations keep the leading 20 bytes of the keccak digest, so they
//! are part of consensus and must not change.

use crate::types::{BlockNumber, ContextId, Seq};
use alloy_primitives::{keccak256, Address, U256};

/// Address of a contract created without a salt: keccak("{number}_{context}_{seq}").
pub fn creation_address(number: BlockNumber, context_id: ContextId, seq: Seq) -> Address {
    let preimage = format!("{number}_{context_id}_{seq}");
    let hash = keccak256(preimage.as_bytes());
    Address::from_slice(&hash[..20])
}

/// Address of a salted creation: keccak(0xff ++ sender ++ salt ++ keccak(init)).
///
/// The sender enters the preimage as its lowercase hex text without a `0x`
/// prefix, the way addresses travel in execution messages.
pub fn salted_creation_address(sender: Address, init_code: &[u8], salt: U256) -> Address {
    let sender_hex = hex::encode(sender.as_slice());
    let mut preimage = Vec::with_capacity(1 + sender_hex.len() + 32 + 32);
    preimage.push(0xff);
    preimage.extend_from_slice(sender_hex.as_bytes());
    preimage.extend_from_slice(&salt.to_be_bytes::<32>());
    preimage.extend_from_slice(keccak256(init_code).as_slice());
    let hash = keccak256(&preimage);
    Address::from_slice(&hash[..20])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_creation_address_is_leading_digest_bytes() {
        let expected = keccak256(b"7_3_0");
        assert_eq!(creation_address(7, 3, 0).as_slice(), &expected[..20]);
        assert_ne!(creation_address(7, 3, 0), creation_address(7, 3, 1));
    }

    #[test]
    fn test_salted_address_depends_on_all_inputs() {
        let sender = Address::repeat_byte(0x11);
        let a = salted_creation_address(sender, b"code", U256::from(1));
        assert_eq!(a, salted_creation_address(sender, b"code", U256::from(1)));
        assert_ne!(a, salted_creation_address(sender, b"code", U256::from(2)));
        assert_ne!(a, salted_creation_address(sender, b"other", U256::from(1)));
        assert_ne!(a, salted_creation_address(Address::repeat_byte(0x12), b"code", U256::from(1)));
    }
}
