//! Keccak-256 and Poseidon hash primitives over the BN254 scalar field.
//!
//! Poseidon itself is treated as an external collaborator by the indexer core
//! (see the system design notes) — this crate is the thin, swappable boundary
//! that exposes it as a callable `H: (F, F) -> F`.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use sha3::{Digest, Keccak256};

pub mod poseidon;

/// Keccak-256 of arbitrary bytes.
pub fn keccak256(data: &[u8]) -> [u8; 32] {
    let mut hasher = Keccak256::new();
    hasher.update(data);
    let out = hasher.finalize();
    let mut bytes = [0u8; 32];
    bytes.copy_from_slice(&out);
    bytes
}

/// Keccak-256 of a Solidity event signature string, as used for topic filters.
pub fn event_topic(signature: &str) -> [u8; 32] {
    keccak256(signature.as_bytes())
}

/// Keccak-256 of `data`, reduced modulo the BN254 scalar field.
///
/// Used to derive the canonical zero-leaf constant `keccak256("tornado") mod p`.
pub fn keccak256_mod_field(data: &[u8]) -> Fr {
    let digest = keccak256(data);
    Fr::from_be_bytes_mod_order(&digest)
}

/// Re-derive a field element's big-endian bytes (convenience re-export point).
pub fn field_to_be_bytes(f: &Fr) -> Vec<u8> {
    f.into_bigint().to_bytes_be()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tornado_zero_value_matches_known_constant() {
        let z = keccak256_mod_field(b"tornado");
        let hex = format!("0x{}", hex::encode(field_to_be_bytes(&z)));
        assert_eq!(
            hex,
            "0x2fe54c60d3acabf3343a35b6eba15db4821b340f76e741e2249685ed4899af6c"
        );
    }

    #[test]
    fn deposit_topic_is_stable() {
        let t = event_topic("Deposit(bytes32,uint32,uint256)");
        assert_eq!(t.len(), 32);
    }
}
