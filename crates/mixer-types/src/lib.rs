//! Shared field-element, hex, and error primitives used across the indexer crates.

use ark_bn254::Fr;
use ark_ff::{BigInteger, PrimeField};
use primitive_types::U256;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// BN254 scalar field element type alias.
pub type FieldElement = Fr;

/// 0x-prefixed hex string (e.g. "0x1234...").
pub type Hex = String;

/// The BN254 scalar field modulus, big-endian, for canonical-range checks.
///
/// `p = 21888242871839275222246405745257275088548364400416034343698204186575808495617`
pub const FIELD_MODULUS_BE: [u8; 32] = [
    0x30, 0x64, 0x4e, 0x72, 0xe1, 0x31, 0xa0, 0x29, 0xb8, 0x50, 0x45, 0xb6, 0x81, 0x81, 0x58, 0x5d,
    0x28, 0x33, 0xe8, 0x48, 0x79, 0xb9, 0x70, 0x91, 0x43, 0xe1, 0xf5, 0x93, 0xf0, 0x00, 0x00, 0x01,
];

/// Mixer indexer error types.
#[derive(Debug, Error)]
pub enum MixerError {
    #[error("invalid hex string: {0}")]
    InvalidHex(String),

    #[error("field element out of range")]
    FieldOutOfRange,

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(String),

    #[error("rpc error: {0}")]
    Rpc(String),

    #[error("{0}")]
    Other(String),
}

pub type Result<T> = std::result::Result<T, MixerError>;

/// Parse a 0x-prefixed hex string into a field element, reducing modulo `p`.
///
/// This is a lossy conversion: values `>= p` are silently reduced. Use
/// [`hex_to_field_checked`] when the `< p` invariant must be enforced.
pub fn hex_to_field(hex_str: &str) -> Result<Fr> {
    let bytes = hex_to_bytes_32(hex_str)?;
    Ok(field_from_be_bytes(&bytes))
}

/// Parse a 0x-prefixed hex string into a field element, rejecting values `>= p`.
pub fn hex_to_field_checked(hex_str: &str) -> Result<Fr> {
    let bytes = hex_to_bytes_32(hex_str)?;
    if !is_canonical_be(&bytes) {
        return Err(MixerError::FieldOutOfRange);
    }
    Ok(field_from_be_bytes(&bytes))
}

/// Whether a big-endian 32-byte value is `< p` (the canonical field range).
pub fn is_canonical_be(bytes: &[u8; 32]) -> bool {
    bytes.as_slice() < FIELD_MODULUS_BE.as_slice()
}

fn field_from_be_bytes(bytes: &[u8; 32]) -> Fr {
    let mut le = *bytes;
    le.reverse();
    Fr::from_le_bytes_mod_order(&le)
}

/// Parse a raw big-endian 32-byte value into a field element, rejecting
/// values `>= p`. The byte-level counterpart of [`hex_to_field_checked`],
/// used where a caller already has decoded bytes (e.g. a Merkle leaf).
pub fn bytes_to_field_checked(bytes: &[u8; 32]) -> Result<Fr> {
    if !is_canonical_be(bytes) {
        return Err(MixerError::FieldOutOfRange);
    }
    Ok(field_from_be_bytes(bytes))
}

/// Decode a 0x-prefixed (or bare) hex string into exactly 32 big-endian bytes,
/// left-padding with zeros if shorter.
pub fn hex_to_bytes_32(hex_str: &str) -> Result<[u8; 32]> {
    let bytes = hex_to_bytes(hex_str)?;
    if bytes.len() > 32 {
        return Err(MixerError::InvalidHex(format!(
            "value wider than 32 bytes: {} bytes",
            bytes.len()
        )));
    }
    let mut padded = [0u8; 32];
    let offset = 32 - bytes.len();
    padded[offset..].copy_from_slice(&bytes);
    Ok(padded)
}

/// Convert a field element to a 0x-prefixed hex string (64 hex chars).
pub fn field_to_hex(f: &Fr) -> Hex {
    let bytes = f.into_bigint().to_bytes_be();
    format!("0x{}", hex::encode(bytes))
}

/// Parse a hex string (with or without `0x` prefix) to raw big-endian bytes.
pub fn hex_to_bytes(hex_str: &str) -> Result<Vec<u8>> {
    let hex_str = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    let owned;
    let hex_str = if hex_str.len() % 2 != 0 {
        owned = format!("0{hex_str}");
        owned.as_str()
    } else {
        hex_str
    };
    hex::decode(hex_str).map_err(|e| MixerError::InvalidHex(e.to_string()))
}

/// Convert bytes to a 0x-prefixed hex string.
pub fn bytes_to_hex(bytes: &[u8]) -> Hex {
    format!("0x{}", hex::encode(bytes))
}

/// Normalize a hex string to carry a leading `0x`, lowercasing it.
pub fn normalize_hex(hex_str: &str) -> Hex {
    let stripped = hex_str.strip_prefix("0x").unwrap_or(hex_str);
    format!("0x{}", stripped.to_ascii_lowercase())
}

/// A deposit log event, as recorded by the store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DepositEvent {
    pub timestamp: u64,
    pub block_number: u64,
    pub tx_hash: Hex,
    pub commitment: Hex,
    pub leaf_index: u32,
}

impl DepositEvent {
    pub fn new(timestamp: u64, block_number: u64, tx_hash: &str, commitment: &str, leaf_index: u32) -> Self {
        Self {
            timestamp,
            block_number,
            tx_hash: normalize_hex(tx_hash),
            commitment: normalize_hex(commitment),
            leaf_index,
        }
    }
}

/// A withdrawal log event, as recorded by the store.
///
/// `fee` is a full 256-bit value (the wire format is `uint256`); a `u128`
/// would silently truncate any fee `>= 2^128`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WithdrawalEvent {
    pub block_number: u64,
    pub tx_hash: Hex,
    pub nullifier_hash: Hex,
    pub to: Hex,
    pub fee: U256,
}

impl WithdrawalEvent {
    pub fn new(block_number: u64, tx_hash: &str, nullifier_hash: &str, to: &str, fee: u64) -> Self {
        let fee = U256::from(fee);
        Self {
            block_number,
            tx_hash: normalize_hex(tx_hash),
            nullifier_hash: normalize_hex(nullifier_hash),
            to: normalize_hex(to),
            fee,
        }
    }
}

/// A decoded chain log event, dispatched by the poller to handlers.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LogEvent {
    Deposit(DepositEvent),
    Withdrawal(WithdrawalEvent),
}
