//! Minimal call-data layout helpers.
//!
//! Call data is a 4-byte function selector followed by zero or more 32-byte
//! words. These helpers only deal with that layout; typed encoding belongs to
//! [`alloy::sol_types`].

use alloy::primitives::{Address, B256, Bytes, U256, keccak256};

use crate::{Error, Result};

pub const SELECTOR_LEN: usize = 4;
pub const WORD_LEN: usize = 32;

/// First four bytes of the Keccak-256 hash of a canonical signature such as
/// `transfer(address,uint256)`.
pub fn selector(signature: &str) -> [u8; SELECTOR_LEN] {
    let hash = keccak256(signature.as_bytes());
    let mut out = [0u8; SELECTOR_LEN];
    out.copy_from_slice(&hash[..SELECTOR_LEN]);
    out
}

/// Builds call data from a signature and pre-encoded words.
pub fn encode_call(signature: &str, words: &[B256]) -> Bytes {
    let mut out = Vec::with_capacity(SELECTOR_LEN + words.len() * WORD_LEN);
    out.extend_from_slice(&selector(signature));
    for word in words {
        out.extend_from_slice(word.as_slice());
    }
    out.into()
}

/// Splits call data into selector and words.
///
/// Fails if the data is shorter than a selector or the remainder is not a
/// whole number of words.
pub fn decode_call(data: &[u8]) -> Result<([u8; SELECTOR_LEN], Vec<B256>)> {
    if data.len() < SELECTOR_LEN {
        return Err(Error::validation(format!(
            "call data too short: {} bytes",
            data.len()
        )));
    }
    let (head, body) = data.split_at(SELECTOR_LEN);
    if body.len() % WORD_LEN != 0 {
        return Err(Error::validation(format!(
            "call data body of {} bytes is not word aligned",
            body.len()
        )));
    }

    let mut sel = [0u8; SELECTOR_LEN];
    sel.copy_from_slice(head);
    let words = body.chunks_exact(WORD_LEN).map(B256::from_slice).collect();
    Ok((sel, words))
}

/// Left-pads an address into a word.
#[inline]
pub fn address_word(address: Address) -> B256 {
    address.into_word()
}

#[inline]
pub fn uint_word(value: U256) -> B256 {
    B256::from(value.to_be_bytes::<WORD_LEN>())
}
