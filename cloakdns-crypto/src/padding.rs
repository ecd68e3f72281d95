//! Query padding.
//!
//! Plaintext queries are padded before sealing so ciphertext lengths leak
//! as little as possible about the question: a single 0x80 marker byte,
//! then zeros up to the caller's target, rounded up to the protocol's
//! 64-byte block size.

use crate::error::{CryptoError, Result};

/// DNSCrypt v2 padding granularity.
pub const PAD_BLOCK_SIZE: usize = 64;

/// Round `len` up to the next multiple of `PAD_BLOCK_SIZE`.
pub fn round_up_to_block(len: usize) -> usize {
    len.div_ceil(PAD_BLOCK_SIZE) * PAD_BLOCK_SIZE
}

/// Pad `packet` with `0x80` then zeros so the result is at least
/// `min_size` bytes and a whole number of blocks. The marker byte always
/// fits, so output is strictly longer than input.
pub fn pad(packet: &[u8], min_size: usize) -> Vec<u8> {
    let padded_len = round_up_to_block(min_size.max(packet.len() + 1));
    let mut padded = Vec::with_capacity(padded_len);
    padded.extend_from_slice(packet);
    padded.push(0x80);
    padded.resize(padded_len, 0x00);
    padded
}

/// Strip padding, returning the original packet slice.
pub fn unpad(padded: &[u8]) -> Result<&[u8]> {
    let marker = padded
        .iter()
        .rposition(|&b| b != 0x00)
        .ok_or(CryptoError::Padding)?;
    if padded[marker] != 0x80 {
        return Err(CryptoError::Padding);
    }
    Ok(&padded[..marker])
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn pads_to_block_multiple() {
        let padded = pad(b"abc", 256);
        assert_eq!(padded.len(), 256);
        assert_eq!(&padded[..3], b"abc");
        assert_eq!(padded[3], 0x80);
        assert!(padded[4..].iter().all(|&b| b == 0));
    }

    #[test]
    fn always_grows_even_at_target() {
        // A packet already at the target still gains a marker block.
        let packet = vec![0xab; 64];
        let padded = pad(&packet, 64);
        assert_eq!(padded.len(), 128);
        assert_eq!(unpad(&padded).unwrap(), &packet[..]);
    }

    #[test]
    fn rejects_missing_marker() {
        assert!(unpad(&[0x00; 64]).is_err());
        assert!(unpad(&[0x41, 0x42, 0x00, 0x00]).is_err());
        assert!(unpad(&[]).is_err());
    }

    proptest! {
        #[test]
        fn unpad_inverts_pad(packet in proptest::collection::vec(any::<u8>(), 0..2048),
                             min_size in 0usize..4096) {
            let padded = pad(&packet, min_size);
            prop_assert_eq!(padded.len() % PAD_BLOCK_SIZE, 0);
            prop_assert!(padded.len() > packet.len());
            prop_assert_eq!(unpad(&padded).unwrap(), &packet[..]);
        }
    }
}
