//! Stand-in field values for gas estimation.
//!
//! Gas accounting hashes and measures a fully-shaped operation, but the real paymaster payload
//! and signature only exist after gas is settled. These fillers have the same byte length as the
//! real values, with mostly non-zero bytes so the estimate errs high.

use ethers::types::Bytes;

/// Length of a verifying-paymaster payload: address, two ABI words of validity window, and a
/// 65-byte ECDSA signature.
pub const PAYMASTER_FILLER_LEN: usize = 20 + 32 + 32 + 65;

/// A well-formed secp256k1 signature over nothing in particular.
pub const DUMMY_SIGNATURE: [u8; 65] = [
    0xa1, 0x55, 0x69, 0xdd, 0x8f, 0x83, 0x24, 0xdb, 0xea, 0xbf, 0x80, 0x73, 0xfd, 0xec, 0x36, 0xd4,
    0xb7, 0x54, 0xf5, 0x3c, 0xe5, 0x90, 0x1e, 0x28, 0x3c, 0x6d, 0xe7, 0x9a, 0xf1, 0x77, 0xdc, 0x94,
    0x55, 0x7f, 0xa3, 0xc9, 0x92, 0x2c, 0xd7, 0xaf, 0x2a, 0x96, 0xca, 0x94, 0x40, 0x2d, 0x35, 0xc3,
    0x9f, 0x26, 0x69, 0x25, 0xee, 0x64, 0x07, 0xae, 0xb3, 0x2b, 0x31, 0xd7, 0x69, 0x78, 0xd4, 0xba,
    0x1c,
];

/// Placeholder `paymasterAndData` and `signature` for a draft awaiting sponsorship.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Placeholders {
    pub paymaster_and_data: Bytes,
    pub signature: Bytes,
}

impl Default for Placeholders {
    fn default() -> Self {
        Self {
            paymaster_and_data: verifying_paymaster_filler(),
            signature: dummy_signature(),
        }
    }
}

pub fn dummy_signature() -> Bytes {
    Bytes::from(DUMMY_SIGNATURE.to_vec())
}

fn verifying_paymaster_filler() -> Bytes {
    let mut filler = Vec::with_capacity(PAYMASTER_FILLER_LEN);
    filler.extend_from_slice(&[0x01; 20]);

    // validUntil = 0x010101010101, validAfter = 0
    let mut valid_until = [0u8; 32];
    valid_until[26..].copy_from_slice(&[0x01; 6]);
    filler.extend_from_slice(&valid_until);
    filler.extend_from_slice(&[0u8; 32]);

    filler.extend_from_slice(&[0x01; 65]);
    Bytes::from(filler)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paymaster_filler_matches_known_pattern() {
        let expected = "0x0101010101010101010101010101010101010101000000000000000000000000000000000000000000000000000001010101010100000000000000000000000000000000000000000000000000000000000000000101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101010101";
        let filler = Placeholders::default().paymaster_and_data;
        assert_eq!(filler.len(), PAYMASTER_FILLER_LEN);
        assert_eq!(crate::encoding::fmt_bytes(&filler), expected);
    }

    #[test]
    fn dummy_signature_has_ecdsa_length() {
        assert_eq!(Placeholders::default().signature.len(), 65);
        assert_eq!(dummy_signature().as_ref()[64], 0x1c);
    }
}
