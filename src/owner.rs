use crate::error::{Result, UserOpError};
use ethers::signers::{LocalWallet, Signer};
use rand::rngs::OsRng;
use rand::RngCore;
use std::str::FromStr;

/// Parse a hex secp256k1 key (with or without `0x`) into the account owner's wallet.
pub fn load_owner(signing_key: &str, chain_id: u64) -> Result<LocalWallet> {
    let wallet = LocalWallet::from_str(signing_key.trim())
        .map_err(|e| UserOpError::Config(format!("invalid signing key: {e}")))?;
    Ok(wallet.with_chain_id(chain_id))
}

/// A new random owner key and its `0x`-prefixed hex form.
pub fn generate_signing_key() -> Result<(LocalWallet, String)> {
    let mut rng = OsRng;
    // Very low probability of invalid key; loop until LocalWallet accepts.
    for _ in 0..64 {
        let mut bytes = [0u8; 32];
        rng.fill_bytes(&mut bytes);
        if bytes.iter().all(|b| *b == 0) {
            continue;
        }
        let key_hex = format!("0x{}", hex::encode(bytes));
        if let Ok(wallet) = LocalWallet::from_str(&key_hex) {
            return Ok((wallet, key_hex));
        }
    }
    Err(UserOpError::Config(
        "failed to generate a valid random signing key".into(),
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use ethers::types::Address;

    #[test]
    fn loads_known_key() {
        let wallet = load_owner(
            "0xac0974bec39a17e36ba4a6b4d238ff944bacb478cbed5efcae784d7bf4f2ff80",
            80_001,
        )
        .unwrap();
        assert_eq!(
            wallet.address(),
            "0xf39Fd6e51aad88F6F4ce6aB8827279cffFb92266"
                .parse::<Address>()
                .unwrap()
        );
        assert_eq!(wallet.chain_id(), 80_001);
    }

    #[test]
    fn rejects_garbage() {
        assert!(matches!(load_owner("0x1234", 1), Err(UserOpError::Config(_))));
        assert!(load_owner(&format!("0x{}", "00".repeat(32)), 1).is_err());
    }

    #[test]
    fn generated_key_round_trips() {
        let (wallet, key) = generate_signing_key().unwrap();
        assert_eq!(key.len(), 66);
        assert_eq!(load_owner(&key, 1).unwrap().address(), wallet.address());

        let (other, _) = generate_signing_key().unwrap();
        assert_ne!(other.address(), wallet.address());
    }
}
