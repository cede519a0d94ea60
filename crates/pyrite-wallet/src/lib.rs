//! Pyrite wallet
//!
//! secp256k1 keypair handling and the node address format: `Px` followed
//! by the uppercase hex of the last 20 bytes of the double-SHA256 of the
//! compressed public key.

use k256::ecdsa::signature::{Signer, Verifier};
use k256::ecdsa::{Signature, SigningKey, VerifyingKey};
use rand_core::OsRng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const ADDRESS_PREFIX: &str = "Px";

#[derive(Debug, thiserror::Error)]
pub enum WalletError {
    #[error("hex decode error: {0}")]
    Hex(#[from] hex::FromHexError),
    #[error("invalid secret key length: {0}")]
    InvalidSecretLength(usize),
    #[error("invalid signature length: {0}")]
    InvalidSignatureLength(usize),
    #[error("key error: {0}")]
    Key(#[from] k256::ecdsa::Error),
    #[error("invalid wallet file: {0}")]
    InvalidWalletFile(String),
    #[error("serialization error: {0}")]
    SerdeError(#[from] serde_json::Error),
}

#[derive(Debug)]
pub struct WalletKeypair {
    signing_key: SigningKey,
}

impl WalletKeypair {
    pub fn generate() -> Self {
        Self {
            signing_key: SigningKey::random(&mut OsRng),
        }
    }

    pub fn from_secret_hex(secret_hex: &str) -> Result<Self, WalletError> {
        let bytes = hex::decode(secret_hex)?;
        if bytes.len() != 32 {
            return Err(WalletError::InvalidSecretLength(bytes.len()));
        }
        Ok(Self {
            signing_key: SigningKey::from_slice(&bytes)?,
        })
    }

    pub fn secret_key_hex(&self) -> String {
        hex::encode(self.signing_key.to_bytes())
    }

    /// Compressed SEC1 public key, hex encoded
    pub fn public_key_hex(&self) -> String {
        hex::encode(self.signing_key.verifying_key().to_sec1_bytes())
    }

    pub fn address(&self) -> String {
        address_from_pubkey(self.signing_key.verifying_key())
    }

    pub fn sign_message(&self, message: &[u8]) -> String {
        let sig: Signature = self.signing_key.sign(message);
        hex::encode(sig.to_bytes())
    }

    pub fn to_wallet_file(&self) -> WalletFile {
        WalletFile {
            version: 1,
            secret_hex: self.secret_key_hex(),
            public_key_hex: self.public_key_hex(),
            address: self.address(),
        }
    }
}

pub fn address_from_pubkey_hex(pubkey_hex: &str) -> Result<String, WalletError> {
    let bytes = hex::decode(pubkey_hex)?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&bytes)?;
    Ok(address_from_pubkey(&verifying_key))
}

pub fn verify_message_hex(
    pubkey_hex: &str,
    message: &[u8],
    signature_hex: &str,
) -> Result<bool, WalletError> {
    let pub_bytes = hex::decode(pubkey_hex)?;
    let verifying_key = VerifyingKey::from_sec1_bytes(&pub_bytes)?;
    let sig_bytes = hex::decode(signature_hex)?;
    if sig_bytes.len() != 64 {
        return Err(WalletError::InvalidSignatureLength(sig_bytes.len()));
    }
    let signature = Signature::from_slice(&sig_bytes)?;
    Ok(verifying_key.verify(message, &signature).is_ok())
}

/// On-disk wallet representation
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct WalletFile {
    pub version: u32,
    pub secret_hex: String,
    pub public_key_hex: String,
    pub address: String,
}

pub fn wallet_keypair_from_file(wallet: &WalletFile) -> Result<WalletKeypair, WalletError> {
    if wallet.version != 1 {
        return Err(WalletError::InvalidWalletFile(
            "unsupported version".to_string(),
        ));
    }
    let kp = WalletKeypair::from_secret_hex(&wallet.secret_hex)?;
    if kp.public_key_hex() != wallet.public_key_hex {
        return Err(WalletError::InvalidWalletFile(
            "public key mismatch".to_string(),
        ));
    }
    if kp.address() != wallet.address {
        return Err(WalletError::InvalidWalletFile(
            "address mismatch".to_string(),
        ));
    }
    Ok(kp)
}

fn address_from_pubkey(pubkey: &VerifyingKey) -> String {
    let first = Sha256::digest(pubkey.to_sec1_bytes());
    let second = Sha256::digest(first);
    format!("{ADDRESS_PREFIX}{}", hex::encode_upper(&second[12..]))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_shape() {
        let kp = WalletKeypair::from_secret_hex(&hex::encode([1u8; 32])).unwrap();
        let addr = kp.address();
        assert!(addr.starts_with(ADDRESS_PREFIX));
        assert_eq!(addr.len(), 2 + 40);
        assert!(addr[2..]
            .chars()
            .all(|c| c.is_ascii_digit() || c.is_ascii_uppercase()));
    }

    #[test]
    fn address_derives_from_pubkey_alone() {
        let kp = WalletKeypair::from_secret_hex(&hex::encode([2u8; 32])).unwrap();
        let from_pub = address_from_pubkey_hex(&kp.public_key_hex()).unwrap();
        assert_eq!(kp.address(), from_pub);
    }

    #[test]
    fn secret_roundtrip() {
        let kp = WalletKeypair::generate();
        let restored = WalletKeypair::from_secret_hex(&kp.secret_key_hex()).unwrap();
        assert_eq!(kp.public_key_hex(), restored.public_key_hex());
        assert_eq!(kp.address(), restored.address());
    }

    #[test]
    fn sign_and_verify() {
        let kp = WalletKeypair::from_secret_hex(&hex::encode([3u8; 32])).unwrap();
        let message = b"hello";
        let sig = kp.sign_message(message);
        assert!(verify_message_hex(&kp.public_key_hex(), message, &sig).unwrap());
        assert!(!verify_message_hex(&kp.public_key_hex(), b"other", &sig).unwrap());
    }

    #[test]
    fn wallet_file_roundtrip() {
        let kp = WalletKeypair::from_secret_hex(&hex::encode([4u8; 32])).unwrap();
        let file = kp.to_wallet_file();
        let restored = wallet_keypair_from_file(&file).unwrap();
        assert_eq!(kp.address(), restored.address());
    }

    #[test]
    fn wallet_file_rejects_mismatched_address() {
        let kp = WalletKeypair::from_secret_hex(&hex::encode([5u8; 32])).unwrap();
        let mut file = kp.to_wallet_file();
        file.address = format!("{ADDRESS_PREFIX}{}", "0".repeat(40));
        match wallet_keypair_from_file(&file) {
            Err(WalletError::InvalidWalletFile(msg)) => assert!(msg.contains("address")),
            other => panic!("expected InvalidWalletFile, got {:?}", other),
        }
    }

    #[test]
    fn invalid_secret_length_rejected() {
        match WalletKeypair::from_secret_hex("abcd") {
            Err(WalletError::InvalidSecretLength(2)) => {}
            other => panic!("expected InvalidSecretLength, got {:?}", other),
        }
    }
}
