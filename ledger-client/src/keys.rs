//! Key generation and transfer signing
//!
//! This module provides:
//! - Ed25519 key pair generation for fresh routing accounts
//! - Address derivation (last 20 bytes of SHA-256 over the public key)
//! - Canonical transfer messages and their signatures

use crate::types::{Address, Amount, SecretKey};
use ed25519_dalek::{Signature as DalekSignature, Signer, SigningKey, Verifier, VerifyingKey};
use sha2::{Digest, Sha256};

/// Ed25519 key pair for signing transfers
#[derive(Debug)]
pub struct KeyPair {
    signing_key: SigningKey,
    verifying_key: VerifyingKey,
}

impl KeyPair {
    /// Generate a new random key pair
    pub fn generate() -> Self {
        Self::from_seed(&rand::random::<[u8; 32]>())
    }

    /// Create from seed (32 bytes) - deterministic generation
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        let signing_key = SigningKey::from_bytes(seed);
        let verifying_key = signing_key.verifying_key();

        Self {
            signing_key,
            verifying_key,
        }
    }

    /// Restore from a stored secret key
    pub fn from_secret(secret: &SecretKey) -> Self {
        Self::from_seed(secret.as_bytes())
    }

    /// Get public key bytes
    pub fn public_key(&self) -> [u8; 32] {
        self.verifying_key.to_bytes()
    }

    /// Get secret key (USE WITH CAUTION - should be protected)
    pub fn secret_key(&self) -> SecretKey {
        SecretKey::from_bytes(self.signing_key.to_bytes())
    }

    /// Address controlled by this key pair
    pub fn address(&self) -> Address {
        derive_address(&self.public_key())
    }

    /// Sign a message
    pub fn sign(&self, message: &[u8]) -> [u8; 64] {
        self.signing_key.sign(message).to_bytes()
    }
}

/// `0x` + hex of the last 20 bytes of SHA-256(public key)
pub fn derive_address(public_key: &[u8; 32]) -> Address {
    let digest = hash_bytes(public_key);
    Address::new(format!("0x{}", hex::encode(&digest[12..])))
}

/// Verify a signature with a public key
pub fn verify_signature(message: &[u8], signature: &[u8; 64], public_key: &[u8; 32]) -> bool {
    let dalek_sig = DalekSignature::from_bytes(signature);

    let verifying_key = match VerifyingKey::from_bytes(public_key) {
        Ok(key) => key,
        Err(_) => return false,
    };

    verifying_key.verify(message, &dalek_sig).is_ok()
}

/// Hash arbitrary bytes using SHA-256
pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hasher.finalize().into()
}

/// A transfer authorized by the sender's key
#[derive(Debug, Clone)]
pub struct SignedTransfer {
    /// Sending address
    pub from: Address,
    /// Receiving address
    pub to: Address,
    /// Value credited to the receiver
    pub amount: Amount,
    /// Fee budget charged to the sender
    pub fee_budget: Amount,
    /// Sender-local sequence number
    pub nonce: u64,
    /// Sender public key
    pub public_key: [u8; 32],
    /// Signature over [`SignedTransfer::message`]
    pub signature: [u8; 64],
}

impl SignedTransfer {
    /// Sign a transfer out of `from` with the sender's key pair
    pub fn sign(
        keypair: &KeyPair,
        from: &Address,
        to: &Address,
        amount: Amount,
        fee_budget: Amount,
        nonce: u64,
    ) -> Self {
        let message = Self::message(from, to, amount, fee_budget, nonce);

        Self {
            from: from.clone(),
            to: to.clone(),
            amount,
            fee_budget,
            nonce,
            public_key: keypair.public_key(),
            signature: keypair.sign(&message),
        }
    }

    /// Canonical bytes covered by the signature
    pub fn message(from: &Address, to: &Address, amount: Amount, fee_budget: Amount, nonce: u64) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(128);
        bytes.extend_from_slice(from.normalized().as_str().as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(to.normalized().as_str().as_bytes());
        bytes.push(b'|');
        bytes.extend_from_slice(&amount.to_be_bytes());
        bytes.extend_from_slice(&fee_budget.to_be_bytes());
        bytes.extend_from_slice(&nonce.to_be_bytes());
        bytes
    }

    /// Signature valid and public key owns `from`
    pub fn verify(&self) -> bool {
        if !derive_address(&self.public_key).matches(&self.from) {
            return false;
        }
        let message = Self::message(&self.from, &self.to, self.amount, self.fee_budget, self.nonce);
        verify_signature(&message, &self.signature, &self.public_key)
    }

    /// Deterministic transaction hash
    pub fn hash(&self) -> String {
        let mut bytes = Self::message(&self.from, &self.to, self.amount, self.fee_budget, self.nonce);
        bytes.extend_from_slice(&self.signature);
        format!("0x{}", hex::encode(hash_bytes(&bytes)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_keypair_roundtrip_from_secret() {
        let keypair = KeyPair::generate();
        let restored = KeyPair::from_secret(&keypair.secret_key());

        assert_eq!(keypair.public_key(), restored.public_key());
        assert_eq!(keypair.address(), restored.address());
    }

    #[test]
    fn test_address_format() {
        let address = KeyPair::from_seed(&[7u8; 32]).address();

        assert!(address.as_str().starts_with("0x"));
        assert_eq!(address.as_str().len(), 42);
    }

    #[test]
    fn test_generated_accounts_are_unlinked() {
        let a = KeyPair::generate();
        let b = KeyPair::generate();
        assert_ne!(a.address(), b.address());
    }

    #[test]
    fn test_signed_transfer_verifies() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let to = Address::new("0x00000000000000000000000000000000000000aa");
        let transfer = SignedTransfer::sign(&keypair, &keypair.address(), &to, 1_000, 214, 0);

        assert!(transfer.verify());
        assert!(transfer.hash().starts_with("0x"));
    }

    #[test]
    fn test_tampered_transfer_rejected() {
        let keypair = KeyPair::from_seed(&[1u8; 32]);
        let to = Address::new("0x00000000000000000000000000000000000000aa");
        let mut transfer = SignedTransfer::sign(&keypair, &keypair.address(), &to, 1_000, 214, 0);
        transfer.amount = 2_000;
        assert!(!transfer.verify());

        let victim = KeyPair::from_seed(&[2u8; 32]).address();
        let forged = SignedTransfer::sign(&keypair, &victim, &to, 1_000, 214, 0);
        assert!(!forged.verify());
    }
}
