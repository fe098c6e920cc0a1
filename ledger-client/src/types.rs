//! Core types shared by the ledger boundary and the router
//!
//! Amounts are plain integers in the ledger's base unit. Nothing in this
//! crate does fractional arithmetic.

use chrono::{DateTime, Utc};
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;

use crate::keys::KeyPair;

/// Quantity of the base currency unit (e.g. wei)
pub type Amount = u128;

/// Ledger address
///
/// Addresses compare case-insensitively through [`Address::matches`]; the
/// derived `Eq` is exact and is only used for map keys after
/// [`Address::normalized`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Address(String);

impl Address {
    /// Create new address
    pub fn new(address: impl Into<String>) -> Self {
        Self(address.into().trim().to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// ASCII case-insensitive comparison
    pub fn matches(&self, other: &Address) -> bool {
        self.0.eq_ignore_ascii_case(&other.0)
    }

    /// Lower-cased form used as a lookup key
    pub fn normalized(&self) -> Address {
        Address(self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Transaction hash
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(String);

impl TxHash {
    /// Create new transaction hash
    pub fn new(hash: impl Into<String>) -> Self {
        Self(hash.into().trim().to_string())
    }

    /// Get as string
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Lower-cased form used as a lookup key
    pub fn normalized(&self) -> TxHash {
        TxHash(self.0.to_ascii_lowercase())
    }
}

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Ed25519 secret key bytes (hex on the wire)
#[derive(Clone, PartialEq, Eq)]
pub struct SecretKey([u8; 32]);

impl SecretKey {
    /// Wrap raw key bytes
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Raw key bytes (USE WITH CAUTION)
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }
}

impl fmt::Debug for SecretKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SecretKey(<redacted>)")
    }
}

impl Serialize for SecretKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for SecretKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        let bytes = hex::decode(encoded.trim_start_matches("0x")).map_err(de::Error::custom)?;
        let bytes: [u8; 32] = bytes
            .try_into()
            .map_err(|_| de::Error::custom("secret key must be 32 bytes"))?;
        Ok(SecretKey(bytes))
    }
}

/// Identity that can sign transfers out of its address
#[derive(Clone, Serialize, Deserialize)]
pub struct Account {
    /// Public address
    pub address: Address,
    secret: SecretKey,
}

impl Account {
    /// Generate a fresh, unlinked account
    pub fn generate() -> Self {
        Self::from_keypair(&KeyPair::generate())
    }

    /// Build from an existing key pair
    pub fn from_keypair(keypair: &KeyPair) -> Self {
        Self {
            address: keypair.address(),
            secret: keypair.secret_key(),
        }
    }

    /// Restore from secret key bytes
    pub fn from_secret(secret: SecretKey) -> Self {
        Self::from_keypair(&KeyPair::from_secret(&secret))
    }

    /// Signing key pair
    pub fn keypair(&self) -> KeyPair {
        KeyPair::from_secret(&self.secret)
    }

    /// Secret key (USE WITH CAUTION)
    pub fn secret(&self) -> &SecretKey {
        &self.secret
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("address", &self.address)
            .field("secret", &self.secret)
            .finish()
    }
}

/// Per-transfer fee estimate
///
/// `network_fee` is the flat L1 cost of one transfer; `surcharge` is the
/// protocol L2 cost, a fixed percentage of the network fee.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct FeeQuote {
    /// Flat network fee (feeL1)
    pub network_fee: Amount,
    /// Protocol surcharge (feeL2)
    pub surcharge: Amount,
}

impl FeeQuote {
    /// `surcharge = network_fee * percent / 100`, integer division
    pub fn with_surcharge_percent(network_fee: Amount, percent: u32) -> Self {
        Self {
            network_fee,
            surcharge: network_fee.saturating_mul(Amount::from(percent)) / 100,
        }
    }

    /// Fee budget reserved by every outbound transfer
    pub fn total(&self) -> Amount {
        self.network_fee.saturating_add(self.surcharge)
    }
}

/// Transaction as returned by a hash lookup
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InboundTransaction {
    /// Transaction hash
    pub hash: TxHash,
    /// Sender
    pub from: Address,
    /// Destination
    pub to: Address,
    /// Transferred value
    pub value: Amount,
    /// Included and final
    pub confirmed: bool,
}

/// Confirmation of a submitted transfer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferReceipt {
    /// Transaction hash
    pub hash: TxHash,
    /// Sender
    pub from: Address,
    /// Recipient
    pub to: Address,
    /// Value credited to the recipient
    pub amount: Amount,
    /// Fee charged to the sender
    pub fee: Amount,
    /// Ledger position of the confirmation
    pub sequence: u64,
    /// Confirmation time
    pub confirmed_at: DateTime<Utc>,
}
