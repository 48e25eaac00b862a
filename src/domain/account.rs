use crate::error::{PaymentError, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Length in bytes of a payment public key hash.
pub const ADDRESS_LEN: usize = 28;

/// Identifies a party both on-chain and for off-chain message routing.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Address([u8; ADDRESS_LEN]);

impl Address {
    pub const fn new(bytes: [u8; ADDRESS_LEN]) -> Self {
        Self(bytes)
    }

    pub fn from_hex(encoded: &str) -> Result<Self> {
        let bytes = hex::decode(encoded.trim())
            .map_err(|e| PaymentError::ValidationError(format!("invalid address hex: {e}")))?;
        let bytes: [u8; ADDRESS_LEN] = bytes.try_into().map_err(|bytes: Vec<u8>| {
            PaymentError::ValidationError(format!(
                "address must be {ADDRESS_LEN} bytes, got {}",
                bytes.len()
            ))
        })?;
        Ok(Self(bytes))
    }

    pub fn as_bytes(&self) -> &[u8; ADDRESS_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({})", self.to_hex())
    }
}

impl FromStr for Address {
    type Err = PaymentError;

    fn from_str(s: &str) -> Result<Self> {
        Self::from_hex(s)
    }
}

impl Serialize for Address {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Address {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// The party a payment client acts for.
///
/// Immutable once constructed: the address is used for channel participation
/// and message routing, the wallet id for balance queries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    address: Address,
    wallet_id: String,
}

impl Account {
    pub fn new(address: Address, wallet_id: impl Into<String>) -> Result<Self> {
        let wallet_id = wallet_id.into();
        if wallet_id.trim().is_empty() {
            return Err(PaymentError::ValidationError(
                "wallet id must not be empty".to_string(),
            ));
        }
        Ok(Self { address, wallet_id })
    }

    pub fn address(&self) -> Address {
        self.address
    }

    pub fn wallet_id(&self) -> &str {
        &self.wallet_id
    }
}
