// Identifier types shared by the ledger client and the rest of the engine.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A 20-byte account address (DJ, voter, or contract).
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Address([u8; 20]);

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid address `{0}`: expected 0x followed by 40 hex digits")]
pub struct AddressParseError(pub String);

impl Address {
    pub const fn from_bytes(bytes: [u8; 20]) -> Self {
        Address(bytes)
    }

    pub fn as_bytes(&self) -> &[u8; 20] {
        &self.0
    }
}

impl FromStr for Address {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .ok_or_else(|| AddressParseError(s.to_string()))?;
        if digits.len() != 40 {
            return Err(AddressParseError(s.to_string()));
        }
        let bytes = super::abi::from_hex(digits).map_err(|_| AddressParseError(s.to_string()))?;
        let mut out = [0u8; 20];
        out.copy_from_slice(&bytes);
        Ok(Address(out))
    }
}

impl TryFrom<String> for Address {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Address> for String {
    fn from(value: Address) -> Self {
        value.to_string()
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&super::abi::to_hex(&self.0))
    }
}

impl fmt::Debug for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Address({self})")
    }
}

/// Ledger-assigned track identity. Assigned sequentially per DJ, so ordering
/// by id is ledger insertion order.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TrackId(pub u64);

impl fmt::Display for TrackId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

impl FromStr for TrackId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().trim_start_matches('#').parse().map(TrackId)
    }
}

/// Hash of a submitted transaction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxHash(pub String);

impl fmt::Display for TxHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// One row of a DJ's queue as the ledger reports it. `name` is raw and may
/// carry an embedded streaming URI.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LedgerTrack {
    pub id: TrackId,
    pub name: String,
    pub votes: u64,
    pub removed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_round_trips_through_display() {
        let s = "0x5f98737e92016b237a451db3258655b691904fbe";
        let addr: Address = s.parse().unwrap();
        assert_eq!(addr.to_string(), s);
    }

    #[test]
    fn address_parse_accepts_mixed_case_and_whitespace() {
        let addr: Address = " 0x5F98737E92016b237A451db3258655B691904fBe\n".parse().unwrap();
        assert_eq!(addr.as_bytes()[0], 0x5f);
    }

    #[test]
    fn address_parse_rejects_bad_input() {
        assert!("5f98737e92016b237a451db3258655b691904fbe".parse::<Address>().is_err());
        assert!("0x1234".parse::<Address>().is_err());
        assert!("0xzz98737e92016b237a451db3258655b691904fbe".parse::<Address>().is_err());
    }

    #[test]
    fn address_serde_as_string() {
        let addr: Address = "0x00000000000000000000000000000000000000aa".parse().unwrap();
        let json = serde_json::to_string(&addr).unwrap();
        assert_eq!(json, "\"0x00000000000000000000000000000000000000aa\"");
        let back: Address = serde_json::from_str(&json).unwrap();
        assert_eq!(back, addr);
    }

    #[test]
    fn track_id_parse() {
        assert_eq!("12".parse::<TrackId>().unwrap(), TrackId(12));
        assert_eq!("#3".parse::<TrackId>().unwrap(), TrackId(3));
        assert!("x".parse::<TrackId>().is_err());
    }
}
