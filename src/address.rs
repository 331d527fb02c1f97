//! Canonical agent addresses.
//!
//! An [`AgentAddress`] is a 20-byte cryptographic identity rendered as a
//! lowercase `0x`-prefixed 40-hex string. Parsing accepts mixed case (as
//! produced by EIP-55 checksummed wallets) but always canonicalises to
//! lowercase, since the address doubles as a routing key and a DNS label.

use std::fmt;
use std::str::FromStr;

use alloy_primitives::Address as AlloyAddress;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct AgentAddress(String);

impl AgentAddress {
    /// Parses and canonicalises a `0x`-prefixed 40-hex address.
    ///
    /// Hex digits are decoded manually (not via `Address`'s `FromStr`) so
    /// that mixed-case input that fails EIP-55 checksum validation is still
    /// accepted and simply lowercased — this relay treats addresses as
    /// case-insensitive identifiers, not checksummed wallet strings.
    pub fn parse(raw: &str) -> Result<Self, AddressParseError> {
        let hex_part = raw.strip_prefix("0x").ok_or(AddressParseError)?;
        if hex_part.len() != 40 || !hex_part.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(AddressParseError);
        }
        let mut bytes = [0u8; 20];
        hex::decode_to_slice(hex_part, &mut bytes).map_err(|_| AddressParseError)?;
        let addr = AlloyAddress::from(bytes);
        Ok(Self(format!("{addr:#x}").to_lowercase()))
    }

    /// The leftmost DNS label match used by the router: a lowercase
    /// `0x`-prefixed 40-hex string, exactly 42 characters.
    pub fn is_well_formed_label(label: &str) -> bool {
        label.len() == 42
            && label.starts_with("0x")
            && label[2..].chars().all(|c| c.is_ascii_hexdigit())
            && label.chars().all(|c| !c.is_ascii_uppercase())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AgentAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for AgentAddress {
    type Err = AddressParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl TryFrom<String> for AgentAddress {
    type Error = AddressParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(&value)
    }
}

impl From<AgentAddress> for String {
    fn from(value: AgentAddress) -> Self {
        value.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AddressParseError;

impl fmt::Display for AddressParseError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("invalid agent address")
    }
}

impl std::error::Error for AddressParseError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalises_mixed_case() {
        let a = AgentAddress::parse("0xAbC1230000000000000000000000000000000000").unwrap();
        assert_eq!(a.as_str(), "0xabc1230000000000000000000000000000000000");
    }

    #[test]
    fn rejects_short_input() {
        assert!(AgentAddress::parse("0xabc").is_err());
    }

    #[test]
    fn rejects_missing_prefix() {
        assert!(AgentAddress::parse("abc1230000000000000000000000000000000000").is_err());
    }

    #[test]
    fn label_match_is_case_sensitive_to_canonical_form() {
        assert!(AgentAddress::is_well_formed_label(
            "0xabc1230000000000000000000000000000000000"
        ));
        assert!(!AgentAddress::is_well_formed_label(
            "0xABC1230000000000000000000000000000000000"
        ));
        assert!(!AgentAddress::is_well_formed_label("0xabc123"));
    }
}
