//! Diagnostic Trouble Codes
//!
//! Decodes Mode 03 replies into canonical codes such as `P0301` and resolves
//! descriptions from a read-only code table.

use crate::error::ObdError;
use crate::hex;
use crate::mode;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

/// Group letters indexed by the top two bits of the first byte
pub const DTC_GROUPS: [char; 4] = ['P', 'C', 'B', 'U'];

/// Display code used when a Mode 03 reply carried no codes
pub const NO_CODES_SENTINEL: &str = "P0000";

/// Description returned for codes missing from the table
pub const NO_DESCRIPTION: &str = "(no description found)";

/// A stored trouble code: group letter plus four hex digits
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(into = "String", try_from = "String")]
pub struct DtcCode {
    /// Index into [`DTC_GROUPS`] (0..=3)
    group: u8,
    /// Digit nibbles; the first is limited to 0..=3
    digits: [u8; 4],
}

impl DtcCode {
    /// Unpack a code from its two-byte wire form
    pub fn from_bytes(a: u8, b: u8) -> Self {
        Self {
            group: (a & 0xC0) >> 6,
            digits: [(a & 0x30) >> 4, a & 0x0F, (b & 0xF0) >> 4, b & 0x0F],
        }
    }

    /// Pack the code back into its two-byte wire form
    pub fn to_bytes(&self) -> (u8, u8) {
        let [d1, d2, d3, d4] = self.digits;
        ((self.group << 6) | (d1 << 4) | d2, (d3 << 4) | d4)
    }

    /// Group letter (`P`, `C`, `B` or `U`)
    pub fn group(&self) -> char {
        DTC_GROUPS[self.group as usize]
    }
}

impl fmt::Display for DtcCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let [d1, d2, d3, d4] = self.digits;
        write!(f, "{}{:X}{:X}{:X}{:X}", self.group(), d1, d2, d3, d4)
    }
}

impl FromStr for DtcCode {
    type Err = ObdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let invalid = || ObdError::InvalidDtc(s.to_string());
        let upper = s.trim().to_ascii_uppercase();
        let mut chars = upper.chars();

        let letter = chars.next().ok_or_else(invalid)?;
        let group = DTC_GROUPS
            .iter()
            .position(|&g| g == letter)
            .ok_or_else(invalid)? as u8;

        let nibbles: Vec<u8> = chars
            .map(|c| c.to_digit(16).map(|d| d as u8))
            .collect::<Option<_>>()
            .ok_or_else(invalid)?;
        let digits: [u8; 4] = nibbles.try_into().map_err(|_| invalid())?;
        if digits[0] > 3 {
            return Err(invalid());
        }

        Ok(Self { group, digits })
    }
}

impl From<DtcCode> for String {
    fn from(code: DtcCode) -> Self {
        code.to_string()
    }
}

impl TryFrom<String> for DtcCode {
    type Error = ObdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

/// Decode stored codes from a Mode 03 reply
///
/// Returns an empty list when the reply has no `43` marker or no codes
/// before the `00 00` terminator. Sentinel substitution is left to
/// [`DtcReport`].
pub fn decode_dtcs(reply: &str) -> Vec<DtcCode> {
    decode_dtc_tokens(&hex::tokenize(reply))
}

/// Decode stored codes from pre-tokenized bytes
pub fn decode_dtc_tokens(tokens: &[u8]) -> Vec<DtcCode> {
    let Some(start) = tokens.iter().position(|&t| t == mode::READ_DTC_RESPONSE) else {
        return Vec::new();
    };

    tokens[start + 1..]
        .chunks_exact(2)
        .take_while(|pair| !(pair[0] == 0 && pair[1] == 0))
        .map(|pair| DtcCode::from_bytes(pair[0], pair[1]))
        .collect()
}

/// Outcome of a Mode 03 reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DtcReport {
    /// One or more stored codes
    Codes(Vec<DtcCode>),
    /// The reply was present but carried no codes
    NoneStored,
}

impl DtcReport {
    /// Wrap decoded codes, mapping an empty list to [`DtcReport::NoneStored`]
    pub fn from_codes(codes: Vec<DtcCode>) -> Self {
        if codes.is_empty() {
            DtcReport::NoneStored
        } else {
            DtcReport::Codes(codes)
        }
    }

    /// Decoded codes (empty for [`DtcReport::NoneStored`])
    pub fn codes(&self) -> &[DtcCode] {
        match self {
            DtcReport::Codes(codes) => codes,
            DtcReport::NoneStored => &[],
        }
    }

    /// Codes as shown to users; an empty report shows the `P0000` sentinel
    pub fn display_codes(&self) -> Vec<String> {
        match self {
            DtcReport::Codes(codes) => codes.iter().map(ToString::to_string).collect(),
            DtcReport::NoneStored => vec![NO_CODES_SENTINEL.to_string()],
        }
    }
}

/// Code to description lookup, built once and then read only
#[derive(Debug, Clone, Default)]
pub struct DtcTable {
    entries: HashMap<String, String>,
}

impl DtcTable {
    /// Create an empty table
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a description
    pub fn insert(&mut self, code: impl Into<String>, description: impl Into<String>) {
        self.entries
            .insert(code.into().to_ascii_uppercase(), description.into());
    }

    /// Description for a code string, or [`NO_DESCRIPTION`]
    pub fn describe(&self, code: &str) -> &str {
        self.entries
            .get(&code.to_ascii_uppercase())
            .map(String::as_str)
            .unwrap_or(NO_DESCRIPTION)
    }

    /// Description for a decoded code, or [`NO_DESCRIPTION`]
    pub fn lookup(&self, code: &DtcCode) -> &str {
        self.describe(&code.to_string())
    }

    /// Number of known codes
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the table has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for DtcTable {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut table = Self::new();
        for (code, description) in iter {
            table.insert(code, description);
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn codes(reply: &str) -> Vec<String> {
        decode_dtcs(reply).iter().map(ToString::to_string).collect()
    }

    #[test]
    fn test_decode_after_marker() {
        assert_eq!(codes("41 0C 1A F8 43 01 03 01 06 00 00"), vec!["P0103", "P0106"]);
    }

    #[test]
    fn test_group_bits() {
        assert_eq!(DtcCode::from_bytes(0x43, 0x01).to_string(), "C0301");
        assert_eq!(DtcCode::from_bytes(0x91, 0x23).to_string(), "B1123");
        assert_eq!(DtcCode::from_bytes(0xC1, 0x00).to_string(), "U0100");
        assert_eq!(DtcCode::from_bytes(0x0A, 0xBC).to_string(), "P0ABC");
    }

    #[test]
    fn test_terminator_right_after_marker() {
        assert!(decode_dtcs("43 00 00").is_empty());
    }

    #[test]
    fn test_missing_marker() {
        assert!(decode_dtcs("41 0D 5A").is_empty());
        assert!(decode_dtcs("NO DATA").is_empty());
    }

    #[test]
    fn test_codes_until_tokens_exhausted() {
        // Odd trailing token is ignored
        assert_eq!(codes("43 03 01 01"), vec!["P0301"]);
    }

    #[test]
    fn test_report_sentinel() {
        let report = DtcReport::from_codes(Vec::new());
        assert_eq!(report, DtcReport::NoneStored);
        assert!(report.codes().is_empty());
        assert_eq!(report.display_codes(), vec!["P0000"]);

        let report = DtcReport::from_codes(decode_dtcs("43 01 71"));
        assert_eq!(report.display_codes(), vec!["P0171"]);
    }

    #[test]
    fn test_parse_canonical() {
        let code: DtcCode = "p0301".parse().unwrap();
        assert_eq!(code.to_string(), "P0301");
        assert_eq!(code.to_bytes(), (0x03, 0x01));

        assert!("X0301".parse::<DtcCode>().is_err());
        assert!("P4301".parse::<DtcCode>().is_err());
        assert!("P030".parse::<DtcCode>().is_err());
        assert!("P03011".parse::<DtcCode>().is_err());
        assert!("".parse::<DtcCode>().is_err());
    }

    #[test]
    fn test_table_lookup() {
        let table: DtcTable = [("P0301", "Cylinder 1 misfire detected")].into_iter().collect();
        assert_eq!(table.len(), 1);
        assert_eq!(
            table.lookup(&DtcCode::from_bytes(0x03, 0x01)),
            "Cylinder 1 misfire detected"
        );
        assert_eq!(table.describe("p0301"), "Cylinder 1 misfire detected");
        assert_eq!(table.describe("P0420"), NO_DESCRIPTION);
    }

    proptest! {
        #[test]
        fn prop_canonical_string_round_trips(
            group in 0usize..4,
            d1 in 0u8..4,
            rest in proptest::collection::vec(0u8..16, 3),
        ) {
            let text = format!(
                "{}{:X}{:X}{:X}{:X}",
                DTC_GROUPS[group], d1, rest[0], rest[1], rest[2]
            );
            let code: DtcCode = text.parse().unwrap();
            let (a, b) = code.to_bytes();
            prop_assert_eq!(DtcCode::from_bytes(a, b).to_string(), text);
        }

        #[test]
        fn prop_bytes_round_trip(a in any::<u8>(), b in any::<u8>()) {
            prop_assert_eq!(DtcCode::from_bytes(a, b).to_bytes(), (a, b));
        }
    }
}
