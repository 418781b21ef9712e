//! Reply Classification and Routing
//!
//! Turns one framed reply into a [`ProcessedResponse`]: adapter status,
//! decoded PID readings, and the Mode 03 report with descriptions.

use crate::dtc::{decode_dtc_tokens, DtcReport, DtcTable};
use crate::hex;
use crate::mode;
use crate::pid::{PidReading, PidRegistry};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Progress text some adapters print while detecting the protocol
pub const SEARCHING: &str = "SEARCHING...";

/// Text-level classification of an adapter reply
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum AdapterStatus {
    /// Command acknowledged
    Ok,
    /// The vehicle did not answer the request
    NoData,
    /// The adapter could not reach the vehicle bus
    UnableToConnect,
    /// Adapter reported an error (`ERROR`, `CAN ERROR`, `BUS ERROR`, ...)
    AdapterError(String),
    /// Adapter identification banner
    Identity(String),
    /// Data or anything else
    Other,
}

impl AdapterStatus {
    /// Classify a cleaned reply
    pub fn classify(reply: &str) -> Self {
        let upper = reply.to_ascii_uppercase();
        if upper.contains("NO DATA") {
            AdapterStatus::NoData
        } else if upper.contains("UNABLE TO CONNECT") {
            AdapterStatus::UnableToConnect
        } else if upper.contains("ERROR") {
            AdapterStatus::AdapterError(reply.to_string())
        } else if upper.contains("ELM327") {
            AdapterStatus::Identity(reply.to_string())
        } else if upper.contains("OK") {
            AdapterStatus::Ok
        } else {
            AdapterStatus::Other
        }
    }

    /// Whether this status deserves a user-facing warning
    pub fn is_advisory(&self) -> bool {
        matches!(
            self,
            AdapterStatus::NoData | AdapterStatus::UnableToConnect | AdapterStatus::AdapterError(_)
        )
    }
}

/// Normalize a raw reply: drop prompt/line terminators and progress text,
/// collapse whitespace
pub fn clean_response(raw: &str) -> String {
    raw.replace(SEARCHING, " ")
        .split(|c: char| c.is_whitespace() || c == '>')
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
}

/// A stored code together with its table description
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DtcEntry {
    pub code: String,
    pub description: String,
}

/// Everything extracted from one reply
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProcessedResponse {
    /// Cleaned reply text
    pub text: String,
    pub status: AdapterStatus,
    /// Readings for every registered PID found in the reply
    pub readings: Vec<PidReading>,
    /// Present when the reply carried the Mode 03 marker
    pub dtc_report: Option<DtcReport>,
    /// Display codes of the report with descriptions (sentinel included)
    pub dtc_entries: Vec<DtcEntry>,
}

/// Routes replies to the PID and DTC decoders
#[derive(Debug, Clone)]
pub struct ResponseProcessor {
    registry: PidRegistry,
    table: Arc<DtcTable>,
}

impl ResponseProcessor {
    /// Create a processor with the given registry and description table
    pub fn new(registry: PidRegistry, table: Arc<DtcTable>) -> Self {
        Self { registry, table }
    }

    /// Description table in use
    pub fn table(&self) -> &DtcTable {
        &self.table
    }

    /// Process one reply; `None` if nothing is left after cleaning
    pub fn process(&self, raw: &str) -> Option<ProcessedResponse> {
        let text = clean_response(raw);
        if text.is_empty() {
            return None;
        }
        debug!("Response <<< {}", text);

        let tokens = hex::tokenize(&text);
        let readings = self.registry.decode_tokens(&tokens);
        for reading in &readings {
            info!("{}", reading);
        }

        let dtc_report = self
            .dtc_marker(&tokens)
            .map(|start| DtcReport::from_codes(decode_dtc_tokens(&tokens[start..])));
        let dtc_entries = dtc_report
            .as_ref()
            .map(|report| self.describe(report))
            .unwrap_or_default();
        if dtc_report == Some(DtcReport::NoneStored) {
            info!("No diagnostic trouble codes found");
        }

        let status = AdapterStatus::classify(&text);
        match &status {
            AdapterStatus::NoData => {
                warn!("NO DATA: PID/mode not supported or no current values")
            }
            AdapterStatus::UnableToConnect => {
                warn!("Unable to connect to vehicle: check ignition and connection")
            }
            AdapterStatus::AdapterError(text) => warn!("Adapter reported error: {}", text),
            AdapterStatus::Identity(text) => info!("Adapter identified: {}", text),
            AdapterStatus::Ok | AdapterStatus::Other => {}
        }

        Some(ProcessedResponse {
            text,
            status,
            readings,
            dtc_report,
            dtc_entries,
        })
    }

    /// Position of the Mode 03 marker
    ///
    /// A `43` byte inside a decoded PID response, or in the PID slot right
    /// after a `41`, is data rather than a marker.
    fn dtc_marker(&self, tokens: &[u8]) -> Option<usize> {
        let claimed = self.registry.claimed_spans(tokens);
        tokens.iter().enumerate().position(|(i, &token)| {
            token == mode::READ_DTC_RESPONSE
                && !claimed.iter().any(|span| span.contains(&i))
                && (i == 0 || tokens[i - 1] != mode::CURRENT_DATA_RESPONSE)
        })
    }

    fn describe(&self, report: &DtcReport) -> Vec<DtcEntry> {
        report
            .display_codes()
            .into_iter()
            .map(|code| {
                let description = self.table.describe(&code).to_string();
                info!("  {} - {}", code, description);
                DtcEntry { code, description }
            })
            .collect()
    }
}

impl Default for ResponseProcessor {
    fn default() -> Self {
        Self::new(PidRegistry::standard(), Arc::new(DtcTable::new()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dtc::NO_DESCRIPTION;

    fn processor() -> ResponseProcessor {
        let table: DtcTable = [
            ("P0103", "Mass air flow circuit high input"),
            ("P0000", "No fault stored"),
        ]
        .into_iter()
        .collect();
        ResponseProcessor::new(PidRegistry::standard(), Arc::new(table))
    }

    #[test]
    fn test_clean_response() {
        assert_eq!(clean_response("SEARCHING...\r41 0C  1A F8\r\r>"), "41 0C 1A F8");
        assert_eq!(clean_response(" > \r\n"), "");
    }

    #[test]
    fn test_classify() {
        assert_eq!(AdapterStatus::classify("OK"), AdapterStatus::Ok);
        assert_eq!(AdapterStatus::classify("NO DATA"), AdapterStatus::NoData);
        assert_eq!(
            AdapterStatus::classify("UNABLE TO CONNECT"),
            AdapterStatus::UnableToConnect
        );
        assert_eq!(
            AdapterStatus::classify("CAN ERROR"),
            AdapterStatus::AdapterError("CAN ERROR".to_string())
        );
        assert_eq!(
            AdapterStatus::classify("ELM327 v1.5"),
            AdapterStatus::Identity("ELM327 v1.5".to_string())
        );
        assert_eq!(AdapterStatus::classify("41 0D 5A"), AdapterStatus::Other);
        assert!(AdapterStatus::NoData.is_advisory());
        assert!(!AdapterStatus::Ok.is_advisory());
    }

    #[test]
    fn test_pid_reply() {
        let response = processor().process("41 0D 5A").unwrap();
        assert_eq!(response.readings, vec![PidReading::SpeedKmh(90)]);
        assert_eq!(response.dtc_report, None);
        assert!(response.dtc_entries.is_empty());
    }

    #[test]
    fn test_pid_byte_0x43_is_not_a_dtc_marker() {
        // Coolant 0x43 = 67 - 40
        let response = processor().process("41 05 43").unwrap();
        assert_eq!(response.readings, vec![PidReading::CoolantC(27)]);
        assert_eq!(response.dtc_report, None);
        assert!(response.dtc_entries.is_empty());

        // Unregistered PID 0x43 in the PID slot
        let response = processor().process("41 43 12 34").unwrap();
        assert_eq!(response.dtc_report, None);

        // A real marker after the PID data still counts
        let response = processor().process("41 0D 5A 43 01 71").unwrap();
        assert_eq!(response.readings, vec![PidReading::SpeedKmh(90)]);
        assert_eq!(response.dtc_report.unwrap().display_codes(), vec!["P0171"]);
    }

    #[test]
    fn test_dtc_reply_with_descriptions() {
        let response = processor().process("43 01 03 01 06 00 00").unwrap();
        let report = response.dtc_report.unwrap();
        assert_eq!(report.display_codes(), vec!["P0103", "P0106"]);
        assert_eq!(
            response.dtc_entries,
            vec![
                DtcEntry {
                    code: "P0103".to_string(),
                    description: "Mass air flow circuit high input".to_string(),
                },
                DtcEntry {
                    code: "P0106".to_string(),
                    description: NO_DESCRIPTION.to_string(),
                },
            ]
        );
    }

    #[test]
    fn test_empty_dtc_reply_uses_sentinel() {
        let response = processor().process("43 00 00").unwrap();
        assert_eq!(response.dtc_report, Some(DtcReport::NoneStored));
        assert_eq!(response.dtc_entries[0].code, "P0000");
        assert_eq!(response.dtc_entries[0].description, "No fault stored");
    }

    #[test]
    fn test_advisory_reply() {
        let response = processor().process("SEARCHING...\rUNABLE TO CONNECT").unwrap();
        assert_eq!(response.status, AdapterStatus::UnableToConnect);
        assert!(response.readings.is_empty());
    }

    #[test]
    fn test_blank_reply() {
        assert!(processor().process("SEARCHING...").is_none());
    }
}
