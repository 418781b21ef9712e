//! OBD-II PID Definitions and Response Parsing
//!
//! Defines the supported Mode 01 Parameter IDs (PIDs), their decoding
//! formulas, and a registry that extracts every known reading from a reply.

use crate::hex;
use crate::mode;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;

/// Supported OBD-II PIDs for Mode 01 (current data)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[repr(u8)]
pub enum Pid {
    /// Calculated engine load (0x04)
    EngineLoad = 0x04,
    /// Engine coolant temperature (0x05)
    CoolantTemp = 0x05,
    /// Engine RPM (0x0C)
    Rpm = 0x0C,
    /// Vehicle speed (0x0D)
    Speed = 0x0D,
    /// Control module voltage (0x42)
    ControlModuleVoltage = 0x42,
}

impl Pid {
    /// Every supported PID
    pub const ALL: [Pid; 5] = [
        Pid::Rpm,
        Pid::Speed,
        Pid::CoolantTemp,
        Pid::EngineLoad,
        Pid::ControlModuleVoltage,
    ];

    /// Get the PID hex value
    pub fn as_hex(&self) -> u8 {
        *self as u8
    }

    /// Look up a supported PID by its hex value
    pub fn from_hex(value: u8) -> Option<Pid> {
        Self::ALL.into_iter().find(|pid| pid.as_hex() == value)
    }

    /// Minimum number of data bytes needed to decode this PID
    pub fn response_bytes(&self) -> usize {
        match self {
            Pid::Rpm | Pid::ControlModuleVoltage => 2,
            _ => 1,
        }
    }

    /// Get the sampling priority (higher = more frequent)
    pub fn sampling_priority(&self) -> u8 {
        match self {
            Pid::Rpm | Pid::Speed => 10,
            Pid::CoolantTemp | Pid::EngineLoad => 5,
            Pid::ControlModuleVoltage => 2,
        }
    }

    /// Request command for this PID, e.g. `010C`
    pub fn request(&self) -> String {
        format!("{:02X}{:02X}", mode::CURRENT_DATA, self.as_hex())
    }

    /// Convert data bytes following `41 <pid>` into a reading
    ///
    /// Returns `None` when fewer than [`Pid::response_bytes`] are present.
    pub fn decode(&self, data: &[u8]) -> Option<PidReading> {
        if data.len() < self.response_bytes() {
            return None;
        }
        let a = data[0] as f64;
        let reading = match self {
            // ((A*256)+B)/4
            Pid::Rpm => PidReading::Rpm((a * 256.0 + data[1] as f64) / 4.0),
            // A (km/h)
            Pid::Speed => PidReading::SpeedKmh(data[0]),
            // A - 40 (°C)
            Pid::CoolantTemp => PidReading::CoolantC(data[0] as i16 - 40),
            // A * 100 / 255 (%)
            Pid::EngineLoad => PidReading::EngineLoadPct(a * 100.0 / 255.0),
            // ((A*256)+B)/1000 (V)
            Pid::ControlModuleVoltage => {
                PidReading::BatteryVolts((a * 256.0 + data[1] as f64) / 1000.0)
            }
        };
        Some(reading)
    }
}

/// A decoded value in physical units
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub enum PidReading {
    Rpm(f64),
    SpeedKmh(u8),
    CoolantC(i16),
    EngineLoadPct(f64),
    BatteryVolts(f64),
}

impl PidReading {
    /// The PID this reading was decoded from
    pub fn pid(&self) -> Pid {
        match self {
            PidReading::Rpm(_) => Pid::Rpm,
            PidReading::SpeedKmh(_) => Pid::Speed,
            PidReading::CoolantC(_) => Pid::CoolantTemp,
            PidReading::EngineLoadPct(_) => Pid::EngineLoad,
            PidReading::BatteryVolts(_) => Pid::ControlModuleVoltage,
        }
    }

    /// Numeric value regardless of unit
    pub fn value(&self) -> f64 {
        match *self {
            PidReading::Rpm(v) | PidReading::EngineLoadPct(v) | PidReading::BatteryVolts(v) => v,
            PidReading::SpeedKmh(v) => v as f64,
            PidReading::CoolantC(v) => v as f64,
        }
    }

    /// Display unit
    pub fn unit(&self) -> &'static str {
        match self {
            PidReading::Rpm(_) => "rpm",
            PidReading::SpeedKmh(_) => "km/h",
            PidReading::CoolantC(_) => "°C",
            PidReading::EngineLoadPct(_) => "%",
            PidReading::BatteryVolts(_) => "V",
        }
    }
}

impl fmt::Display for PidReading {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PidReading::Rpm(v) => write!(f, "RPM: {:.0} rpm", v),
            PidReading::SpeedKmh(v) => write!(f, "Speed: {} km/h", v),
            PidReading::CoolantC(v) => write!(f, "CoolantTemp: {} °C", v),
            PidReading::EngineLoadPct(v) => write!(f, "EngineLoad: {:.0} %", v),
            PidReading::BatteryVolts(v) => write!(f, "Control Module Voltage: {:.2} V", v),
        }
    }
}

/// Data bytes following the first `41 <pid>` pair, if any
pub fn find_payload(tokens: &[u8], pid: u8) -> Option<&[u8]> {
    find_header(tokens, pid).map(|i| &tokens[i + 2..])
}

/// Index of the first `41 <pid>` pair
fn find_header(tokens: &[u8], pid: u8) -> Option<usize> {
    tokens
        .windows(2)
        .position(|pair| pair[0] == mode::CURRENT_DATA_RESPONSE && pair[1] == pid)
}

/// Set of PIDs evaluated against every reply
#[derive(Debug, Clone)]
pub struct PidRegistry {
    pids: Vec<Pid>,
}

impl PidRegistry {
    /// Create a registry for the given PIDs
    pub fn new(pids: impl IntoIterator<Item = Pid>) -> Self {
        let mut registry = Self { pids: Vec::new() };
        for pid in pids {
            registry.register(pid);
        }
        registry
    }

    /// Registry with every supported PID
    pub fn standard() -> Self {
        Self::new(Pid::ALL)
    }

    /// Add a PID (ignored if already present)
    pub fn register(&mut self, pid: Pid) {
        if !self.pids.contains(&pid) {
            self.pids.push(pid);
        }
    }

    /// Registered PIDs in evaluation order
    pub fn pids(&self) -> &[Pid] {
        &self.pids
    }

    /// Decode every registered PID found in a reply
    pub fn decode(&self, reply: &str) -> Vec<PidReading> {
        self.decode_tokens(&hex::tokenize(reply))
    }

    /// Decode every registered PID found in pre-tokenized bytes
    ///
    /// Each PID is matched independently; a PID whose payload is too short
    /// is skipped without affecting the others.
    pub fn decode_tokens(&self, tokens: &[u8]) -> Vec<PidReading> {
        self.pids
            .iter()
            .filter_map(|pid| find_payload(tokens, pid.as_hex()).and_then(|data| pid.decode(data)))
            .collect()
    }

    /// Token ranges taken by registered PID responses: header plus payload
    pub fn claimed_spans(&self, tokens: &[u8]) -> Vec<Range<usize>> {
        self.pids
            .iter()
            .filter_map(|pid| {
                find_header(tokens, pid.as_hex())
                    .map(|i| i..(i + 2 + pid.response_bytes()).min(tokens.len()))
            })
            .collect()
    }
}

impl Default for PidRegistry {
    fn default() -> Self {
        Self::standard()
    }
}

/// Latest decoded value for each PID
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct LiveData {
    /// Timestamp of the most recent update (Unix ms)
    pub timestamp_ms: u64,
    /// Engine RPM
    pub rpm: Option<f64>,
    /// Vehicle speed (km/h)
    pub speed_kmh: Option<u8>,
    /// Coolant temperature (°C)
    pub coolant_c: Option<i16>,
    /// Engine load (0-100%)
    pub engine_load_pct: Option<f64>,
    /// Control module voltage (V)
    pub battery_volts: Option<f64>,
}

impl LiveData {
    /// Create an empty snapshot
    pub fn new(timestamp_ms: u64) -> Self {
        Self {
            timestamp_ms,
            ..Default::default()
        }
    }

    /// Overwrite the field matching a reading
    pub fn update(&mut self, reading: &PidReading, timestamp_ms: u64) {
        self.timestamp_ms = timestamp_ms;
        match *reading {
            PidReading::Rpm(v) => self.rpm = Some(v),
            PidReading::SpeedKmh(v) => self.speed_kmh = Some(v),
            PidReading::CoolantC(v) => self.coolant_c = Some(v),
            PidReading::EngineLoadPct(v) => self.engine_load_pct = Some(v),
            PidReading::BatteryVolts(v) => self.battery_volts = Some(v),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rpm_decode() {
        // 1A 2B => ((0x1A * 256) + 0x2B) / 4 = 6699 / 4
        assert_eq!(Pid::Rpm.decode(&[0x1A, 0x2B]), Some(PidReading::Rpm(1674.75)));
    }

    #[test]
    fn test_claimed_spans() {
        let registry = PidRegistry::standard();
        // 41 0C 1A F8 | 41 05 43
        let tokens = [0x41, 0x0C, 0x1A, 0xF8, 0x41, 0x05, 0x43];
        let mut spans = registry.claimed_spans(&tokens);
        spans.sort_by_key(|span| span.start);
        assert_eq!(spans, vec![0..4, 4..7]);

        // Truncated payload is clamped to the reply
        assert_eq!(registry.claimed_spans(&[0x41, 0x0C, 0x1A]), vec![0..3]);
    }

    #[test]
    fn test_speed_decode() {
        assert_eq!(Pid::Speed.decode(&[0x5A]), Some(PidReading::SpeedKmh(90)));
    }

    #[test]
    fn test_coolant_temp_decode() {
        // 0x46 = 70, so temp = 70 - 40 = 30°C
        assert_eq!(Pid::CoolantTemp.decode(&[0x46]), Some(PidReading::CoolantC(30)));
        assert_eq!(Pid::CoolantTemp.decode(&[0x00]), Some(PidReading::CoolantC(-40)));
    }

    #[test]
    fn test_engine_load_decode() {
        let load = Pid::EngineLoad.decode(&[0x7F]).unwrap().value();
        assert!((load - 49.8).abs() < 0.01);
    }

    #[test]
    fn test_voltage_decode() {
        // 0x3A98 = 15000 mV
        assert_eq!(
            Pid::ControlModuleVoltage.decode(&[0x3A, 0x98]),
            Some(PidReading::BatteryVolts(15.0))
        );
    }

    #[test]
    fn test_short_payload_yields_nothing() {
        assert_eq!(Pid::Rpm.decode(&[0x1A]), None);
        assert_eq!(Pid::Speed.decode(&[]), None);
        assert!(PidRegistry::standard().decode("41 0C 1A").is_empty());
    }

    #[test]
    fn test_request_commands() {
        assert_eq!(Pid::Rpm.request(), "010C");
        assert_eq!(Pid::ControlModuleVoltage.request(), "0142");
        assert_eq!(Pid::from_hex(0x0D), Some(Pid::Speed));
        assert_eq!(Pid::from_hex(0x10), None);
    }

    #[test]
    fn test_registry_decodes_reply() {
        let readings = PidRegistry::standard().decode("41 0D 5A >");
        assert_eq!(readings, vec![PidReading::SpeedKmh(90)]);
    }

    #[test]
    fn test_registry_matches_each_pid_independently() {
        let readings = PidRegistry::standard().decode("41 0C 1A F8 41 05 46");
        assert!(readings.contains(&PidReading::Rpm(1726.0)));
        assert!(readings.contains(&PidReading::CoolantC(30)));
    }

    #[test]
    fn test_registry_only_decodes_registered() {
        let registry = PidRegistry::new([Pid::Speed]);
        assert!(registry.decode("41 0C 1A F8").is_empty());
    }

    #[test]
    fn test_no_positive_response_marker() {
        assert!(PidRegistry::standard().decode("7F 01 12").is_empty());
        assert!(PidRegistry::standard().decode("NO DATA").is_empty());
    }

    #[test]
    fn test_live_data_update() {
        let mut live = LiveData::new(0);
        live.update(&PidReading::SpeedKmh(42), 1000);
        live.update(&PidReading::BatteryVolts(12.6), 2000);
        assert_eq!(live.speed_kmh, Some(42));
        assert_eq!(live.battery_volts, Some(12.6));
        assert_eq!(live.rpm, None);
        assert_eq!(live.timestamp_ms, 2000);
    }

    #[test]
    fn test_reading_display() {
        assert_eq!(PidReading::Rpm(1707.75).to_string(), "RPM: 1708 rpm");
        assert_eq!(PidReading::BatteryVolts(12.6).to_string(), "Control Module Voltage: 12.60 V");
    }
}
