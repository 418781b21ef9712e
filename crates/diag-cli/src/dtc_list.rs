//! o3script DTC description lists
//!
//! Entries live between a `<...START;READ...>` and a `<...END;READ...>`
//! marker line. Inside that block, lines opening with `<` or `-` are
//! comments and anything after a `<` is dropped. The code is separated
//! from its description by a tab, or failing that by whitespace.

use obd_protocol::{DtcTable, DTC_GROUPS};
use std::fs::File;
use std::io::{self, BufRead, BufReader};
use std::path::Path;
use tracing::{info, warn};

/// Load a description table, falling back to an empty one
pub fn load(path: &Path) -> DtcTable {
    match File::open(path).and_then(|file| parse(BufReader::new(file))) {
        Ok(table) => {
            info!("Loaded {} DTC descriptions from {}", table.len(), path.display());
            table
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            warn!("DTC code list not found: {}", path.display());
            DtcTable::new()
        }
        Err(e) => {
            warn!("Failed to load DTC codes from {}: {}", path.display(), e);
            DtcTable::new()
        }
    }
}

/// Parse an o3script stream
///
/// Invalid UTF-8 is replaced rather than rejected.
pub fn parse<R: BufRead>(mut reader: R) -> io::Result<DtcTable> {
    let mut table = DtcTable::new();
    let mut reading = false;
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            break;
        }
        let text = String::from_utf8_lossy(&raw);
        let line = text.trim();
        if line.is_empty() {
            continue;
        }

        if line.starts_with('<') && line.contains("START;READ") {
            reading = true;
            continue;
        }
        if line.starts_with('<') && line.contains("END;READ") {
            reading = false;
            continue;
        }
        if !reading || line.starts_with('<') || line.starts_with('-') {
            continue;
        }

        if let Some((code, description)) = parse_entry(line) {
            table.insert(code, description);
        }
    }

    Ok(table)
}

fn parse_entry(line: &str) -> Option<(String, &str)> {
    let line = line.split('<').next().unwrap_or_default().trim();
    let (code, description) = match line.split_once('\t') {
        Some(pair) => pair,
        None => line.split_once(char::is_whitespace)?,
    };

    let code = code.trim().to_ascii_uppercase();
    is_valid_code(&code).then(|| (code, description.trim()))
}

fn is_valid_code(code: &str) -> bool {
    let bytes = code.as_bytes();
    bytes.len() == 5
        && DTC_GROUPS.contains(&(bytes[0] as char))
        && bytes[1..].iter().all(u8::is_ascii_digit)
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = "\
header text outside the block
P9999\tIgnored, not inside the block
<o3script START;READ>
- comment line
<another marker>
P0100\tMass or Volume Air Flow Circuit Malfunction
p0101   MAF circuit range/performance <trailing markup>
C0035\tLeft front wheel speed sensor
X1234\tNot a valid group
P012\tToo short
U0100
<o3script END;READ>
P0200\tAfter the block
";

    #[test]
    fn test_parse_block() {
        let table = parse(SAMPLE.as_bytes()).unwrap();
        assert_eq!(table.len(), 3);
        assert_eq!(
            table.describe("P0100"),
            "Mass or Volume Air Flow Circuit Malfunction"
        );
        assert_eq!(table.describe("P0101"), "MAF circuit range/performance");
        assert_eq!(table.describe("C0035"), "Left front wheel speed sensor");
        assert_eq!(table.describe("P9999"), obd_protocol::NO_DESCRIPTION);
        assert_eq!(table.describe("P0200"), obd_protocol::NO_DESCRIPTION);
    }

    #[test]
    fn test_invalid_utf8_is_tolerated() {
        let mut bytes = b"<START;READ>\nB1234\tSeat \xFF heater\n<END;READ>\n".to_vec();
        bytes.extend_from_slice(b"U0001\tignored\n");
        let table = parse(bytes.as_slice()).unwrap();
        assert_eq!(table.len(), 1);
        assert!(table.describe("B1234").starts_with("Seat"));
    }

    #[test]
    fn test_code_validation() {
        assert!(is_valid_code("P0103"));
        assert!(!is_valid_code("U3FFF"));
        assert!(!is_valid_code("P01034"));
        assert!(!is_valid_code("Q0103"));
    }

    #[test]
    fn test_missing_file_gives_empty_table() {
        let table = load(Path::new("/nonexistent/o3diag/codes.o3script"));
        assert!(table.is_empty());
    }
}
