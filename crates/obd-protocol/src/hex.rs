//! Hex byte tokenization shared by the PID and DTC decoders

/// Split a reply on whitespace and keep only two-digit hex tokens
///
/// Anything else (prompt characters, status words, partial tokens) is
/// discarded.
pub fn tokenize(reply: &str) -> Vec<u8> {
    reply
        .split_whitespace()
        .filter(|token| token.len() == 2 && token.bytes().all(|b| b.is_ascii_hexdigit()))
        .filter_map(|token| u8::from_str_radix(token, 16).ok())
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tokenize_keeps_hex_pairs() {
        assert_eq!(tokenize("41 0c 1A 2b"), vec![0x41, 0x0C, 0x1A, 0x2B]);
    }

    #[test]
    fn test_tokenize_discards_noise() {
        assert_eq!(tokenize(">41 0D 5A ABC 7 NO DATA\t46"), vec![0x0D, 0x5A, 0x46]);
        assert!(tokenize("").is_empty());
    }
}
