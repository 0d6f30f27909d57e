use crate::memory::Byte;
use crate::{MemOpError, MemOpResult};

/// Wildcard sentinel used by byte-array signatures that cannot express `None`.
pub const LEGACY_WILDCARD: u8 = 0xFF;

/// A byte signature where `None` matches any byte at its position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Pattern {
    bytes: Vec<Byte>,
}

impl Pattern {
    pub fn new(bytes: Vec<Byte>) -> MemOpResult<Self> {
        if bytes.is_empty() {
            return Err(MemOpError::InvalidPattern("pattern is empty".to_string()));
        }

        Ok(Pattern { bytes })
    }

    /// Parses an IDA-style pattern such as `"E8 ?? 60 EF"`.
    ///
    /// `?` and `??` are wildcards. Anything that is not a wildcard must be a
    /// one or two digit hex byte.
    pub fn parse(pattern: &str) -> MemOpResult<Self> {
        let bytes = pattern
            .split_whitespace()
            .map(|s| match s {
                "?" | "??" => Ok(None),
                hex => parse_hex_byte(hex).map(Some),
            })
            .collect::<MemOpResult<Vec<Byte>>>()?;

        Pattern::new(bytes)
    }

    /// Builds a pattern from raw bytes where every occurrence of `sentinel` is a wildcard.
    ///
    /// With this form the sentinel value itself can never be matched literally.
    pub fn from_sentinel(raw: &[u8], sentinel: u8) -> MemOpResult<Self> {
        Pattern::new(
            raw.iter()
                .map(|&b| if b == sentinel { None } else { Some(b) })
                .collect(),
        )
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn as_slice(&self) -> &[Byte] {
        &self.bytes
    }
}

impl std::fmt::Display for Pattern {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for (i, byte) in self.bytes.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }
            match byte {
                Some(b) => write!(f, "{b:02X}")?,
                None => f.write_str("??")?,
            }
        }
        Ok(())
    }
}

/// Parses whitespace separated hex bytes. Wildcards are rejected.
pub fn parse_hex_bytes(text: &str) -> MemOpResult<Vec<u8>> {
    text.split_whitespace().map(parse_hex_byte).collect()
}

fn parse_hex_byte(token: &str) -> MemOpResult<u8> {
    let digits = token
        .strip_prefix("0x")
        .or_else(|| token.strip_prefix("0X"))
        .unwrap_or(token);

    if digits.is_empty() || digits.len() > 2 {
        return Err(MemOpError::InvalidPattern(format!(
            "\"{token}\" is not a hex byte"
        )));
    }

    u8::from_str_radix(digits, 16)
        .map_err(|_| MemOpError::InvalidPattern(format!("\"{token}\" is not a hex byte")))
}

/// Determines when a byte matches a pattern byte.
fn byte_matches(byte: u8, pattern: Byte) -> bool {
    match pattern {
        None => true,
        Some(b) => b == byte,
    }
}

/// Compares `pattern.len()` bytes of `buffer` starting at `offset`.
///
/// The caller guarantees `offset + pattern.len() <= buffer.len()`.
pub fn matches(buffer: &[u8], offset: usize, pattern: &[Byte]) -> bool {
    buffer[offset..offset + pattern.len()]
        .iter()
        .zip(pattern)
        .all(|(&byte, &pattern_byte)| byte_matches(byte, pattern_byte))
}

/// Finds the lowest offset in `buffer` where `pattern` matches.
pub fn find_first(buffer: &[u8], pattern: &[Byte]) -> Option<usize> {
    if pattern.is_empty() || pattern.len() > buffer.len() {
        return None;
    }

    // Only iterate up to where a full pattern could still fit
    (0..=buffer.len() - pattern.len()).find(|&offset| matches(buffer, offset, pattern))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn wildcard_middle() -> Pattern {
        Pattern::from_sentinel(&[0xAB, 0xFF, 0xCD], LEGACY_WILDCARD).unwrap()
    }

    #[test]
    fn test_wildcard_matches_any_value() {
        let pattern = wildcard_middle();
        for value in 0..=u8::MAX {
            let buffer = [0x11, 0xAB, value, 0xCD, 0x22];
            assert!(matches(&buffer, 1, pattern.as_slice()), "value {value:#x}");
        }
    }

    #[test]
    fn test_sentinel_scenario() {
        let pattern = wildcard_middle();
        assert!(matches(&[0x00, 0xAB, 0x00, 0xCD, 0x00], 1, pattern.as_slice()));
        assert!(matches(&[0x00, 0xAB, 0xFF, 0xCD, 0x00], 1, pattern.as_slice()));
        assert!(!matches(&[0x00, 0xAB, 0x00, 0xCE, 0x00], 1, pattern.as_slice()));
    }

    #[test]
    fn test_single_difference_fails() {
        let pattern = Pattern::parse("10 20 30 40").unwrap();
        let base = [0x10u8, 0x20, 0x30, 0x40];
        assert!(matches(&base, 0, pattern.as_slice()));

        for i in 0..base.len() {
            let mut buffer = base;
            buffer[i] ^= 0x01;
            assert!(!matches(&buffer, 0, pattern.as_slice()), "index {i}");
        }
    }

    #[test]
    fn test_find_first_includes_last_window() {
        let pattern = Pattern::parse("AA BB").unwrap();
        let buffer = [0x00, 0x00, 0xAA, 0xBB];
        assert_eq!(find_first(&buffer, pattern.as_slice()), Some(2));
    }

    #[test]
    fn test_find_first_lowest_offset() {
        let pattern = Pattern::parse("AA ?? CC").unwrap();
        let buffer = [0xAA, 0x01, 0xCC, 0xAA, 0x02, 0xCC];
        assert_eq!(find_first(&buffer, pattern.as_slice()), Some(0));
        assert_eq!(find_first(&buffer[1..], pattern.as_slice()), Some(2));
    }

    #[test]
    fn test_pattern_longer_than_buffer() {
        let pattern = Pattern::parse("AA BB CC").unwrap();
        assert_eq!(find_first(&[0xAA, 0xBB], pattern.as_slice()), None);
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(Pattern::parse("").is_err());
        assert!(Pattern::parse("E8 ZZ").is_err());
        assert!(Pattern::parse("123").is_err());
        assert!(parse_hex_bytes("90 ??").is_err());
        assert_eq!(parse_hex_bytes("0x90 c3").unwrap(), vec![0x90, 0xC3]);
    }

    #[test]
    fn test_display_round_trips_through_parse() {
        let pattern = Pattern::parse("e8 ? 60 ef").unwrap();
        assert_eq!(pattern.to_string(), "E8 ?? 60 EF");
    }
}
