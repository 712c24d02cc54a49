//! `Range` header parsing
//!
//! Single-range requests only; a multi-range header is answered with its
//! first range, which is what every media player sends anyway.

/// Parse a `Range` header against a resource of `size` bytes.
///
/// Returns the inclusive `[start, end]` pair. Supports `bytes=a-b`,
/// `bytes=a-` and the suffix form `bytes=-n`.
pub fn parse_range(header: &str, size: i64) -> Result<(i64, i64), RangeError> {
    let spec = header.strip_prefix("bytes=").ok_or(RangeError)?;
    let first = spec.split(',').next().ok_or(RangeError)?.trim();
    let (start_raw, end_raw) = first.split_once('-').ok_or(RangeError)?;

    let (start, end) = if start_raw.is_empty() {
        // Suffix form: last n bytes.
        let suffix: i64 = end_raw.parse().map_err(|_| RangeError)?;
        if suffix <= 0 {
            return Err(RangeError);
        }
        ((size - suffix).max(0), size - 1)
    } else {
        let start: i64 = start_raw.parse().map_err(|_| RangeError)?;
        let end: i64 = if end_raw.is_empty() {
            size - 1
        } else {
            end_raw.parse().map_err(|_| RangeError)?
        };
        (start, end.min(size - 1))
    };

    if start < 0 || end < start || start >= size {
        return Err(RangeError);
    }
    Ok((start, end))
}

#[derive(Debug, PartialEq, Eq)]
pub struct RangeError;

impl std::fmt::Display for RangeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "invalid range header")
    }
}

impl std::error::Error for RangeError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_explicit_range() {
        assert_eq!(parse_range("bytes=0-499", 1000), Ok((0, 499)));
        assert_eq!(parse_range("bytes=500-999", 1000), Ok((500, 999)));
    }

    #[test]
    fn test_single_byte_of_single_byte_file() {
        assert_eq!(parse_range("bytes=0-0", 1), Ok((0, 0)));
    }

    #[test]
    fn test_open_ended_range() {
        assert_eq!(parse_range("bytes=200-", 1000), Ok((200, 999)));
    }

    #[test]
    fn test_suffix_range() {
        assert_eq!(parse_range("bytes=-100", 1000), Ok((900, 999)));
        // Suffix longer than the file clamps to the whole file.
        assert_eq!(parse_range("bytes=-5000", 1000), Ok((0, 999)));
    }

    #[test]
    fn test_end_clamped_to_size() {
        assert_eq!(parse_range("bytes=0-99999", 1000), Ok((0, 999)));
    }

    #[test]
    fn test_multi_range_takes_first() {
        assert_eq!(parse_range("bytes=0-99,200-299", 1000), Ok((0, 99)));
    }

    #[test]
    fn test_invalid_ranges() {
        assert!(parse_range("bytes=abc-def", 1000).is_err());
        assert!(parse_range("lines=0-10", 1000).is_err());
        assert!(parse_range("bytes=500-100", 1000).is_err());
        assert!(parse_range("bytes=1000-1001", 1000).is_err());
        assert!(parse_range("bytes=-0", 1000).is_err());
        assert!(parse_range("bytes=", 1000).is_err());
    }
}
