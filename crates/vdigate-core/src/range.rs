//! HTTP range header arithmetic
//!
//! Parsers for `Content-Range: bytes S-E/T` and `Range: bytes=S-E`, plus the
//! window clipping used when serving partial downloads. Both parsers are
//! strict: decimal non-negative integers only, no `*` forms (those return
//! `NotImplemented`), optional trailing whitespace.

use crate::error::{Error, Result};

/// A parsed `Content-Range: bytes S-E/T` header. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: u64,
    pub end: u64,
    pub total: u64,
}

/// A parsed `Range: bytes=S-E` header. `end` is inclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RequestRange {
    pub start: u64,
    pub end: u64,
}

fn skip_prefix<'a>(s: &'a str, prefix: &str) -> Result<&'a str> {
    s.strip_prefix(prefix)
        .ok_or_else(|| Error::bad_request(format!("range header missing '{}'", prefix.trim())))
}

fn read_nonnegative_integer(s: &str) -> Result<(u64, &str)> {
    if s.starts_with('*') {
        return Err(Error::not_implemented("'*' in range header"));
    }
    let digits = s.len() - s.trim_start_matches(|c: char| c.is_ascii_digit()).len();
    if digits == 0 {
        return Err(Error::bad_request("expected decimal integer in range header"));
    }
    let num = s[..digits]
        .parse::<u64>()
        .map_err(|_| Error::bad_request("range value out of range"))?;
    Ok((num, &s[digits..]))
}

impl ContentRange {
    /// Parse a strict `bytes S-E/T` value.
    ///
    /// # Errors
    ///
    /// `BadRequest` on any malformation or when the `0 <= S <= E < T`
    /// invariant does not hold; `NotImplemented` when any field is `*`.
    pub fn parse(value: &str) -> Result<Self> {
        let rest = skip_prefix(value, "bytes ")?;
        let rest = rest.trim_start_matches([' ', '\t']);
        let (start, rest) = read_nonnegative_integer(rest)?;
        let rest = skip_prefix(rest, "-")?;
        let (end, rest) = read_nonnegative_integer(rest)?;
        let rest = skip_prefix(rest, "/")?;
        let (total, rest) = read_nonnegative_integer(rest)?;
        if !rest.trim_matches([' ', '\t']).is_empty() {
            return Err(Error::bad_request("trailing garbage in Content-Range"));
        }

        if start > end || end >= total {
            return Err(Error::bad_request(format!(
                "Content-Range bytes {}-{}/{} violates start <= end < total",
                start, end, total
            )));
        }

        Ok(Self { start, end, total })
    }

    /// The number of bytes this range spans.
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True when the span equals the declared request Content-Length.
    pub fn matches_content_length(&self, content_length: u64) -> bool {
        self.len() == content_length
    }
}

impl RequestRange {
    /// Parse a strict `bytes=S-E` value.
    ///
    /// `start == end` is rejected along with `start > end`. This is stricter
    /// than RFC 7233 allows, and deliberate: a one-byte disk-image range has
    /// always meant a confused client here.
    pub fn parse(value: &str) -> Result<Self> {
        let rest = skip_prefix(value, "bytes=")?;
        let (start, rest) = read_nonnegative_integer(rest)?;
        let rest = skip_prefix(rest, "-")?;
        let (end, rest) = read_nonnegative_integer(rest)?;
        if !rest.trim_matches([' ', '\t']).is_empty() {
            return Err(Error::bad_request("trailing garbage in Range"));
        }

        if start >= end {
            return Err(Error::bad_request(format!(
                "Range bytes={}-{} violates start < end",
                start, end
            )));
        }

        Ok(Self { start, end })
    }
}

/// Clip the window `[window_off, window_off + window_len)` against the
/// inclusive request range `[req_start, req_end]`.
///
/// Returns `(skip, emit_len)`: the emitted sub-window is
/// `[window_off + skip, window_off + skip + emit_len)`. `emit_len` is zero
/// when the window and the range are disjoint.
pub fn clip(window_off: u64, window_len: u64, req_start: u64, req_end: u64) -> (u64, u64) {
    if window_off > req_end {
        return (0, 0);
    }

    let skip = req_start.saturating_sub(window_off);
    if skip >= window_len {
        return (0, 0);
    }

    let mut emit_len = window_len;
    if window_off + window_len > req_end {
        emit_len = req_end - window_off + 1;
    }

    (skip, emit_len - skip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_range_parse() {
        let r = ContentRange::parse("bytes 0-65535/4194304").unwrap();
        assert_eq!(r.start, 0);
        assert_eq!(r.end, 65535);
        assert_eq!(r.total, 4194304);
        assert_eq!(r.len(), 65536);
        assert!(r.matches_content_length(65536));
        assert!(!r.matches_content_length(65535));
    }

    #[test]
    fn test_content_range_single_byte() {
        // One-byte fragments are legal for Content-Range
        let r = ContentRange::parse("bytes 5-5/10").unwrap();
        assert_eq!(r.len(), 1);
    }

    #[test]
    fn test_content_range_trailing_whitespace() {
        assert!(ContentRange::parse("bytes 0-9/10  ").is_ok());
        assert!(ContentRange::parse("bytes  0-9/10").is_ok());
    }

    #[test]
    fn test_content_range_rejects_star() {
        assert!(matches!(
            ContentRange::parse("bytes */10"),
            Err(Error::NotImplemented(_))
        ));
        assert!(matches!(
            ContentRange::parse("bytes 0-9/*"),
            Err(Error::NotImplemented(_))
        ));
    }

    #[test]
    fn test_content_range_rejects_malformed() {
        assert!(ContentRange::parse("bytes=0-9/10").is_err());
        assert!(ContentRange::parse("bytes 0-9").is_err());
        assert!(ContentRange::parse("bytes a-9/10").is_err());
        assert!(ContentRange::parse("bytes 0-9/10 junk").is_err());
        assert!(ContentRange::parse("").is_err());
    }

    #[test]
    fn test_content_range_rejects_bad_ordering() {
        // end < start
        assert!(ContentRange::parse("bytes 9-0/10").is_err());
        // end == total
        assert!(ContentRange::parse("bytes 0-10/10").is_err());
        // end > total
        assert!(ContentRange::parse("bytes 0-20/10").is_err());
    }

    #[test]
    fn test_request_range_parse() {
        let r = RequestRange::parse("bytes=512-2047").unwrap();
        assert_eq!(r.start, 512);
        assert_eq!(r.end, 2047);
    }

    #[test]
    fn test_request_range_rejects_degenerate() {
        // start == end is deliberately rejected
        assert!(RequestRange::parse("bytes=5-5").is_err());
        assert!(RequestRange::parse("bytes=9-5").is_err());
        assert!(matches!(
            RequestRange::parse("bytes=*-5"),
            Err(Error::NotImplemented(_))
        ));
        assert!(RequestRange::parse("bytes 0-5").is_err());
    }

    #[test]
    fn test_clip_window_inside_range() {
        assert_eq!(clip(100, 50, 0, 1000), (0, 50));
    }

    #[test]
    fn test_clip_window_before_range() {
        assert_eq!(clip(0, 100, 200, 300), (0, 0));
    }

    #[test]
    fn test_clip_window_after_range() {
        assert_eq!(clip(400, 100, 200, 300), (0, 0));
    }

    #[test]
    fn test_clip_partial_overlap_front() {
        // Window [100, 200), range starts at 150
        assert_eq!(clip(100, 100, 150, 1000), (50, 50));
    }

    #[test]
    fn test_clip_partial_overlap_back() {
        // Window [100, 200), range ends at 149 inclusive
        assert_eq!(clip(100, 100, 0, 149), (0, 50));
    }

    #[test]
    fn test_clip_range_inside_window() {
        assert_eq!(clip(0, 1000, 200, 299), (200, 100));
    }

    #[test]
    fn test_clip_exact_match() {
        assert_eq!(clip(512, 1536, 512, 2047), (0, 1536));
    }
}
