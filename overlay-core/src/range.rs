//! Single-range `Range: bytes=<from>-<to>` parsing against a known object size.

/// Inclusive byte window `[from, to]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub from: u64,
    pub to: u64,
}

impl ByteRange {
    /// Whole object. None for an empty object, which has no inclusive window.
    pub fn full(size: u64) -> Option<Self> {
        if size == 0 {
            return None;
        }
        Some(Self {
            from: 0,
            to: size - 1,
        })
    }

    pub fn len(&self) -> u64 {
        self.to - self.from + 1
    }

    /// `Content-Range` value for this window of an object of `size` bytes.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.from, self.to, size)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RangeError {
    #[error("malformed range header")]
    Malformed,
    #[error("multiple ranges are not supported")]
    MultipleRanges,
    #[error("range not satisfiable")]
    NotSatisfiable,
}

/// Parse "bytes=from-to". A missing `from` is 0 and a missing `to` is `size - 1`.
/// Every failure is answered with 416 by the caller.
pub fn parse_range_header(value: &str, size: u64) -> Result<ByteRange, RangeError> {
    let spec = value
        .trim()
        .strip_prefix("bytes=")
        .ok_or(RangeError::Malformed)?;
    if spec.contains(',') {
        return Err(RangeError::MultipleRanges);
    }
    let (a, b) = spec.split_once('-').ok_or(RangeError::Malformed)?;
    let (a, b) = (a.trim(), b.trim());
    if size == 0 {
        return Err(RangeError::NotSatisfiable);
    }
    let from = if a.is_empty() {
        0
    } else {
        a.parse::<u64>().map_err(|_| RangeError::Malformed)?
    };
    let to = if b.is_empty() {
        size - 1
    } else {
        b.parse::<u64>().map_err(|_| RangeError::Malformed)?
    };
    if from > to || to > size - 1 {
        return Err(RangeError::NotSatisfiable);
    }
    Ok(ByteRange { from, to })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn closed_range() {
        let r = parse_range_header("bytes=1000-1999", 5000).unwrap();
        assert_eq!(r, ByteRange { from: 1000, to: 1999 });
        assert_eq!(r.len(), 1000);
        assert_eq!(r.content_range(5000), "bytes 1000-1999/5000");
    }

    #[test]
    fn open_bounds_default() {
        assert_eq!(
            parse_range_header("bytes=10-", 100).unwrap(),
            ByteRange { from: 10, to: 99 }
        );
        assert_eq!(
            parse_range_header("bytes=-20", 100).unwrap(),
            ByteRange { from: 0, to: 20 }
        );
        assert_eq!(
            parse_range_header("bytes=-", 100).unwrap(),
            ByteRange { from: 0, to: 99 }
        );
    }

    #[test]
    fn unsatisfiable() {
        assert_eq!(
            parse_range_header("bytes=50-10", 100),
            Err(RangeError::NotSatisfiable)
        );
        assert_eq!(
            parse_range_header("bytes=0-100", 100),
            Err(RangeError::NotSatisfiable)
        );
        assert_eq!(
            parse_range_header("bytes=100-", 100),
            Err(RangeError::NotSatisfiable)
        );
        assert_eq!(
            parse_range_header("bytes=0-0", 0),
            Err(RangeError::NotSatisfiable)
        );
    }

    #[test]
    fn multiple_and_malformed() {
        assert_eq!(
            parse_range_header("bytes=0-1,5-6", 100),
            Err(RangeError::MultipleRanges)
        );
        assert_eq!(
            parse_range_header("items=0-1", 100),
            Err(RangeError::Malformed)
        );
        assert_eq!(
            parse_range_header("bytes=x-1", 100),
            Err(RangeError::Malformed)
        );
    }

    #[test]
    fn full_window() {
        assert_eq!(ByteRange::full(0), None);
        assert_eq!(ByteRange::full(10), Some(ByteRange { from: 0, to: 9 }));
    }
}
