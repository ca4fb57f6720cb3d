//! HTTP Range header parsing (§4.7).

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64, // inclusive
}

impl ByteRange {
    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }
}

/// Parses exactly one of `bytes=A-B`, `bytes=A-`, `bytes=-N` against a known
/// total size, clamping the suffix form to `[max(0, size-N), size-1]`.
pub fn parse_range(header: &str, size: u64) -> Result<ByteRange> {
    let spec = header.strip_prefix("bytes=").ok_or_else(|| Error::InvalidRange {
        msg: format!("unsupported range unit in '{header}'"),
    })?;

    if spec.contains(',') {
        return Err(Error::InvalidRange {
            msg: "multi-range requests are not supported".to_string(),
        });
    }

    let (start_str, end_str) = spec.split_once('-').ok_or_else(|| Error::InvalidRange {
        msg: format!("malformed range '{header}'"),
    })?;

    if size == 0 {
        return Err(Error::InvalidRange {
            msg: "empty object has no satisfiable range".to_string(),
        });
    }

    let range = if start_str.is_empty() {
        // Suffix form: bytes=-N
        let n: u64 = end_str.parse().map_err(|_| Error::InvalidRange {
            msg: format!("malformed suffix length in '{header}'"),
        })?;
        if n == 0 {
            return Err(Error::InvalidRange {
                msg: "suffix length must be positive".to_string(),
            });
        }
        let start = size.saturating_sub(n);
        ByteRange {
            start,
            end: size - 1,
        }
    } else {
        let start: u64 = start_str.parse().map_err(|_| Error::InvalidRange {
            msg: format!("malformed range start in '{header}'"),
        })?;
        let end = if end_str.is_empty() {
            size - 1
        } else {
            end_str.parse().map_err(|_| Error::InvalidRange {
                msg: format!("malformed range end in '{header}'"),
            })?
        };
        ByteRange { start, end }
    };

    if range.start > range.end || range.end >= size {
        return Err(Error::InvalidRange {
            msg: format!("range '{header}' not satisfiable for size {size}"),
        });
    }

    Ok(range)
}
