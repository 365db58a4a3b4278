//! `Content-Range` header for chunk submission: `bytes <start>-<end>/<total>`.
//!
//! `total` may be `*` while the client does not know it yet. Both bounds are inclusive.

use std::str::FromStr;

use onair_core::AppError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContentRange {
    pub start: i64,
    pub end: i64,
    pub total: Option<i64>,
}

impl ContentRange {
    /// A zero end past byte 0 carries no data and only asks for the current offset.
    /// `bytes 0-0` is the one-byte first chunk.
    pub fn is_offset_query(&self) -> bool {
        self.end == 0 && self.start != 0
    }

    /// Number of bytes the range covers.
    pub fn byte_count(&self) -> i64 {
        self.end - self.start + 1
    }

    /// Reject ranges that cannot describe a slice of the file.
    pub fn validate(&self) -> Result<(), AppError> {
        if self.end < self.start {
            return Err(AppError::BadRequest(format!(
                "Content-Range end {} is before start {}",
                self.end, self.start
            )));
        }
        if let Some(total) = self.total {
            if self.end >= total {
                return Err(AppError::BadRequest(format!(
                    "Content-Range end {} is past the declared total {}",
                    self.end, total
                )));
            }
        }
        Ok(())
    }
}

impl FromStr for ContentRange {
    type Err = AppError;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let malformed = || {
            AppError::BadRequest(format!(
                "Malformed Content-Range {:?}, expected \"bytes <start>-<end>/<total>\"",
                value
            ))
        };

        let ranges = value
            .trim()
            .strip_prefix("bytes")
            .ok_or_else(malformed)?
            .trim_start();
        let (range, total) = ranges.split_once('/').ok_or_else(malformed)?;
        let (start, end) = range.split_once('-').ok_or_else(malformed)?;

        let parse = |s: &str| -> Result<i64, AppError> {
            let s = s.trim();
            if s.is_empty() || !s.bytes().all(|b| b.is_ascii_digit()) {
                return Err(malformed());
            }
            s.parse::<i64>().map_err(|_| malformed())
        };

        let total = match total.trim() {
            "*" => None,
            t => Some(parse(t)?),
        };

        Ok(ContentRange {
            start: parse(start)?,
            end: parse(end)?,
            total,
        })
    }
}
