//! Parts contributed to a session's optimistic multipart upload.

use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// S3 numbers parts `1..=10000`, and chunk `i` becomes part `i + 1`.
pub const MAX_CHUNK_INDEX: u32 = 9_999;

/// A single part appended to the session's multipart upload via server-side copy.
#[derive(Serialize, Deserialize, Clone, FromRow, Debug, PartialEq, Eq)]
pub struct MultipartPart {
    /// Part number (1-based, chunk index + 1).
    pub part_number: i64,

    /// ETag the backend returned for this part.
    pub etag: String,
}

impl MultipartPart {
    pub fn new(part_number: i64, etag: impl Into<String>) -> Self {
        Self {
            part_number,
            etag: etag.into(),
        }
    }

    /// Part number used for the chunk at `index`, or `None` when the index
    /// is past [`MAX_CHUNK_INDEX`].
    pub fn number_for_chunk(index: u32) -> Option<i32> {
        if index > MAX_CHUNK_INDEX {
            return None;
        }
        i32::try_from(index).ok()?.checked_add(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn part_numbers_stop_at_the_s3_limit() {
        assert_eq!(MultipartPart::number_for_chunk(0), Some(1));
        assert_eq!(MultipartPart::number_for_chunk(MAX_CHUNK_INDEX), Some(10_000));
        assert_eq!(MultipartPart::number_for_chunk(MAX_CHUNK_INDEX + 1), None);
        assert_eq!(MultipartPart::number_for_chunk(i32::MAX as u32), None);
        assert_eq!(MultipartPart::number_for_chunk(u32::MAX), None);
    }
}
