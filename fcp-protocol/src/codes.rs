//! Reference table of fetch failure codes.
//!
//! These are the `Code` values a node puts in `GetFailed`. The client never
//! acts on them; they exist for display and for test fixtures.

/// One entry of the fetch failure code table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FetchCode {
    pub code: i32,
    pub name: &'static str,
    pub description: &'static str,
}

const fn entry(code: i32, name: &'static str, description: &'static str) -> FetchCode {
    FetchCode {
        code,
        name,
        description,
    }
}

/// Fetch failure codes 1 to 30.
pub const FETCH_CODES: [FetchCode; 30] = [
    entry(1, "TOO_DEEP_ARCHIVE_RECURSION", "Too many levels of recursion into archives"),
    entry(2, "UNKNOWN_SPLITFILE_METADATA", "Don't know what to do with splitfile"),
    entry(3, "UNKNOWN_METADATA", "Don't know what to do with metadata"),
    entry(4, "INVALID_METADATA", "Failed to parse metadata"),
    entry(5, "ARCHIVE_FAILURE", "Failure in extracting files from an archive"),
    entry(6, "BLOCK_DECODE_ERROR", "Failed to decode a block"),
    entry(7, "TOO_MANY_METADATA_LEVELS", "Too many metadata levels"),
    entry(8, "TOO_MANY_ARCHIVE_RESTARTS", "Request was restarted too many times due to archives changing"),
    entry(9, "TOO_MUCH_RECURSION", "Too many redirects"),
    entry(10, "NOT_IN_ARCHIVE", "File not in archive"),
    entry(11, "TOO_MANY_PATH_COMPONENTS", "Too many path components"),
    entry(12, "BUCKET_ERROR", "Temporary files error"),
    entry(13, "DATA_NOT_FOUND", "Data not found"),
    entry(14, "ROUTE_NOT_FOUND", "Route not found"),
    entry(15, "REJECTED_OVERLOAD", "Rejected: overload"),
    entry(16, "TOO_MANY_REDIRECTS", "Too many redirects"),
    entry(17, "INTERNAL_ERROR", "Internal error"),
    entry(18, "TRANSFER_FAILED", "Transfer failed"),
    entry(19, "SPLITFILE_ERROR", "Splitfile error"),
    entry(20, "INVALID_URI", "Invalid URI"),
    entry(21, "TOO_BIG", "Too big"),
    entry(22, "TOO_BIG_METADATA", "Metadata too big"),
    entry(23, "TOO_MANY_BLOCKS_PER_SEGMENT", "Too many blocks per segment"),
    entry(24, "NOT_ENOUGH_PATH_COMPONENTS", "Not enough path components"),
    entry(25, "CANCELLED", "Cancelled by caller"),
    entry(26, "ARCHIVE_RESTART", "Archive restart"),
    entry(27, "PERMANENT_REDIRECT", "New URI"),
    entry(28, "ALL_DATA_NOT_FOUND", "Not all data found"),
    entry(29, "WRONG_MIME_TYPE", "Wrong MIME type"),
    entry(30, "RECENTLY_FAILED", "Recently failed, DNF cached"),
];

/// Looks up the reference entry for a fetch failure code.
pub fn fetch_code(code: i32) -> Option<&'static FetchCode> {
    FETCH_CODES.iter().find(|entry| entry.code == code)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_codes_are_contiguous() {
        for (i, entry) in FETCH_CODES.iter().enumerate() {
            assert_eq!(entry.code, i as i32 + 1);
        }
    }

    #[test]
    fn test_well_known_codes() {
        assert_eq!(fetch_code(13).unwrap().description, "Data not found");
        assert_eq!(fetch_code(15).unwrap().name, "REJECTED_OVERLOAD");
        assert_eq!(fetch_code(20).unwrap().name, "INVALID_URI");
        assert_eq!(fetch_code(30).unwrap().name, "RECENTLY_FAILED");
        assert!(fetch_code(0).is_none());
        assert!(fetch_code(31).is_none());
    }
}
