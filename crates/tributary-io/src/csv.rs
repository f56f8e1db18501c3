//! Quote-aware CSV reading
//!
//! CDM partitions and Salesforce bulk results are RFC 4180 style text: fields
//! are separated by commas, may be wrapped in double quotes, and quoted fields
//! may contain delimiters, doubled quotes and line breaks.

use ::csv::{ReaderBuilder, StringRecord};
use tributary_core::{StreamError, StreamResult};

const QUOTE: u8 = b'"';

/// Split a whole document into records
///
/// No header handling: the first record is returned like any other. Record
/// lengths are not enforced here, callers compare them against their schema.
/// Blank lines are skipped. A quote left open at the end of the input is a
/// parse error.
pub fn parse_records(text: &str, delimiter: u8) -> StreamResult<Vec<StringRecord>> {
    // well-formed quoting always pairs up, escaped quotes included
    let quotes = text.bytes().filter(|b| *b == QUOTE).count();
    if quotes % 2 != 0 {
        return Err(StreamError::parse(
            "unbalanced quotes, a quoted field is never closed",
        ));
    }

    let mut reader = ReaderBuilder::new()
        .delimiter(delimiter)
        .quote(QUOTE)
        .has_headers(false)
        .flexible(true)
        .from_reader(text.as_bytes());
    reader
        .records()
        .map(|record| record.map_err(|e| StreamError::parse(format!("CSV parse error: {e}"))))
        .collect()
}
