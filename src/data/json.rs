//! JSON ingestion into a [`DataTree`].
//!
//! The body arrives as raw bytes from the chunk assembler. Errors are
//! reported with the byte offset of the offending token so they can be
//! matched against the request body.

use thiserror::Error;

use super::value::DataTree;

/// Maximum nesting of arrays and objects, the recursion limit of `serde_json`.
pub const MAX_DEPTH: usize = 128;

const BOM: &[u8] = &[0xEF, 0xBB, 0xBF];

/// A JSON syntax error.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message} at byte offset {offset}")]
pub struct ParseError {
    /// Byte offset of the malformed token.
    pub offset: usize,
    pub message: String,
}

impl ParseError {
    fn from_json(input: &[u8], base: usize, err: serde_json::Error) -> Self {
        let (line, column) = (err.line(), err.column());
        let text = err.to_string();
        let message = text
            .strip_suffix(&format!(" at line {} column {}", line, column))
            .unwrap_or(&text)
            .to_string();
        Self {
            offset: base + byte_offset(input, &err),
            message,
        }
    }
}

/// Parse a complete JSON document. A leading UTF-8 BOM is skipped.
pub fn parse(bytes: &[u8]) -> Result<DataTree, ParseError> {
    let (input, base) = match bytes.strip_prefix(BOM) {
        Some(rest) => (rest, BOM.len()),
        None => (bytes, 0),
    };
    serde_json::from_slice(input).map_err(|e| ParseError::from_json(input, base, e))
}

/// Turn serde_json's 1-based line and column into a byte offset.
fn byte_offset(input: &[u8], err: &serde_json::Error) -> usize {
    if err.is_eof() {
        return input.len();
    }
    let line = err.line();
    if line == 0 {
        return 0;
    }
    let line_start: usize = input
        .split(|&b| b == b'\n')
        .take(line - 1)
        .map(|l| l.len() + 1)
        .sum();
    (line_start + err.column().saturating_sub(1)).min(input.len())
}
