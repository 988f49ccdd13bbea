//! Debug information for mapping instructions to template source.

use serde::Serialize;
use std::fmt;

/// A line table entry mapping an instruction index to a source location.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LineEntry {
    /// Instruction index
    pub ip: u32,
    /// String constant holding the source file name
    pub file: u32,
    /// Line number (1-based)
    pub line: u32,
    /// Column number (1-based)
    pub column: u32,
}

/// Entries sorted by instruction index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LineTable {
    entries: Vec<LineEntry>,
}

impl LineTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. An entry for the same `ip` as the previous one replaces it.
    pub fn add(&mut self, entry: LineEntry) {
        match self.entries.last_mut() {
            Some(last) if last.ip == entry.ip => *last = entry,
            _ => self.entries.push(entry),
        }
    }

    pub fn entries(&self) -> &[LineEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn from_sorted(entries: Vec<LineEntry>) -> Self {
        Self { entries }
    }

    /// The entry with the largest `ip` not above `ip`.
    pub fn find(&self, ip: u32) -> Option<&LineEntry> {
        let idx = self.entries.partition_point(|e| e.ip <= ip);
        idx.checked_sub(1).map(|i| &self.entries[i])
    }
}

/// Resolved source position of an instruction.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub column: u32,
}

impl fmt::Display for SourceLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(ip: u32, line: u32) -> LineEntry {
        LineEntry {
            ip,
            file: 0,
            line,
            column: 1,
        }
    }

    #[test]
    fn test_line_table() {
        let mut table = LineTable::new();
        table.add(entry(0, 1));
        table.add(entry(5, 2));
        table.add(entry(10, 3));

        assert_eq!(table.find(0).map(|e| e.line), Some(1));
        assert_eq!(table.find(3).map(|e| e.line), Some(1));
        assert_eq!(table.find(5).map(|e| e.line), Some(2));
        assert_eq!(table.find(7).map(|e| e.line), Some(2));
        assert_eq!(table.find(10).map(|e| e.line), Some(3));
        assert_eq!(table.find(100).map(|e| e.line), Some(3));
    }

    #[test]
    fn test_lookup_before_first_entry() {
        let mut table = LineTable::new();
        table.add(entry(4, 7));
        assert!(table.find(3).is_none());
    }

    #[test]
    fn test_same_ip_replaces() {
        let mut table = LineTable::new();
        table.add(entry(2, 1));
        table.add(entry(2, 9));
        assert_eq!(table.len(), 1);
        assert_eq!(table.find(2).map(|e| e.line), Some(9));
    }

    #[test]
    fn test_location_display() {
        let loc = SourceLocation {
            file: "page.tmpl".to_string(),
            line: 12,
            column: 4,
        };
        assert_eq!(loc.to_string(), "page.tmpl:12:4");
    }
}
