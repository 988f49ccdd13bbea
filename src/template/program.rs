//! Decoded segments of a validated template image.

use super::debug::{LineEntry, LineTable, SourceLocation};
use super::header::{ExecutableView, RejectKind, Segment};
use super::ops::{INSTRUCTION_SIZE, Instruction};
use indexmap::IndexMap;

/// Everything the VM needs from a template, decoded once at load time.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Program {
    entry_point: u32,
    code: Vec<Instruction>,
    strings: Vec<String>,
    /// Syscall table entries, by name.
    syscalls: Vec<String>,
    /// Named blocks in declaration order.
    blocks: IndexMap<String, u32>,
    lines: LineTable,
}

impl Program {
    /// Decode all segments of `view`.
    pub fn decode(view: &ExecutableView<'_>) -> Result<Program, RejectKind> {
        let code = decode_code(view.segment(Segment::Code)?)?;
        let strings = decode_strings(view.segment(Segment::Strings)?)?;

        let mut r = SegmentReader::new(Segment::Syscalls, view.segment(Segment::Syscalls)?);
        let count = r.u32()?;
        let mut syscalls = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            syscalls.push(r.string_ref(&strings)?.to_string());
        }
        r.finish()?;

        let mut r = SegmentReader::new(Segment::Blocks, view.segment(Segment::Blocks)?);
        let count = r.u32()?;
        let mut blocks = IndexMap::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let name = r.string_ref(&strings)?.to_string();
            let entry = r.u32()?;
            if blocks.insert(name.clone(), entry).is_some() {
                return Err(RejectKind::malformed(
                    Segment::Blocks,
                    format!("duplicate block `{name}`"),
                ));
            }
        }
        r.finish()?;

        let mut r = SegmentReader::new(Segment::Debug, view.segment(Segment::Debug)?);
        let count = r.u32()?;
        let mut entries: Vec<LineEntry> = Vec::with_capacity(count.min(1024) as usize);
        for _ in 0..count {
            let ip = r.u32()?;
            let file = r.u32()?;
            if file as usize >= strings.len() {
                return Err(RejectKind::malformed(
                    Segment::Debug,
                    format!("file index {file} out of range"),
                ));
            }
            let line = r.u32()?;
            let column = r.u32()?;
            if entries.last().is_some_and(|prev| prev.ip > ip) {
                return Err(RejectKind::malformed(Segment::Debug, "entries not sorted by ip"));
            }
            entries.push(LineEntry {
                ip,
                file,
                line,
                column,
            });
        }
        r.finish()?;

        Ok(Program {
            entry_point: view.header().entry_point,
            code,
            strings,
            syscalls,
            blocks,
            lines: LineTable::from_sorted(entries),
        })
    }

    pub fn entry_point(&self) -> u32 {
        self.entry_point
    }

    pub fn code(&self) -> &[Instruction] {
        &self.code
    }

    pub fn instruction(&self, ip: u32) -> Option<&Instruction> {
        self.code.get(ip as usize)
    }

    pub fn strings(&self) -> &[String] {
        &self.strings
    }

    pub fn string(&self, index: u32) -> Option<&str> {
        self.strings.get(index as usize).map(String::as_str)
    }

    pub fn syscalls(&self) -> &[String] {
        &self.syscalls
    }

    pub fn syscall_name(&self, index: u32) -> Option<&str> {
        self.syscalls.get(index as usize).map(String::as_str)
    }

    pub fn block(&self, name: &str) -> Option<u32> {
        self.blocks.get(name).copied()
    }

    pub fn blocks(&self) -> impl Iterator<Item = (&str, u32)> {
        self.blocks.iter().map(|(name, ip)| (name.as_str(), *ip))
    }

    pub fn lines(&self) -> &LineTable {
        &self.lines
    }

    /// Source position covering `ip`, if debug info has one.
    pub fn location(&self, ip: u32) -> Option<SourceLocation> {
        let entry = self.lines.find(ip)?;
        Some(SourceLocation {
            file: self.string(entry.file)?.to_string(),
            line: entry.line,
            column: entry.column,
        })
    }
}

fn decode_code(bytes: &[u8]) -> Result<Vec<Instruction>, RejectKind> {
    let chunks = bytes.chunks_exact(INSTRUCTION_SIZE);
    if !chunks.remainder().is_empty() {
        return Err(RejectKind::malformed(
            Segment::Code,
            format!("size {} is not a multiple of {INSTRUCTION_SIZE}", bytes.len()),
        ));
    }
    Ok(chunks
        .map(|chunk| {
            let mut raw = [0u8; INSTRUCTION_SIZE];
            raw.copy_from_slice(chunk);
            Instruction::from_bytes(&raw)
        })
        .collect())
}

fn decode_strings(bytes: &[u8]) -> Result<Vec<String>, RejectKind> {
    let mut r = SegmentReader::new(Segment::Strings, bytes);
    let count = r.u32()?;
    let mut strings = Vec::with_capacity(count.min(1024) as usize);
    for i in 0..count {
        let len = r.u32()? as usize;
        let raw = r.bytes(len)?;
        let s = std::str::from_utf8(raw).map_err(|_| {
            RejectKind::malformed(Segment::Strings, format!("string {i} is not valid UTF-8"))
        })?;
        strings.push(s.to_string());
    }
    r.finish()?;
    Ok(strings)
}

struct SegmentReader<'a> {
    segment: Segment,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> SegmentReader<'a> {
    fn new(segment: Segment, bytes: &'a [u8]) -> Self {
        Self {
            segment,
            bytes,
            pos: 0,
        }
    }

    fn bytes(&mut self, n: usize) -> Result<&'a [u8], RejectKind> {
        let end = self.pos.checked_add(n).filter(|&end| end <= self.bytes.len());
        let Some(end) = end else {
            return Err(RejectKind::malformed(self.segment, "unexpected end of segment"));
        };
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn u32(&mut self) -> Result<u32, RejectKind> {
        let mut b = [0u8; 4];
        b.copy_from_slice(self.bytes(4)?);
        Ok(u32::from_ne_bytes(b))
    }

    fn string_ref<'s>(&mut self, strings: &'s [String]) -> Result<&'s str, RejectKind> {
        let index = self.u32()?;
        strings.get(index as usize).map(String::as_str).ok_or_else(|| {
            RejectKind::malformed(self.segment, format!("string index {index} out of range"))
        })
    }

    fn finish(self) -> Result<(), RejectKind> {
        if self.pos != self.bytes.len() {
            return Err(RejectKind::malformed(
                self.segment,
                format!("{} trailing bytes", self.bytes.len() - self.pos),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::header::{self, HEADER_SIZE};
    use crate::template::{Opcode, ProgramBuilder};

    fn decode(image: &[u8]) -> Result<Program, RejectKind> {
        let view = header::validate(image, false)?;
        Program::decode(&view)
    }

    #[test]
    fn test_decode_all_segments() {
        let mut b = ProgramBuilder::new();
        b.set_file("page.tmpl");
        b.set_line(1, 1);
        b.emit_str("<h1>");
        let block_ip = b.here();
        b.block("header", block_ip);
        b.set_line(2, 5);
        b.push_var("title");
        b.syscall("htmlescape", 1);
        b.op(Opcode::Emit);
        b.halt();
        let program = decode(&b.build()).unwrap();

        assert_eq!(program.code().len(), 5);
        assert_eq!(program.syscalls(), &["htmlescape".to_string()]);
        assert_eq!(program.block("header"), Some(1));
        assert_eq!(program.block("footer"), None);
        assert_eq!(program.entry_point(), 0);

        let loc = program.location(3).unwrap();
        assert_eq!(loc.to_string(), "page.tmpl:2:5");
        assert_eq!(program.location(0).unwrap().line, 1);
    }

    #[test]
    fn test_program_without_debug_info_has_no_locations() {
        let mut b = ProgramBuilder::new();
        b.halt();
        let program = decode(&b.build()).unwrap();
        assert!(program.location(0).is_none());
    }

    #[test]
    fn test_ragged_code_segment_rejected() {
        let mut b = ProgramBuilder::new();
        b.halt();
        let mut image = b.build();
        // Shrink the code segment size by one byte.
        let at = 32 + 4;
        let size = u32::from_ne_bytes(image[at..at + 4].try_into().unwrap());
        image[at..at + 4].copy_from_slice(&(size - 1).to_ne_bytes());
        header::seal(&mut image);
        assert!(matches!(
            decode(&image),
            Err(RejectKind::MalformedSegment { segment: "code", .. })
        ));
    }

    #[test]
    fn test_dangling_string_reference_rejected() {
        let mut b = ProgramBuilder::new();
        b.syscall("uc", 1);
        b.halt();
        let mut image = b.build();
        let at = 32 + Segment::Syscalls as usize * 8;
        let offset = u32::from_ne_bytes(image[at..at + 4].try_into().unwrap()) as usize;
        assert!(offset >= HEADER_SIZE);
        // First (and only) syscall name index.
        image[offset + 4..offset + 8].copy_from_slice(&99u32.to_ne_bytes());
        assert!(matches!(
            decode(&image),
            Err(RejectKind::MalformedSegment { segment: "syscalls", .. })
        ));
    }
}
