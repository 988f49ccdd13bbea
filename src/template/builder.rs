//! Serialization of template images.
//!
//! Used by the text assembler, the test suite and the benchmarks. Segments
//! are written in table order right after the header.

use super::debug::{LineEntry, LineTable};
use super::header::{self, HEADER_SIZE, Header, IEEE754_CANARY, PLATFORM_FINGERPRINT, SegmentRange, VERSION};
use super::ops::{Instruction, Opcode};
use std::collections::HashMap;

#[derive(Debug, Clone)]
pub struct ProgramBuilder {
    version: [u8; 4],
    entry_point: u32,
    code: Vec<Instruction>,
    strings: Vec<String>,
    string_index: HashMap<String, u32>,
    syscalls: Vec<u32>,
    syscall_index: HashMap<String, u32>,
    blocks: Vec<(u32, u32)>,
    lines: LineTable,
    file: Option<u32>,
    position: (u32, u32),
    position_dirty: bool,
}

impl Default for ProgramBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgramBuilder {
    pub fn new() -> Self {
        Self {
            version: VERSION,
            entry_point: 0,
            code: Vec::new(),
            strings: Vec::new(),
            string_index: HashMap::new(),
            syscalls: Vec::new(),
            syscall_index: HashMap::new(),
            blocks: Vec::new(),
            lines: LineTable::new(),
            file: None,
            position: (1, 1),
            position_dirty: false,
        }
    }

    pub fn version(&mut self, version: [u8; 4]) -> &mut Self {
        self.version = version;
        self
    }

    pub fn entry_point(&mut self, ip: u32) -> &mut Self {
        self.entry_point = ip;
        self
    }

    /// Index of the next instruction.
    pub fn here(&self) -> u32 {
        self.code.len() as u32
    }

    /// Intern a string constant.
    pub fn intern(&mut self, s: &str) -> u32 {
        if let Some(&idx) = self.string_index.get(s) {
            return idx;
        }
        let idx = self.strings.len() as u32;
        self.strings.push(s.to_string());
        self.string_index.insert(s.to_string(), idx);
        idx
    }

    /// Syscall table index for `name`, adding it on first use.
    pub fn syscall_slot(&mut self, name: &str) -> u32 {
        if let Some(&slot) = self.syscall_index.get(name) {
            return slot;
        }
        let name_idx = self.intern(name);
        let slot = self.syscalls.len() as u32;
        self.syscalls.push(name_idx);
        self.syscall_index.insert(name.to_string(), slot);
        slot
    }

    /// Bind a named block to an instruction index.
    pub fn block(&mut self, name: &str, ip: u32) -> &mut Self {
        let name_idx = self.intern(name);
        self.blocks.push((name_idx, ip));
        self
    }

    /// Source file for the following instructions.
    pub fn set_file(&mut self, file: &str) -> &mut Self {
        self.file = Some(self.intern(file));
        self.position_dirty = true;
        self
    }

    /// Source position for the following instructions.
    pub fn set_line(&mut self, line: u32, column: u32) -> &mut Self {
        self.position = (line, column);
        self.position_dirty = true;
        self
    }

    /// Append a raw instruction and return its index.
    pub fn push(&mut self, ins: Instruction) -> u32 {
        let ip = self.here();
        if self.position_dirty {
            if let Some(file) = self.file {
                self.lines.add(LineEntry {
                    ip,
                    file,
                    line: self.position.0,
                    column: self.position.1,
                });
                self.position_dirty = false;
            }
        }
        self.code.push(ins);
        ip
    }

    pub fn op(&mut self, op: Opcode) -> u32 {
        self.push(Instruction::op(op))
    }

    pub fn op_arg(&mut self, op: Opcode, arg: u32) -> u32 {
        self.push(Instruction::new(op, arg, 0))
    }

    pub fn halt(&mut self) -> u32 {
        self.op(Opcode::Hlt)
    }

    pub fn push_null(&mut self) -> u32 {
        self.op(Opcode::PushNull)
    }

    pub fn push_bool(&mut self, value: bool) -> u32 {
        self.op_arg(Opcode::PushBool, value as u32)
    }

    pub fn push_int(&mut self, value: i64) -> u32 {
        self.push(Instruction::new(Opcode::PushInt, 0, value as u64))
    }

    pub fn push_float(&mut self, value: f64) -> u32 {
        self.push(Instruction::new(Opcode::PushFloat, 0, value.to_bits()))
    }

    pub fn push_str(&mut self, s: &str) -> u32 {
        let idx = self.intern(s);
        self.op_arg(Opcode::PushStr, idx)
    }

    pub fn push_var(&mut self, path: &str) -> u32 {
        let idx = self.intern(path);
        self.op_arg(Opcode::PushVar, idx)
    }

    pub fn emit_str(&mut self, s: &str) -> u32 {
        let idx = self.intern(s);
        self.op_arg(Opcode::EmitStr, idx)
    }

    pub fn emit_var(&mut self, path: &str) -> u32 {
        let ip = self.push_var(path);
        self.op(Opcode::Emit);
        ip
    }

    pub fn syscall(&mut self, name: &str, argc: u32) -> u32 {
        let slot = self.syscall_slot(name);
        self.push(Instruction::new(Opcode::Syscall, slot, argc as u64))
    }

    /// Jump-like instruction to `target`.
    pub fn jump(&mut self, op: Opcode, target: u32) -> u32 {
        self.op_arg(op, target)
    }

    pub fn call_block(&mut self, name: &str) -> u32 {
        let idx = self.intern(name);
        self.op_arg(Opcode::CallBlock, idx)
    }

    /// Point a previously emitted jump at `target`.
    pub fn patch_target(&mut self, ip: u32, target: u32) {
        if let Some(ins) = self.code.get_mut(ip as usize) {
            ins.arg = target;
        }
    }

    /// Serialize into a sealed template image.
    pub fn build(&self) -> Vec<u8> {
        let mut image = vec![0u8; HEADER_SIZE];
        let mut segments = [SegmentRange::default(); 5];

        let start = image.len();
        for ins in &self.code {
            image.extend_from_slice(&ins.to_bytes());
        }
        segments[0] = range(start, image.len());

        let start = image.len();
        write_u32(&mut image, self.strings.len() as u32);
        for s in &self.strings {
            write_u32(&mut image, s.len() as u32);
            image.extend_from_slice(s.as_bytes());
        }
        segments[1] = range(start, image.len());

        let start = image.len();
        write_u32(&mut image, self.syscalls.len() as u32);
        for &name in &self.syscalls {
            write_u32(&mut image, name);
        }
        segments[2] = range(start, image.len());

        let start = image.len();
        write_u32(&mut image, self.blocks.len() as u32);
        for &(name, ip) in &self.blocks {
            write_u32(&mut image, name);
            write_u32(&mut image, ip);
        }
        segments[3] = range(start, image.len());

        let start = image.len();
        write_u32(&mut image, self.lines.len() as u32);
        for entry in self.lines.entries() {
            write_u32(&mut image, entry.ip);
            write_u32(&mut image, entry.file);
            write_u32(&mut image, entry.line);
            write_u32(&mut image, entry.column);
        }
        segments[4] = range(start, image.len());

        let header = Header {
            version: self.version,
            platform: PLATFORM_FINGERPRINT,
            crc: 0,
            entry_point: self.entry_point,
            canary: IEEE754_CANARY,
            segments,
        };
        header.write(&mut image);
        header::seal(&mut image);
        image
    }
}

fn range(start: usize, end: usize) -> SegmentRange {
    SegmentRange {
        offset: start as u32,
        size: (end - start) as u32,
    }
}

fn write_u32(out: &mut Vec<u8>, v: u32) {
    out.extend_from_slice(&v.to_ne_bytes());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::header::validate;

    #[test]
    fn test_strings_are_interned() {
        let mut b = ProgramBuilder::new();
        assert_eq!(b.intern("a"), 0);
        assert_eq!(b.intern("b"), 1);
        assert_eq!(b.intern("a"), 0);
        assert_eq!(b.syscall_slot("uc"), 0);
        assert_eq!(b.syscall_slot("lc"), 1);
        assert_eq!(b.syscall_slot("uc"), 0);
    }

    #[test]
    fn test_built_image_is_sealed() {
        let mut b = ProgramBuilder::new();
        b.emit_str("x");
        b.halt();
        let image = b.build();
        let view = validate(&image, true).unwrap();
        assert_eq!(view.header().platform, PLATFORM_FINGERPRINT);
    }

    #[test]
    fn test_patch_target() {
        let mut b = ProgramBuilder::new();
        b.push_bool(false);
        let jump = b.jump(Opcode::JmpIfFalse, 0);
        b.emit_str("skipped");
        let end = b.halt();
        b.patch_target(jump, end);
        assert_eq!(b.code[jump as usize].arg, 3);
    }

    #[test]
    fn test_line_entries_only_on_change() {
        let mut b = ProgramBuilder::new();
        b.set_file("a.tmpl").set_line(1, 1);
        b.op(Opcode::Nop);
        b.op(Opcode::Nop);
        b.set_line(4, 2);
        b.op(Opcode::Nop);
        assert_eq!(b.lines.len(), 2);
        assert_eq!(b.lines.entries()[1].ip, 2);
    }
}
