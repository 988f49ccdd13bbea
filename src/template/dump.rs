//! Human-readable listing of a template.

use super::header::{Header, Segment};
use super::ops::{Instruction, Opcode, Operand};
use super::program::Program;
use std::fmt::Write;

/// Disassembler for a decoded template.
pub struct Disassembler<'a> {
    header: Option<&'a Header>,
    program: &'a Program,
    output: String,
}

impl<'a> Disassembler<'a> {
    pub fn new(program: &'a Program) -> Self {
        Self {
            header: None,
            program,
            output: String::new(),
        }
    }

    /// Also print the header fields.
    pub fn with_header(mut self, header: &'a Header) -> Self {
        self.header = Some(header);
        self
    }

    pub fn disassemble(&mut self) -> &str {
        if let Some(header) = self.header {
            self.header_section(header);
        }

        if !self.program.strings().is_empty() {
            self.output.push_str("== String Constants ==\n");
            for (i, s) in self.program.strings().iter().enumerate() {
                let _ = writeln!(self.output, "  [{:04}] \"{}\"", i, escape(s));
            }
            self.output.push('\n');
        }

        if !self.program.syscalls().is_empty() {
            self.output.push_str("== Syscalls ==\n");
            for (i, name) in self.program.syscalls().iter().enumerate() {
                let _ = writeln!(self.output, "  [{:04}] {}", i, name);
            }
            self.output.push('\n');
        }

        if self.program.blocks().next().is_some() {
            self.output.push_str("== Blocks ==\n");
            for (name, ip) in self.program.blocks() {
                let _ = writeln!(self.output, "  {:04} {}", ip, name);
            }
            self.output.push('\n');
        }

        self.output.push_str("== Code ==\n");
        for (ip, ins) in self.program.code().iter().enumerate() {
            let ip = ip as u32;
            let marker = if ip == self.program.entry_point() { '>' } else { ' ' };
            let _ = write!(self.output, "{}{:04}: ", marker, ip);
            self.instruction(ins);
            if let Some(entry) = self.program.lines().entries().iter().find(|e| e.ip == ip) {
                let file = self.program.string(entry.file).unwrap_or("<?>");
                let _ = write!(self.output, "    @ {}:{}:{}", file, entry.line, entry.column);
            }
            self.output.push('\n');
        }

        &self.output
    }

    fn header_section(&mut self, header: &Header) {
        self.output.push_str("== Header ==\n");
        let v = header.version;
        let _ = writeln!(self.output, "  version     {}.{}.{}", v[0], v[1], v[2]);
        let _ = writeln!(self.output, "  crc         {:#010x}", header.crc);
        let _ = writeln!(self.output, "  entry       {}", header.entry_point);
        for segment in Segment::ALL {
            let range = header.segment(segment);
            let _ = writeln!(
                self.output,
                "  {:<11} offset {} size {}",
                segment.name(),
                range.offset,
                range.size
            );
        }
        self.output.push('\n');
    }

    fn instruction(&mut self, ins: &Instruction) {
        let Some(op) = ins.decode() else {
            let _ = write!(self.output, "<illegal {:#x}> {} {}", ins.opcode, ins.arg, ins.imm);
            return;
        };
        self.output.push_str(op.mnemonic());
        match op.operand() {
            Operand::None => {}
            Operand::Bool => {
                let _ = write!(self.output, " {}", ins.arg != 0);
            }
            Operand::Int => {
                let _ = write!(self.output, " {}", ins.imm as i64);
            }
            Operand::Float => {
                let _ = write!(self.output, " {:?}", f64::from_bits(ins.imm));
            }
            Operand::Str => {
                let s = self.program.string(ins.arg).unwrap_or("<?>");
                let _ = write!(self.output, " {} ; \"{}\"", ins.arg, escape(s));
            }
            Operand::Target => {
                let _ = write!(self.output, " {:04}", ins.arg);
            }
            Operand::Syscall => {
                let name = self.program.syscall_name(ins.arg).unwrap_or("<?>");
                let _ = write!(self.output, " {} {} ; {}", ins.arg, ins.imm, name);
            }
        }
        if op == Opcode::Hlt {
            self.output.push_str("   ; end");
        }
    }
}

fn escape(s: &str) -> String {
    s.replace('\\', "\\\\")
        .replace('\n', "\\n")
        .replace('\t', "\\t")
        .replace('"', "\\\"")
}

/// Format a decoded template as a listing.
pub fn format_program(program: &Program, header: Option<&Header>) -> String {
    let mut disassembler = Disassembler::new(program);
    if let Some(header) = header {
        disassembler = disassembler.with_header(header);
    }
    disassembler.disassemble().to_string()
}
