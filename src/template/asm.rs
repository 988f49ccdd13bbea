//! Text assembler for template images.
//!
//! One instruction or directive per line; `;` starts a comment.
//!
//! ```text
//! .file "page.tmpl"
//! .line 1
//!     EMIT_STR "Hello, "
//!     PUSH_VAR "user.name"
//!     SYSCALL htmlescape 1
//!     EMIT
//!     JMP_IF_FALSE done
//! .block footer
//!     EMIT_STR "<footer/>"
//! done:
//!     HLT
//! ```
//!
//! Directives: `.file NAME`, `.line LINE [COLUMN]`, `.block NAME` (names
//! the current position and makes it a label), `.entry LABEL`, and
//! `.op OPCODE ARG IMM` for a raw instruction.

use super::builder::ProgramBuilder;
use super::ops::{Instruction, Opcode, Operand};
use std::collections::HashMap;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{line}:{column}: {message}")]
pub struct AsmError {
    pub line: usize,
    pub column: usize,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq)]
enum TokenKind {
    Ident(String),
    Directive(String),
    Int(i64),
    Float(f64),
    Str(String),
    Colon,
    Newline,
    Eof,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Span {
    line: usize,
    column: usize,
}

#[derive(Debug, Clone, PartialEq)]
struct Token {
    kind: TokenKind,
    span: Span,
}

struct Lexer<'a> {
    source: &'a str,
    chars: std::iter::Peekable<std::str::CharIndices<'a>>,
    line: usize,
    column: usize,
}

impl<'a> Lexer<'a> {
    fn new(source: &'a str) -> Self {
        Self {
            source,
            chars: source.char_indices().peekable(),
            line: 1,
            column: 1,
        }
    }

    fn scan_tokens(&mut self) -> Result<Vec<Token>, AsmError> {
        let mut tokens = Vec::new();
        loop {
            self.skip_blanks_and_comments();
            let span = Span {
                line: self.line,
                column: self.column,
            };
            let Some((start, ch)) = self.peek() else {
                tokens.push(Token {
                    kind: TokenKind::Eof,
                    span,
                });
                break;
            };
            let kind = match ch {
                '\n' => {
                    self.advance();
                    TokenKind::Newline
                }
                ':' => {
                    self.advance();
                    TokenKind::Colon
                }
                '"' => self.scan_string()?,
                '.' => {
                    self.advance();
                    let word = self.scan_word();
                    if word.is_empty() {
                        return Err(self.error_at(span, "expected directive name after '.'"));
                    }
                    TokenKind::Directive(word)
                }
                '-' | '+' | '0'..='9' => self.scan_number(start, span)?,
                c if c.is_alphabetic() || c == '_' => TokenKind::Ident(self.scan_word()),
                other => return Err(self.error_at(span, format!("unexpected character '{other}'"))),
            };
            tokens.push(Token { kind, span });
        }
        Ok(tokens)
    }

    fn peek(&mut self) -> Option<(usize, char)> {
        self.chars.peek().copied()
    }

    fn advance(&mut self) -> Option<(usize, char)> {
        let result = self.chars.next();
        if let Some((_, ch)) = result {
            if ch == '\n' {
                self.line += 1;
                self.column = 1;
            } else {
                self.column += 1;
            }
        }
        result
    }

    fn skip_blanks_and_comments(&mut self) {
        while let Some((_, ch)) = self.peek() {
            match ch {
                ' ' | '\t' | '\r' => {
                    self.advance();
                }
                ';' => {
                    while let Some((_, c)) = self.peek() {
                        if c == '\n' {
                            break;
                        }
                        self.advance();
                    }
                }
                _ => break,
            }
        }
    }

    fn scan_word(&mut self) -> String {
        let mut word = String::new();
        while let Some((_, ch)) = self.peek() {
            if ch.is_alphanumeric() || ch == '_' || ch == '.' {
                word.push(ch);
                self.advance();
            } else {
                break;
            }
        }
        word
    }

    fn scan_number(&mut self, start: usize, span: Span) -> Result<TokenKind, AsmError> {
        let mut end = start;
        while let Some((i, ch)) = self.peek() {
            if ch.is_ascii_alphanumeric() || matches!(ch, '.' | '-' | '+' | '_') {
                end = i + ch.len_utf8();
                self.advance();
            } else {
                break;
            }
        }
        let text = &self.source[start..end];
        let (negative, digits) = match text.strip_prefix('-') {
            Some(rest) => (true, rest),
            None => (false, text.strip_prefix('+').unwrap_or(text)),
        };
        if let Some(hex) = digits.strip_prefix("0x").or_else(|| digits.strip_prefix("0X")) {
            let value = u64::from_str_radix(&hex.replace('_', ""), 16)
                .map_err(|_| self.error_at(span, format!("invalid hex literal '{text}'")))?;
            let value = value as i64;
            return Ok(TokenKind::Int(if negative { value.wrapping_neg() } else { value }));
        }
        let cleaned = text.replace('_', "");
        if let Ok(value) = cleaned.parse::<i64>() {
            return Ok(TokenKind::Int(value));
        }
        cleaned
            .parse::<f64>()
            .map(TokenKind::Float)
            .map_err(|_| self.error_at(span, format!("invalid number '{text}'")))
    }

    fn scan_string(&mut self) -> Result<TokenKind, AsmError> {
        let span = Span {
            line: self.line,
            column: self.column,
        };
        self.advance(); // opening quote
        let mut value = String::new();
        loop {
            match self.advance() {
                None | Some((_, '\n')) => return Err(self.error_at(span, "unterminated string")),
                Some((_, '"')) => break,
                Some((_, '\\')) => match self.advance() {
                    Some((_, 'n')) => value.push('\n'),
                    Some((_, 't')) => value.push('\t'),
                    Some((_, 'r')) => value.push('\r'),
                    Some((_, '0')) => value.push('\0'),
                    Some((_, '\\')) => value.push('\\'),
                    Some((_, '"')) => value.push('"'),
                    Some((_, other)) => {
                        return Err(self.error_at(span, format!("unknown escape '\\{other}'")));
                    }
                    None => return Err(self.error_at(span, "unterminated string")),
                },
                Some((_, ch)) => value.push(ch),
            }
        }
        Ok(TokenKind::Str(value))
    }

    fn error_at(&self, span: Span, message: impl Into<String>) -> AsmError {
        AsmError {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }
}

struct Assembler {
    tokens: Vec<Token>,
    pos: usize,
    builder: ProgramBuilder,
    labels: HashMap<String, u32>,
    /// Instructions whose target is a label not resolved yet.
    fixups: Vec<(u32, String, Span)>,
    entry: Option<(String, Span)>,
}

impl Assembler {
    fn new(tokens: Vec<Token>) -> Self {
        Self {
            tokens,
            pos: 0,
            builder: ProgramBuilder::new(),
            labels: HashMap::new(),
            fixups: Vec::new(),
            entry: None,
        }
    }

    fn peek(&self) -> &Token {
        &self.tokens[self.pos.min(self.tokens.len() - 1)]
    }

    fn next(&mut self) -> Token {
        let token = self.peek().clone();
        if self.pos < self.tokens.len() - 1 {
            self.pos += 1;
        }
        token
    }

    fn error(span: Span, message: impl Into<String>) -> AsmError {
        AsmError {
            line: span.line,
            column: span.column,
            message: message.into(),
        }
    }

    fn run(mut self) -> Result<Vec<u8>, AsmError> {
        loop {
            let token = self.next();
            match token.kind {
                TokenKind::Eof => break,
                TokenKind::Newline => continue,
                TokenKind::Directive(name) => self.directive(&name, token.span)?,
                TokenKind::Ident(word) => {
                    if self.peek().kind == TokenKind::Colon {
                        self.next();
                        self.define_label(word, token.span)?;
                        continue;
                    }
                    self.instruction(&word, token.span)?;
                }
                other => return Err(Self::error(token.span, format!("unexpected {other:?}"))),
            }
            self.end_of_line()?;
        }
        self.resolve()
    }

    fn end_of_line(&mut self) -> Result<(), AsmError> {
        let token = self.next();
        match token.kind {
            TokenKind::Newline | TokenKind::Eof => Ok(()),
            other => Err(Self::error(token.span, format!("expected end of line, found {other:?}"))),
        }
    }

    fn define_label(&mut self, name: String, span: Span) -> Result<(), AsmError> {
        let ip = self.builder.here();
        if self.labels.insert(name.clone(), ip).is_some() {
            return Err(Self::error(span, format!("duplicate label `{name}`")));
        }
        Ok(())
    }

    fn directive(&mut self, name: &str, span: Span) -> Result<(), AsmError> {
        match name {
            "file" => {
                let file = self.expect_name()?;
                self.builder.set_file(&file);
            }
            "line" => {
                let line = self.expect_u32()?;
                let column = if matches!(self.peek().kind, TokenKind::Int(_)) {
                    self.expect_u32()?
                } else {
                    1
                };
                self.builder.set_line(line, column);
            }
            "block" => {
                let block = self.expect_name()?;
                let ip = self.builder.here();
                self.builder.block(&block, ip);
                self.define_label(block, span)?;
            }
            "entry" => {
                let label = self.expect_name()?;
                self.entry = Some((label, span));
            }
            "op" => {
                let opcode = self.expect_u32()?;
                let arg = self.expect_u32()?;
                let imm = self.expect_int()?;
                self.builder.push(Instruction {
                    opcode,
                    arg,
                    imm: imm as u64,
                });
            }
            other => return Err(Self::error(span, format!("unknown directive `.{other}`"))),
        }
        Ok(())
    }

    fn instruction(&mut self, mnemonic: &str, span: Span) -> Result<(), AsmError> {
        let op = Opcode::from_mnemonic(&mnemonic.to_ascii_uppercase())
            .ok_or_else(|| Self::error(span, format!("unknown instruction `{mnemonic}`")))?;
        match op.operand() {
            Operand::None => {
                self.builder.op(op);
            }
            Operand::Bool => {
                let token = self.next();
                let value = match token.kind {
                    TokenKind::Ident(ref w) if w == "true" => true,
                    TokenKind::Ident(ref w) if w == "false" => false,
                    TokenKind::Int(n) => n != 0,
                    _ => return Err(Self::error(token.span, "expected true or false")),
                };
                self.builder.push_bool(value);
            }
            Operand::Int => {
                let value = self.expect_int()?;
                self.builder.push_int(value);
            }
            Operand::Float => {
                let token = self.next();
                let value = match token.kind {
                    TokenKind::Float(f) => f,
                    TokenKind::Int(n) => n as f64,
                    _ => return Err(Self::error(token.span, "expected a number")),
                };
                self.builder.push_float(value);
            }
            Operand::Str => {
                let token = self.next();
                let TokenKind::Str(s) = token.kind else {
                    return Err(Self::error(token.span, "expected a string literal"));
                };
                let idx = self.builder.intern(&s);
                self.builder.op_arg(op, idx);
            }
            Operand::Target => {
                let token = self.next();
                match token.kind {
                    TokenKind::Ident(label) => {
                        let ip = self.builder.jump(op, 0);
                        self.fixups.push((ip, label, token.span));
                    }
                    TokenKind::Int(n) if (0..=u32::MAX as i64).contains(&n) => {
                        self.builder.jump(op, n as u32);
                    }
                    _ => return Err(Self::error(token.span, "expected a label")),
                }
            }
            Operand::Syscall => {
                let name = self.expect_name()?;
                let argc = if matches!(self.peek().kind, TokenKind::Int(_)) {
                    self.expect_u32()?
                } else {
                    1
                };
                self.builder.syscall(&name, argc);
            }
        }
        Ok(())
    }

    fn expect_name(&mut self) -> Result<String, AsmError> {
        let token = self.next();
        match token.kind {
            TokenKind::Ident(s) | TokenKind::Str(s) => Ok(s),
            _ => Err(Self::error(token.span, "expected a name")),
        }
    }

    fn expect_int(&mut self) -> Result<i64, AsmError> {
        let token = self.next();
        match token.kind {
            TokenKind::Int(n) => Ok(n),
            _ => Err(Self::error(token.span, "expected an integer")),
        }
    }

    fn expect_u32(&mut self) -> Result<u32, AsmError> {
        let token = self.next();
        match token.kind {
            TokenKind::Int(n) => u32::try_from(n)
                .map_err(|_| Self::error(token.span, format!("{n} does not fit in u32"))),
            _ => Err(Self::error(token.span, "expected an integer")),
        }
    }

    fn resolve(mut self) -> Result<Vec<u8>, AsmError> {
        for (ip, label, span) in std::mem::take(&mut self.fixups) {
            let target = *self
                .labels
                .get(&label)
                .ok_or_else(|| Self::error(span, format!("undefined label `{label}`")))?;
            self.builder.patch_target(ip, target);
        }
        if let Some((label, span)) = self.entry.take() {
            let ip = *self
                .labels
                .get(&label)
                .ok_or_else(|| Self::error(span, format!("undefined label `{label}`")))?;
            self.builder.entry_point(ip);
        }
        Ok(self.builder.build())
    }
}

/// Assemble `source` into a sealed template image.
pub fn assemble(source: &str) -> Result<Vec<u8>, AsmError> {
    let tokens = Lexer::new(source).scan_tokens()?;
    Assembler::new(tokens).run()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::Template;

    fn load(source: &str) -> Template {
        Template::load(assemble(source).unwrap(), true).unwrap()
    }

    #[test]
    fn test_assemble_hello() {
        let t = load("EMIT_STR \"hello, world\"\nHLT\n");
        let program = t.program();
        assert_eq!(program.code().len(), 2);
        assert_eq!(program.code()[0].decode(), Some(Opcode::EmitStr));
        assert_eq!(program.string(program.code()[0].arg), Some("hello, world"));
    }

    #[test]
    fn test_labels_resolve_forward_and_backward() {
        let t = load(
            "top:\n  PUSH_BOOL false\n  JMP_IF_FALSE end ; skip\n  JMP top\nend: HLT\n",
        );
        let code = t.program().code();
        assert_eq!(code[1].arg, 3);
        assert_eq!(code[2].arg, 0);
    }

    #[test]
    fn test_operands() {
        let t = load(
            "PUSH_INT -42\nPUSH_FLOAT 2.5\nPUSH_INT 0x10\nSYSCALL numformat 3\nSYSCALL uc\nHLT",
        );
        let program = t.program();
        let code = program.code();
        assert_eq!(code[0].imm as i64, -42);
        assert_eq!(f64::from_bits(code[1].imm), 2.5);
        assert_eq!(code[2].imm, 16);
        assert_eq!(code[3].imm, 3);
        assert_eq!(code[4].imm, 1);
        assert_eq!(program.syscalls(), &["numformat".to_string(), "uc".to_string()]);
    }

    #[test]
    fn test_blocks_entry_and_debug_info() {
        let src = r#"
.file "page.tmpl"
.entry main
.block header
.line 1 1
    EMIT_STR "<h1>"
    RET
main:
.line 3 5
    CALL_BLOCK "header"
    HLT
"#;
        let t = load(src);
        let program = t.program();
        assert_eq!(program.block("header"), Some(0));
        assert_eq!(program.entry_point(), 2);
        assert_eq!(program.location(2).unwrap().to_string(), "page.tmpl:3:5");
    }

    #[test]
    fn test_raw_op() {
        let t = load(".op 255 7 9\n");
        assert_eq!(t.program().code()[0].opcode, 255);
        assert_eq!(t.program().code()[0].decode(), None);
    }

    #[test]
    fn test_errors_carry_position() {
        let err = assemble("HLT\n  FROB 1\n").unwrap_err();
        assert_eq!((err.line, err.column), (2, 3));
        assert!(err.message.contains("FROB"));

        let err = assemble("JMP nowhere\n").unwrap_err();
        assert!(err.message.contains("undefined label"));

        let err = assemble("EMIT_STR \"open\n").unwrap_err();
        assert!(err.message.contains("unterminated"));

        let err = assemble("HLT HLT\n").unwrap_err();
        assert!(err.message.contains("end of line"));
    }

    #[test]
    fn test_string_escapes() {
        let t = load(r#"EMIT_STR "a\n\"b\"\\""#);
        assert_eq!(t.program().string(0), Some("a\n\"b\"\\"));
    }
}
