//! Instruction encoding of the template VM.
//!
//! Every instruction is 16 bytes: a `u32` opcode, a `u32` argument and a
//! `u64` immediate. What `arg` and `imm` mean depends on the opcode; see
//! [`Operand`].

/// Size of one encoded instruction in bytes.
pub const INSTRUCTION_SIZE: usize = 16;

/// How an opcode uses its `arg`/`imm` fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    None,
    /// `arg != 0`
    Bool,
    /// `imm` as `i64`
    Int,
    /// `imm` as `f64` bits
    Float,
    /// `arg` is a string constant index
    Str,
    /// `arg` is an instruction index
    Target,
    /// `arg` is a syscall table index, `imm` the argument count
    Syscall,
}

macro_rules! opcodes {
    ($($variant:ident = $code:literal, $mnemonic:literal, $operand:ident;)*) => {
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u32)]
        pub enum Opcode {
            $($variant = $code,)*
        }

        impl Opcode {
            pub const ALL: &'static [Opcode] = &[$(Opcode::$variant,)*];

            pub fn from_u32(code: u32) -> Option<Opcode> {
                match code {
                    $($code => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn mnemonic(self) -> &'static str {
                match self {
                    $(Opcode::$variant => $mnemonic,)*
                }
            }

            pub fn from_mnemonic(name: &str) -> Option<Opcode> {
                match name {
                    $($mnemonic => Some(Opcode::$variant),)*
                    _ => None,
                }
            }

            pub fn operand(self) -> Operand {
                match self {
                    $(Opcode::$variant => Operand::$operand,)*
                }
            }
        }
    };
}

opcodes! {
    Hlt = 0x00, "HLT", None;
    Nop = 0x01, "NOP", None;
    PushNull = 0x02, "PUSH_NULL", None;
    PushBool = 0x03, "PUSH_BOOL", Bool;
    PushInt = 0x04, "PUSH_INT", Int;
    PushFloat = 0x05, "PUSH_FLOAT", Float;
    PushStr = 0x06, "PUSH_STR", Str;
    PushVar = 0x07, "PUSH_VAR", Str;
    Pop = 0x08, "POP", None;
    Dup = 0x09, "DUP", None;
    Swap = 0x0A, "SWAP", None;

    Emit = 0x10, "EMIT", None;
    EmitStr = 0x11, "EMIT_STR", Str;
    Concat = 0x12, "CONCAT", None;

    Add = 0x20, "ADD", None;
    Sub = 0x21, "SUB", None;
    Mul = 0x22, "MUL", None;
    Div = 0x23, "DIV", None;
    Mod = 0x24, "MOD", None;
    Neg = 0x25, "NEG", None;

    Eq = 0x30, "EQ", None;
    Ne = 0x31, "NE", None;
    Lt = 0x32, "LT", None;
    Le = 0x33, "LE", None;
    Gt = 0x34, "GT", None;
    Ge = 0x35, "GE", None;
    Not = 0x36, "NOT", None;

    Jmp = 0x40, "JMP", Target;
    JmpIfFalse = 0x41, "JMP_IF_FALSE", Target;
    JmpIfTrue = 0x42, "JMP_IF_TRUE", Target;

    Call = 0x50, "CALL", Target;
    Ret = 0x51, "RET", None;
    CallBlock = 0x52, "CALL_BLOCK", Str;
    CallBlockDyn = 0x53, "CALL_BLOCK_DYN", None;

    Syscall = 0x60, "SYSCALL", Syscall;

    Size = 0x70, "SIZE", None;
    Index = 0x71, "INDEX", None;
    PushScope = 0x72, "PUSH_SCOPE", None;
    PopScope = 0x73, "POP_SCOPE", None;
}

/// One raw instruction as stored in the code segment.
///
/// The opcode stays a raw `u32` so that an unknown opcode is only an error
/// when execution actually reaches it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Instruction {
    pub opcode: u32,
    pub arg: u32,
    pub imm: u64,
}

impl Instruction {
    pub fn new(op: Opcode, arg: u32, imm: u64) -> Self {
        Self {
            opcode: op as u32,
            arg,
            imm,
        }
    }

    pub fn op(op: Opcode) -> Self {
        Self::new(op, 0, 0)
    }

    pub fn decode(&self) -> Option<Opcode> {
        Opcode::from_u32(self.opcode)
    }

    pub fn to_bytes(&self) -> [u8; INSTRUCTION_SIZE] {
        let mut out = [0u8; INSTRUCTION_SIZE];
        out[0..4].copy_from_slice(&self.opcode.to_ne_bytes());
        out[4..8].copy_from_slice(&self.arg.to_ne_bytes());
        out[8..16].copy_from_slice(&self.imm.to_ne_bytes());
        out
    }

    pub fn from_bytes(bytes: &[u8; INSTRUCTION_SIZE]) -> Self {
        let mut opcode = [0u8; 4];
        let mut arg = [0u8; 4];
        let mut imm = [0u8; 8];
        opcode.copy_from_slice(&bytes[0..4]);
        arg.copy_from_slice(&bytes[4..8]);
        imm.copy_from_slice(&bytes[8..16]);
        Self {
            opcode: u32::from_ne_bytes(opcode),
            arg: u32::from_ne_bytes(arg),
            imm: u64::from_ne_bytes(imm),
        }
    }
}
