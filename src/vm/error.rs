use crate::output::AllocationError;
use crate::template::SourceLocation;
use thiserror::Error;

/// A fault raised while executing a template. Every fault stops the run.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum VmError {
    #[error("Illegal opcode {opcode:#010X} at {ip:#010X}")]
    IllegalOpcode { ip: u32, opcode: u32 },
    #[error("Unsupported syscall \"{name}\" at {ip:#010X}{}", at(.location))]
    InvalidSyscall {
        name: String,
        ip: u32,
        location: Option<SourceLocation>,
    },
    #[error("Invalid block name \"{name}\" at {ip:#010X}{}", at(.location))]
    InvalidCall {
        name: String,
        ip: u32,
        location: Option<SourceLocation>,
    },
    #[error("Code segment overrun at {ip:#010X}")]
    CodeSegmentOverrun { ip: u32 },
    #[error("Stack overflow at {ip:#010X}")]
    StackOverflow { ip: u32 },
    #[error("Stack underflow at {ip:#010X}")]
    StackUnderflow { ip: u32 },
    #[error("Execution limit of steps reached at {ip:#010X}")]
    ExecutionLimitReached { ip: u32 },
    #[error("{message} at {ip:#010X}")]
    Runtime { ip: u32, message: String },
    #[error("output allocation failed at {ip:#010X}: {source}")]
    Allocation { ip: u32, source: AllocationError },
}

fn at(location: &Option<SourceLocation>) -> String {
    match location {
        Some(loc) => format!(
            " (template file \"{}\", line {}, pos {})",
            loc.file, loc.line, loc.column
        ),
        None => String::new(),
    }
}

impl VmError {
    /// Instruction pointer of the fault.
    pub fn ip(&self) -> u32 {
        match self {
            VmError::IllegalOpcode { ip, .. }
            | VmError::InvalidSyscall { ip, .. }
            | VmError::InvalidCall { ip, .. }
            | VmError::CodeSegmentOverrun { ip }
            | VmError::StackOverflow { ip }
            | VmError::StackUnderflow { ip }
            | VmError::ExecutionLimitReached { ip }
            | VmError::Runtime { ip, .. }
            | VmError::Allocation { ip, .. } => *ip,
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            VmError::InvalidSyscall { location, .. } | VmError::InvalidCall { location, .. } => {
                location.as_ref()
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        assert_eq!(
            VmError::IllegalOpcode {
                ip: 3,
                opcode: 0xFF
            }
            .to_string(),
            "Illegal opcode 0x000000FF at 0x00000003"
        );
        assert_eq!(
            VmError::ExecutionLimitReached { ip: 16 }.to_string(),
            "Execution limit of steps reached at 0x00000010"
        );
        let err = VmError::InvalidSyscall {
            name: "frob".to_string(),
            ip: 2,
            location: Some(SourceLocation {
                file: "page.tmpl".to_string(),
                line: 4,
                column: 9,
            }),
        };
        assert_eq!(
            err.to_string(),
            "Unsupported syscall \"frob\" at 0x00000002 (template file \"page.tmpl\", line 4, pos 9)"
        );
        assert_eq!(err.location().map(|l| l.line), Some(4));
        assert_eq!(err.ip(), 2);
    }
}
