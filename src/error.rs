//! Render failures and their structured diagnostic form.

use crate::data::ParseError;
use crate::output::AllocationError;
use crate::template::{RejectKind, SourceLocation};
use crate::vm::VmError;
use serde::Serialize;
use std::io;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// Everything that can abort one render.
#[derive(Debug, Error)]
pub enum RenderError {
    #[error("template rejected: {0}")]
    HeaderRejected(#[from] RejectKind),
    #[error("invalid JSON data: {0}")]
    Parse(#[from] ParseError),
    #[error(
        "data buffer overflow: the body does not fit in {capacity} bytes; \
         send a correct Content-Length or raise `data_buffer`"
    )]
    BufferOverflow { capacity: usize },
    #[error("output allocation failed at {ip:#010X}: {source}")]
    Allocation { ip: u32, source: AllocationError },
    #[error("{0}")]
    Vm(VmError),
    #[error("{}: {source}", .path.display())]
    Io { path: PathBuf, source: io::Error },
}

impl RenderError {
    pub fn io(path: impl AsRef<Path>, source: io::Error) -> Self {
        RenderError::Io {
            path: path.as_ref().to_path_buf(),
            source,
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RenderError::HeaderRejected(_) => ErrorKind::HeaderRejected,
            RenderError::Parse(_) => ErrorKind::Parse,
            RenderError::BufferOverflow { .. } => ErrorKind::BufferOverflow,
            RenderError::Allocation { .. } => ErrorKind::Allocation,
            RenderError::Io { .. } => ErrorKind::Io,
            RenderError::Vm(e) => match e {
                VmError::IllegalOpcode { .. } => ErrorKind::IllegalOpcode,
                VmError::InvalidSyscall { .. } => ErrorKind::InvalidSyscall,
                VmError::InvalidCall { .. } => ErrorKind::InvalidCall,
                VmError::CodeSegmentOverrun { .. } => ErrorKind::CodeSegmentOverrun,
                VmError::StackOverflow { .. } => ErrorKind::StackOverflow,
                VmError::StackUnderflow { .. } => ErrorKind::StackUnderflow,
                VmError::ExecutionLimitReached { .. } => ErrorKind::ExecutionLimitReached,
                VmError::Runtime { .. } => ErrorKind::Runtime,
                VmError::Allocation { .. } => ErrorKind::Allocation,
            },
        }
    }

    /// Instruction pointer, for faults raised while executing.
    pub fn ip(&self) -> Option<u32> {
        match self {
            RenderError::Vm(e) => Some(e.ip()),
            RenderError::Allocation { ip, .. } => Some(*ip),
            _ => None,
        }
    }

    pub fn location(&self) -> Option<&SourceLocation> {
        match self {
            RenderError::Vm(e) => e.location(),
            _ => None,
        }
    }

    /// Whether the failure comes from configuration rather than the template.
    pub fn is_misconfiguration(&self) -> bool {
        matches!(self, RenderError::BufferOverflow { .. })
    }
}

impl From<VmError> for RenderError {
    fn from(e: VmError) -> Self {
        match e {
            VmError::Allocation { ip, source } => RenderError::Allocation { ip, source },
            other => RenderError::Vm(other),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    HeaderRejected,
    Parse,
    BufferOverflow,
    Allocation,
    IllegalOpcode,
    InvalidSyscall,
    InvalidCall,
    CodeSegmentOverrun,
    StackOverflow,
    StackUnderflow,
    ExecutionLimitReached,
    Runtime,
    Io,
}

/// Flat, serializable description of a [`RenderError`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReport {
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<SourceLocation>,
    /// Byte offset into the JSON body, for parse errors.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub errno: Option<i32>,
}

impl From<&RenderError> for ErrorReport {
    fn from(e: &RenderError) -> Self {
        ErrorReport {
            kind: e.kind(),
            message: e.to_string(),
            ip: e.ip(),
            location: e.location().cloned(),
            offset: match e {
                RenderError::Parse(p) => Some(p.offset),
                _ => None,
            },
            errno: match e {
                RenderError::Io { source, .. } => source.raw_os_error(),
                _ => None,
            },
        }
    }
}

impl ErrorReport {
    pub fn to_json(&self) -> String {
        // Every field is a plain string, number or enum tag.
        serde_json::to_string(self).unwrap_or_else(|_| format!("{{\"message\":{:?}}}", self.message))
    }
}
