//! Named host functions callable from templates through `SYSCALL`.

use crate::data::DataTree;
use indexmap::IndexMap;
use std::fmt;
use thiserror::Error;

/// Failure reported by a syscall handler.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{0}")]
pub struct SyscallError(pub String);

impl SyscallError {
    pub fn new(message: impl Into<String>) -> Self {
        SyscallError(message.into())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RegisterError {
    #[error("syscall table is full ({capacity} handlers)")]
    TableFull { capacity: usize },
    #[error("syscall \"{0}\" is already registered")]
    Duplicate(String),
}

/// What a handler can see besides its arguments.
pub struct SyscallContext<'a> {
    /// The request's data tree. Only `assign`-style handlers modify it.
    pub data: &'a mut DataTree,
    /// Instruction pointer of the `SYSCALL`.
    pub ip: u32,
}

pub type SyscallResult = Result<DataTree, SyscallError>;

type Handler = Box<dyn Fn(&mut SyscallContext<'_>, &[DataTree]) -> SyscallResult + Send + Sync>;

/// Registered handlers, looked up by name at call time.
pub struct SyscallTable {
    capacity: usize,
    handlers: IndexMap<String, Handler>,
}

impl SyscallTable {
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity,
            handlers: IndexMap::with_capacity(capacity),
        }
    }

    /// Table holding the standard library, with room for `capacity` handlers.
    pub fn stdlib(capacity: usize) -> Result<Self, RegisterError> {
        let mut table = Self::with_capacity(capacity);
        super::stdlib::install(&mut table)?;
        Ok(table)
    }

    pub fn register<F>(&mut self, name: &str, handler: F) -> Result<(), RegisterError>
    where
        F: Fn(&mut SyscallContext<'_>, &[DataTree]) -> SyscallResult + Send + Sync + 'static,
    {
        if self.handlers.contains_key(name) {
            return Err(RegisterError::Duplicate(name.to_string()));
        }
        if self.handlers.len() >= self.capacity {
            return Err(RegisterError::TableFull {
                capacity: self.capacity,
            });
        }
        self.handlers.insert(name.to_string(), Box::new(handler));
        Ok(())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.handlers.contains_key(name)
    }

    pub fn call(&self, name: &str, ctx: &mut SyscallContext<'_>, args: &[DataTree]) -> Option<SyscallResult> {
        self.handlers.get(name).map(|handler| handler(ctx, args))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl fmt::Debug for SyscallTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyscallTable")
            .field("capacity", &self.capacity)
            .field("handlers", &self.handlers.keys().collect::<Vec<_>>())
            .finish()
    }
}
