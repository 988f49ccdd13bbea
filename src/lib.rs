//! ctpp-render - executes compiled CTPP2 templates against JSON data.
//!
//! The pipeline assembles streamed input into buffers, validates the template
//! image, parses the JSON body and runs the bytecode VM, collecting output
//! into a chain of fixed-size chunks.

pub mod assembler;
pub mod config;
pub mod data;
pub mod error;
pub mod filter;
pub mod output;
pub mod render;
pub mod template;
pub mod vm;

// Re-export commonly used types
pub use assembler::{AssemblyBuffer, ChunkQueue, FeedStatus, InputChunk};
pub use config::{Config, ConfigError, EngineConfig, LocationConfig};
pub use data::{DataTree, ParseError};
pub use error::{ErrorKind, ErrorReport, RenderError};
pub use filter::{FilterStep, Location, RenderFilter, ResponseHead};
pub use output::{OutputChain, OutputSink, PageAllocator};
pub use render::{RenderOutcome, Renderer};
pub use template::{RejectKind, Template, TemplateCache};
pub use vm::{Limits, SyscallTable, Vm, VmError, VmPool};
