//! Compiled templates: binary format, loading and tooling.

pub mod asm;
mod builder;
pub mod debug;
pub mod dump;
pub mod header;
mod ops;
mod program;

pub use builder::ProgramBuilder;
pub use debug::{LineEntry, LineTable, SourceLocation};
pub use header::{ExecutableView, Header, RejectKind, Segment};
pub use ops::{INSTRUCTION_SIZE, Instruction, Opcode, Operand};
pub use program::Program;

use crate::error::RenderError;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// A validated, decoded template. Cheap to clone.
///
/// The image is never modified after validation; the CRC is checked at most
/// once, here.
#[derive(Debug, Clone)]
pub struct Template {
    image: Arc<[u8]>,
    header: Header,
    program: Arc<Program>,
    checksum_verified: bool,
}

impl Template {
    /// Validate and decode an image.
    pub fn load(bytes: impl Into<Arc<[u8]>>, enforce_crc: bool) -> Result<Template, RejectKind> {
        let image: Arc<[u8]> = bytes.into();
        let view = header::validate(&image, enforce_crc)?;
        let program = Program::decode(&view)?;
        let header = *view.header();
        debug!(
            size = image.len(),
            instructions = program.code().len(),
            crc_checked = enforce_crc,
            "template decoded"
        );
        Ok(Template {
            header,
            program: Arc::new(program),
            checksum_verified: enforce_crc,
            image,
        })
    }

    /// Read and load a template file.
    pub fn load_file(path: impl AsRef<Path>, enforce_crc: bool) -> Result<Template, RenderError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path).map_err(|e| RenderError::io(path, e))?;
        Ok(Template::load(bytes, enforce_crc)?)
    }

    pub fn image(&self) -> &[u8] {
        &self.image
    }

    pub fn header(&self) -> &Header {
        &self.header
    }

    pub fn program(&self) -> &Program {
        &self.program
    }

    pub fn checksum_verified(&self) -> bool {
        self.checksum_verified
    }
}

/// Header inspection only, without decoding segments.
pub fn inspect(bytes: &[u8], enforce_crc: bool) -> Result<Header, RejectKind> {
    header::validate(bytes, enforce_crc).map(|view| *view.header())
}

/// Templates loaded once and shared across requests.
///
/// Entries are always loaded with the CRC enforced.
#[derive(Debug, Default)]
pub struct TemplateCache {
    entries: HashMap<PathBuf, Template>,
}

impl TemplateCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load `path`, or return the already loaded template.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<Template, RenderError> {
        let path = path.as_ref();
        if let Some(template) = self.entries.get(path) {
            return Ok(template.clone());
        }
        let template = Template::load_file(path, true)?;
        info!(path = %path.display(), "template cached");
        self.entries.insert(path.to_path_buf(), template.clone());
        Ok(template)
    }

    pub fn get(&self, path: impl AsRef<Path>) -> Option<&Template> {
        self.entries.get(path.as_ref())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
