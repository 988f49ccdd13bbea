//! The render pipeline: JSON body in, output chain out.

use crate::config::EngineConfig;
use crate::data::{self, DataTree};
use crate::error::RenderError;
use crate::output::{OutputChain, OutputSink, PageAllocator};
use crate::template::Template;
use crate::vm::{Limits, RegisterError, RunStats, SyscallTable, VmPool};
use tracing::debug;

/// Result of a successful render.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RenderOutcome {
    Content(OutputChain),
    /// The template ran to completion without emitting a byte.
    NoContent,
}

impl RenderOutcome {
    fn from_chain(chain: OutputChain) -> Self {
        if chain.is_empty() {
            RenderOutcome::NoContent
        } else {
            RenderOutcome::Content(chain)
        }
    }

    pub fn total(&self) -> usize {
        match self {
            RenderOutcome::Content(chain) => chain.total(),
            RenderOutcome::NoContent => 0,
        }
    }

    /// The rendered bytes, concatenated.
    pub fn to_vec(&self) -> Vec<u8> {
        match self {
            RenderOutcome::Content(chain) => chain.to_vec(),
            RenderOutcome::NoContent => Vec::new(),
        }
    }
}

/// Rendering environment: pooled VMs plus output settings.
///
/// One `Renderer` serves any number of requests; each render borrows a VM
/// from the pool for its duration.
#[derive(Debug)]
pub struct Renderer {
    pool: VmPool,
    page_size: usize,
    output_limit: usize,
}

impl Renderer {
    /// Renderer with the standard syscalls installed.
    pub fn new(config: &EngineConfig) -> Result<Renderer, RegisterError> {
        let syscalls = SyscallTable::stdlib(config.max_handlers)?;
        Ok(Renderer::with_syscalls(syscalls, config.limits(), config.page_size, config.output_limit))
    }

    pub fn with_syscalls(syscalls: SyscallTable, limits: Limits, page_size: usize, output_limit: usize) -> Renderer {
        Renderer {
            pool: VmPool::new(syscalls, limits),
            page_size,
            output_limit,
        }
    }

    pub fn pool(&self) -> &VmPool {
        &self.pool
    }

    fn allocator(&self) -> PageAllocator {
        PageAllocator::new(self.page_size).with_limit(self.output_limit)
    }

    /// Parse `body` as JSON and run `template` against it.
    pub fn render(&self, template: &Template, body: &[u8]) -> Result<RenderOutcome, RenderError> {
        let mut data = parse_body(body)?;
        let sink = OutputSink::new(self.allocator());
        self.execute(template, &mut data, sink)
    }

    /// Like [`Renderer::render`], but the body's allocation becomes the first
    /// output chunk once the JSON has been parsed.
    pub fn render_into_buffer(&self, template: &Template, mut body: Vec<u8>) -> Result<RenderOutcome, RenderError> {
        let mut data = parse_body(&body)?;
        body.clear();
        let sink = OutputSink::with_first_chunk(self.allocator(), body);
        self.execute(template, &mut data, sink)
    }

    /// Run `template` against an already built data tree.
    pub fn render_data(&self, template: &Template, data: &mut DataTree) -> Result<RenderOutcome, RenderError> {
        self.execute(template, data, OutputSink::new(self.allocator()))
    }

    fn execute(
        &self,
        template: &Template,
        data: &mut DataTree,
        mut sink: OutputSink,
    ) -> Result<RenderOutcome, RenderError> {
        let program = template.program();
        debug!(entry = program.entry_point(), "vm executing");
        let stats: RunStats = self.pool.acquire().run(program, data, &mut sink, program.entry_point())?;
        let chain = sink.finish();
        debug!(
            steps = stats.steps,
            bytes = chain.total(),
            chunks = chain.chunks().len(),
            "vm executing - done"
        );
        Ok(RenderOutcome::from_chain(chain))
    }
}

fn parse_body(body: &[u8]) -> Result<DataTree, RenderError> {
    debug!(bytes = body.len(), "parsing json data");
    let data = data::parse(body)?;
    debug!("parsing json data - done");
    Ok(data)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::{Opcode, ProgramBuilder};
    use crate::vm::VmError;

    fn renderer() -> Renderer {
        Renderer::new(&EngineConfig::default()).unwrap()
    }

    fn template(f: impl FnOnce(&mut ProgramBuilder)) -> Template {
        let mut b = ProgramBuilder::new();
        f(&mut b);
        Template::load(b.build(), true).unwrap()
    }

    #[test]
    fn test_hello_world() {
        let t = template(|b| {
            b.push_str("hello, ");
            b.push_var("name");
            b.op(Opcode::Concat);
            b.op(Opcode::Emit);
            b.halt();
        });
        let outcome = renderer().render(&t, br#"{"name": "world"}"#).unwrap();
        assert_eq!(outcome.to_vec(), b"hello, world");
        assert_eq!(outcome.total(), 12);
    }

    #[test]
    fn test_no_content() {
        let t = template(|b| {
            b.push_var("x");
            b.op(Opcode::Pop);
            b.halt();
        });
        assert_eq!(renderer().render(&t, b"{}").unwrap(), RenderOutcome::NoContent);
    }

    #[test]
    fn test_parse_error_stops_before_vm() {
        let t = template(|b| {
            b.emit_str("never");
            b.halt();
        });
        let r = renderer();
        let err = r.render(&t, br#"{"a":}"#).unwrap_err();
        match err {
            RenderError::Parse(e) => assert_eq!(e.offset, 5),
            other => panic!("unexpected error: {other:?}"),
        }
        // No VM was ever taken from the pool.
        assert_eq!(r.pool().idle(), 0);
    }

    #[test]
    fn test_render_into_buffer_reuses_body() {
        let t = template(|b| {
            b.push_var("greeting");
            b.op(Opcode::Emit);
            b.halt();
        });
        let mut body = Vec::with_capacity(64);
        body.extend_from_slice(br#"{"greeting": "hi there"}"#);
        let ptr = body.as_ptr();

        let outcome = renderer().render_into_buffer(&t, body).unwrap();
        let RenderOutcome::Content(chain) = outcome else {
            panic!("expected content");
        };
        assert_eq!(chain.chunks().len(), 1);
        assert_eq!(chain.chunks()[0].as_bytes().as_ptr(), ptr);
        assert_eq!(chain.to_vec(), b"hi there");
    }

    #[test]
    fn test_output_limit() {
        let config = EngineConfig {
            page_size: 4,
            output_limit: 8,
            ..Default::default()
        };
        let t = template(|b| {
            b.emit_str("0123456789");
            b.halt();
        });
        let err = Renderer::new(&config).unwrap().render(&t, b"null").unwrap_err();
        assert!(matches!(err, RenderError::Allocation { ip: 0, .. }));
    }

    #[test]
    fn test_vm_fault_surfaces() {
        let config = EngineConfig {
            steps_limit: 3,
            ..Default::default()
        };
        let t = template(|b| {
            let top = b.here();
            b.jump(Opcode::Jmp, top);
        });
        let err = Renderer::new(&config).unwrap().render(&t, b"{}").unwrap_err();
        assert!(matches!(
            err,
            RenderError::Vm(VmError::ExecutionLimitReached { ip: 0 })
        ));
    }
}
