//! Per-response streaming driver.
//!
//! A [`RenderFilter`] is created in the header phase of a response, when the
//! template is chosen and the body buffer sized. The body phase then feeds it
//! chunk deliveries until the body is assembled and rendered.
//!
//! A template that is not cached arrives in the same stream, ahead of the
//! body: [`RenderFilter::open_template`] reads it from disk and queues it in
//! front of the pending chunks.

use crate::assembler::{AssemblyBuffer, ChunkQueue, FeedStatus, InputChunk};
use crate::config::LocationConfig;
use crate::error::{ErrorReport, RenderError};
use crate::render::{RenderOutcome, Renderer};
use crate::template::{RejectKind, Template, TemplateCache};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, error, info};

/// What the header phase sees of a response.
#[derive(Debug, Clone, Default)]
pub struct ResponseHead {
    pub not_modified: bool,
    pub content_length: Option<usize>,
    pub headers: Vec<(String, String)>,
}

impl ResponseHead {
    /// First header named `name`, compared case-insensitively.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(key, _)| key.eq_ignore_ascii_case(name))
            .map(|(_, value)| value.as_str())
    }
}

/// A location's settings plus the template loaded at setup, if cached.
#[derive(Debug, Clone)]
pub struct Location {
    config: LocationConfig,
    cached: Option<Template>,
}

impl Location {
    /// Prepare a location. A cached template is loaded here, once, with its
    /// CRC checked.
    pub fn setup(config: LocationConfig, cache: &mut TemplateCache) -> Result<Location, RenderError> {
        let cached = match config.template_path() {
            Some(path) if config.cached => Some(cache.load(path)?),
            _ => None,
        };
        Ok(Location { config, cached })
    }

    pub fn config(&self) -> &LocationConfig {
        &self.config
    }

    pub fn cached_template(&self) -> Option<&Template> {
        self.cached.as_ref()
    }
}

/// Outcome of one body delivery.
#[derive(Debug)]
pub enum FilterStep {
    /// More chunks are needed.
    Pending,
    Done(RenderOutcome),
    Failed(ErrorReport),
    /// The filter already finished; chunks are not touched.
    Passthrough,
}

#[derive(Debug)]
enum TemplateStage {
    /// Streamed template not opened yet.
    Unopened(PathBuf),
    Streaming {
        path: PathBuf,
        buffer: AssemblyBuffer,
    },
    Ready(Template),
}

#[derive(Debug)]
enum Phase {
    Template(TemplateStage),
    Body(Template),
    Finished,
}

/// State of one response being rendered.
#[derive(Debug)]
pub struct RenderFilter {
    phase: Phase,
    body: Option<AssemblyBuffer>,
    templates_check: bool,
    template_path: PathBuf,
}

impl RenderFilter {
    /// Header phase. Returns `None` when this response is not rendered: the
    /// location is disabled, the response is `304 Not Modified`, or no
    /// template is named.
    ///
    /// A template named by the response header takes precedence over the
    /// configured one and is always streamed.
    pub fn on_headers(location: &Location, head: &ResponseHead) -> Option<RenderFilter> {
        let config = &location.config;
        if !config.enabled || head.not_modified {
            return None;
        }

        let (template_path, stage) = match head.header(&config.templates_header) {
            Some(name) => {
                let path = config.resolve_template(name);
                (path.clone(), TemplateStage::Unopened(path))
            }
            None => {
                let path = config.template_path()?;
                match &location.cached {
                    Some(template) => (path, TemplateStage::Ready(template.clone())),
                    None => (path.clone(), TemplateStage::Unopened(path)),
                }
            }
        };
        info!(template = %template_path.display(), "template will be processed");

        let capacity = config.body_capacity(head.content_length);
        if head.content_length.is_none() {
            debug!("missing Content-Length, using the default data buffer size");
        }
        debug!(bytes = capacity, "allocating data buffer");

        let phase = match stage {
            TemplateStage::Ready(template) => Phase::Body(template),
            stage => Phase::Template(stage),
        };
        Some(RenderFilter {
            phase,
            body: Some(AssemblyBuffer::for_body(capacity)),
            templates_check: config.templates_check,
            template_path,
        })
    }

    pub fn template_path(&self) -> &Path {
        &self.template_path
    }

    /// Whether a streamed template still has to be opened.
    pub fn needs_template(&self) -> bool {
        matches!(self.phase, Phase::Template(TemplateStage::Unopened(_)))
    }

    /// Read the streamed template and queue its bytes in front of `queue`.
    pub fn open_template(&mut self, queue: &mut ChunkQueue) -> Result<(), RenderError> {
        let Phase::Template(TemplateStage::Unopened(path)) = &self.phase else {
            return Ok(());
        };
        let path = path.clone();
        let bytes = fs::read(&path).map_err(|e| RenderError::io(&path, e))?;
        if bytes.is_empty() {
            let e = io::Error::new(io::ErrorKind::InvalidData, "template has zero size");
            return Err(RenderError::io(&path, e));
        }
        debug!(bytes = bytes.len(), "allocating template buffer");
        let buffer = AssemblyBuffer::for_prefix(bytes.len());
        queue.push_front(InputChunk::new(bytes));
        self.phase = Phase::Template(TemplateStage::Streaming { path, buffer });
        Ok(())
    }

    /// Expect a streamed template of `len` bytes at the head of the stream,
    /// delivered by the host itself.
    pub fn expect_template(&mut self, len: usize) {
        if let Phase::Template(TemplateStage::Unopened(path)) = &self.phase {
            let path = path.clone();
            self.phase = Phase::Template(TemplateStage::Streaming {
                path,
                buffer: AssemblyBuffer::for_prefix(len),
            });
        }
    }

    /// Body phase: consume one delivery.
    pub fn on_chunks(&mut self, renderer: &Renderer, queue: &mut ChunkQueue) -> FilterStep {
        match self.advance(renderer, queue) {
            Ok(Some(outcome)) => {
                self.phase = Phase::Finished;
                FilterStep::Done(outcome)
            }
            Ok(None) if matches!(self.phase, Phase::Finished) => FilterStep::Passthrough,
            Ok(None) => FilterStep::Pending,
            Err(e) => {
                self.phase = Phase::Finished;
                let report = ErrorReport::from(&e);
                error!(
                    template = %self.template_path.display(),
                    kind = ?report.kind,
                    "{}",
                    report.message
                );
                FilterStep::Failed(report)
            }
        }
    }

    fn advance(&mut self, renderer: &Renderer, queue: &mut ChunkQueue) -> Result<Option<RenderOutcome>, RenderError> {
        if let Phase::Template(stage) = &mut self.phase {
            let TemplateStage::Streaming { buffer, .. } = stage else {
                // The template was never opened; nothing can be assembled.
                let e = io::Error::new(io::ErrorKind::NotFound, "template was not opened");
                return Err(RenderError::io(&self.template_path, e));
            };
            debug!("filling template buffer");
            match buffer.feed(queue) {
                FeedStatus::NeedMore | FeedStatus::Filled => return Ok(None),
                FeedStatus::Overflow | FeedStatus::Truncated => {
                    return Err(RenderError::HeaderRejected(RejectKind::Truncated));
                }
                FeedStatus::Complete => {}
            }
            let Phase::Template(TemplateStage::Streaming { path, buffer }) =
                std::mem::replace(&mut self.phase, Phase::Finished)
            else {
                return Ok(None);
            };
            debug!(path = %path.display(), "template buffer filled");
            let template = Template::load(buffer.into_bytes(), self.templates_check)?;
            self.phase = Phase::Body(template);
            if queue.is_empty() {
                return Ok(None);
            }
        }

        let Phase::Body(template) = &self.phase else {
            return Ok(None);
        };
        let Some(body) = self.body.as_mut() else {
            return Ok(None);
        };
        debug!("filling data buffer");
        match body.feed(queue) {
            FeedStatus::NeedMore | FeedStatus::Filled => return Ok(None),
            FeedStatus::Overflow | FeedStatus::Truncated => {
                return Err(RenderError::BufferOverflow {
                    capacity: body.capacity(),
                });
            }
            FeedStatus::Complete => {}
        }
        debug!(bytes = body.len(), "data buffer filled");

        let template = template.clone();
        let body = self.body.take().map(AssemblyBuffer::into_bytes).unwrap_or_default();
        let outcome = renderer.render_into_buffer(&template, body)?;
        debug!(bytes = outcome.total(), "templating done");
        Ok(Some(outcome))
    }
}
