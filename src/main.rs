use clap::{Parser, Subcommand, ValueEnum};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing_subscriber::filter::EnvFilter;

use ctpp_render::assembler::{ChunkQueue, InputChunk};
use ctpp_render::config::Config;
use ctpp_render::error::{ErrorReport, RenderError};
use ctpp_render::filter::{FilterStep, Location, RenderFilter, ResponseHead};
use ctpp_render::render::{RenderOutcome, Renderer};
use ctpp_render::template::{self, Header, Template, TemplateCache, asm, dump};

#[derive(Debug, Clone, Copy, ValueEnum, Default, PartialEq, Eq)]
pub enum ReportFormat {
    #[default]
    Human,
    Json,
}

#[derive(Parser)]
#[command(name = "ctpp")]
#[command(about = "Render compiled CTPP2 templates against JSON data", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Render a template with JSON data
    Render {
        /// Compiled template
        template: PathBuf,

        /// JSON data file (defaults to stdin)
        data: Option<PathBuf>,

        /// Configuration file
        #[arg(long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Verify the template CRC before rendering
        #[arg(long)]
        check_crc: bool,

        /// Deliver the data in chunks of this many bytes
        #[arg(long, default_value = "4096")]
        chunk_size: usize,

        /// Body buffer size, as if the response had no Content-Length
        #[arg(long)]
        buffer_size: Option<usize>,

        /// Error report format (human, json)
        #[arg(long, value_enum, default_value = "human")]
        report: ReportFormat,
    },
    /// Validate a template without running it
    Check {
        /// Compiled template
        template: PathBuf,

        /// Verify the CRC as well
        #[arg(long)]
        crc: bool,
    },
    /// Disassemble a template
    Dump {
        /// Compiled template
        template: PathBuf,
    },
    /// Assemble a template from its text form
    Asm {
        /// Assembly source
        source: PathBuf,

        /// Output file
        #[arg(short, long)]
        output: PathBuf,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(io::stderr)
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Render {
            template,
            data,
            config,
            check_crc,
            chunk_size,
            buffer_size,
            report,
        } => {
            let options = RenderOptions {
                template,
                data,
                config,
                check_crc,
                chunk_size,
                buffer_size,
            };
            match render(&options) {
                Ok(outcome) => {
                    if let RenderOutcome::Content(chain) = outcome {
                        if let Err(e) = chain.write_to(&mut io::stdout().lock()) {
                            eprintln!("error: {}", e);
                            return ExitCode::FAILURE;
                        }
                    }
                }
                Err(Failure::Render(r)) => {
                    print_report(&r, report);
                    return ExitCode::FAILURE;
                }
                Err(Failure::Setup(message)) => {
                    eprintln!("error: {}", message);
                    return ExitCode::FAILURE;
                }
            }
        }
        Commands::Check { template, crc } => {
            if let Err(e) = check(&template, crc) {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        }
        Commands::Dump { template } => match Template::load_file(&template, false) {
            Ok(t) => print!("{}", dump::format_program(t.program(), Some(t.header()))),
            Err(e) => {
                eprintln!("error: {}", e);
                return ExitCode::FAILURE;
            }
        },
        Commands::Asm { source, output } => {
            if let Err(e) = assemble(&source, &output) {
                eprintln!("{}", e);
                return ExitCode::FAILURE;
            }
        }
    }

    ExitCode::SUCCESS
}

struct RenderOptions {
    template: PathBuf,
    data: Option<PathBuf>,
    config: Option<PathBuf>,
    check_crc: bool,
    chunk_size: usize,
    buffer_size: Option<usize>,
}

enum Failure {
    /// Configuration or input problems, reported as plain text.
    Setup(String),
    Render(ErrorReport),
}

impl From<RenderError> for Failure {
    fn from(e: RenderError) -> Self {
        Failure::Render(ErrorReport::from(&e))
    }
}

/// Drive one render the way a server response would: the template streamed
/// ahead of the body, the body delivered in chunks.
fn render(options: &RenderOptions) -> Result<RenderOutcome, Failure> {
    let mut config = match &options.config {
        Some(path) => Config::load(path).map_err(|e| Failure::Setup(e.to_string()))?,
        None => Config::default(),
    };
    let body = read_data(options.data.as_deref())?;
    // Relative names would otherwise resolve against `templates_root`.
    let template_path =
        std::path::absolute(&options.template).map_err(|e| Failure::from(RenderError::io(&options.template, e)))?;

    let location_config = &mut config.location;
    location_config.enabled = true;
    location_config.template = Some(template_path.display().to_string());
    location_config.templates_check |= options.check_crc;
    if let Some(size) = options.buffer_size {
        location_config.data_buffer = size;
    }
    let location = Location::setup(config.location.clone(), &mut TemplateCache::new())?;
    let renderer = Renderer::new(&config.engine).map_err(|e| Failure::Setup(e.to_string()))?;

    let head = ResponseHead {
        content_length: if options.buffer_size.is_some() {
            None
        } else {
            Some(body.len())
        },
        ..Default::default()
    };
    let Some(mut filter) = RenderFilter::on_headers(&location, &head) else {
        return Err(Failure::Setup("template is not configured".to_string()));
    };

    let mut queue = ChunkQueue::new();
    if filter.needs_template() {
        filter.open_template(&mut queue)?;
    }

    let chunk_size = options.chunk_size.max(1);
    let mut deliveries: Vec<InputChunk> = body.chunks(chunk_size).map(InputChunk::new).collect();
    match deliveries.pop() {
        Some(tail) => deliveries.push(InputChunk::last(tail.remaining())),
        None => deliveries.push(InputChunk::end_of_stream()),
    }

    for chunk in deliveries {
        queue.push(chunk);
        match filter.on_chunks(&renderer, &mut queue) {
            FilterStep::Pending => continue,
            FilterStep::Done(outcome) => return Ok(outcome),
            FilterStep::Failed(report) => return Err(Failure::Render(report)),
            FilterStep::Passthrough => break,
        }
    }
    Err(Failure::Setup("data ended before the render completed".to_string()))
}

fn read_data(path: Option<&Path>) -> Result<Vec<u8>, Failure> {
    match path {
        Some(path) => std::fs::read(path).map_err(|e| Failure::from(RenderError::io(path, e))),
        None => {
            let mut buf = Vec::new();
            io::stdin()
                .read_to_end(&mut buf)
                .map_err(|e| Failure::from(RenderError::io("<stdin>", e)))?;
            Ok(buf)
        }
    }
}

fn print_report(report: &ErrorReport, format: ReportFormat) {
    match format {
        ReportFormat::Human => {
            eprintln!("error: {}", report.message);
            if let Some(location) = &report.location {
                eprintln!("  --> {}", location);
            }
        }
        ReportFormat::Json => eprintln!("{}", report.to_json()),
    }
}

fn check(path: &Path, crc: bool) -> Result<(), RenderError> {
    let bytes = std::fs::read(path).map_err(|e| RenderError::io(path, e))?;
    let header = template::inspect(&bytes, crc)?;
    let t = Template::load(bytes, false)?;
    write_summary(&mut io::stdout().lock(), path, &header, &t, crc)
        .map_err(|e| RenderError::io("<stdout>", e))
}

fn write_summary(
    out: &mut impl Write,
    path: &Path,
    header: &Header,
    t: &Template,
    crc: bool,
) -> io::Result<()> {
    let program = t.program();
    let [major, minor, patch, _] = header.version;
    writeln!(out, "{}: ok", path.display())?;
    writeln!(out, "  version   {}.{}.{}", major, minor, patch)?;
    writeln!(
        out,
        "  crc       {:#010x} ({})",
        header.crc,
        if crc { "verified" } else { "not checked" }
    )?;
    writeln!(out, "  entry     {}", header.entry_point)?;
    writeln!(out, "  code      {} instructions", program.code().len())?;
    writeln!(out, "  strings   {}", program.strings().len())?;
    writeln!(out, "  syscalls  {}", program.syscalls().len())?;
    writeln!(out, "  blocks    {}", program.blocks().count())?;
    Ok(())
}

fn assemble(source: &Path, output: &Path) -> Result<(), String> {
    let text = std::fs::read_to_string(source)
        .map_err(|e| format!("error: failed to read {}: {}", source.display(), e))?;
    let image = asm::assemble(&text).map_err(|e| format!("{}:{}", source.display(), e))?;
    std::fs::write(output, &image)
        .map_err(|e| format!("error: failed to write {}: {}", output.display(), e))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ctpp_render::template::ProgramBuilder;

    struct ClosedPipe;

    impl Write for ClosedPipe {
        fn write(&mut self, _: &[u8]) -> io::Result<usize> {
            Err(io::Error::from(io::ErrorKind::BrokenPipe))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    fn hello() -> Template {
        let mut b = ProgramBuilder::new();
        b.emit_str("hello");
        b.halt();
        Template::load(b.build(), true).unwrap()
    }

    #[test]
    fn test_summary_lists_segments() {
        let t = hello();
        let mut out: Vec<u8> = Vec::new();
        write_summary(&mut out, Path::new("hello.ct2"), t.header(), &t, true).unwrap();
        let text = String::from_utf8(out).unwrap();
        assert!(text.starts_with("hello.ct2: ok\n"));
        assert!(text.contains("(verified)"));
        assert!(text.contains("code      2 instructions"));
    }

    #[test]
    fn test_summary_write_errors_propagate() {
        let t = hello();
        let err = write_summary(&mut ClosedPipe, Path::new("hello.ct2"), t.header(), &t, false).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::BrokenPipe);
    }
}
