use ctpp_render::config::EngineConfig;
use ctpp_render::render::Renderer;
use ctpp_render::template::{Template, asm};
use serde::Serialize;
use std::time::Instant;

const ITERATIONS: u32 = 200;

#[derive(Serialize)]
struct BenchmarkResult {
    name: String,
    iterations: u32,
    total_secs: f64,
    per_iter_micros: f64,
    output_bytes: usize,
}

#[derive(Serialize)]
struct BenchmarkOutput {
    results: Vec<BenchmarkResult>,
}

const LIST: &str = r#"
    EMIT_STR "<ul>\n"
    PUSH_INT 0
loop:
    DUP
    PUSH_VAR "items"
    SIZE
    LT
    JMP_IF_FALSE done
    DUP
    PUSH_VAR "items"
    SWAP
    INDEX
    PUSH_SCOPE
    EMIT_STR "  <li>"
    PUSH_VAR "title"
    SYSCALL htmlescape 1
    EMIT
    EMIT_STR " "
    PUSH_VAR "price"
    SYSCALL numformat 1
    EMIT
    EMIT_STR "</li>\n"
    POP_SCOPE
    PUSH_INT 1
    ADD
    JMP loop
done:
    POP
    EMIT_STR "</ul>\n"
    HLT
"#;

fn catalogue(items: usize) -> Vec<u8> {
    let items: Vec<serde_json::Value> = (0..items)
        .map(|i| {
            serde_json::json!({
                "title": format!("Item <{}> & co", i),
                "price": i as f64 * 1.25,
            })
        })
        .collect();
    serde_json::to_vec(&serde_json::json!({ "items": items })).unwrap_or_default()
}

fn time<F>(name: &str, mut f: F) -> BenchmarkResult
where
    F: FnMut() -> usize,
{
    let mut output_bytes = f();
    let start = Instant::now();
    for _ in 0..ITERATIONS {
        output_bytes = f();
    }
    let total_secs = start.elapsed().as_secs_f64();
    BenchmarkResult {
        name: name.to_string(),
        iterations: ITERATIONS,
        total_secs,
        per_iter_micros: total_secs * 1e6 / ITERATIONS as f64,
        output_bytes,
    }
}

fn main() {
    let engine = EngineConfig {
        steps_limit: 100_000_000,
        ..Default::default()
    };
    let renderer = match Renderer::new(&engine) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("failed to set up renderer: {}", e);
            std::process::exit(1);
        }
    };
    let image = match asm::assemble(LIST) {
        Ok(image) => image,
        Err(e) => {
            eprintln!("failed to assemble benchmark template: {}", e);
            std::process::exit(1);
        }
    };
    let template = match Template::load(image.clone(), true) {
        Ok(t) => t,
        Err(e) => {
            eprintln!("benchmark template rejected: {}", e);
            std::process::exit(1);
        }
    };

    let mut results = Vec::new();

    results.push(time("assemble", || {
        asm::assemble(LIST).map(|image| image.len()).unwrap_or(0)
    }));

    results.push(time("load_with_crc", || {
        Template::load(image.clone(), true)
            .map(|t| t.program().code().len())
            .unwrap_or(0)
    }));

    for items in [10, 1_000, 10_000] {
        let body = catalogue(items);

        results.push(time(&format!("parse_{}", items), || {
            ctpp_render::data::parse(&body).map(|_| body.len()).unwrap_or(0)
        }));

        results.push(time(&format!("render_{}", items), || match renderer.render(&template, &body) {
            Ok(outcome) => outcome.total(),
            Err(e) => {
                eprintln!("render_{} failed: {}", items, e);
                0
            }
        }));
    }

    let output = BenchmarkOutput { results };
    match serde_json::to_string_pretty(&output) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("failed to serialize results: {}", e),
    }
}
