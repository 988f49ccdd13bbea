use std::path::{Path, PathBuf};
use std::process::Command;

struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    fn new() -> Self {
        Workspace {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    fn write(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.dir.path().join(name);
        std::fs::write(&path, contents).unwrap();
        path
    }

    /// Assemble `source` through the CLI and return the image path.
    fn assemble(&self, name: &str, source: &str) -> PathBuf {
        let src = self.write(&format!("{}.tasm", name), source.as_bytes());
        let out = self.dir.path().join(format!("{}.ct2", name));
        let (_, stderr, success) = run_ctpp(&[
            "asm",
            src.to_str().unwrap(),
            "-o",
            out.to_str().unwrap(),
        ]);
        assert!(success, "asm failed:\n{}", stderr);
        out
    }
}

fn run_ctpp(args: &[&str]) -> (String, String, bool) {
    let output = Command::new(env!("CARGO_BIN_EXE_ctpp"))
        .args(args)
        .output()
        .expect("failed to execute ctpp");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    (stdout, stderr, output.status.success())
}

fn render(template: &Path, data: &Path, extra: &[&str]) -> (String, String, bool) {
    let mut args = vec!["render", template.to_str().unwrap(), data.to_str().unwrap()];
    args.extend_from_slice(extra);
    run_ctpp(&args)
}

const GREETING: &str = r#"
.file "greeting.tmpl"
.line 1
    EMIT_STR "Hello, "
    PUSH_VAR "user.name"
    SYSCALL htmlescape 1
    EMIT
    EMIT_STR "!\n"
    HLT
"#;

#[test]
fn test_render_from_file() {
    let ws = Workspace::new();
    let t = ws.assemble("greeting", GREETING);
    let data = ws.write("data.json", br#"{"user": {"name": "<Ann>"}}"#);

    let (stdout, stderr, success) = render(&t, &data, &[]);
    assert!(success, "stderr:\n{}", stderr);
    assert_eq!(stdout, "Hello, &lt;Ann&gt;!\n");
}

#[test]
fn test_render_from_stdin() {
    use std::io::Write;
    use std::process::Stdio;

    let ws = Workspace::new();
    let t = ws.assemble("greeting", GREETING);
    let mut child = Command::new(env!("CARGO_BIN_EXE_ctpp"))
        .args(["render", t.to_str().unwrap(), "--check-crc"])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .spawn()
        .expect("failed to execute ctpp");
    child
        .stdin
        .take()
        .unwrap()
        .write_all(br#"{"user": {"name": "Bob"}}"#)
        .unwrap();
    let output = child.wait_with_output().unwrap();
    assert!(output.status.success());
    assert_eq!(String::from_utf8_lossy(&output.stdout), "Hello, Bob!\n");
}

#[test]
fn test_config_steps_limit() {
    let ws = Workspace::new();
    let t = ws.assemble(
        "count",
        r#"
    PUSH_INT 0
top:
    PUSH_INT 1
    ADD
    DUP
    PUSH_INT 100
    LT
    JMP_IF_TRUE top
    EMIT
    HLT
"#,
    );
    let data = ws.write("data.json", b"{}");

    let (stdout, _, success) = render(&t, &data, &[]);
    assert!(success);
    assert_eq!(stdout, "100");

    let config = ws.write("ctpp.toml", b"[engine]\nsteps_limit = 50\n");
    let (stdout, stderr, success) = render(&t, &data, &["--config", config.to_str().unwrap()]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains("Execution limit of steps reached"), "stderr: {}", stderr);
}

#[test]
fn test_invalid_config() {
    let ws = Workspace::new();
    let t = ws.assemble("greeting", GREETING);
    let data = ws.write("data.json", b"{}");
    let config = ws.write("ctpp.toml", b"[engine]\narg_stack = 0\n");
    let (_, stderr, success) = render(&t, &data, &["--config", config.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("engine.arg_stack"), "stderr: {}", stderr);
}

#[test]
fn test_check_and_corruption() {
    let ws = Workspace::new();
    let t = ws.assemble("greeting", GREETING);

    let (stdout, stderr, success) = run_ctpp(&["check", t.to_str().unwrap(), "--crc"]);
    assert!(success, "stderr:\n{}", stderr);
    assert!(stdout.contains(": ok"));
    assert!(stdout.contains("verified"));

    let mut image = std::fs::read(&t).unwrap();
    let last = image.len() - 1;
    image[last] ^= 0xFF;
    let bad = ws.write("bad.ct2", &image);

    let (_, stderr, success) = run_ctpp(&["check", bad.to_str().unwrap(), "--crc"]);
    assert!(!success);
    assert!(stderr.contains("CRC checksum invalid"), "stderr: {}", stderr);

    // Rendering with the check enabled rejects before running anything.
    let data = ws.write("data.json", b"{}");
    let (stdout, stderr, success) = render(&bad, &data, &["--check-crc", "--report", "json"]);
    assert!(!success);
    assert!(stdout.is_empty());
    assert!(stderr.contains(r#""kind":"header_rejected""#), "stderr: {}", stderr);
}

#[test]
fn test_not_a_template() {
    let ws = Workspace::new();
    let bogus = ws.write("bogus.ct2", b"PK\x03\x04 definitely not a template, just some bytes here");
    let (_, stderr, success) = run_ctpp(&["check", bogus.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("not a compiled template"), "stderr: {}", stderr);
}

#[test]
fn test_dump() {
    let ws = Workspace::new();
    let t = ws.assemble("greeting", GREETING);
    let (stdout, _, success) = run_ctpp(&["dump", t.to_str().unwrap()]);
    assert!(success);
    assert!(stdout.contains("EMIT_STR"));
    assert!(stdout.contains("\"Hello, \""));
    assert!(stdout.contains("htmlescape"));
    assert!(stdout.contains("greeting.tmpl:1"));
}

#[test]
fn test_asm_error_location() {
    let ws = Workspace::new();
    let src = ws.write("broken.tasm", b"    EMIT_STR \"ok\"\n    FROB 1\n");
    let out = ws.dir.path().join("broken.ct2");
    let (_, stderr, success) = run_ctpp(&["asm", src.to_str().unwrap(), "-o", out.to_str().unwrap()]);
    assert!(!success);
    assert!(stderr.contains("broken.tasm:2:5"), "stderr: {}", stderr);
    assert!(stderr.contains("unknown instruction"));
    assert!(!out.exists());
}

#[test]
fn test_missing_template() {
    let ws = Workspace::new();
    let data = ws.write("data.json", b"{}");
    let (_, stderr, success) = render(Path::new("/nonexistent/page.ct2"), &data, &["--report", "json"]);
    assert!(!success);
    assert!(stderr.contains(r#""kind":"io""#), "stderr: {}", stderr);
    assert!(stderr.contains(r#""errno":2"#), "stderr: {}", stderr);
}
