use std::fs;
use std::path::Path;
use std::process::Command;

/// Run the ctpp CLI and return (stdout, stderr, exit_code)
fn run_ctpp(args: &[&str]) -> (String, String, i32) {
    let output = Command::new(env!("CARGO_BIN_EXE_ctpp"))
        .args(args)
        .output()
        .expect("failed to execute ctpp");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let exit_code = output.status.code().unwrap_or(-1);

    (stdout, stderr, exit_code)
}

/// Assemble one `.tasm` file and render it with the `.json` next to it
fn run_snapshot_test(tasm_path: &Path, work_dir: &Path) {
    let base_path = tasm_path.with_extension("");
    let name = base_path.file_name().unwrap().to_string_lossy().to_string();

    let image_path = work_dir.join(format!("{}.ct2", name));
    let (_, asm_stderr, asm_exit) = run_ctpp(&[
        "asm",
        tasm_path.to_str().unwrap(),
        "-o",
        image_path.to_str().unwrap(),
    ]);
    assert_eq!(asm_exit, 0, "assembling {:?} failed:\n{}", tasm_path, asm_stderr);

    let data_path = base_path.with_extension("json");
    let mut args: Vec<String> = vec![
        "render".to_string(),
        image_path.to_string_lossy().to_string(),
        data_path.to_string_lossy().to_string(),
    ];

    // Check for .args file with extra CLI arguments
    let args_path = base_path.with_extension("args");
    if args_path.exists() {
        let args_content = fs::read_to_string(&args_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", args_path, e));
        for arg in args_content.lines() {
            let arg = arg.trim();
            if !arg.is_empty() && !arg.starts_with('#') {
                args.push(arg.to_string());
            }
        }
    }

    let args_refs: Vec<&str> = args.iter().map(|s| s.as_str()).collect();
    let (actual_stdout, actual_stderr, actual_exitcode) = run_ctpp(&args_refs);

    // Check stdout (exact match)
    let stdout_path = base_path.with_extension("stdout");
    if stdout_path.exists() {
        let expected_stdout = fs::read_to_string(&stdout_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", stdout_path, e));
        assert_eq!(
            actual_stdout, expected_stdout,
            "stdout mismatch for {:?}\n--- expected ---\n{}\n--- actual ---\n{}\n--- stderr ---\n{}",
            tasm_path, expected_stdout, actual_stdout, actual_stderr
        );
    }

    // Check stderr (partial match - expected must be contained in actual)
    let stderr_path = base_path.with_extension("stderr");
    if stderr_path.exists() {
        let expected_stderr = fs::read_to_string(&stderr_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", stderr_path, e));
        assert!(
            actual_stderr.contains(&expected_stderr),
            "stderr mismatch for {:?}\n--- expected (substring) ---\n{}\n--- actual ---\n{}",
            tasm_path, expected_stderr, actual_stderr
        );
    }

    // Check exit code (default: 0)
    let exitcode_path = base_path.with_extension("exitcode");
    let expected_exitcode = if exitcode_path.exists() {
        fs::read_to_string(&exitcode_path)
            .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", exitcode_path, e))
            .trim()
            .parse::<i32>()
            .unwrap_or_else(|e| panic!("Invalid exitcode in {:?}: {}", exitcode_path, e))
    } else {
        0
    };

    assert_eq!(
        actual_exitcode, expected_exitcode,
        "exit code mismatch for {:?}: expected {}, got {}\n{}",
        tasm_path, expected_exitcode, actual_exitcode, actual_stderr
    );
}

/// Discover and run all `.tasm` tests in a directory
fn run_snapshot_dir(dir: &str) {
    let dir_path = Path::new(env!("CARGO_MANIFEST_DIR"))
        .join("tests")
        .join("snapshots")
        .join(dir);

    if !dir_path.exists() {
        return;
    }

    let work_dir = tempfile::tempdir().unwrap();
    let mut entries: Vec<_> = fs::read_dir(&dir_path)
        .unwrap_or_else(|e| panic!("Failed to read {:?}: {}", dir_path, e))
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|path| path.extension().is_some_and(|ext| ext == "tasm"))
        .collect();
    entries.sort();
    assert!(!entries.is_empty(), "no snapshots in {:?}", dir_path);

    for path in entries {
        run_snapshot_test(&path, work_dir.path());
    }
}

#[test]
fn snapshot_basic() {
    run_snapshot_dir("basic");
}

#[test]
fn snapshot_errors() {
    run_snapshot_dir("errors");
}
