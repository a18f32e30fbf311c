//! E2E Integration tests for gitprune
//!
//! Run with: cargo test --test integration
//! Verbose:  TEST_VERBOSE=1 cargo test --test integration -- --nocapture

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};
use tempfile::TempDir;

/// Test logging macro - prints when TEST_VERBOSE is set
macro_rules! test_log {
    ($level:expr, $($arg:tt)*) => {
        if std::env::var("TEST_VERBOSE").is_ok() {
            eprintln!("[{}] [integration:{}] {}",
                $level,
                line!(),
                format!($($arg)*)
            );
        }
    };
}

const NODE_TEMPLATE: &str = "# Logs
logs
*.log
npm-debug.log*

# Node dependencies
node_modules/

# dotenv environment variable files
.env
";

fn get_binary_path() -> PathBuf {
    if let Some(bin_path) = option_env!("CARGO_BIN_EXE_gitprune") {
        let path = PathBuf::from(bin_path);
        if path.exists() {
            return path;
        }
    }

    let manifest_dir = env!("CARGO_MANIFEST_DIR");
    let release_path = PathBuf::from(manifest_dir).join("target/release/gitprune");
    let debug_path = PathBuf::from(manifest_dir).join("target/debug/gitprune");

    if let Ok(target_dir) = std::env::var("CARGO_TARGET_DIR") {
        let custom_release = PathBuf::from(&target_dir).join("release/gitprune");
        let custom_debug = PathBuf::from(&target_dir).join("debug/gitprune");
        if custom_release.exists() {
            return custom_release;
        }
        if custom_debug.exists() {
            return custom_debug;
        }
    }

    if release_path.exists() {
        release_path
    } else if debug_path.exists() {
        debug_path
    } else {
        panic!(
            "gitprune binary not found. Run 'cargo build' or 'cargo build --release' first.\n\
             Looked in:\n  - {}\n  - {}",
            release_path.display(),
            debug_path.display()
        );
    }
}

fn run_gitprune(args: &[&str], stdin: Option<&str>) -> (String, String, i32) {
    test_log!("RUN", "gitprune with args: {:?}", args);

    let binary = get_binary_path();
    let mut child = Command::new(&binary)
        .arg("--no-config")
        .arg("--color")
        .arg("never")
        .args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("Failed to spawn gitprune");

    if let Some(mut pipe) = child.stdin.take() {
        if let Some(input) = stdin {
            pipe.write_all(input.as_bytes())
                .expect("Failed to write to stdin");
        }
    }

    let output = child.wait_with_output().expect("Failed to wait on gitprune");

    let stdout = String::from_utf8_lossy(&output.stdout).to_string();
    let stderr = String::from_utf8_lossy(&output.stderr).to_string();
    let code = output.status.code().unwrap_or(-1);

    test_log!("OUTPUT", "Exit code: {}", code);
    if !stderr.is_empty() {
        test_log!("STDERR", "{}", stderr);
    }

    (stdout, stderr, code)
}

/// Write template and project files into a fresh temp dir
fn write_inputs(template: &str, project: &str) -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().unwrap();
    let template_path = temp.path().join("Node.gitignore");
    let project_path = temp.path().join(".gitignore");
    fs::write(&template_path, template).unwrap();
    fs::write(&project_path, project).unwrap();
    (temp, template_path, project_path)
}

fn arg(path: &Path) -> &str {
    path.to_str().unwrap()
}

/// Poll `path` until its content satisfies `check` or the timeout passes
fn wait_for_content(path: &Path, timeout: Duration, check: impl Fn(&str) -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if let Ok(content) = fs::read_to_string(path) {
            if check(&content) {
                return true;
            }
        }
        thread::sleep(Duration::from_millis(50));
    }
    false
}

// ============================================================================
// Basic Functionality Tests
// ============================================================================

#[test]
fn test_e2e_basic_merge() {
    test_log!("START", "Basic append merge");

    let (_temp, template, project) = write_inputs("# Logs\n*.log\n", "*.log\nnode_modules/\n");
    let (stdout, _stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 0, "Should exit successfully");
    assert_eq!(
        stdout,
        "# Logs\n*.log\n\n\n# Project-specific entries\n\nnode_modules/\n"
    );

    test_log!("END", "Test PASSED");
}

#[test]
fn test_e2e_nothing_new_passes_template_through() {
    let (_temp, template, project) = write_inputs(NODE_TEMPLATE, "# mine\nnode_modules/\n  .env\n");
    let (stdout, _stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert_eq!(stdout, NODE_TEMPLATE, "Template should pass through unchanged");
}

#[test]
fn test_e2e_project_from_stdin() {
    let (_temp, template, _project) = write_inputs("*.log\n", "unused\n");
    let (stdout, _stderr, code) = run_gitprune(&[arg(&template), "-"], Some("*.log\ndist/\n"));

    assert_eq!(code, 0);
    assert!(stdout.ends_with("# Project-specific entries\n\ndist/\n"));
}

#[test]
fn test_e2e_template_from_stdin() {
    let (_temp, _template, project) = write_inputs("unused\n", "coverage/\n");
    let (stdout, _stderr, code) = run_gitprune(&["-", arg(&project)], Some("*.log\n"));

    assert_eq!(code, 0);
    assert!(stdout.starts_with("*.log\n"));
    assert!(stdout.contains("coverage/"));
}

#[test]
fn test_e2e_remerge_is_idempotent() {
    let project = "# local\n*.log\ntmp/\n";
    let (temp, template, project_path) = write_inputs(NODE_TEMPLATE, project);

    let (first, _stderr, code) = run_gitprune(&[arg(&template), arg(&project_path)], None);
    assert_eq!(code, 0);

    let merged = temp.path().join("merged.gitignore");
    fs::write(&merged, &first).unwrap();

    let (second, _stderr, code) = run_gitprune(&[arg(&merged), arg(&project_path)], None);
    assert_eq!(code, 0);
    assert_eq!(first, second, "Second merge should add nothing");
}

// ============================================================================
// Policy Tests
// ============================================================================

#[test]
fn test_e2e_loose_policy() {
    let (_temp, template, project) = write_inputs("node_modules/\n", "node_modules\nNODE_MODULES/\n");

    let (stdout, _stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);
    assert_eq!(code, 0);
    assert!(stdout.contains("# Project-specific entries"), "Exact keeps variants");

    let (stdout, _stderr, code) =
        run_gitprune(&["--policy", "loose", arg(&template), arg(&project)], None);
    assert_eq!(code, 0);
    assert_eq!(stdout, "node_modules/\n", "Loose drops variants");
}

#[test]
fn test_e2e_section_placement() {
    let (_temp, template, project) = write_inputs(NODE_TEMPLATE, "yarn-error.log\nsecrets.txt\n");
    let (stdout, _stderr, code) = run_gitprune(
        &["--placement", "section", arg(&template), arg(&project)],
        None,
    );

    assert_eq!(code, 0);
    assert!(
        stdout.starts_with("# Logs\nlogs\n*.log\nnpm-debug.log*\nyarn-error.log\n\n# Node dependencies"),
        "Log entry should join the Logs section, got:\n{}",
        stdout
    );
    assert!(stdout.ends_with("# Project-specific entries\nsecrets.txt\n"));
}

#[test]
fn test_e2e_section_placement_loose_env_entry() {
    let (_temp, template, project) = write_inputs(NODE_TEMPLATE, ".env.production\nNODE_MODULES\n");
    let (stdout, _stderr, code) = run_gitprune(
        &[
            "--placement",
            "section",
            "--policy",
            "loose",
            arg(&template),
            arg(&project),
        ],
        None,
    );

    assert_eq!(code, 0);
    assert_eq!(stdout, format!("{}.env.production\n", NODE_TEMPLATE));
    assert!(!stdout.contains("# Project-specific entries"));
}

#[test]
fn test_e2e_repeated_project_entries_are_kept() {
    let (_temp, template, project) = write_inputs("*.log\n", "tmp/\ntmp/\n");
    let (stdout, _stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert_eq!(stdout, "*.log\n\n\n# Project-specific entries\n\ntmp/\ntmp/\n");
}

#[test]
fn test_e2e_custom_heading() {
    let (_temp, template, project) = write_inputs("a\n", "b\n");
    let (stdout, _stderr, code) = run_gitprune(
        &["--heading", "# Local additions", arg(&template), arg(&project)],
        None,
    );

    assert_eq!(code, 0);
    assert_eq!(stdout, "a\n\n\n# Local additions\n\nb\n");
}

// ============================================================================
// Output Mode Tests
// ============================================================================

#[test]
fn test_e2e_output_file() {
    let (temp, template, project) = write_inputs("*.log\n", "dist/\n");
    let out = temp.path().join("out.gitignore");

    let (stdout, _stderr, code) =
        run_gitprune(&["-o", arg(&out), arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert!(stdout.is_empty());
    assert_eq!(
        fs::read_to_string(&out).unwrap(),
        "*.log\n\n\n# Project-specific entries\n\ndist/\n"
    );
}

#[test]
fn test_e2e_in_place_with_backup() {
    let (_temp, template, project) = write_inputs("*.log\n", "dist/\n");

    let (_stdout, _stderr, code) = run_gitprune(
        &["-i", "--backup", arg(&template), arg(&project)],
        None,
    );

    assert_eq!(code, 0);
    let merged = fs::read_to_string(&template).unwrap();
    assert!(merged.ends_with("dist/\n"));

    let mut backup = template.as_os_str().to_owned();
    backup.push(".bak");
    assert_eq!(fs::read_to_string(PathBuf::from(backup)).unwrap(), "*.log\n");
}

#[test]
fn test_e2e_diff_mode() {
    let (_temp, template, project) = write_inputs("*.log\n", "dist/\n");
    let (stdout, _stderr, code) = run_gitprune(&["-d", arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert!(stdout.contains("--- a/"));
    assert!(stdout.contains("(merged)"));
    assert!(stdout.contains("+# Project-specific entries"));
    assert!(stdout.contains("+dist/"));
}

#[test]
fn test_e2e_diff_mode_no_changes() {
    let (_temp, template, project) = write_inputs("*.log\n", "*.log\n");
    let (stdout, _stderr, code) = run_gitprune(&["-d", arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert!(stdout.is_empty(), "No diff when nothing is added");
}

#[test]
fn test_e2e_json_output() {
    let (_temp, template, project) = write_inputs("# Logs\n*.log\n", "*.log\nnode_modules/\n");
    let (stdout, _stderr, code) =
        run_gitprune(&["--json", arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    let value: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert_eq!(value["status"], "success");
    assert_eq!(value["new_entries"], serde_json::json!(["node_modules/"]));
    assert_eq!(value["output"]["changed"], true);
    assert_eq!(
        value["content"],
        "# Logs\n*.log\n\n\n# Project-specific entries\n\nnode_modules/\n"
    );
}

#[test]
fn test_e2e_highlight_marks_new_entries() {
    let (_temp, template, project) = write_inputs("*.log\n", "*.pyc\n");
    let (stdout, _stderr, code) = run_gitprune(&["-H", arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert!(stdout.contains("1 new entry"), "got:\n{}", stdout);
    assert!(stdout.contains("+ *.pyc"), "got:\n{}", stdout);
    assert!(stdout.contains("  *.log"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn test_e2e_exit_code_dry_run_would_change() {
    let (_temp, template, project) = write_inputs("*.log\n", "*.log\ndist/\n");
    let (stdout, _stderr, code) = run_gitprune(&["-n", arg(&template), arg(&project)], None);

    assert_eq!(code, 3, "Dry run with new entries exits 3");
    assert_eq!(stdout, "dist/\n");
    assert_eq!(fs::read_to_string(&template).unwrap(), "*.log\n");
}

#[test]
fn test_e2e_exit_code_dry_run_no_changes() {
    let (_temp, template, project) = write_inputs("*.log\n", "*.log\n");
    let (stdout, _stderr, code) = run_gitprune(&["-n", arg(&template), arg(&project)], None);

    assert_eq!(code, 0);
    assert!(stdout.is_empty());
}

#[test]
fn test_e2e_exit_code_both_empty() {
    let (_temp, template, project) = write_inputs("", "\n  \n");
    let (stdout, stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 5, "Validation errors exit 5");
    assert!(stdout.is_empty());
    assert!(stderr.contains("Both inputs cannot be empty"), "stderr: {}", stderr);
}

#[test]
fn test_e2e_exit_code_empty_template() {
    let (_temp, template, project) = write_inputs("   \n", "dist/\n");
    let (_stdout, stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 5);
    assert!(stderr.contains("Template cannot be empty"));
}

#[test]
fn test_e2e_exit_code_empty_project_leaves_output_untouched() {
    let (temp, template, project) = write_inputs("*.log\n", "");
    let out = temp.path().join("out.gitignore");
    fs::write(&out, "previous result\n").unwrap();

    let (_stdout, stderr, code) =
        run_gitprune(&["-o", arg(&out), arg(&template), arg(&project)], None);

    assert_eq!(code, 5);
    assert!(stderr.contains("Project ignore file cannot be empty"));
    assert_eq!(fs::read_to_string(&out).unwrap(), "previous result\n");
}

#[test]
fn test_e2e_exit_code_missing_project_arg() {
    let (_temp, template, _project) = write_inputs("*.log\n", "x\n");
    let (_stdout, stderr, code) = run_gitprune(&[arg(&template)], None);

    assert_eq!(code, 2);
    assert!(stderr.contains("PROJECT"));
}

#[test]
fn test_e2e_exit_code_nonexistent_file() {
    let (_stdout, stderr, code) =
        run_gitprune(&["/nonexistent/template", "/nonexistent/project"], None);

    assert_eq!(code, 1);
    assert!(stderr.contains("Error:"));
}

#[test]
fn test_e2e_exit_code_binary_input() {
    let temp = TempDir::new().unwrap();
    let template = temp.path().join("template");
    let project = temp.path().join("project");
    fs::write(&template, "*.log\n").unwrap();
    fs::write(&project, [b'a', 0, b'b']).unwrap();

    let (_stdout, stderr, code) = run_gitprune(&[arg(&template), arg(&project)], None);

    assert_eq!(code, 4);
    assert!(stderr.contains("binary"));
}

#[test]
fn test_e2e_exit_code_invalid_heading() {
    let (_temp, template, project) = write_inputs("a\n", "b\n");
    let (_stdout, _stderr, code) =
        run_gitprune(&["--heading", "Extras", arg(&template), arg(&project)], None);

    assert_eq!(code, 2);
}

// ============================================================================
// Config Tests
// ============================================================================

#[test]
fn test_e2e_explicit_config_file() {
    let (temp, template, project) = write_inputs("node_modules/\n", "node_modules\nbuild/\n");
    let config = temp.path().join("gitprune.toml");
    fs::write(&config, "policy = \"loose\"\nheading = \"# Extras\"\n").unwrap();

    let output = Command::new(get_binary_path())
        .args(["--config", arg(&config), arg(&template), arg(&project)])
        .output()
        .expect("Failed to run gitprune");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(
        String::from_utf8_lossy(&output.stdout),
        "node_modules/\n\n\n# Extras\n\nbuild/\n"
    );
}

#[test]
fn test_e2e_config_heading_without_hash_is_rejected() {
    let (temp, template, project) = write_inputs("a\n", "b\n");
    let config = temp.path().join("gitprune.toml");
    fs::write(&config, "heading = \"Extras\"\n").unwrap();

    let output = Command::new(get_binary_path())
        .args(["--config", arg(&config), arg(&template), arg(&project)])
        .output()
        .expect("Failed to run gitprune");

    assert_eq!(output.status.code(), Some(2));
    assert!(output.stdout.is_empty());
}

// ============================================================================
// Watch Mode Tests
// ============================================================================

#[test]
fn test_e2e_watch_merges_last_edit_of_a_burst() {
    let (temp, template, project) = write_inputs("*.log\n", "first/\n");
    let output = temp.path().join("merged.gitignore");

    let mut child = Command::new(get_binary_path())
        .args([
            "--no-config",
            "--color",
            "never",
            "-w",
            "--debounce-ms",
            "300",
            "-o",
            arg(&output),
            arg(&template),
            arg(&project),
        ])
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .spawn()
        .expect("Failed to spawn gitprune");

    let initial = wait_for_content(&output, Duration::from_secs(10), |c| c.contains("first/"));

    // Two edits inside one debounce window
    fs::write(&project, "second/\n").unwrap();
    thread::sleep(Duration::from_millis(50));
    fs::write(&project, "third/\n").unwrap();

    let settled = wait_for_content(&output, Duration::from_secs(10), |c| c.contains("third/"));

    let _ = child.kill();
    let _ = child.wait();

    assert!(initial, "initial merge was never written");
    assert!(settled, "last edit was never merged");
    test_log!("WATCH", "final output:\n{}", fs::read_to_string(&output).unwrap());
}
