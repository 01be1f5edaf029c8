//! End-to-end checks of the command-line surface, with stand-in benchmark tools
//! where a run has to get that far.

use serde_json::Value;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

/// A proxmark command with an isolated environment: no config file, no
/// inherited `PROXMARK_*` overrides.
fn isolated(home: &Path) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_proxmark"));
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("PROXMARK_") {
            cmd.env_remove(&key);
        }
    }
    cmd.env("HOME", home)
        .env("PROXMARK_CONFIG_PATH", home.join("absent.toml"))
        .env("NO_COLOR", "1")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    cmd
}

fn proxmark(args: &[&str], home: &Path) -> Output {
    isolated(home)
        .args(args)
        .output()
        .unwrap_or_else(|e| panic!("failed to run proxmark: {e}"))
}

const SYSBENCH_OK: &str = r#"#!/bin/sh
case "$1" in
  cpu)
    echo "CPU speed:"
    echo "    events per second:  1234.56"
    ;;
  memory)
    echo "Total operations: 1000000 (10000000.00 per second)"
    echo ""
    echo "102400.00 MiB transferred (9765.62 MiB/sec)"
    ;;
esac
"#;

const FIO_OK: &str = r#"#!/bin/sh
cat <<'JSON'
{ "jobs": [ { "jobname": "job",
  "read": { "bw": 102400, "iops": 25600, "clat_ns": { "mean": 1000.0 } },
  "write": { "bw": 51200, "iops": 12800, "clat_ns": { "mean": 2000.0 } } } ] }
JSON
"#;

const GARBLED: &str = "#!/bin/sh\necho 'Illegal instruction (core dumped)'\n";

/// Write stand-in `sysbench` and `fio` scripts into `dir/bin`.
fn fake_tools(dir: &Path, sysbench: &str, fio: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let bin = dir.join("bin");
    fs::create_dir_all(&bin).unwrap();
    for (name, script) in [("sysbench", sysbench), ("fio", fio)] {
        let path = bin.join(name);
        fs::write(&path, script).unwrap();
        fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    }
    bin
}

/// A short non-interactive `--json` run against `disk_path` with the fake
/// tools first on PATH.
fn benchmark_run(home: &Path, bin: &Path, disk_path: &Path, result: &Path) -> Output {
    let mut paths = vec![bin.to_path_buf()];
    if let Some(system) = std::env::var_os("PATH") {
        paths.extend(std::env::split_paths(&system));
    }
    let path = std::env::join_paths(paths).unwrap();

    isolated(home)
        .env("PATH", path)
        .args(["--json", "--no-upload", "--no-install", "--non-interactive"])
        .args(["--cpu-multi-time", "1", "--cpu-single-time", "1"])
        .args(["--memory-time", "1", "--disk-time", "1", "--disk-size", "1"])
        .arg("--disk-path")
        .arg(disk_path)
        .arg("--output")
        .arg(result)
        .output()
        .unwrap_or_else(|e| panic!("failed to run proxmark: {e}"))
}

fn parse_stdout(output: &Output) -> Value {
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(!stdout.contains('\u{1b}'), "ANSI codes on stdout: {stdout}");
    serde_json::from_str(stdout.trim())
        .unwrap_or_else(|e| panic!("stdout is not one JSON document ({e}): {stdout}"))
}

fn leftover_scratch_files(dir: &Path) -> Vec<String> {
    fs::read_dir(dir)
        .unwrap()
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .filter(|name| name.starts_with(".proxmark-"))
        .collect()
}

#[test]
fn unknown_flag_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let result = dir.path().join("result.json");
    let output = proxmark(
        &["--bogus-flag", "--output", result.to_str().unwrap()],
        dir.path(),
    );

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--bogus-flag"), "{stderr}");
    assert!(stderr.contains("Usage"), "{stderr}");
    assert!(output.stdout.is_empty());
    assert!(!result.exists());
}

#[test]
fn invalid_value_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = proxmark(&["--iperf", "nas:notaport"], dir.path());
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("invalid port"));
}

#[test]
fn help_exits_zero_without_benchmarking() {
    let dir = tempfile::tempdir().unwrap();
    let output = proxmark(&["--help"], dir.path());
    assert_eq!(output.status.code(), Some(0));
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--quick", "--json", "--disk-path", "--all-disks", "--iperf", "--tag"] {
        assert!(stdout.contains(flag), "help is missing {flag}");
    }
    assert!(!stdout.contains("--api-url"));
}

#[test]
fn version_exits_zero() {
    let dir = tempfile::tempdir().unwrap();
    let output = proxmark(&["--version"], dir.path());
    assert_eq!(output.status.code(), Some(0));
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn missing_tools_without_install_fail_before_writing_anything() {
    let dir = tempfile::tempdir().unwrap();
    let empty_path = dir.path().join("bin");
    std::fs::create_dir(&empty_path).unwrap();
    let result = dir.path().join("out").join("result.json");

    let mut cmd_args = vec!["--no-install", "--non-interactive", "--json", "--output"];
    let result_arg = result.to_str().unwrap().to_string();
    cmd_args.push(&result_arg);

    let output = Command::new(env!("CARGO_BIN_EXE_proxmark"))
        .args(&cmd_args)
        .env("PATH", &empty_path)
        .env("HOME", dir.path())
        .env("PROXMARK_CONFIG_PATH", dir.path().join("absent.toml"))
        .stdin(Stdio::null())
        .output()
        .unwrap();

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("sysbench"), "{stderr}");
    assert!(output.stdout.is_empty(), "stdout must stay clean in --json mode");
    assert!(!result.exists());
    assert!(!result.with_extension("log").exists());
}

#[test]
fn json_run_prints_the_result_document_once() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_tools(dir.path(), SYSBENCH_OK, FIO_OK);
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    let result = dir.path().join("out").join("result.json");

    let output = benchmark_run(dir.path(), &bin, &data, &result);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(0), "{stderr}");

    let printed = parse_stdout(&output);
    let written: Value = serde_json::from_str(&fs::read_to_string(&result).unwrap()).unwrap();
    assert_eq!(printed, written);
    assert_eq!(printed["benchmarks"]["cpu"]["multi_thread"]["events_per_sec"], 1234.56);
    assert_eq!(printed["benchmarks"]["memory"]["write_mb_s"], 9765.62);
    assert_eq!(printed["scores"]["cpu_multi"], 1235);
    assert_eq!(printed["scores"]["memory_latency"], 100_000);
    assert!(result.with_extension("log").exists());
    assert!(!result.with_extension("debug").exists());
    assert!(leftover_scratch_files(&data).is_empty());
}

#[test]
fn ram_backed_path_switches_to_sync_engine() {
    let shm = Path::new("/dev/shm");
    if !shm.is_dir() {
        eprintln!("skipping: /dev/shm is not available");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let target = tempfile::tempdir_in(shm).unwrap();
    let bin = fake_tools(dir.path(), SYSBENCH_OK, FIO_OK);
    let result = dir.path().join("result.json");

    let output = benchmark_run(dir.path(), &bin, target.path(), &result);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(0), "{stderr}");
    assert!(stderr.contains("RAM-BACKED BENCHMARK PATH"), "{stderr}");

    let report = parse_stdout(&output);
    assert_eq!(report["benchmarks"]["disk"]["engine"], "sync");
    assert_eq!(report["benchmarks"]["disk"]["ram_backed"], true);
    assert!(leftover_scratch_files(target.path()).is_empty());
}

#[test]
fn garbled_tool_output_scores_zero_but_still_reports() {
    let dir = tempfile::tempdir().unwrap();
    let bin = fake_tools(dir.path(), GARBLED, GARBLED);
    let data = dir.path().join("data");
    fs::create_dir(&data).unwrap();
    let result = dir.path().join("result.json");

    let output = benchmark_run(dir.path(), &bin, &data, &result);
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert_eq!(output.status.code(), Some(0), "{stderr}");
    assert!(stderr.contains("reported as 0"), "{stderr}");

    let report = parse_stdout(&output);
    assert_eq!(report["benchmarks"]["cpu"]["multi_thread"]["events_per_sec"], 0.0);
    assert_eq!(report["benchmarks"]["memory"]["latency_ns"], 0.0);
    assert_eq!(report["benchmarks"]["disk"]["seq_read_mb_s"], 0.0);
    assert_eq!(report["scores"]["composite"], 0);
    assert!(result.exists());
    assert!(leftover_scratch_files(&data).is_empty());
}
