use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use std::time::{SystemTime, UNIX_EPOCH};

fn unique_dir(root: &Path, name: &str) -> PathBuf {
    let ts = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_nanos();
    root.join(format!("{}_{}_{}", name, std::process::id(), ts))
}

fn sandbox(name: &str) -> PathBuf {
    let root = PathBuf::from(env!("CARGO_MANIFEST_DIR"))
        .join("target")
        .join("tests")
        .join("cli_smoke");
    let dir = unique_dir(&root, name);
    fs::create_dir_all(&dir).expect("failed to create sandbox dir");
    dir
}

fn run_tj(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_tj"))
        .args(args)
        .env_remove("TJ_UNROLL")
        .env_remove("TJ_DISABLE_REWRITE")
        .env_remove("TJ_DISABLE_VIRTUALS")
        .env("NO_COLOR", "1")
        .output()
        .expect("failed to run tj")
}

const COUNTER: &str = r#"
loop Counter
[i0, i1]
i2 = int_lt(i0, i1)
guard_true(i2) [i0, i1]
i3 = int_add(i0, 1)
jump(i3, i1)
"#;

#[test]
fn prints_preamble_and_body() {
    let dir = sandbox("dump");
    let path = dir.join("counter.trace");
    fs::write(&path, COUNTER).expect("failed to write trace");

    let out = run_tj(&[path.to_str().unwrap(), "--verify", "--stats"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("# preamble: 4 ops"), "{}", stdout);
    assert!(stdout.contains("# loop: 4 ops"), "{}", stdout);
    assert!(stdout.contains("jump(i5, i1, descr=Counter)"), "{}", stdout);
    assert!(stdout.contains("#   peeled          1"), "{}", stdout);
}

#[test]
fn writes_output_file_and_respects_no_unroll() {
    let dir = sandbox("out");
    let path = dir.join("counter.trace");
    let out_path = dir.join("counter.opt");
    fs::write(&path, COUNTER).expect("failed to write trace");

    let out = run_tj(&[
        path.to_str().unwrap(),
        "--no-unroll",
        "-o",
        out_path.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    assert!(out.stdout.is_empty());
    let dump = fs::read_to_string(&out_path).expect("output file must exist");
    assert!(!dump.contains("# preamble"));
    assert!(dump.starts_with("loop Counter\n[i0, i1]\n"), "{}", dump);
}

#[test]
fn rejects_bad_input_with_exit_code() {
    let dir = sandbox("bad");
    let path = dir.join("bad.trace");
    fs::write(&path, "[i0]\ni1 = int_frob(i0)\njump(i1)\n").expect("failed to write trace");

    let out = run_tj(&[path.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&out.stderr);
    assert!(stderr.contains("E0002"), "{}", stderr);

    let out = run_tj(&[path.to_str().unwrap(), "--frobnicate"]);
    assert_eq!(out.status.code(), Some(1));

    let missing = dir.join("missing.trace");
    let out = run_tj(&[missing.to_str().unwrap()]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn repeel_keeps_the_loop_valid() {
    let dir = sandbox("repeel");
    let path = dir.join("counter.trace");
    fs::write(&path, COUNTER).expect("failed to write trace");

    let out = run_tj(&[path.to_str().unwrap(), "--repeel", "2", "--verify", "--stats"]);
    assert!(out.status.success(), "stderr: {}", String::from_utf8_lossy(&out.stderr));
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("#   peeled          3"), "{}", stdout);
}
