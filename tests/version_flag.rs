use std::process::Command;

#[test]
fn prints_version() {
    let exe = env!("CARGO_BIN_EXE_slidefeed");
    let output = Command::new(exe)
        .arg("--version")
        .output()
        .expect("run slidefeed --version");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    assert!(
        stdout.contains(env!("CARGO_PKG_VERSION")),
        "stdout was: {}",
        stdout.trim()
    );
}

#[test]
fn prints_help() {
    let exe = env!("CARGO_BIN_EXE_slidefeed");
    let output = Command::new(exe)
        .arg("--help")
        .output()
        .expect("run slidefeed --help");
    assert!(output.status.success());
    let stdout = String::from_utf8(output.stdout).expect("stdout utf8");
    for flag in ["--config", "--url", "--once"] {
        assert!(stdout.contains(flag), "help lacks {flag}: {}", stdout);
    }
}

#[test]
fn flag_missing_its_value_is_rejected() {
    let exe = env!("CARGO_BIN_EXE_slidefeed");
    let output = Command::new(exe)
        .arg("--url")
        .output()
        .expect("run slidefeed --url");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).expect("stderr utf8");
    assert!(stderr.contains("--url needs a value"));
}

#[test]
fn rejects_unknown_flags() {
    let exe = env!("CARGO_BIN_EXE_slidefeed");
    let output = Command::new(exe)
        .arg("--bogus")
        .output()
        .expect("run slidefeed --bogus");
    assert_eq!(output.status.code(), Some(2));
    let stderr = String::from_utf8(output.stderr).expect("stderr utf8");
    assert!(stderr.contains("unknown argument '--bogus'"));
}
