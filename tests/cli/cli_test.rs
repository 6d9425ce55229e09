//! CLI contract tests against the built binary.

use std::fs;
use std::path::Path;

use assert_cmd::Command;

fn campaigner(home: &Path) -> Command {
    let mut cmd = Command::cargo_bin("campaigner").expect("binary should build");
    cmd.env("HOME", home)
        .env_remove("RESEND_API_KEY")
        .env("RUST_LOG", "warn");
    cmd
}

fn write_inputs(dir: &Path) {
    fs::write(
        dir.join("recipients.json"),
        r#"[
            {"email": "ada@example.com", "name": "Ada"},
            {"email": "bob@example.com", "name": "Bob"},
            {"email": "broken-address", "name": "Nobody"}
        ]"#,
    )
    .expect("write recipients");
    fs::write(dir.join("body.html"), "<p>Hello {{ name }}</p>").expect("write template");
    fs::write(dir.join("config.toml"), "[delivery]\nconcurrency = 2\n").expect("write config");
}

#[test]
fn help_lists_subcommands() {
    let home = tempfile::tempdir().expect("temp dir");
    let output = campaigner(home.path())
        .arg("--help")
        .output()
        .expect("binary runs");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    for subcommand in ["send", "check", "quota", "suppress"] {
        assert!(stdout.contains(subcommand), "missing {subcommand} in help");
    }
}

#[test]
fn dry_run_send_prints_json_summary() {
    let home = tempfile::tempdir().expect("temp dir");
    let inputs = tempfile::tempdir().expect("temp dir");
    write_inputs(inputs.path());

    let output = campaigner(home.path())
        .arg("--config")
        .arg(inputs.path().join("config.toml"))
        .args(["send", "--subject", "Hi {{ name }}", "--campaign-id", "cli-test"])
        .arg("--recipients")
        .arg(inputs.path().join("recipients.json"))
        .arg("--template")
        .arg(inputs.path().join("body.html"))
        .args(["--dry-run", "--json"])
        .output()
        .expect("binary runs");
    assert!(
        output.status.success(),
        "send failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let summary: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout is a JSON summary");
    assert_eq!(summary["campaign_id"], "cli-test");
    assert_eq!(summary["dry_run"], true);
    assert_eq!(summary["total"], 2);
    assert_eq!(summary["delivered"], 2);
    assert!(!home.path().join(".campaigner").join("campaigner.db").exists());
}

#[test]
fn check_fails_without_api_key() {
    let home = tempfile::tempdir().expect("temp dir");
    let output = campaigner(home.path())
        .arg("check")
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("not ready"), "unexpected stderr: {stderr}");
}

#[test]
fn suppress_rejects_invalid_address() {
    let home = tempfile::tempdir().expect("temp dir");
    let output = campaigner(home.path())
        .args(["suppress", "not-an-address"])
        .output()
        .expect("binary runs");
    assert!(!output.status.success());
}

#[test]
fn suppress_then_quota_use_local_database() {
    let home = tempfile::tempdir().expect("temp dir");
    let suppressed = campaigner(home.path())
        .args(["suppress", "gone@example.com", "--reason", "unsubscribed"])
        .output()
        .expect("binary runs");
    assert!(suppressed.status.success());
    assert!(home.path().join(".campaigner").join("campaigner.db").exists());

    let quota = campaigner(home.path())
        .arg("quota")
        .output()
        .expect("binary runs");
    assert!(quota.status.success());
    let stdout = String::from_utf8_lossy(&quota.stdout);
    assert!(stdout.contains("1000 of 1000"), "unexpected stdout: {stdout}");
}
