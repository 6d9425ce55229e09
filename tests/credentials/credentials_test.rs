//! Coverage for credential loading and permission checks.

use std::collections::BTreeMap;
use std::fs;
use std::path::PathBuf;

use campaigner::credentials::{load_credentials, Credentials};

fn write_env(dir: &tempfile::TempDir, contents: &str) -> PathBuf {
    let path = dir.path().join(".env");
    fs::write(&path, contents).expect("write .env");
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600)).expect("chmod 600");
    }
    path
}

#[test]
fn loads_env_credentials() {
    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_env(&dir, "RESEND_API_KEY=re_live_123\nEMPTY_KEY=\n");

    let credentials = load_credentials(&path).expect("credentials should load");
    assert_eq!(credentials.get("RESEND_API_KEY"), Some("re_live_123"));
    assert_eq!(credentials.get("EMPTY_KEY"), None);
    assert!(credentials.require("EMPTY_KEY").is_err());
}

#[test]
fn missing_file_is_an_error() {
    let dir = tempfile::tempdir().expect("temp dir");
    assert!(load_credentials(&dir.path().join(".env")).is_err());
}

#[cfg(unix)]
#[test]
fn world_readable_file_is_rejected() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempfile::tempdir().expect("temp dir");
    let path = write_env(&dir, "RESEND_API_KEY=re_live_123\n");
    fs::set_permissions(&path, fs::Permissions::from_mode(0o644)).expect("chmod 644");

    let err = load_credentials(&path).expect_err("0644 must be rejected");
    assert!(err.to_string().contains("must be 0600"));
}

#[test]
fn debug_output_hides_values() {
    let mut vars = BTreeMap::new();
    vars.insert("RESEND_API_KEY".to_owned(), "re_secret_value".to_owned());
    let credentials = Credentials::from_map(vars);

    let rendered = format!("{credentials:?}");
    assert!(rendered.contains("RESEND_API_KEY"));
    assert!(!rendered.contains("re_secret_value"));
}

#[test]
fn file_values_take_precedence_over_environment() {
    let mut vars = BTreeMap::new();
    vars.insert("PATH".to_owned(), "from-file".to_owned());
    let credentials = Credentials::from_map(vars).with_env_fallback(&["PATH"]);
    assert_eq!(credentials.get("PATH"), Some("from-file"));
}

#[test]
fn environment_fills_missing_keys() {
    let credentials = Credentials::default().with_env_fallback(&["PATH"]);
    let expected = std::env::var("PATH").ok().filter(|v| !v.trim().is_empty());
    assert_eq!(credentials.get("PATH").map(str::to_owned), expected);
}
