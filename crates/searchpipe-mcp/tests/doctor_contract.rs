const KEY_VARS: [&str; 3] = ["SEARCHPIPE_API_KEY", "SEARCH_API_KEY", "SEARCHPIPE_ENV_FILE"];

fn doctor(env: &[(&str, &str)]) -> (bool, serde_json::Value, String) {
    let bin = assert_cmd::cargo::cargo_bin!("searchpipe");
    let mut cmd = std::process::Command::new(bin);
    cmd.args(["doctor", "--check-stdio=false"]);
    for k in KEY_VARS {
        cmd.env_remove(k);
    }
    for (k, v) in env {
        cmd.env(k, v);
    }
    let out = cmd.output().expect("run searchpipe doctor");
    let s = String::from_utf8_lossy(&out.stdout).to_string();
    let v: serde_json::Value = serde_json::from_str(&s).expect("parse doctor json");
    (out.status.success(), v, s)
}

fn check<'a>(v: &'a serde_json::Value, name: &str) -> &'a serde_json::Value {
    v["checks"]
        .as_array()
        .expect("checks array")
        .iter()
        .find(|c| c["name"].as_str() == Some(name))
        .unwrap_or_else(|| panic!("missing check {name}"))
}

#[test]
fn doctor_reports_missing_api_key_without_failing() {
    let (success, v, _) = doctor(&[]);
    assert!(success, "doctor should always exit 0");
    assert_eq!(v["schema_version"].as_u64(), Some(1));
    assert_eq!(v["kind"].as_str(), Some("doctor"));
    assert_eq!(v["name"].as_str(), Some("searchpipe"));
    assert_eq!(v["ok"].as_bool(), Some(false));
    assert_eq!(v["configured"]["api_key_present"].as_bool(), Some(false));
    assert_eq!(v["features"]["stdio"].as_bool(), Some(cfg!(feature = "stdio")));

    let config = check(&v, "config_valid");
    assert_eq!(config["ok"].as_bool(), Some(false));
    assert!(config["problems"]
        .as_array()
        .unwrap()
        .iter()
        .any(|p| p.as_str().unwrap_or("").contains("SEARCHPIPE_API_KEY")));

    let handshake = check(&v, "mcp_stdio_handshake");
    assert_eq!(handshake["skipped"].as_bool(), Some(true));
    assert_eq!(handshake["ok"].as_bool(), Some(true));
}

#[test]
fn doctor_reads_env_file_and_never_prints_the_key() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("searchpipe.env");
    std::fs::write(
        &path,
        "# local keys\nSEARCHPIPE_API_KEY=sk-doctor-secret-123\nSEARCHPIPE_TIMEOUT_MS=2500\n",
    )
    .expect("write env file");

    let (success, v, raw) = doctor(&[("SEARCHPIPE_ENV_FILE", path.to_str().unwrap())]);
    assert!(success);
    assert_eq!(v["ok"].as_bool(), Some(true), "{v}");
    assert_eq!(v["configured"]["api_key_present"].as_bool(), Some(true));
    assert_eq!(v["configured"]["timeout_ms"].as_u64(), Some(2500));
    assert!(!raw.contains("sk-doctor-secret-123"));
}

#[test]
fn process_env_wins_over_env_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("searchpipe.env");
    std::fs::write(&path, "SEARCHPIPE_API_KEY=k\nSEARCHPIPE_TIMEOUT_MS=2500\n").unwrap();

    let (_, v, _) = doctor(&[
        ("SEARCHPIPE_ENV_FILE", path.to_str().unwrap()),
        ("SEARCHPIPE_TIMEOUT_MS", "700"),
    ]);
    assert_eq!(v["configured"]["timeout_ms"].as_u64(), Some(700));
}

#[cfg(feature = "stdio")]
#[test]
fn doctor_stdio_handshake_lists_every_tool() {
    let bin = assert_cmd::cargo::cargo_bin!("searchpipe");
    let mut cmd = std::process::Command::new(bin);
    cmd.args(["doctor", "--check-stdio=true", "--timeout-ms=20000"]);
    for k in KEY_VARS {
        cmd.env_remove(k);
    }
    cmd.env("SEARCHPIPE_API_KEY", "k");
    let out = cmd.output().expect("run searchpipe doctor");
    assert!(out.status.success());
    let v: serde_json::Value = serde_json::from_slice(&out.stdout).expect("parse doctor json");

    let handshake = check(&v, "mcp_stdio_handshake");
    assert_eq!(handshake["skipped"].as_bool(), Some(false));
    assert_eq!(handshake["ok"].as_bool(), Some(true), "{handshake}");
    assert_eq!(handshake["tool_count"].as_u64(), Some(7));
    assert_eq!(handshake["missing_tools"].as_array().map(Vec::len), Some(0));
    assert_eq!(v["ok"].as_bool(), Some(true));
}
