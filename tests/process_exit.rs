use std::process::Command;

fn run(bin: &str, config: &std::path::Path) -> std::process::Output {
    Command::new(bin)
        .args(["--quiet", "--config"])
        .arg(config)
        .env_remove("MCP_RUNNER__CONFIG_PATH")
        .output()
        .expect("failed to spawn runner binary")
}

#[test]
fn test_missing_config_exits_non_zero_without_result() {
    let dir = tempfile::tempdir().unwrap();
    let missing = dir.path().join("browser_mcp.json");

    for bin in [env!("CARGO_BIN_EXE_mcp-runner"), env!("CARGO_BIN_EXE_browser")] {
        let output = run(bin, &missing);
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);

        assert!(!output.status.success(), "{bin} should fail");
        assert!(!stdout.contains("Result:"), "unexpected result line: {stdout}");
        assert!(!stdout.contains("RESULT:"), "unexpected result line: {stdout}");
        assert!(stderr.contains("Configuration error"), "stderr was: {stderr}");
    }
}

#[test]
fn test_malformed_config_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("browser_mcp.json");
    std::fs::write(&path, "{ \"mcpServers\": [").unwrap();

    let output = run(env!("CARGO_BIN_EXE_browser"), &path);

    assert!(!output.status.success());
    assert!(output.stdout.is_empty());
}
