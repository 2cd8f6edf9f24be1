use std::io::Write;
use std::path::PathBuf;
use std::process::Command;

use serde_json::{Value, json};
use tempfile::NamedTempFile;

fn shield_binary() -> PathBuf {
	PathBuf::from(env!("CARGO_BIN_EXE_shield"))
}

fn run_shield(args: &[&str]) -> (bool, Value, String) {
	let output = Command::new(shield_binary()).args(args).env_remove("SHIELD_LOG").output().expect("failed to run shield");
	let stdout = String::from_utf8_lossy(&output.stdout).to_string();
	let stderr = String::from_utf8_lossy(&output.stderr).to_string();
	let value = serde_json::from_str(&stdout).unwrap_or_else(|e| panic!("stdout is not JSON ({e}): {stdout}\nstderr: {stderr}"));
	(output.status.success(), value, stderr)
}

fn json_file(value: &Value) -> NamedTempFile {
	let mut file = NamedTempFile::new().expect("temp file");
	write!(file, "{value}").expect("write temp file");
	file
}

#[test]
fn policy_allowlisted_status_is_eligible() {
	let (success, value, stderr) = run_shield(&["policy", "--status", "403", "--allow-status", "403"]);
	assert!(success, "policy failed: {stderr}");
	assert_eq!(value["ok"], true);
	assert_eq!(value["command"], "policy");
	assert_eq!(value["data"]["eligible"], true);
}

#[test]
fn policy_unlisted_status_is_not_eligible() {
	let (success, value, _) = run_shield(&["policy", "--status", "500", "--allow-status", "403", "--allow-status", "429"]);
	assert!(success);
	assert_eq!(value["data"]["eligible"], false);
}

#[test]
fn policy_gate_reports_non_http_base_url() {
	let (success, value, _) = run_shield(&["policy", "--code", "HTTP_403", "--base-url", "file:///tmp/x"]);
	assert!(success);
	assert_eq!(value["data"]["eligible"], true);
	assert_eq!(value["data"]["decision"]["decision"], "skip");
}

#[test]
fn policy_without_status_or_code_fails() {
	let (success, value, _) = run_shield(&["policy"]);
	assert!(!success);
	assert_eq!(value["ok"], false);
	assert_eq!(value["error"]["code"], "INVALID_INPUT");
}

#[test]
fn rule_uses_configured_base_id() {
	let config = json_file(&json!({"rules": {"baseRuleId": 5000}}));
	let path = config.path().to_str().unwrap();
	let (success, value, stderr) = run_shield(&["--config", path, "rule", "--tab", "7", "--url", "http://localhost:3000/api", "--cookie", "session=abc"]);
	assert!(success, "rule failed: {stderr}");
	let rule = &value["data"];
	assert_eq!(rule["id"], 5007);
	assert_eq!(rule["condition"]["tabIds"], json!([7]));
	assert_eq!(rule["condition"]["urlFilter"], "|http://localhost:3000/");
}

#[test]
fn invalid_config_is_reported() {
	let config = json_file(&json!({"pool": {"maxContextsPerAccount": 0}}));
	let (success, value, _) = run_shield(&["--config", config.path().to_str().unwrap(), "config"]);
	assert!(!success);
	assert_eq!(value["error"]["code"], "CONFIG_ERROR");
	assert!(value["error"]["message"].as_str().unwrap().contains("maxContextsPerAccount"));
}

#[test]
fn config_prints_defaults() {
	let (success, value, _) = run_shield(&["config"]);
	assert!(success);
	assert_eq!(value["data"]["pool"]["maxContextsPerAccount"], 2);
	assert_eq!(value["data"]["rules"]["baseRuleId"], 10000);
	assert_eq!(value["data"]["relay"]["tokenQueryParam"], "turnstile");
}

#[test]
fn simulate_guard_block_never_relays() {
	let scenario = json_file(&json!({
		"request": {
			"originUrl": "https://api.example.com",
			"fetchUrl": "https://api.example.com/api/user/self",
			"requestId": "sim-guard",
			"accountId": "acct",
			"sessionCookie": "session=abc",
			"authType": "cookie"
		},
		"script": {"cloudflareGuard": {"success": true, "passed": false}}
	}));
	let config = json_file(&json!({"guards": {"guardTimeoutMs": 50, "pollIntervalMs": 10, "probeTimeoutMs": 20}}));

	let (success, value, stderr) = run_shield(&["--config", config.path().to_str().unwrap(), "simulate", "--scenario", scenario.path().to_str().unwrap()]);
	assert!(success, "simulate failed: {stderr}");

	let data = &value["data"];
	assert_eq!(data["outcome"]["success"], false);
	assert_eq!(data["outcome"]["error"], "GuardNotPassed:cloudflare");
	let fetches = data["events"]
		.as_array()
		.unwrap()
		.iter()
		.filter(|e| e["event"] == "message" && e["action"] == "performRelayedFetch")
		.count();
	assert_eq!(fetches, 0);
	assert_eq!(data["openTabs"], json!([]));
}

#[test]
fn simulate_missing_scenario_is_io_error() {
	let (success, value, _) = run_shield(&["simulate", "--scenario", "/nonexistent/scenario.json"]);
	assert!(!success);
	assert_eq!(value["error"]["code"], "IO_ERROR");
}
