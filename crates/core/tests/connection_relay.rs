//! Relay runs whose page exchanges travel over a real `Connection`.

use std::sync::Arc;
use std::time::Duration;

use serde_json::{Value, json};
use shield::fake::FakeBrowser;
use shield::{ContextState, FetchRelay, ShieldConfig};
use shield_protocol::FetchSpec;
use shield_runtime::Connection;
use shield_runtime::fake_transport::{FakeTransportBuilder, FakeTransportController, error_reply};

fn config() -> ShieldConfig {
	let mut config = ShieldConfig::default();
	config.pool.load_poll_interval_ms = 5;
	config.pool.idle_timeout_ms = 0;
	config.guards.probe_timeout_ms = 100;
	config.guards.poll_interval_ms = 10;
	config.guards.guard_timeout_ms = 100;
	config.relay.fetch_timeout_ms = 200;
	config
}

fn page_script(envelope_action: &str, fetch: &Value) -> Option<Value> {
	match envelope_action {
		"checkCapGuard" | "checkCloudflareGuard" => Some(json!({"success": true, "passed": true})),
		"waitForChallengeToken" => Some(json!({"status": "not_present"})),
		"performRelayedFetch" => Some(fetch.clone()),
		_ => None,
	}
}

fn connect(fetch: Value) -> (Arc<Connection>, FakeTransportController) {
	let (parts, controller) = FakeTransportBuilder::new()
		.respond_with(move |envelope| page_script(envelope.payload["action"].as_str().unwrap_or_default(), &fetch))
		.build();
	let connection = Arc::new(Connection::new(parts));
	tokio::spawn({
		let connection = Arc::clone(&connection);
		async move { connection.run().await }
	});
	(connection, controller)
}

#[tokio::test]
async fn relay_over_connection_correlates_every_exchange() {
	let (connection, controller) = connect(json!({"success": true, "status": 200, "data": "{\"id\":7}"}));
	let browser = Arc::new(FakeBrowser::new());
	let relay = FetchRelay::new(browser.clone(), browser.clone(), connection.clone(), &config());

	let outcome = relay
		.execute(FetchSpec::new("https://api.example.com", "https://api.example.com/api/user/self", "acct").with_request_id("conn-1"))
		.await;

	assert!(outcome.success, "{:?}", outcome.error);
	assert_eq!(outcome.data, json!({"id": 7}));
	assert_eq!(connection.pending_requests(), 0);

	let tab = outcome.meta.tab_id.unwrap();
	let sent = controller.take_sent();
	assert_eq!(sent.len(), 4);
	assert!(sent.iter().all(|envelope| envelope["tabId"] == json!(tab.0)));
	assert_eq!(sent.last().unwrap()["payload"]["action"], "performRelayedFetch");
}

#[tokio::test]
async fn page_error_reply_fails_the_fetch_and_destroys_the_sandbox() {
	let (connection, _controller) = connect(error_reply("Error", "script unavailable"));
	let browser = Arc::new(FakeBrowser::new());
	let relay = FetchRelay::new(browser.clone(), browser.clone(), connection, &config());

	let outcome = relay
		.execute(FetchSpec::new("https://api.example.com", "https://api.example.com/x", "acct").with_request_id("conn-2"))
		.await;

	let error = outcome.error.unwrap();
	assert!(error.starts_with("RelayedFetchFailed"), "{error}");
	assert!(error.contains("script unavailable"), "{error}");
	assert_eq!(browser.removed_count(), 1);
}

#[tokio::test]
async fn tab_removed_events_reach_the_pool() {
	let (connection, controller) = connect(json!({"success": true, "status": 204}));
	let browser = Arc::new(FakeBrowser::new());
	let relay = FetchRelay::new(browser.clone(), browser.clone(), connection.clone(), &config());
	let _watcher = relay.pool().watch_tab_events(connection.subscribe());

	let outcome = relay
		.execute(FetchSpec::new("https://api.example.com", "https://api.example.com/x", "acct").with_request_id("conn-3"))
		.await;
	let tab = outcome.meta.tab_id.unwrap();
	assert_eq!(relay.pool().state_of(tab), Some(ContextState::Ready));

	controller.inject_event(tab, "tabRemoved", Value::Null);
	for _ in 0..50 {
		if relay.pool().state_of(tab).is_none() {
			break;
		}
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	assert_eq!(relay.pool().state_of(tab), None);
	assert_eq!(browser.removed_count(), 0);
}
