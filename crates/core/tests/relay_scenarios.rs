//! End-to-end relay runs against the scripted browser.

use std::sync::Arc;
use std::time::Duration;

use serde_json::json;
use shield::fake::{FakeBrowser, HostEvent, PageScript};
use shield::{ContextState, FetchRelay, OverflowPolicy, ShieldConfig, SiteCookie};
use shield_protocol::{ChallengeRequest, ChallengeStatus, Degradation, FetchOutcome, FetchSpec, IsolationMode, RelayStep, RequestId, ResponseType, SandboxRequest, TabId};

fn fast_config() -> ShieldConfig {
	let mut config = ShieldConfig::default();
	config.pool.load_poll_interval_ms = 5;
	config.pool.idle_timeout_ms = 0;
	config.pool.queue_timeout_ms = 200;
	config.guards.probe_timeout_ms = 50;
	config.guards.poll_interval_ms = 10;
	config.guards.guard_timeout_ms = 80;
	config.challenge.reply_grace_ms = 50;
	config.relay.acquire_timeout_ms = 1_000;
	config.relay.rule_timeout_ms = 200;
	config.relay.fetch_timeout_ms = 300;
	config
}

fn relay_for(browser: &Arc<FakeBrowser>) -> FetchRelay {
	FetchRelay::with_browser(browser.clone(), &fast_config())
}

fn spec(request_id: &str) -> FetchSpec {
	FetchSpec::new("https://api.example.com", "https://api.example.com/api/user/self", "acct-1").with_request_id(request_id)
}

fn position(events: &[HostEvent], predicate: impl Fn(&HostEvent) -> bool) -> usize {
	events.iter().position(predicate).expect("event not recorded")
}

fn fetch_urls(browser: &FakeBrowser) -> Vec<String> {
	browser
		.sent_requests()
		.into_iter()
		.filter_map(|(_, request)| match request {
			SandboxRequest::PerformRelayedFetch { fetch_url, .. } => Some(fetch_url),
			_ => None,
		})
		.collect()
}

fn assert_single_done(outcome: &FetchOutcome) {
	let done = outcome.meta.steps.iter().filter(|step| **step == RelayStep::Done).count();
	assert_eq!(done, 1, "steps: {:?}", outcome.meta.steps);
	let teardown = outcome.meta.steps.iter().filter(|step| **step == RelayStep::Teardown).count();
	assert_eq!(teardown, 1, "steps: {:?}", outcome.meta.steps);
}

#[tokio::test]
async fn happy_path_relays_and_returns_sandbox_to_pool() {
	let browser = Arc::new(FakeBrowser::new());
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1")).await;

	assert!(outcome.success, "{:?}", outcome.error);
	assert_eq!(outcome.request_id, RequestId::new("r-1"));
	assert_eq!(outcome.status, Some(200));
	assert_eq!(outcome.data, json!({"success": true}));
	assert_eq!(
		outcome.meta.steps,
		vec![
			RelayStep::Init,
			RelayStep::AcquireContext,
			RelayStep::InstallCookieRule,
			RelayStep::AwaitGuards,
			RelayStep::AwaitChallengeIfPresent,
			RelayStep::PerformRelayedFetch,
			RelayStep::Teardown,
			RelayStep::Done,
		]
	);
	assert_eq!(outcome.meta.isolation, IsolationMode::Skipped);
	assert_eq!(outcome.meta.challenge.as_ref().map(|c| c.status), Some(ChallengeStatus::NotPresent));

	let tab = outcome.meta.tab_id.unwrap();
	assert_eq!(relay.pool().state_of(tab), Some(ContextState::Ready));
	assert_eq!(browser.removed_count(), 0);
	assert_eq!(relay.in_flight(), 0);
}

#[tokio::test]
async fn session_cookie_is_isolated_for_the_relay_only() {
	let browser = Arc::new(FakeBrowser::new().with_site_cookies(vec![SiteCookie::new("cf_clearance", "cf"), SiteCookie::new("theme", "dark")]));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1").with_session_cookie("session=abc")).await;
	assert!(outcome.success);
	assert_eq!(outcome.meta.isolation, IsolationMode::Installed);

	let history = browser.rule_history();
	assert_eq!(history.len(), 1);
	let tab = outcome.meta.tab_id.unwrap();
	assert_eq!(history[0].condition.tab_ids, vec![tab]);
	assert_eq!(history[0].condition.url_filter, "|https://api.example.com/");
	assert_eq!(history[0].cookie_value(), Some("session=abc; cf_clearance=cf"));
	assert!(browser.installed_rules().is_empty());

	let events = browser.events();
	let installed = position(&events, |e| matches!(e, HostEvent::RuleInstalled { .. }));
	let fetched = position(&events, |e| matches!(e, HostEvent::Message { action, .. } if action == "performRelayedFetch"));
	let removed = position(&events, |e| matches!(e, HostEvent::RuleRemoved { .. }));
	assert!(installed < fetched && fetched < removed);
}

#[tokio::test]
async fn guard_block_never_relays() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		cloudflare_guard: json!({"success": true, "passed": false}),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1").with_session_cookie("session=abc")).await;

	assert!(!outcome.success);
	assert_eq!(outcome.error.as_deref(), Some("GuardNotPassed:cloudflare"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::AwaitGuards));
	assert_eq!(browser.messages_for("performRelayedFetch"), 0);
	assert_single_done(&outcome);

	// A sandbox that failed its guards is not reused; rule goes first.
	let events = browser.events();
	assert_eq!(browser.removed_count(), 1);
	let rule_removed = position(&events, |e| matches!(e, HostEvent::RuleRemoved { .. }));
	let tab_removed = position(&events, |e| matches!(e, HostEvent::Removed { .. }));
	assert!(rule_removed < tab_removed);
	assert!(relay.pool().snapshot().is_empty());
}

#[tokio::test]
async fn both_guards_blocked_reports_both() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		cap_guard: json!({"success": true, "passed": false}),
		cloudflare_guard: json!({"success": false}),
		..PageScript::default()
	}));
	let outcome = relay_for(&browser).execute(spec("r-1")).await;
	assert_eq!(outcome.error.as_deref(), Some("GuardNotPassed:both"));
}

#[tokio::test]
async fn guards_cleared_after_a_few_polls_still_relay() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		cloudflare_blocked_polls: 2,
		..PageScript::default()
	}));
	let outcome = relay_for(&browser).execute(spec("r-1")).await;
	assert!(outcome.success, "{:?}", outcome.error);
	assert_eq!(browser.messages_for("checkCloudflareGuard"), 3);
}

#[tokio::test]
async fn challenge_timeout_still_relays() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		challenge: json!({"status": "timeout", "detection": {"hasWidget": true, "score": 3, "reasons": ["iframe"]}}),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1")).await;

	assert!(outcome.success);
	assert_eq!(outcome.meta.degradations, vec![Degradation::ChallengeTimeout]);
	assert_eq!(browser.messages_for("performRelayedFetch"), 1);
	assert_eq!(fetch_urls(&browser), vec!["https://api.example.com/api/user/self".to_string()]);
}

#[tokio::test]
async fn silent_challenge_page_counts_as_timeout() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		challenge_delay: Some(Duration::from_secs(5)),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay
		.execute(spec("r-1").with_challenge(ChallengeRequest {
			timeout_ms: Some(500),
			pre_trigger: None,
		}))
		.await;

	assert!(outcome.success);
	assert_eq!(outcome.meta.degradations, vec![Degradation::ChallengeTimeout]);
}

#[tokio::test]
async fn obtained_token_is_attached_to_fetch_url() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		challenge: json!({"status": "token_obtained", "token": "tok-123"}),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay
		.execute(FetchSpec::new("https://api.example.com", "https://api.example.com/api/user/checkin?x=1", "acct-1").with_page_url("https://api.example.com/console"))
		.await;

	assert!(outcome.success);
	assert!(outcome.meta.degradations.is_empty());
	assert_eq!(fetch_urls(&browser), vec!["https://api.example.com/api/user/checkin?x=1&turnstile=tok-123".to_string()]);

	let waited_on = browser.sent_requests().into_iter().find_map(|(_, request)| match request {
		SandboxRequest::WaitForChallengeToken { page_url, .. } => Some(page_url),
		_ => None,
	});
	assert_eq!(waited_on.as_deref(), Some("https://api.example.com/console"));
}

#[tokio::test]
async fn creation_failure_produces_one_failure() {
	let browser = Arc::new(FakeBrowser::new().failing_create("window quota"));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1")).await;

	assert!(!outcome.success);
	assert!(outcome.error.as_deref().unwrap().starts_with("ContextCreationFailed"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::AcquireContext));
	assert_eq!(outcome.meta.steps, vec![RelayStep::Init, RelayStep::AcquireContext, RelayStep::Teardown, RelayStep::Done]);
	assert_eq!(outcome.meta.tab_id, None);
	assert_eq!(browser.create_attempts(), 1);
	assert_eq!(browser.removed_count(), 0);
}

#[tokio::test]
async fn unsupported_rules_degrade_instead_of_failing() {
	let browser = Arc::new(FakeBrowser::new().without_header_rules());
	let outcome = relay_for(&browser).execute(spec("r-1").with_session_cookie("session=abc")).await;

	assert!(outcome.success);
	assert_eq!(outcome.meta.isolation, IsolationMode::Unsupported);
	assert!(matches!(outcome.meta.degradations.as_slice(), [Degradation::RuleInstallUnsupported { .. }]));
}

#[tokio::test]
async fn failed_rule_install_degrades_instead_of_failing() {
	let browser = Arc::new(FakeBrowser::new().failing_rule_install("too many rules"));
	let outcome = relay_for(&browser).execute(spec("r-1").with_session_cookie("session=abc")).await;

	assert!(outcome.success);
	assert_eq!(outcome.meta.isolation, IsolationMode::Failed);
	match outcome.meta.degradations.as_slice() {
		[Degradation::RuleInstallFailed { reason }] => assert!(reason.contains("too many rules")),
		other => panic!("unexpected degradations {other:?}"),
	}
}

#[tokio::test]
async fn relayed_http_error_keeps_status_and_sandbox() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch: json!({"success": false, "status": 429, "error": "Too Many Requests", "data": {"message": "slow down"}}),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1")).await;

	assert!(!outcome.success);
	assert_eq!(outcome.status, Some(429));
	assert_eq!(outcome.error.as_deref(), Some("RelayedFetchFailed: Too Many Requests"));
	assert_eq!(outcome.data, json!({"message": "slow down"}));
	let tab = outcome.meta.tab_id.unwrap();
	assert_eq!(relay.pool().state_of(tab), Some(ContextState::Ready));
}

#[tokio::test]
async fn slow_fetch_times_out_and_destroys_sandbox() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch_delay: Some(Duration::from_secs(5)),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let outcome = relay.execute(spec("r-1")).await;

	assert_eq!(outcome.error.as_deref(), Some("Timeout:PerformRelayedFetch"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::PerformRelayedFetch));
	assert_eq!(browser.removed_count(), 1);
	assert_single_done(&outcome);
}

#[tokio::test]
async fn binary_bodies_come_back_as_base64() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch: json!({"success": true, "status": 200, "data": [137, 80, 78, 71]}),
		..PageScript::default()
	}));
	let outcome = relay_for(&browser).execute(spec("r-1").with_response_type(ResponseType::ArrayBuffer)).await;

	assert!(outcome.success);
	assert_eq!(outcome.body_bytes().unwrap(), vec![137, 80, 78, 71]);
}

#[tokio::test]
async fn invalid_request_is_rejected_before_any_sandbox() {
	let browser = Arc::new(FakeBrowser::new());
	let outcome = relay_for(&browser)
		.execute(FetchSpec::new("chrome-extension://abc/options.html", "https://api.example.com/x", "acct-1"))
		.await;

	assert!(outcome.error.as_deref().unwrap().starts_with("InvalidRequest"));
	assert_eq!(outcome.meta.steps, vec![RelayStep::Init, RelayStep::Done]);
	assert_eq!(browser.create_attempts(), 0);
}

#[tokio::test]
async fn duplicate_in_flight_request_id_is_rejected() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch_delay: Some(Duration::from_millis(50)),
		..PageScript::default()
	}));
	let relay = relay_for(&browser);

	let (a, b) = tokio::join!(relay.execute(spec("same")), relay.execute(spec("same")));

	let rejected: Vec<_> = [&a, &b]
		.into_iter()
		.filter(|outcome| outcome.error.as_deref().is_some_and(|e| e.contains("already in flight")))
		.collect();
	assert_eq!(rejected.len(), 1);
	assert!(a.success || b.success);
	assert_eq!(browser.created_count(), 1);

	// Once finished, the id may be used again.
	assert!(relay.execute(spec("same")).await.success);
}

#[tokio::test]
async fn cancellation_tears_down_before_ack() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch_delay: Some(Duration::from_millis(250)),
		..PageScript::default()
	}));
	let relay = Arc::new(relay_for(&browser));

	let running = {
		let relay = relay.clone();
		tokio::spawn(async move { relay.execute(spec("r-cancel").with_session_cookie("session=abc")).await })
	};
	while browser.messages_for("performRelayedFetch") == 0 {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}

	let ack = relay.cancel(&RequestId::new("r-cancel")).expect("request is in flight");
	ack.settled().await;
	assert_eq!(browser.removed_count(), 1);
	assert!(browser.installed_rules().is_empty());

	let outcome = running.await.unwrap();
	assert_eq!(outcome.error.as_deref(), Some("Cancelled"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::PerformRelayedFetch));
	assert_single_done(&outcome);
	assert!(relay.cancel(&RequestId::new("r-cancel")).is_none());
}

#[tokio::test]
async fn reject_policy_surfaces_pool_exhaustion() {
	let browser = Arc::new(FakeBrowser::new().with_script(PageScript {
		fetch_delay: Some(Duration::from_millis(50)),
		..PageScript::default()
	}));
	let mut config = fast_config();
	config.pool.max_contexts_per_account = 1;
	config.pool.overflow = OverflowPolicy::Reject;
	let relay = FetchRelay::with_browser(browser.clone(), &config);

	let (a, b) = tokio::join!(relay.execute(spec("r-a")), relay.execute(spec("r-b")));

	let exhausted = [&a, &b].iter().filter(|o| o.error.as_deref().is_some_and(|e| e.starts_with("PoolExhausted"))).count();
	assert_eq!(exhausted, 1);
	assert_eq!(browser.created_count(), 1);
}

#[tokio::test]
async fn sequential_relays_reuse_one_sandbox_with_one_rule() {
	let browser = Arc::new(FakeBrowser::new());
	let relay = relay_for(&browser);

	let first = relay.execute(spec("r-1").with_session_cookie("session=one")).await;
	let second = relay.execute(spec("r-2").with_session_cookie("session=two")).await;

	assert!(first.success && second.success);
	assert_eq!(first.meta.tab_id, second.meta.tab_id);
	assert_eq!(browser.created_count(), 1);

	let history = browser.rule_history();
	assert_eq!(history.len(), 2);
	assert_eq!(history[0].id, history[1].id);
	assert_eq!(history[1].cookie_value(), Some("session=two"));
	assert!(browser.installed_rules().is_empty());
	assert_eq!(first.meta.tab_id, Some(TabId(1)));
}

#[tokio::test]
async fn slow_sandbox_creation_times_out_and_late_sandbox_is_closed() {
	let browser = Arc::new(FakeBrowser::new().slow_create(Duration::from_millis(150)));
	let mut config = fast_config();
	config.relay.acquire_timeout_ms = 50;
	let relay = FetchRelay::with_browser(browser.clone(), &config);

	let outcome = relay.execute(spec("r-slow-create")).await;

	assert_eq!(outcome.error.as_deref(), Some("Timeout:AcquireContext"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::AcquireContext));
	assert_eq!(outcome.meta.tab_id, None);
	assert_single_done(&outcome);
	assert_eq!(browser.messages_for("checkCapGuard"), 0);

	tokio::time::sleep(Duration::from_millis(300)).await;
	assert_eq!(browser.created_count(), 1);
	assert_eq!(browser.removed_count(), 1);
	assert!(browser.open_tabs().is_empty());
	assert!(relay.pool().snapshot().is_empty());
}

#[tokio::test]
async fn cancellation_during_creation_closes_the_late_sandbox() {
	let browser = Arc::new(FakeBrowser::new().slow_create(Duration::from_millis(100)));
	let relay = Arc::new(relay_for(&browser));

	let running = {
		let relay = relay.clone();
		tokio::spawn(async move { relay.execute(spec("r-cancel-create")).await })
	};
	while browser.create_attempts() == 0 {
		tokio::time::sleep(Duration::from_millis(5)).await;
	}
	relay.cancel(&RequestId::new("r-cancel-create")).expect("request is in flight").settled().await;

	let outcome = running.await.unwrap();
	assert_eq!(outcome.error.as_deref(), Some("Cancelled"));
	assert_eq!(outcome.meta.failed_step, Some(RelayStep::AcquireContext));
	assert_single_done(&outcome);

	tokio::time::sleep(Duration::from_millis(250)).await;
	assert_eq!(browser.created_count(), 1);
	assert!(browser.open_tabs().is_empty());
	assert!(relay.pool().snapshot().is_empty());
}
