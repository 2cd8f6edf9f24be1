//! Cookie header assembly for the isolation rule.

use std::collections::HashSet;

use crate::host::SiteCookie;

/// Cookies set by edge protections once a browser passes their challenge.
/// Sending them alongside the account session keeps the relayed request from
/// being challenged again.
pub const WAF_COOKIE_NAMES: &[&str] = &["cf_clearance", "__cf_bm", "__cap_clearance", "acw_tc", "acw_sc__v2", "waf_session"];

pub fn is_waf_cookie(name: &str) -> bool {
	WAF_COOKIE_NAMES.iter().any(|known| known.eq_ignore_ascii_case(name))
}

/// Splits a `Cookie` header into `(name, value)` pairs, skipping empty or
/// nameless fragments. A bare fragment such as `flag` has an empty value.
pub fn parse_cookie_header(header: &str) -> Vec<(&str, &str)> {
	fragments(header)
		.map(|(name, fragment)| (name, fragment.split_once('=').map_or("", |(_, value)| value.trim())))
		.collect()
}

/// Yields `(name, fragment)` for every named fragment, the fragment trimmed
/// but otherwise untouched.
fn fragments(header: &str) -> impl Iterator<Item = (&str, &str)> {
	header.split(';').map(str::trim).filter_map(|fragment| {
		let name = fragment.split_once('=').map_or(fragment, |(name, _)| name).trim();
		(!name.is_empty()).then_some((name, fragment))
	})
}

/// Keeps every session cookie as written and appends the site's WAF cookies
/// whose names the session does not already carry.
pub fn merge_cookie_header(session: &str, site_cookies: &[SiteCookie]) -> String {
	let mut present = HashSet::new();
	let mut parts = Vec::new();
	for (name, fragment) in fragments(session) {
		present.insert(name.to_ascii_lowercase());
		parts.push(fragment.to_string());
	}

	let mut appended = HashSet::new();
	for cookie in site_cookies {
		let key = cookie.name.to_ascii_lowercase();
		if is_waf_cookie(&cookie.name) && !present.contains(&key) && appended.insert(key) {
			parts.push(format!("{}={}", cookie.name, cookie.value));
		}
	}
	parts.join("; ")
}
