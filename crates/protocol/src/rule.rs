//! Per-tab header-override rule shape.
//!
//! Mirrors the session-rule format of the host's declarative request API:
//!
//! ```json
//! {
//!   "id": 10042,
//!   "priority": 1,
//!   "action": {
//!     "type": "modifyHeaders",
//!     "requestHeaders": [
//!       { "header": "All-API-Hub", "operation": "remove" },
//!       { "header": "Cookie", "operation": "set", "value": "session=abc" }
//!     ]
//!   },
//!   "condition": {
//!     "tabIds": [42],
//!     "urlFilter": "|https://api.example.com/",
//!     "resourceTypes": ["xmlhttprequest"]
//!   }
//! }
//! ```

use serde::{Deserialize, Serialize};

use crate::ids::TabId;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderRule {
	pub id: u32,
	pub priority: u32,
	pub action: RuleAction,
	pub condition: RuleCondition,
}

impl HeaderRule {
	/// Cookie value this rule force-sets, if any.
	pub fn cookie_value(&self) -> Option<&str> {
		self.action
			.request_headers
			.iter()
			.find(|o| o.operation == HeaderOperation::Set && o.header.eq_ignore_ascii_case("cookie"))
			.and_then(|o| o.value.as_deref())
	}

	pub fn applies_to_tab(&self, tab_id: TabId) -> bool {
		self.condition.tab_ids.contains(&tab_id)
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum RuleActionType {
	#[default]
	ModifyHeaders,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleAction {
	#[serde(rename = "type")]
	pub kind: RuleActionType,
	pub request_headers: Vec<HeaderOverride>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum HeaderOperation {
	Set,
	Remove,
	Append,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeaderOverride {
	pub header: String,
	pub operation: HeaderOperation,
	#[serde(default, skip_serializing_if = "Option::is_none")]
	pub value: Option<String>,
}

impl HeaderOverride {
	pub fn set(header: impl Into<String>, value: impl Into<String>) -> Self {
		Self {
			header: header.into(),
			operation: HeaderOperation::Set,
			value: Some(value.into()),
		}
	}

	pub fn remove(header: impl Into<String>) -> Self {
		Self {
			header: header.into(),
			operation: HeaderOperation::Remove,
			value: None,
		}
	}
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceType {
	#[serde(rename = "xmlhttprequest")]
	XmlHttpRequest,
	MainFrame,
	SubFrame,
	Other,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleCondition {
	pub tab_ids: Vec<TabId>,
	pub url_filter: String,
	pub resource_types: Vec<ResourceType>,
}

#[cfg(test)]
mod tests {
	use serde_json::json;

	use super::*;

	#[test]
	fn rule_serializes_to_host_shape() {
		let rule = HeaderRule {
			id: 10042,
			priority: 1,
			action: RuleAction {
				kind: RuleActionType::ModifyHeaders,
				request_headers: vec![HeaderOverride::remove("All-API-Hub"), HeaderOverride::set("Cookie", "session=abc")],
			},
			condition: RuleCondition {
				tab_ids: vec![TabId(42)],
				url_filter: "|https://api.example.com/".into(),
				resource_types: vec![ResourceType::XmlHttpRequest],
			},
		};

		let value = serde_json::to_value(&rule).unwrap();
		assert_eq!(value["action"]["type"], "modifyHeaders");
		assert_eq!(value["action"]["requestHeaders"][0], json!({"header": "All-API-Hub", "operation": "remove"}));
		assert_eq!(value["condition"]["tabIds"], json!([42]));
		assert_eq!(value["condition"]["resourceTypes"], json!(["xmlhttprequest"]));
		assert_eq!(rule.cookie_value(), Some("session=abc"));
		assert!(rule.applies_to_tab(TabId(42)));
		assert!(!rule.applies_to_tab(TabId(43)));
	}
}
