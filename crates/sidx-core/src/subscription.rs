use crate::state::{StateId, StatesById};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum KeyMatcher {
    All,
    Exact(String),
    Prefix(String),
}

impl KeyMatcher {
    pub fn matches(&self, key: &str) -> bool {
        match self {
            KeyMatcher::All => true,
            KeyMatcher::Exact(expected) => key == expected,
            KeyMatcher::Prefix(prefix) => key.starts_with(prefix.as_str()),
        }
    }
}

impl Default for KeyMatcher {
    fn default() -> Self {
        Self::All
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subscription {
    #[serde(rename = "type")]
    pub state_type: String,
    #[serde(default)]
    pub key_matcher: KeyMatcher,
}

impl Subscription {
    /// Subscribes to every device key of `state_type`.
    pub fn all(state_type: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            key_matcher: KeyMatcher::All,
        }
    }

    pub fn exact(state_type: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            key_matcher: KeyMatcher::Exact(key.into()),
        }
    }

    pub fn prefix(state_type: impl Into<String>, prefix: impl Into<String>) -> Self {
        Self {
            state_type: state_type.into(),
            key_matcher: KeyMatcher::Prefix(prefix.into()),
        }
    }

    pub fn matches(&self, id: &StateId) -> bool {
        self.state_type == id.state_type && self.key_matcher.matches(&id.device_id)
    }
}

pub fn matches_any(subscriptions: &[Subscription], id: &StateId) -> bool {
    subscriptions.iter().any(|sub| sub.matches(id))
}

/// Keeps the IDs matched by at least one subscription, preserving input order.
pub fn filter_ids(subscriptions: &[Subscription], ids: &[StateId]) -> Vec<StateId> {
    ids.iter()
        .filter(|id| matches_any(subscriptions, id))
        .cloned()
        .collect()
}

pub fn filter_states(subscriptions: &[Subscription], states: &StatesById) -> StatesById {
    states
        .iter()
        .filter(|(id, _)| matches_any(subscriptions, id))
        .map(|(id, state)| (id.clone(), state.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::SerializedState;

    fn state(value: &str) -> SerializedState {
        SerializedState {
            value: value.as_bytes().to_vec(),
            version: 1,
            reporter_id: "gw-1".to_string(),
            time_ms: 0,
        }
    }

    #[test]
    fn key_matchers_follow_variant_semantics() {
        assert!(KeyMatcher::All.matches("anything"));
        assert!(KeyMatcher::Exact("imsi001".to_string()).matches("imsi001"));
        assert!(!KeyMatcher::Exact("imsi001".to_string()).matches("imsi0011"));
        assert!(KeyMatcher::Prefix("imsi".to_string()).matches("imsi0011"));
        assert!(!KeyMatcher::Prefix("imsi".to_string()).matches("IMSI0011"));
        assert!(KeyMatcher::Prefix(String::new()).matches(""));
    }

    #[test]
    fn subscription_requires_type_and_key_match() {
        let sub = Subscription::prefix("directory_record", "imsi");
        assert!(sub.matches(&StateId::new("directory_record", "imsi123")));
        assert!(!sub.matches(&StateId::new("gw_status", "imsi123")));
        assert!(!sub.matches(&StateId::new("directory_record", "gw-1")));
    }

    #[test]
    fn filter_ids_is_union_of_subscriptions() {
        let subs = vec![
            Subscription::exact("foo", "dev-1"),
            Subscription::all("bar"),
        ];
        let ids = vec![
            StateId::new("foo", "dev-1"),
            StateId::new("foo", "dev-2"),
            StateId::new("bar", "dev-3"),
            StateId::new("baz", "dev-1"),
        ];

        let filtered = filter_ids(&subs, &ids);
        assert_eq!(
            filtered,
            vec![StateId::new("foo", "dev-1"), StateId::new("bar", "dev-3")]
        );
        assert!(filter_ids(&[], &ids).is_empty());
    }

    #[test]
    fn filter_states_drops_unsubscribed_values() {
        let subs = vec![Subscription::all("foo")];
        let states = StatesById::from([
            (StateId::new("foo", "a"), state("1")),
            (StateId::new("other", "b"), state("2")),
        ]);

        let filtered = filter_states(&subs, &states);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[&StateId::new("foo", "a")], state("1"));
    }

    #[test]
    fn key_matcher_round_trips_through_json() {
        let sub = Subscription::prefix("foo", "gw");
        let json = serde_json::to_string(&sub).expect("serialize");
        assert_eq!(
            json,
            r#"{"type":"foo","key_matcher":{"kind":"prefix","value":"gw"}}"#
        );
        let parsed: Subscription = serde_json::from_str(r#"{"type":"foo"}"#).expect("parse");
        assert_eq!(parsed, Subscription::all("foo"));
    }
}
