//! Subscription filter: the pure predicate deciding whether an uplink
//! reaches a session.

use serde::Deserialize;

use crate::message::UplinkMessage;

/// Optional match attributes a subscriber pins at connect time.
///
/// Deserializable so the WebSocket handler can extract it straight from the
/// `/ws` query string. An absent or empty field is a wildcard.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SubscriptionFilter {
    pub app_id: Option<String>,
    pub dev_id: Option<String>,
    pub user_id: Option<String>,
    pub experiment: Option<String>,
}

impl SubscriptionFilter {
    /// True when every pinned field equals the message's corresponding
    /// field. Wildcard fields never reject.
    pub fn matches(&self, message: &UplinkMessage) -> bool {
        field_matches(self.app_id.as_deref(), &message.app_id)
            && field_matches(self.dev_id.as_deref(), &message.dev_id)
            && field_matches(self.user_id.as_deref(), &message.user_id)
            && field_matches(self.experiment.as_deref(), &message.experiment)
    }
}

fn field_matches(pinned: Option<&str>, actual: &str) -> bool {
    match pinned {
        Some(pinned) if !pinned.is_empty() => pinned == actual,
        _ => true,
    }
}
