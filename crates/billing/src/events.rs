//! Outbound webhook event types and the canonical envelope.

use serde::{Serialize, Serializer};
use time::OffsetDateTime;
use uuid::Uuid;

/// Events delivered to vendor endpoints. Wire names are dotted strings
/// (`subscription.activated` etc.) and are also what tools list in their
/// subscribed-events allowlist.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookEventType {
    SubscriptionCreated,
    SubscriptionActivated,
    SubscriptionCanceled,
    SubscriptionUpdated,
    PurchaseCompleted,
    EntitlementGranted,
    EntitlementRevoked,
    EntitlementChanged,
    CreditsConsumed,
    CreditsLow,
    CreditsDepleted,
    ToolStatusChanged,
    VerificationRequired,
}

impl WebhookEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SubscriptionCreated => "subscription.created",
            Self::SubscriptionActivated => "subscription.activated",
            Self::SubscriptionCanceled => "subscription.canceled",
            Self::SubscriptionUpdated => "subscription.updated",
            Self::PurchaseCompleted => "purchase.completed",
            Self::EntitlementGranted => "entitlement.granted",
            Self::EntitlementRevoked => "entitlement.revoked",
            Self::EntitlementChanged => "entitlement.changed",
            Self::CreditsConsumed => "credits.consumed",
            Self::CreditsLow => "credits.low",
            Self::CreditsDepleted => "credits.depleted",
            Self::ToolStatusChanged => "tool.status_changed",
            Self::VerificationRequired => "verification.required",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "subscription.created" => Some(Self::SubscriptionCreated),
            "subscription.activated" => Some(Self::SubscriptionActivated),
            "subscription.canceled" => Some(Self::SubscriptionCanceled),
            "subscription.updated" => Some(Self::SubscriptionUpdated),
            "purchase.completed" => Some(Self::PurchaseCompleted),
            "entitlement.granted" => Some(Self::EntitlementGranted),
            "entitlement.revoked" => Some(Self::EntitlementRevoked),
            "entitlement.changed" => Some(Self::EntitlementChanged),
            "credits.consumed" => Some(Self::CreditsConsumed),
            "credits.low" => Some(Self::CreditsLow),
            "credits.depleted" => Some(Self::CreditsDepleted),
            "tool.status_changed" => Some(Self::ToolStatusChanged),
            "verification.required" => Some(Self::VerificationRequired),
            _ => None,
        }
    }

    /// Events that narrow or revoke access. Senders for these invalidate
    /// the entitlement cache before building and sending the notification,
    /// so a vendor that re-verifies on receipt never sees a stale grant.
    pub fn is_access_change(&self) -> bool {
        matches!(
            self,
            Self::SubscriptionCanceled
                | Self::EntitlementRevoked
                | Self::EntitlementChanged
                | Self::VerificationRequired
        )
    }
}

impl std::fmt::Display for WebhookEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for WebhookEventType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Canonical webhook body: `{id, type, created, data}`. `data` always
/// carries `oneSubUserId` and, when resolvable, `userEmail`; the dispatcher
/// injects both before building the envelope.
#[derive(Debug, Clone, Serialize)]
pub struct WebhookEnvelope {
    pub id: Uuid,
    #[serde(rename = "type")]
    pub event_type: WebhookEventType,
    /// Unix seconds at envelope creation.
    pub created: i64,
    pub data: serde_json::Value,
}

impl WebhookEnvelope {
    pub fn new(event_type: WebhookEventType, data: serde_json::Value) -> Self {
        Self {
            id: Uuid::new_v4(),
            event_type,
            created: OffsetDateTime::now_utc().unix_timestamp(),
            data,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wire_names_roundtrip() {
        for event in [
            WebhookEventType::SubscriptionCreated,
            WebhookEventType::SubscriptionActivated,
            WebhookEventType::SubscriptionCanceled,
            WebhookEventType::SubscriptionUpdated,
            WebhookEventType::PurchaseCompleted,
            WebhookEventType::EntitlementGranted,
            WebhookEventType::EntitlementRevoked,
            WebhookEventType::EntitlementChanged,
            WebhookEventType::CreditsConsumed,
            WebhookEventType::CreditsLow,
            WebhookEventType::CreditsDepleted,
            WebhookEventType::ToolStatusChanged,
            WebhookEventType::VerificationRequired,
        ] {
            assert_eq!(WebhookEventType::parse(event.as_str()), Some(event));
        }
        assert_eq!(WebhookEventType::parse("subscription.exploded"), None);
    }

    #[test]
    fn access_change_subset() {
        assert!(WebhookEventType::SubscriptionCanceled.is_access_change());
        assert!(WebhookEventType::EntitlementRevoked.is_access_change());
        assert!(WebhookEventType::EntitlementChanged.is_access_change());
        assert!(WebhookEventType::VerificationRequired.is_access_change());
        assert!(!WebhookEventType::SubscriptionCreated.is_access_change());
        assert!(!WebhookEventType::CreditsConsumed.is_access_change());
    }

    #[test]
    fn envelope_serializes_with_type_key() {
        let user_id = Uuid::new_v4();
        let envelope = WebhookEnvelope::new(
            WebhookEventType::SubscriptionActivated,
            json!({"oneSubUserId": user_id}),
        );
        let value = serde_json::to_value(&envelope).unwrap();

        assert_eq!(value["type"], json!("subscription.activated"));
        assert_eq!(value["data"]["oneSubUserId"], json!(user_id));
        assert!(value["created"].as_i64().unwrap() > 1_600_000_000);
        assert!(value.get("id").is_some());
    }
}
