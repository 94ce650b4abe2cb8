//! Subscription verification for vendor tools.
//!
//! A tool backend asks "what does this user get from me right now" and
//! receives the resolved entitlement view. The caller identifies the
//! user by exactly one of three identifiers; the external-identifier
//! forms exist so tools never have to store platform user ids.

use axum::extract::State;
use axum::{Extension, Json};
use onesub_billing::{CacheOptions, Entitlements};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::auth::AuthTool;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyBody {
    pub one_sub_user_id: Option<Uuid>,
    /// The tool's own user id, resolved through account_links.
    pub tool_user_id: Option<String>,
    /// Hex SHA-256 of lowercase(trim(email)).
    pub email_sha256: Option<String>,
    #[serde(default)]
    pub bypass_cache: bool,
    #[serde(default)]
    pub fresh_credits: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyResponse {
    pub one_sub_user_id: Uuid,
    #[serde(flatten)]
    pub entitlements: Entitlements,
    pub from_cache: bool,
    /// Epoch ms until which the answer may be trusted without re-asking.
    pub authority_expires_at: i64,
}

/// `POST /api/v1/tools/subscriptions/verify`.
pub async fn verify_subscription(
    State(state): State<AppState>,
    Extension(tool): Extension<AuthTool>,
    Json(body): Json<VerifyBody>,
) -> ApiResult<Json<VerifyResponse>> {
    let Some(selector) = selector(&body) else {
        return Err(ApiError::Validation(
            "exactly one of oneSubUserId, toolUserId or emailSha256 is required".to_string(),
        ));
    };
    let user_id = resolve_user(&state, tool.id, selector).await?;

    let cached = state
        .billing
        .entitlements
        .get_with_cache(
            user_id,
            tool.id,
            CacheOptions {
                bypass_cache: body.bypass_cache,
                ttl: None,
                fresh_credits: body.fresh_credits,
            },
        )
        .await?;

    Ok(Json(VerifyResponse {
        one_sub_user_id: user_id,
        entitlements: cached.entitlements,
        from_cache: cached.from_cache,
        authority_expires_at: cached.authority_expires_at,
    }))
}

/// Which identifier the caller supplied.
#[derive(Debug, PartialEq)]
enum UserSelector<'a> {
    ById(Uuid),
    ByToolUser(&'a str),
    ByEmailHash(&'a str),
}

/// Exactly one identifier must be present; anything else is a validation
/// failure rather than a guess.
fn selector(body: &VerifyBody) -> Option<UserSelector<'_>> {
    match (&body.one_sub_user_id, &body.tool_user_id, &body.email_sha256) {
        (Some(id), None, None) => Some(UserSelector::ById(*id)),
        (None, Some(tool_user), None) => Some(UserSelector::ByToolUser(tool_user)),
        (None, None, Some(email_hash)) => Some(UserSelector::ByEmailHash(email_hash)),
        _ => None,
    }
}

/// Map the supplied identifier to a platform user id. Unknown identifiers
/// are 404s, including a platform id for a user that does not exist.
async fn resolve_user(
    state: &AppState,
    tool_id: Uuid,
    selector: UserSelector<'_>,
) -> ApiResult<Uuid> {
    let found: Option<(Uuid,)> = match selector {
        UserSelector::ById(user_id) => {
            sqlx::query_as("SELECT id FROM users WHERE id = $1")
                .bind(user_id)
                .fetch_optional(&state.pool)
                .await?
        }
        UserSelector::ByToolUser(tool_user_id) => {
            sqlx::query_as(
                "SELECT user_id FROM account_links WHERE tool_id = $1 AND tool_user_id = $2",
            )
            .bind(tool_id)
            .bind(tool_user_id)
            .fetch_optional(&state.pool)
            .await?
        }
        UserSelector::ByEmailHash(email_sha256) => {
            sqlx::query_as("SELECT id FROM users WHERE email_sha256 = $1")
                .bind(email_sha256.to_lowercase())
                .fetch_optional(&state.pool)
                .await?
        }
    };

    found.map(|(id,)| id).ok_or(ApiError::NotFound)
}

#[cfg(test)]
mod tests {
    use super::*;
    use onesub_billing::SubscriptionStatus;
    use serde_json::json;

    fn body(value: serde_json::Value) -> VerifyBody {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_selector_accepts_each_identifier_alone() {
        let id = Uuid::new_v4();
        assert_eq!(
            selector(&body(json!({ "oneSubUserId": id }))),
            Some(UserSelector::ById(id))
        );
        assert!(matches!(
            selector(&body(json!({ "toolUserId": "ext-42" }))),
            Some(UserSelector::ByToolUser("ext-42"))
        ));
        assert!(matches!(
            selector(&body(json!({ "emailSha256": "ab12" }))),
            Some(UserSelector::ByEmailHash("ab12"))
        ));
    }

    #[test]
    fn test_selector_rejects_none_or_multiple() {
        assert_eq!(selector(&body(json!({}))), None);
        assert_eq!(
            selector(&body(json!({
                "oneSubUserId": Uuid::new_v4(),
                "toolUserId": "ext-42",
            }))),
            None
        );
        assert_eq!(
            selector(&body(json!({
                "oneSubUserId": Uuid::new_v4(),
                "toolUserId": "ext-42",
                "emailSha256": "ab12",
            }))),
            None
        );
    }

    #[test]
    fn test_body_flags_default_off() {
        let parsed = body(json!({ "toolUserId": "ext-42" }));
        assert!(!parsed.bypass_cache);
        assert!(!parsed.fresh_credits);

        let parsed = body(json!({ "toolUserId": "ext-42", "bypassCache": true }));
        assert!(parsed.bypass_cache);
    }

    #[test]
    fn test_response_flattens_entitlements() {
        let response = VerifyResponse {
            one_sub_user_id: Uuid::nil(),
            entitlements: Entitlements {
                plan_id: Some("monthly".to_string()),
                credits_remaining: Some(120),
                features: vec!["api".to_string()],
                limits: [("calls_per_day".to_string(), 1000)].into_iter().collect(),
                status: SubscriptionStatus::Active,
                active: true,
                current_period_end: Some(1_900_000_000_000),
                cancel_at_period_end: false,
            },
            from_cache: true,
            authority_expires_at: 1_900_000_000_000,
        };

        let value = serde_json::to_value(&response).unwrap();
        // Entitlement fields sit at the top level, camelCased.
        assert_eq!(value["planId"], "monthly");
        assert_eq!(value["creditsRemaining"], 120);
        assert_eq!(value["status"], "active");
        assert_eq!(value["active"], true);
        assert_eq!(value["fromCache"], true);
        assert_eq!(value["oneSubUserId"], Uuid::nil().to_string());
        assert!(value.get("entitlements").is_none());
    }
}
