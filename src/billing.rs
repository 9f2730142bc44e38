//! Thin billing seam.
//!
//! No Stripe SDK call ever happens here — `async-stripe` is dropped from
//! the dependency set entirely (see `DESIGN.md`). What's left is exactly
//! the two things the core pipeline actually needs from billing: verifying
//! a webhook came from Stripe, and flipping a site's plan once it has.
//! Signature verification is ported from `tinyzkp_api`'s
//! `verify_stripe_signature` unchanged.

use hmac::{Hmac, Mac};
use sha2::Sha256;

use crate::store::{Plan, SitePlan, Store, StoreError};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    #[error("missing stripe-signature header")]
    MissingSignatureHeader,
    #[error("malformed stripe-signature header")]
    MalformedSignatureHeader,
    #[error("signature mismatch")]
    SignatureMismatch,
    #[error("invalid webhook payload: {0}")]
    InvalidPayload(String),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Verifies a Stripe-style `t=...,v1=...` signature header over `payload`.
pub fn verify_webhook_signature(
    sig_header: &str,
    payload: &str,
    secret: &str,
) -> Result<(), BillingError> {
    let mut timestamp = None;
    let mut signature = None;
    for part in sig_header.split(',') {
        if let Some((key, value)) = part.split_once('=') {
            match key {
                "t" => timestamp = Some(value),
                "v1" => signature = Some(value),
                _ => {}
            }
        }
    }
    let timestamp = timestamp.ok_or(BillingError::MalformedSignatureHeader)?;
    let expected_sig = signature.ok_or(BillingError::MalformedSignatureHeader)?;

    let signed_payload = format!("{timestamp}.{payload}");
    let mut mac = HmacSha256::new_from_slice(secret.as_bytes())
        .map_err(|_| BillingError::MalformedSignatureHeader)?;
    mac.update(signed_payload.as_bytes());
    let computed_sig = hex::encode(mac.finalize().into_bytes());

    if computed_sig != expected_sig {
        return Err(BillingError::SignatureMismatch);
    }
    Ok(())
}

/// What a verified webhook event resolves to: which site, and which plan it
/// should now be on.
pub struct PlanFlip {
    pub site_id: String,
    pub plan: Plan,
    pub stripe_customer_id: Option<String>,
    pub stripe_subscription_id: Option<String>,
}

/// Parses the subset of a Stripe event this pipeline cares about
/// (`checkout.session.completed`, `customer.subscription.deleted`) into a
/// plan flip. Unrecognized event types return `Ok(None)` — not every Stripe
/// event needs to do anything here.
pub fn parse_plan_flip(payload: &serde_json::Value) -> Result<Option<PlanFlip>, BillingError> {
    let event_type = payload.get("type").and_then(|t| t.as_str()).unwrap_or("");
    let obj = payload
        .get("data")
        .and_then(|d| d.get("object"))
        .and_then(|o| o.as_object())
        .ok_or_else(|| BillingError::InvalidPayload("missing data.object".to_string()))?;

    let site_id = obj
        .get("metadata")
        .and_then(|m| m.get("site_id"))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string());

    match event_type {
        "checkout.session.completed" => {
            let Some(site_id) = site_id else { return Ok(None) };
            let plan = obj
                .get("metadata")
                .and_then(|m| m.get("plan"))
                .and_then(|v| v.as_str())
                .and_then(|s| s.parse::<Plan>().ok())
                .unwrap_or(Plan::Standard);
            Ok(Some(PlanFlip {
                site_id,
                plan,
                stripe_customer_id: obj.get("customer").and_then(|v| v.as_str()).map(String::from),
                stripe_subscription_id: obj.get("subscription").and_then(|v| v.as_str()).map(String::from),
            }))
        }
        "customer.subscription.deleted" => {
            let Some(site_id) = site_id else { return Ok(None) };
            Ok(Some(PlanFlip {
                site_id,
                plan: Plan::Free,
                stripe_customer_id: obj.get("customer").and_then(|v| v.as_str()).map(String::from),
                stripe_subscription_id: None,
            }))
        }
        _ => Ok(None),
    }
}

/// Applies a plan flip, creating the `SitePlan` row if it doesn't exist yet.
pub async fn apply_plan_flip<S: Store>(
    store: &S,
    now: chrono::DateTime<chrono::Utc>,
    flip: PlanFlip,
) -> Result<(), BillingError> {
    let existing = store.get_site_plan(&flip.site_id).await?;
    let created_at = existing.as_ref().map(|p| p.created_at).unwrap_or(now);
    store
        .upsert_site_plan(SitePlan {
            site_id: flip.site_id,
            plan: flip.plan,
            stripe_customer_id: flip.stripe_customer_id,
            stripe_subscription_id: flip.stripe_subscription_id,
            created_at,
            updated_at: now,
        })
        .await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sign(secret: &str, payload: &str, timestamp: &str) -> String {
        let signed_payload = format!("{timestamp}.{payload}");
        let mut mac = HmacSha256::new_from_slice(secret.as_bytes()).unwrap();
        mac.update(signed_payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    #[test]
    fn verifies_a_correctly_signed_payload() {
        let secret = "whsec_test";
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let sig = sign(secret, payload, "1700000000");
        let header = format!("t=1700000000,v1={sig}");
        assert!(verify_webhook_signature(&header, payload, secret).is_ok());
    }

    #[test]
    fn rejects_a_tampered_payload() {
        let secret = "whsec_test";
        let payload = r#"{"type":"checkout.session.completed"}"#;
        let sig = sign(secret, payload, "1700000000");
        let header = format!("t=1700000000,v1={sig}");
        let tampered = r#"{"type":"customer.subscription.deleted"}"#;
        assert!(verify_webhook_signature(&header, tampered, secret).is_err());
    }

    #[test]
    fn parses_checkout_completed_into_a_plan_flip() {
        let payload = serde_json::json!({
            "type": "checkout.session.completed",
            "data": { "object": {
                "metadata": { "site_id": "site-a", "plan": "pro" },
                "customer": "cus_123",
                "subscription": "sub_456",
            }}
        });
        let flip = parse_plan_flip(&payload).unwrap().unwrap();
        assert_eq!(flip.site_id, "site-a");
        assert!(matches!(flip.plan, Plan::Pro));
        assert_eq!(flip.stripe_customer_id.as_deref(), Some("cus_123"));
    }

    #[test]
    fn unrecognized_event_types_are_ignored() {
        let payload = serde_json::json!({"type": "invoice.paid", "data": {"object": {}}});
        assert!(parse_plan_flip(&payload).unwrap().is_none());
    }
}
