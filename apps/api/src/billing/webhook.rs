//! Stripe webhook intake: signature check, per-event idempotency, dispatch.

use hmac::{Hmac, Mac};
use serde::Deserialize;
use serde_json::Value;
use sha2::Sha256;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditLogger};
use crate::billing::checkout::{CheckoutFinalizer, FinalizeOutcome};
use crate::errors::AppError;
use crate::models::tenant::{BillingUpdate, TenantStatus};
use crate::store::Repositories;

type HmacSha256 = Hmac<Sha256>;

pub const SIGNATURE_TOLERANCE_SECS: i64 = 300;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SignatureError {
    #[error("Malformed Stripe-Signature header")]
    Malformed,

    #[error("Webhook timestamp outside the tolerance window")]
    Stale,

    #[error("No matching webhook signature")]
    Mismatch,
}

/// Verifies a `Stripe-Signature` header (`t=<unix>,v1=<hex>[,v1=...]`) against the raw
/// payload: HMAC-SHA256 over `"{t}.{payload}"`.
pub fn verify_signature(
    payload: &[u8],
    header: &str,
    secret: &str,
    now_unix: i64,
) -> Result<(), SignatureError> {
    let mut timestamp: Option<i64> = None;
    let mut signatures: Vec<Vec<u8>> = Vec::new();

    for part in header.split(',') {
        match part.trim().split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => {
                if let Ok(bytes) = hex::decode(value) {
                    signatures.push(bytes);
                }
            }
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or(SignatureError::Malformed)?;
    if signatures.is_empty() {
        return Err(SignatureError::Malformed);
    }
    if (now_unix - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        return Err(SignatureError::Stale);
    }

    for signature in &signatures {
        let mut mac =
            HmacSha256::new_from_slice(secret.as_bytes()).map_err(|_| SignatureError::Malformed)?;
        mac.update(timestamp.to_string().as_bytes());
        mac.update(b".");
        mac.update(payload);
        // verify_slice compares in constant time.
        if mac.verify_slice(signature).is_ok() {
            return Ok(());
        }
    }
    Err(SignatureError::Mismatch)
}

#[derive(Debug, Deserialize)]
pub struct StripeEvent {
    pub id: String,
    #[serde(rename = "type")]
    pub event_type: String,
    pub data: EventData,
}

#[derive(Debug, Deserialize)]
pub struct EventData {
    pub object: Value,
}

#[derive(Debug, PartialEq, Eq)]
pub enum WebhookOutcome {
    Duplicate,
    Ignored,
    Processed,
    Pending,
}

pub struct WebhookProcessor<'a> {
    pub repos: &'a Repositories,
    pub finalizer: &'a CheckoutFinalizer,
    pub audit: &'a AuditLogger,
}

impl WebhookProcessor<'_> {
    /// Handles one verified event. The marker is recorded only after the handler
    /// succeeds, so Stripe's redelivery retries failures.
    pub async fn process(&self, event: &StripeEvent) -> Result<WebhookOutcome, AppError> {
        let marker = format!("webhook:{}", event.id);
        if self.repos.markers.exists(&marker).await? {
            debug!(event_id = %event.id, "Duplicate webhook delivery");
            return Ok(WebhookOutcome::Duplicate);
        }

        let outcome = match event.event_type.as_str() {
            "checkout.session.completed" | "checkout.session.async_payment_succeeded" => {
                let session_id = object_str(&event.data.object, "id")
                    .ok_or_else(|| AppError::Validation("event has no session id".to_string()))?;
                match self.finalizer.finalize(session_id).await? {
                    FinalizeOutcome::Pending { .. } => WebhookOutcome::Pending,
                    _ => WebhookOutcome::Processed,
                }
            }
            "customer.subscription.updated" | "customer.subscription.deleted" => {
                self.sync_subscription(event).await?
            }
            other => {
                debug!(event_type = other, "Ignoring webhook event");
                WebhookOutcome::Ignored
            }
        };

        // Pending checkouts stay unmarked so the later paid event is not swallowed.
        if outcome != WebhookOutcome::Pending {
            self.repos.markers.record(&marker, &event.event_type).await?;
        }

        self.audit
            .log(
                AuditEvent::new(AuditEventType::WebhookProcessed)
                    .resource(event.id.clone())
                    .detail("event_type", event.event_type.clone())
                    .detail("outcome", format!("{outcome:?}")),
            )
            .await;

        Ok(outcome)
    }

    async fn sync_subscription(&self, event: &StripeEvent) -> Result<WebhookOutcome, AppError> {
        let object = &event.data.object;
        let Some(subscription_id) = object_str(object, "id") else {
            return Ok(WebhookOutcome::Ignored);
        };
        let Some(tenant) = self
            .repos
            .tenants
            .find_by_subscription_id(subscription_id)
            .await?
        else {
            warn!(subscription_id, "Subscription event for unknown tenant");
            return Ok(WebhookOutcome::Ignored);
        };

        let status = if event.event_type == "customer.subscription.deleted" {
            Some(TenantStatus::Cancelled)
        } else {
            object_str(object, "status").and_then(map_subscription_status)
        };

        let Some(status) = status else {
            return Ok(WebhookOutcome::Ignored);
        };

        self.repos
            .tenants
            .update_billing(
                tenant.id,
                &BillingUpdate {
                    status: Some(status),
                    ..Default::default()
                },
            )
            .await?;
        info!(tenant = %tenant.slug, %status, "Tenant status synced from subscription");
        Ok(WebhookOutcome::Processed)
    }
}

fn object_str<'v>(object: &'v Value, key: &str) -> Option<&'v str> {
    object.get(key).and_then(Value::as_str)
}

fn map_subscription_status(status: &str) -> Option<TenantStatus> {
    match status {
        "trialing" => Some(TenantStatus::Trial),
        "active" => Some(TenantStatus::Active),
        "past_due" | "unpaid" | "paused" => Some(TenantStatus::Suspended),
        "canceled" | "incomplete_expired" => Some(TenantStatus::Cancelled),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use serde_json::json;

    use super::*;
    use crate::billing::stripe::fake::FakePayments;
    use crate::billing::stripe::{CheckoutSession, CustomerDetails};
    use crate::notify::fake::RecordingNotifier;
    use crate::notify::LinkSettings;
    use crate::store::memory::MemoryStore;

    const SECRET: &str = "whsec_test";

    fn sign(payload: &[u8], timestamp: i64) -> String {
        let mut mac = HmacSha256::new_from_slice(SECRET.as_bytes()).unwrap();
        mac.update(format!("{timestamp}.").as_bytes());
        mac.update(payload);
        format!("t={timestamp},v1={}", hex::encode(mac.finalize().into_bytes()))
    }

    #[test]
    fn test_valid_signature_accepted() {
        let payload = br#"{"id":"evt_1"}"#;
        let header = sign(payload, 1_700_000_000);
        assert_eq!(
            verify_signature(payload, &header, SECRET, 1_700_000_100),
            Ok(())
        );
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let header = sign(br#"{"id":"evt_1"}"#, 1_700_000_000);
        assert_eq!(
            verify_signature(br#"{"id":"evt_2"}"#, &header, SECRET, 1_700_000_000),
            Err(SignatureError::Mismatch)
        );
    }

    #[test]
    fn test_stale_timestamp_rejected() {
        let payload = b"{}";
        let header = sign(payload, 1_700_000_000);
        assert_eq!(
            verify_signature(payload, &header, SECRET, 1_700_000_000 + 301),
            Err(SignatureError::Stale)
        );
    }

    #[test]
    fn test_malformed_header_rejected() {
        assert_eq!(
            verify_signature(b"{}", "v1=abcd", SECRET, 0),
            Err(SignatureError::Malformed)
        );
        assert_eq!(
            verify_signature(b"{}", "t=123", SECRET, 123),
            Err(SignatureError::Malformed)
        );
    }

    #[test]
    fn test_any_matching_v1_accepted() {
        let payload = b"{}";
        let good = sign(payload, 1_000);
        let header = format!("t=1000,v1={},{}", "00".repeat(32), &good[7..]);
        assert_eq!(verify_signature(payload, &header, SECRET, 1_000), Ok(()));
    }

    fn event(id: &str, event_type: &str, object: Value) -> StripeEvent {
        serde_json::from_value(json!({
            "id": id,
            "type": event_type,
            "data": { "object": object }
        }))
        .unwrap()
    }

    struct Fixture {
        store: Arc<MemoryStore>,
        repos: Repositories,
        finalizer: CheckoutFinalizer,
        audit: AuditLogger,
        notifier: Arc<RecordingNotifier>,
    }

    fn fixture() -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let repos = Repositories::from_store(store.clone());
        let audit = AuditLogger::new(store.clone());
        let notifier = Arc::new(RecordingNotifier::default());
        let payments = FakePayments::default().with_session(CheckoutSession {
            id: "cs_1".to_string(),
            payment_status: Some("paid".to_string()),
            customer: Some("cus_1".to_string()),
            subscription: Some("sub_1".to_string()),
            customer_details: Some(CustomerDetails {
                email: Some("owner@initech.test".to_string()),
                name: None,
            }),
            ..Default::default()
        });
        let finalizer = CheckoutFinalizer::new(
            repos.clone(),
            Arc::new(payments),
            notifier.clone(),
            audit.clone(),
            LinkSettings {
                token_ttl_hours: 48,
                app_base_url: "https://app.test".to_string(),
            },
        );
        Fixture {
            store,
            repos,
            finalizer,
            audit,
            notifier,
        }
    }

    #[tokio::test]
    async fn test_checkout_event_finalizes_once() {
        let f = fixture();
        let processor = WebhookProcessor {
            repos: &f.repos,
            finalizer: &f.finalizer,
            audit: &f.audit,
        };
        let evt = event("evt_1", "checkout.session.completed", json!({"id": "cs_1"}));

        assert_eq!(processor.process(&evt).await.unwrap(), WebhookOutcome::Processed);
        assert_eq!(processor.process(&evt).await.unwrap(), WebhookOutcome::Duplicate);
        assert_eq!(f.store.tenants().len(), 1);
        assert_eq!(f.notifier.count(), 1);
        assert!(f.store.has_marker("webhook:evt_1"));
    }

    #[tokio::test]
    async fn test_subscription_deleted_cancels_tenant() {
        let f = fixture();
        let processor = WebhookProcessor {
            repos: &f.repos,
            finalizer: &f.finalizer,
            audit: &f.audit,
        };
        processor
            .process(&event("evt_1", "checkout.session.completed", json!({"id": "cs_1"})))
            .await
            .unwrap();

        let outcome = processor
            .process(&event(
                "evt_2",
                "customer.subscription.deleted",
                json!({"id": "sub_1", "status": "canceled"}),
            ))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Processed);
        assert_eq!(f.store.tenants()[0].status, TenantStatus::Cancelled);
    }

    #[tokio::test]
    async fn test_unknown_event_is_ignored_and_marked() {
        let f = fixture();
        let processor = WebhookProcessor {
            repos: &f.repos,
            finalizer: &f.finalizer,
            audit: &f.audit,
        };
        let outcome = processor
            .process(&event("evt_9", "invoice.created", json!({"id": "in_1"})))
            .await
            .unwrap();
        assert_eq!(outcome, WebhookOutcome::Ignored);
        assert!(f.store.has_marker("webhook:evt_9"));
    }

    #[test]
    fn test_subscription_status_mapping() {
        assert_eq!(map_subscription_status("past_due"), Some(TenantStatus::Suspended));
        assert_eq!(map_subscription_status("trialing"), Some(TenantStatus::Trial));
        assert_eq!(map_subscription_status("incomplete"), None);
    }
}
