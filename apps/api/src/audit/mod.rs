//! Security audit trail.
//!
//! `AuditLogger` is passed explicitly (it lives in `AppState`); request-scoped fields are
//! attached with `with_context`, which returns a new logger for the lifetime of one
//! request. Every event goes to `tracing` on target `audit`, and a minimal row is written
//! through `AuditRepository`. Persistence is best-effort: its error is logged and
//! dropped, never returned to the caller.

pub mod context;

use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{error, warn, Level};
use uuid::Uuid;

pub use context::RequestContext;

use crate::store::{AuditRecord, AuditRepository, StoreResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AuditEventType {
    TokenGenerated,
    TokenValidated,
    TokenUsed,
    TokenExpired,
    TokenInvalidated,
    AccountActivationStarted,
    AccountActivationCompleted,
    AccountActivationFailed,
    PasswordValidationFailed,
    PasswordCreated,
    PasswordWarning,
    EmailSent,
    EmailFailed,
    SuspiciousActivity,
    RateLimitExceeded,
    InvalidTokenAttempt,
    WebhookProcessed,
    UserCreated,
    TenantCreated,
}

impl AuditEventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AuditEventType::TokenGenerated => "token_generated",
            AuditEventType::TokenValidated => "token_validated",
            AuditEventType::TokenUsed => "token_used",
            AuditEventType::TokenExpired => "token_expired",
            AuditEventType::TokenInvalidated => "token_invalidated",
            AuditEventType::AccountActivationStarted => "account_activation_started",
            AuditEventType::AccountActivationCompleted => "account_activation_completed",
            AuditEventType::AccountActivationFailed => "account_activation_failed",
            AuditEventType::PasswordValidationFailed => "password_validation_failed",
            AuditEventType::PasswordCreated => "password_created",
            AuditEventType::PasswordWarning => "password_warning",
            AuditEventType::EmailSent => "email_sent",
            AuditEventType::EmailFailed => "email_failed",
            AuditEventType::SuspiciousActivity => "suspicious_activity",
            AuditEventType::RateLimitExceeded => "rate_limit_exceeded",
            AuditEventType::InvalidTokenAttempt => "invalid_token_attempt",
            AuditEventType::WebhookProcessed => "webhook_processed",
            AuditEventType::UserCreated => "user_created",
            AuditEventType::TenantCreated => "tenant_created",
        }
    }

    fn default_severity(&self) -> Severity {
        match self {
            AuditEventType::SuspiciousActivity => Severity::High,
            AuditEventType::InvalidTokenAttempt
            | AuditEventType::RateLimitExceeded
            | AuditEventType::AccountActivationFailed
            | AuditEventType::EmailFailed
            | AuditEventType::TokenExpired
            | AuditEventType::PasswordValidationFailed => Severity::Medium,
            _ => Severity::Low,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    pub fn as_str(&self) -> &'static str {
        match self {
            Severity::Low => "low",
            Severity::Medium => "medium",
            Severity::High => "high",
            Severity::Critical => "critical",
        }
    }
}

/// One audit event. Build with `AuditEvent::new(..)` and the chained setters.
#[derive(Debug, Clone)]
pub struct AuditEvent {
    pub event_type: AuditEventType,
    pub severity: Severity,
    pub user_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub email: Option<String>,
    pub resource_id: Option<String>,
    pub success: bool,
    pub error: Option<String>,
    pub duration_ms: Option<u64>,
    pub details: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(event_type: AuditEventType) -> Self {
        Self {
            event_type,
            severity: event_type.default_severity(),
            user_id: None,
            tenant_id: None,
            email: None,
            resource_id: None,
            success: true,
            error: None,
            duration_ms: None,
            details: Map::new(),
        }
    }

    pub fn severity(mut self, severity: Severity) -> Self {
        self.severity = severity;
        self
    }

    pub fn user(mut self, user_id: Uuid) -> Self {
        self.user_id = Some(user_id);
        self
    }

    pub fn tenant(mut self, tenant_id: Uuid) -> Self {
        self.tenant_id = Some(tenant_id);
        self
    }

    pub fn email(mut self, email: impl Into<String>) -> Self {
        self.email = Some(email.into());
        self
    }

    pub fn resource(mut self, resource_id: impl Into<String>) -> Self {
        self.resource_id = Some(resource_id.into());
        self
    }

    pub fn failed(mut self, error: impl Into<String>) -> Self {
        self.success = false;
        self.error = Some(error.into());
        self
    }

    pub fn elapsed_since(mut self, started: Instant) -> Self {
        self.duration_ms = Some(started.elapsed().as_millis() as u64);
        self
    }

    pub fn detail(mut self, key: &str, value: impl Into<Value>) -> Self {
        self.details.insert(key.to_string(), value.into());
        self
    }
}

/// One `audit` target event at a fixed level; `tracing` needs the level at compile time.
macro_rules! emit_audit {
    ($level:expr, $event:expr, $ctx:expr, $details:expr) => {
        tracing::event!(
            target: "audit",
            $level,
            event_type = $event.event_type.as_str(),
            severity = $event.severity.as_str(),
            success = $event.success,
            user_id = ?$event.user_id,
            tenant_id = ?$event.tenant_id,
            email = ?$event.email,
            resource_id = ?$event.resource_id,
            error = ?$event.error,
            duration_ms = ?$event.duration_ms,
            ip = ?$ctx.ip,
            user_agent = ?$ctx.user_agent,
            request_id = %$ctx.request_id,
            details = %$details,
            "audit event"
        )
    };
}

#[derive(Clone)]
pub struct AuditLogger {
    store: Arc<dyn AuditRepository>,
    context: RequestContext,
}

impl AuditLogger {
    pub fn new(store: Arc<dyn AuditRepository>) -> Self {
        Self {
            store,
            context: RequestContext::default(),
        }
    }

    /// Returns a logger that stamps every event with the given request context.
    pub fn with_context(&self, context: RequestContext) -> Self {
        Self {
            store: self.store.clone(),
            context,
        }
    }

    pub fn context(&self) -> &RequestContext {
        &self.context
    }

    pub async fn log(&self, event: AuditEvent) {
        let details = Value::Object(event.details.clone()).to_string();
        let ctx = &self.context;

        match event.severity {
            Severity::Low => emit_audit!(Level::INFO, event, ctx, details),
            Severity::Medium | Severity::High => emit_audit!(Level::WARN, event, ctx, details),
            Severity::Critical => emit_audit!(Level::ERROR, event, ctx, details),
        }

        let record = AuditRecord {
            id: Uuid::new_v4(),
            event_type: event.event_type.as_str().to_string(),
            severity: event.severity.as_str().to_string(),
            success: event.success,
            created_at: Utc::now(),
        };

        // Auditing never fails the primary operation.
        if let Err(e) = self.persist(&record).await {
            warn!(
                target: "audit",
                event_type = %record.event_type,
                "Failed to persist audit event: {e}"
            );
        }

        if event.severity == Severity::Critical {
            self.alert(&event);
        }
    }

    async fn persist(&self, record: &AuditRecord) -> StoreResult<()> {
        self.store.insert(record).await
    }

    // Console alert. A paging integration plugs in here.
    fn alert(&self, event: &AuditEvent) {
        error!(
            target: "audit::alert",
            event_type = event.event_type.as_str(),
            user_id = ?event.user_id,
            tenant_id = ?event.tenant_id,
            ip = ?self.context.ip,
            request_id = %self.context.request_id,
            "CRITICAL security event: {}",
            event.error.as_deref().unwrap_or(event.event_type.as_str())
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::memory::MemoryStore;
    use crate::store::{StoreError, StoreResult};
    use async_trait::async_trait;

    struct FailingAuditStore;

    #[async_trait]
    impl AuditRepository for FailingAuditStore {
        async fn insert(&self, _record: &AuditRecord) -> StoreResult<()> {
            Err(StoreError::NotFound)
        }
    }

    #[derive(Default)]
    struct CapturingAuditStore {
        rows: std::sync::Mutex<Vec<AuditRecord>>,
    }

    #[async_trait]
    impl AuditRepository for CapturingAuditStore {
        async fn insert(&self, record: &AuditRecord) -> StoreResult<()> {
            self.rows.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    #[test]
    fn test_default_severities() {
        assert_eq!(
            AuditEvent::new(AuditEventType::SuspiciousActivity).severity,
            Severity::High
        );
        assert_eq!(
            AuditEvent::new(AuditEventType::TokenGenerated).severity,
            Severity::Low
        );
        assert_eq!(
            AuditEvent::new(AuditEventType::InvalidTokenAttempt).severity,
            Severity::Medium
        );
    }

    #[test]
    fn test_failed_marks_unsuccessful() {
        let event = AuditEvent::new(AuditEventType::EmailFailed).failed("smtp down");
        assert!(!event.success);
        assert_eq!(event.error.as_deref(), Some("smtp down"));
    }

    #[test]
    fn test_event_type_tags_are_snake_case() {
        assert_eq!(
            AuditEventType::AccountActivationCompleted.as_str(),
            "account_activation_completed"
        );
        assert_eq!(
            serde_json::to_string(&AuditEventType::RateLimitExceeded).unwrap(),
            "\"rate_limit_exceeded\""
        );
    }

    #[tokio::test]
    async fn test_log_persists_minimal_row() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store.clone());
        logger
            .log(AuditEvent::new(AuditEventType::TenantCreated).detail("slug", "acme"))
            .await;
        assert_eq!(store.audit_types(), vec!["tenant_created".to_string()]);
    }

    #[tokio::test]
    async fn test_every_severity_is_logged_with_context() {
        let store = Arc::new(CapturingAuditStore::default());
        let logger = AuditLogger::new(store.clone()).with_context(RequestContext {
            ip: Some("198.51.100.4".to_string()),
            user_agent: Some("curl/8".to_string()),
            request_id: "req-7".to_string(),
        });
        for severity in [
            Severity::Low,
            Severity::Medium,
            Severity::High,
            Severity::Critical,
        ] {
            logger
                .log(
                    AuditEvent::new(AuditEventType::SuspiciousActivity)
                        .severity(severity)
                        .email("jane@acme.test")
                        .detail("reason", "checkout"),
                )
                .await;
        }

        let severities: Vec<String> = store
            .rows
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.severity.clone())
            .collect();
        assert_eq!(severities, vec!["low", "medium", "high", "critical"]);
    }

    #[tokio::test]
    async fn test_persistence_failure_is_swallowed() {
        let logger = AuditLogger::new(Arc::new(FailingAuditStore));
        // Must return normally.
        logger
            .log(AuditEvent::new(AuditEventType::SuspiciousActivity).severity(Severity::Critical))
            .await;
    }

    #[tokio::test]
    async fn test_with_context_does_not_leak_into_parent() {
        let store = Arc::new(MemoryStore::new());
        let logger = AuditLogger::new(store);
        let scoped = logger.with_context(RequestContext {
            ip: Some("203.0.113.9".to_string()),
            user_agent: None,
            request_id: "req-1".to_string(),
        });
        assert_eq!(scoped.context().ip.as_deref(), Some("203.0.113.9"));
        assert!(logger.context().ip.is_none());
    }
}
