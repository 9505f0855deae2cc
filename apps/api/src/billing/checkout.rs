//! Checkout finalization: paid Stripe session → tenant + inactive admin user +
//! activation email.
//!
//! Safe to call repeatedly and concurrently for one session. Duplicate suppression comes
//! from store constraints, not locks:
//! - `finalize:<session>` is written last; its presence short-circuits every later call.
//! - tenant inserts that lose a race hit a unique constraint and re-read the winner.
//! - users are upserted on `(email, tenant_id)`.
//! - `finalize-email:<session>` is claimed insert-if-absent before a token is minted, so
//!   only one caller sends the activation email. The holder writes
//!   `finalize-email-sent:<session>` once delivery is confirmed; a caller that lost the
//!   claim reports `Pending` until then, so the completion marker never precedes a send.

use std::sync::Arc;
use std::time::Instant;

use anyhow::anyhow;
use serde::Serialize;
use tracing::{info, warn};

use crate::audit::{AuditEvent, AuditEventType, AuditLogger, Severity};
use crate::auth::tokens::{ActivationTokenService, MintRequest, TokenError};
use crate::billing::stripe::{CheckoutSession, PaymentProvider};
use crate::errors::AppError;
use crate::models::tenant::{
    slugify, BillingUpdate, NewTenant, PlanTier, Tenant, TenantStatus, TenantSummary,
};
use crate::models::user::{normalize_email, NewUser, Role, User, UserSummary};
use crate::notify::{ActivationEmail, EmailNotifier, LinkSettings};
use crate::store::{
    Repositories, StoreError, TENANT_CUSTOMER_KEY, TENANT_SLUG_KEY, TENANT_SUBSCRIPTION_KEY,
};

const MAX_SLUG_ATTEMPTS: u32 = 20;
const FALLBACK_SLUG: &str = "workspace";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum PendingReason {
    Unpaid,
    NoEmail,
    EmailInFlight,
}

impl PendingReason {
    pub fn message(&self) -> &'static str {
        match self {
            PendingReason::Unpaid => "Payment has not been confirmed yet",
            PendingReason::NoEmail => "No contact email is available for this checkout yet",
            PendingReason::EmailInFlight => {
                "The activation email is still being sent, retry shortly"
            }
        }
    }

    fn marker_suffix(&self) -> &'static str {
        match self {
            PendingReason::Unpaid => "unpaid",
            PendingReason::NoEmail => "no-email",
            PendingReason::EmailInFlight => "email-in-flight",
        }
    }
}

/// Result of the per-session activation email step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EmailStep {
    /// This call delivered the email.
    Sent,
    /// Nothing left to send: the user is active or another call confirmed delivery.
    Settled,
    /// Another call holds the claim and has not confirmed delivery yet.
    InFlight,
}

#[derive(Debug, Clone)]
pub enum FinalizeOutcome {
    AlreadyProcessed,
    Pending {
        reason: PendingReason,
    },
    Completed {
        tenant: TenantSummary,
        user: UserSummary,
        activation_email_sent: bool,
    },
}

pub struct CheckoutFinalizer {
    repos: Repositories,
    payments: Arc<dyn PaymentProvider>,
    notifier: Arc<dyn EmailNotifier>,
    tokens: ActivationTokenService,
    audit: AuditLogger,
    links: LinkSettings,
}

/// Which lookup a tenant creation must re-read after losing an insert race.
#[derive(Clone, Copy, PartialEq, Eq)]
enum SlugMode {
    /// Slug came from checkout metadata and must be used as-is.
    Exact,
    /// Slug derived from a name; append `-2`, `-3`… on unrelated conflicts.
    Derived,
}

impl CheckoutFinalizer {
    pub fn new(
        repos: Repositories,
        payments: Arc<dyn PaymentProvider>,
        notifier: Arc<dyn EmailNotifier>,
        audit: AuditLogger,
        links: LinkSettings,
    ) -> Self {
        let tokens = ActivationTokenService::new(repos.tokens.clone(), audit.clone());
        Self {
            repos,
            payments,
            notifier,
            tokens,
            audit,
            links,
        }
    }

    #[cfg(test)]
    pub fn with_secret_source(mut self, source: fn() -> String) -> Self {
        self.tokens = self.tokens.with_secret_source(source);
        self
    }

    pub async fn finalize(&self, session_id: &str) -> Result<FinalizeOutcome, AppError> {
        let started = Instant::now();
        let session_id = session_id.trim();
        if session_id.is_empty() {
            return Err(AppError::Validation("sessionId is required".to_string()));
        }

        let done_key = completion_key(session_id);
        if self.repos.markers.exists(&done_key).await? {
            info!(session_id, "Checkout already finalized");
            return Ok(FinalizeOutcome::AlreadyProcessed);
        }

        let session = self.payments.retrieve_checkout_session(session_id).await?;
        if !session.is_paid() {
            return self.pending(session_id, PendingReason::Unpaid).await;
        }

        let Some((email, customer_name)) = self.resolve_email(&session).await? else {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::SuspiciousActivity)
                        .severity(Severity::Medium)
                        .resource(session_id)
                        .failed("paid checkout without a resolvable email"),
                )
                .await;
            return self.pending(session_id, PendingReason::NoEmail).await;
        };

        let tenant = self.resolve_tenant(&session, &email, customer_name).await?;
        let user = self.upsert_admin(&session, &email, &tenant).await?;
        let step = self.send_activation_once(session_id, &tenant, &user).await?;
        let activation_email_sent = match step {
            EmailStep::Sent => true,
            EmailStep::Settled => false,
            EmailStep::InFlight => {
                return self.pending(session_id, PendingReason::EmailInFlight).await
            }
        };

        // Written last: a failure above leaves the session retryable.
        self.repos
            .markers
            .record(&done_key, "checkout.session.completed")
            .await?;

        self.audit
            .log(
                AuditEvent::new(AuditEventType::WebhookProcessed)
                    .tenant(tenant.id)
                    .user(user.id)
                    .resource(session_id)
                    .detail("activation_email_sent", activation_email_sent)
                    .elapsed_since(started),
            )
            .await;

        Ok(FinalizeOutcome::Completed {
            tenant: TenantSummary::from(&tenant),
            user: UserSummary::from(&user),
            activation_email_sent,
        })
    }

    async fn pending(
        &self,
        session_id: &str,
        reason: PendingReason,
    ) -> Result<FinalizeOutcome, AppError> {
        let key = format!("{}:{}", completion_key(session_id), reason.marker_suffix());
        self.repos
            .markers
            .record(&key, "checkout.session.pending")
            .await?;
        info!(session_id, ?reason, "Checkout finalization pending");
        Ok(FinalizeOutcome::Pending { reason })
    }

    /// Session email → session `customer_email` → Stripe customer → metadata.
    /// Also returns the best display name seen along the way.
    async fn resolve_email(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<(String, Option<String>)>, AppError> {
        let details = session.customer_details.clone().unwrap_or_default();
        let mut name = details.name.filter(|n| !n.trim().is_empty());

        let mut email = details
            .email
            .or_else(|| session.customer_email.clone())
            .filter(|e| e.contains('@'));

        if email.is_none() {
            if let Some(customer_id) = session.customer.as_deref() {
                if let Some(customer) = self.payments.retrieve_customer(customer_id).await? {
                    email = customer.email.filter(|e| e.contains('@'));
                    name = name.or(customer.name);
                }
            }
        }

        let email = email.or_else(|| {
            session
                .metadata_value("email")
                .filter(|e| e.contains('@'))
                .map(String::from)
        });

        Ok(email.map(|e| (normalize_email(&e), name)))
    }

    async fn resolve_tenant(
        &self,
        session: &CheckoutSession,
        email: &str,
        customer_name: Option<String>,
    ) -> Result<Tenant, AppError> {
        let tenants = &self.repos.tenants;

        if let Some(hint) = session.metadata_value("tenantSlug").map(slugify) {
            if !hint.is_empty() {
                // An explicit slug never falls back to provider-id matching.
                return match tenants.find_by_slug(&hint).await? {
                    Some(existing) => self.update_existing(existing, session).await,
                    None => {
                        let name = session
                            .metadata_value("companyName")
                            .map(String::from)
                            .unwrap_or_else(|| hint.clone());
                        self.create_tenant(session, name, hint, SlugMode::Exact).await
                    }
                };
            }
        }

        if let Some(existing) = self.find_by_provider_refs(session).await? {
            return self.update_existing(existing, session).await;
        }

        let name = display_name(session, customer_name, email);
        let base = match slugify(&name) {
            s if s.is_empty() => FALLBACK_SLUG.to_string(),
            s => s,
        };
        self.create_tenant(session, name, base, SlugMode::Derived).await
    }

    async fn find_by_provider_refs(
        &self,
        session: &CheckoutSession,
    ) -> Result<Option<Tenant>, AppError> {
        if let Some(customer_id) = session.customer.as_deref() {
            if let Some(t) = self.repos.tenants.find_by_customer_id(customer_id).await? {
                return Ok(Some(t));
            }
        }
        if let Some(subscription_id) = session.subscription.as_deref() {
            if let Some(t) = self
                .repos
                .tenants
                .find_by_subscription_id(subscription_id)
                .await?
            {
                return Ok(Some(t));
            }
        }
        Ok(None)
    }

    async fn create_tenant(
        &self,
        session: &CheckoutSession,
        name: String,
        base_slug: String,
        mode: SlugMode,
    ) -> Result<Tenant, AppError> {
        // Never take provider ids another tenant already holds.
        let mut customer_id = self.unclaimed_customer(session, None).await?;
        let mut subscription_id = self.unclaimed_subscription(session, None).await?;
        if session.customer.is_some() && customer_id.is_none() {
            subscription_id = None;
            self.log_claim_conflict(session, &base_slug).await;
        }

        let mut attempt = 1;
        loop {
            let slug = if attempt == 1 {
                base_slug.clone()
            } else {
                format!("{base_slug}-{attempt}")
            };

            let new_tenant = NewTenant {
                name: name.clone(),
                slug: slug.clone(),
                plan: plan_from(session).unwrap_or_default(),
                status: status_from(session),
                stripe_customer_id: customer_id.clone(),
                stripe_subscription_id: subscription_id.clone(),
            };

            match self.repos.tenants.insert(&new_tenant).await {
                Ok(tenant) => {
                    self.audit
                        .log(
                            AuditEvent::new(AuditEventType::TenantCreated)
                                .tenant(tenant.id)
                                .resource(session.id.clone())
                                .detail("slug", tenant.slug.clone())
                                .detail("plan", tenant.plan.as_str()),
                        )
                        .await;
                    return Ok(tenant);
                }
                Err(StoreError::UniqueViolation(constraint)) => {
                    // A concurrent finalize of this session may have created it first.
                    if let Some(winner) = self.find_race_winner(session, &base_slug, mode).await? {
                        return self.update_existing(winner, session).await;
                    }

                    if constraint == TENANT_CUSTOMER_KEY || constraint == TENANT_SUBSCRIPTION_KEY {
                        // Claimed by another tenant between the check and the insert.
                        customer_id = None;
                        subscription_id = None;
                        continue;
                    }

                    if constraint == TENANT_SLUG_KEY && mode == SlugMode::Derived {
                        attempt += 1;
                        if attempt <= MAX_SLUG_ATTEMPTS {
                            continue;
                        }
                    }

                    return Err(AppError::Conflict(format!(
                        "Tenant slug '{slug}' is already taken"
                    )));
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    async fn find_race_winner(
        &self,
        session: &CheckoutSession,
        base_slug: &str,
        mode: SlugMode,
    ) -> Result<Option<Tenant>, AppError> {
        match mode {
            SlugMode::Exact => Ok(self.repos.tenants.find_by_slug(base_slug).await?),
            SlugMode::Derived => self.find_by_provider_refs(session).await,
        }
    }

    /// Applies plan/status from the session. Provider ids are only filled in when the
    /// tenant has none and no other tenant holds them; an existing different customer
    /// id is left alone and reported.
    async fn update_existing(
        &self,
        tenant: Tenant,
        session: &CheckoutSession,
    ) -> Result<Tenant, AppError> {
        let mut update = BillingUpdate {
            plan: plan_from(session),
            status: Some(status_from(session)),
            ..Default::default()
        };

        let customer_matches = match (&tenant.stripe_customer_id, &session.customer) {
            (Some(current), Some(incoming)) if current != incoming => {
                self.log_claim_conflict(session, &tenant.slug).await;
                false
            }
            (None, Some(_)) => {
                update.stripe_customer_id = self.unclaimed_customer(session, Some(&tenant)).await?;
                update.stripe_customer_id.is_some()
            }
            (Some(_), Some(_)) => true,
            (_, None) => tenant.stripe_customer_id.is_none(),
        };

        if customer_matches && tenant.stripe_subscription_id != session.subscription {
            update.stripe_subscription_id =
                self.unclaimed_subscription(session, Some(&tenant)).await?;
        }

        match self.repos.tenants.update_billing(tenant.id, &update).await {
            Ok(updated) => Ok(updated),
            Err(e)
                if e.is_unique_violation_of(TENANT_CUSTOMER_KEY)
                    || e.is_unique_violation_of(TENANT_SUBSCRIPTION_KEY) =>
            {
                warn!(tenant = %tenant.slug, "Provider ids claimed concurrently, keeping billing state only");
                let billing_only = BillingUpdate {
                    plan: update.plan,
                    status: update.status,
                    ..Default::default()
                };
                Ok(self
                    .repos
                    .tenants
                    .update_billing(tenant.id, &billing_only)
                    .await?)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn unclaimed_customer(
        &self,
        session: &CheckoutSession,
        owner: Option<&Tenant>,
    ) -> Result<Option<String>, AppError> {
        let Some(customer_id) = session.customer.as_deref() else {
            return Ok(None);
        };
        let holder = self.repos.tenants.find_by_customer_id(customer_id).await?;
        Ok(is_free_for(holder, owner).then(|| customer_id.to_string()))
    }

    async fn unclaimed_subscription(
        &self,
        session: &CheckoutSession,
        owner: Option<&Tenant>,
    ) -> Result<Option<String>, AppError> {
        let Some(subscription_id) = session.subscription.as_deref() else {
            return Ok(None);
        };
        let holder = self
            .repos
            .tenants
            .find_by_subscription_id(subscription_id)
            .await?;
        Ok(is_free_for(holder, owner).then(|| subscription_id.to_string()))
    }

    async fn log_claim_conflict(&self, session: &CheckoutSession, slug: &str) {
        self.audit
            .log(
                AuditEvent::new(AuditEventType::SuspiciousActivity)
                    .resource(session.id.clone())
                    .detail("tenant_slug", slug)
                    .detail("stripe_customer_id", session.customer.clone())
                    .failed("payment customer already bound to a different tenant"),
            )
            .await;
    }

    async fn upsert_admin(
        &self,
        session: &CheckoutSession,
        email: &str,
        tenant: &Tenant,
    ) -> Result<User, AppError> {
        let existed = self
            .repos
            .users
            .find_by_email_and_tenant(email, tenant.id)
            .await?
            .is_some();

        let name = session
            .metadata_value("fullName")
            .map(String::from)
            .or_else(|| session.customer_details.as_ref().and_then(|d| d.name.clone()));

        let user = self
            .repos
            .users
            .upsert_pending(&NewUser {
                email: email.to_string(),
                name,
                role: Role::Admin,
                tenant_id: tenant.id,
            })
            .await?;

        if !existed {
            self.audit
                .log(
                    AuditEvent::new(AuditEventType::UserCreated)
                        .user(user.id)
                        .tenant(tenant.id)
                        .email(user.email.clone())
                        .detail("role", user.role.as_str()),
                )
                .await;
        }
        Ok(user)
    }

    /// Sends at most one activation email per session.
    async fn send_activation_once(
        &self,
        session_id: &str,
        tenant: &Tenant,
        user: &User,
    ) -> Result<EmailStep, AppError> {
        if user.is_active {
            return Ok(EmailStep::Settled);
        }

        let claim = format!("finalize-email:{session_id}");
        let sent_key = format!("finalize-email-sent:{session_id}");
        if !self
            .repos
            .markers
            .record(&claim, "checkout.activation_email")
            .await?
        {
            if self.repos.markers.exists(&sent_key).await? {
                return Ok(EmailStep::Settled);
            }
            info!(session_id, "Activation email claimed by another attempt, not yet confirmed");
            return Ok(EmailStep::InFlight);
        }

        match self.mint_and_send(tenant, user).await {
            Ok(sent) => {
                self.repos
                    .markers
                    .record(&sent_key, "checkout.activation_email_sent")
                    .await?;
                Ok(if sent { EmailStep::Sent } else { EmailStep::Settled })
            }
            Err(e) => {
                if let Err(release_err) = self.repos.markers.release(&claim).await {
                    warn!(session_id, "Failed to release activation email claim: {release_err}");
                }
                Err(e)
            }
        }
    }

    async fn mint_and_send(&self, tenant: &Tenant, user: &User) -> Result<bool, AppError> {
        let minted = self
            .tokens
            .create_activation_token(MintRequest {
                email: &user.email,
                user_id: user.id,
                tenant_id: tenant.id,
                expires_in_hours: self.links.token_ttl_hours,
                created_from_ip: self.audit.context().ip.as_deref(),
            })
            .await;

        let raw = match minted {
            Ok(raw) => raw,
            Err(TokenError::DuplicateTokenHash) => {
                // A concurrent mint holds the live token and sends its email.
                let latest = self.tokens.latest_unused_token(user.id, tenant.id).await?;
                warn!(
                    user_id = %user.id,
                    live_token = ?latest.map(|t| t.id),
                    "Token hash collision, skipping activation email"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };

        let activation_url = self.links.activation_url(&raw);
        let email = ActivationEmail {
            to: &user.email,
            tenant_name: &tenant.name,
            activation_url: &activation_url,
            expires_in_hours: self.links.token_ttl_hours,
        };

        match self.notifier.send_activation(&email).await {
            Ok(()) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::EmailSent)
                            .user(user.id)
                            .tenant(tenant.id)
                            .email(user.email.clone())
                            .detail("template", "activation"),
                    )
                    .await;
                Ok(true)
            }
            Err(e) => {
                self.audit
                    .log(
                        AuditEvent::new(AuditEventType::EmailFailed)
                            .user(user.id)
                            .tenant(tenant.id)
                            .email(user.email.clone())
                            .failed(e.to_string()),
                    )
                    .await;
                Err(AppError::Internal(anyhow!(
                    "activation email could not be sent: {e}"
                )))
            }
        }
    }
}

fn completion_key(session_id: &str) -> String {
    format!("finalize:{session_id}")
}

fn is_free_for(holder: Option<Tenant>, owner: Option<&Tenant>) -> bool {
    match (holder, owner) {
        (None, _) => true,
        (Some(h), Some(o)) => h.id == o.id,
        (Some(_), None) => false,
    }
}

fn plan_from(session: &CheckoutSession) -> Option<PlanTier> {
    session
        .metadata_value("plan")
        .and_then(|p| p.parse::<PlanTier>().ok())
}

fn status_from(session: &CheckoutSession) -> TenantStatus {
    if session.is_trial() {
        TenantStatus::Trial
    } else {
        TenantStatus::Active
    }
}

/// Company name from metadata, else the payer's name, else the email domain label.
fn display_name(session: &CheckoutSession, customer_name: Option<String>, email: &str) -> String {
    session
        .metadata_value("companyName")
        .map(String::from)
        .or(customer_name)
        .unwrap_or_else(|| {
            email
                .split('@')
                .nth(1)
                .and_then(|domain| domain.split('.').next())
                .filter(|label| !label.is_empty())
                .unwrap_or(FALLBACK_SLUG)
                .to_string()
        })
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::sync::atomic::Ordering;

    use super::*;
    use crate::billing::stripe::fake::FakePayments;
    use crate::billing::stripe::{CustomerDetails, Customer};
    use crate::notify::fake::RecordingNotifier;
    use crate::store::memory::MemoryStore;
    use crate::store::EventMarkerRepository;

    struct Harness {
        store: Arc<MemoryStore>,
        payments: Arc<FakePayments>,
        notifier: Arc<RecordingNotifier>,
    }

    impl Harness {
        fn new(payments: FakePayments) -> Self {
            Self {
                store: Arc::new(MemoryStore::new()),
                payments: Arc::new(payments),
                notifier: Arc::new(RecordingNotifier::default()),
            }
        }

        fn finalizer(&self) -> CheckoutFinalizer {
            CheckoutFinalizer::new(
                Repositories::from_store(self.store.clone()),
                self.payments.clone(),
                self.notifier.clone(),
                AuditLogger::new(self.store.clone()),
                LinkSettings {
                    token_ttl_hours: 48,
                    app_base_url: "https://app.test".to_string(),
                },
            )
        }
    }

    fn paid_session(id: &str, customer: &str, metadata: &[(&str, &str)]) -> CheckoutSession {
        CheckoutSession {
            id: id.to_string(),
            status: Some("complete".to_string()),
            payment_status: Some("paid".to_string()),
            customer: Some(customer.to_string()),
            subscription: Some(format!("sub_{customer}")),
            customer_email: None,
            customer_details: Some(CustomerDetails {
                email: Some("Jane@Acme.test".to_string()),
                name: Some("Jane Doe".to_string()),
            }),
            metadata: metadata
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect::<HashMap<_, _>>(),
        }
    }

    #[tokio::test]
    async fn test_finalize_creates_tenant_user_and_sends_email() {
        let h = Harness::new(FakePayments::default().with_session(paid_session(
            "cs_1",
            "cus_1",
            &[("companyName", "Acme Corp"), ("plan", "pro")],
        )));

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        let FinalizeOutcome::Completed { tenant, user, activation_email_sent } = outcome else {
            panic!("expected completion");
        };

        assert_eq!(tenant.slug, "acme-corp");
        assert_eq!(tenant.plan, PlanTier::Professional);
        assert_eq!(tenant.status, TenantStatus::Active);
        assert_eq!(user.email, "jane@acme.test");
        assert_eq!(user.role, Role::Admin);
        assert!(!user.is_active);
        assert!(activation_email_sent);
        assert_eq!(h.notifier.count(), 1);
        assert!(h.store.has_marker("finalize:cs_1"));
        assert_eq!(
            h.store.tenants()[0].stripe_customer_id.as_deref(),
            Some("cus_1")
        );
    }

    #[tokio::test]
    async fn test_finalize_twice_is_idempotent() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_1", "cus_1", &[])),
        );

        h.finalizer().finalize("cs_1").await.unwrap();
        let second = h.finalizer().finalize("cs_1").await.unwrap();

        assert!(matches!(second, FinalizeOutcome::AlreadyProcessed));
        assert_eq!(h.store.tenants().len(), 1);
        assert_eq!(h.store.users().len(), 1);
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_finalize_sends_one_email() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_1", "cus_1", &[])),
        );
        let (a, b) = (h.finalizer(), h.finalizer());

        let (ra, rb) = tokio::join!(a.finalize("cs_1"), b.finalize("cs_1"));
        let outcomes = [ra.unwrap(), rb.unwrap()];
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, FinalizeOutcome::Completed { activation_email_sent: true, .. })));
        assert!(outcomes.iter().all(|o| matches!(
            o,
            FinalizeOutcome::Completed { .. }
                | FinalizeOutcome::Pending { reason: PendingReason::EmailInFlight }
        )));

        assert_eq!(h.store.tenants().len(), 1);
        assert_eq!(h.store.users().len(), 1);
        assert_eq!(h.notifier.count(), 1);

        // A caller told to retry finds the email settled and does not send again.
        h.finalizer().finalize("cs_1").await.unwrap();
        assert_eq!(h.notifier.count(), 1);
        assert!(h.store.has_marker("finalize:cs_1"));
    }

    #[tokio::test]
    async fn test_claimed_unconfirmed_email_stays_pending() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_1", "cus_1", &[])),
        );
        // Another attempt holds the email claim and has not confirmed delivery.
        h.store
            .record("finalize-email:cs_1", "checkout.activation_email")
            .await
            .unwrap();

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            outcome,
            FinalizeOutcome::Pending { reason: PendingReason::EmailInFlight }
        ));
        assert!(!h.store.has_marker("finalize:cs_1"));
        assert_eq!(h.notifier.count(), 0);

        // The holder's send failed and released the claim.
        h.store.release("finalize-email:cs_1").await.unwrap();
        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            outcome,
            FinalizeOutcome::Completed { activation_email_sent: true, .. }
        ));
        assert_eq!(h.notifier.count(), 1);
        assert!(h.store.has_marker("finalize:cs_1"));
    }

    #[tokio::test]
    async fn test_concurrent_finalize_with_failed_send_never_completes_silently() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_1", "cus_1", &[])),
        );
        h.notifier.fail_next.store(true, Ordering::SeqCst);
        let (a, b) = (h.finalizer(), h.finalizer());

        let (ra, rb) = tokio::join!(a.finalize("cs_1"), b.finalize("cs_1"));
        assert!(ra.is_err() || rb.is_err());
        for outcome in [ra, rb].into_iter().flatten() {
            if let FinalizeOutcome::Completed { activation_email_sent, .. } = outcome {
                assert!(activation_email_sent);
            }
        }
        if h.notifier.count() == 0 {
            assert!(!h.store.has_marker("finalize:cs_1"));
        }

        let retry = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            retry,
            FinalizeOutcome::Completed { .. } | FinalizeOutcome::AlreadyProcessed
        ));
        assert_eq!(h.notifier.count(), 1);
        assert!(h.store.has_marker("finalize:cs_1"));
        assert_eq!(h.store.tenants().len(), 1);
    }

    #[tokio::test]
    async fn test_unpaid_session_is_pending() {
        let mut session = paid_session("cs_1", "cus_1", &[]);
        session.payment_status = Some("unpaid".to_string());
        session.status = Some("open".to_string());
        let h = Harness::new(FakePayments::default().with_session(session));

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            outcome,
            FinalizeOutcome::Pending { reason: PendingReason::Unpaid }
        ));
        assert!(h.store.tenants().is_empty());
        assert!(h.store.has_marker("finalize:cs_1:unpaid"));
        assert!(!h.store.has_marker("finalize:cs_1"));
    }

    #[tokio::test]
    async fn test_pending_session_completes_once_paid() {
        let mut session = paid_session("cs_1", "cus_1", &[]);
        session.payment_status = Some("unpaid".to_string());
        session.status = Some("open".to_string());
        let h = Harness::new(FakePayments::default().with_session(session));
        h.finalizer().finalize("cs_1").await.unwrap();

        h.payments.set_session(paid_session("cs_1", "cus_1", &[]));
        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(outcome, FinalizeOutcome::Completed { .. }));
    }

    #[tokio::test]
    async fn test_missing_email_is_pending() {
        let mut session = paid_session("cs_1", "cus_1", &[]);
        session.customer_details = None;
        let h = Harness::new(FakePayments::default().with_session(session));

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            outcome,
            FinalizeOutcome::Pending { reason: PendingReason::NoEmail }
        ));
        assert!(h.store.tenants().is_empty());
        assert!(h.store.users().is_empty());
        assert!(h.store.has_marker("finalize:cs_1:no-email"));
    }

    #[tokio::test]
    async fn test_email_falls_back_to_customer_record() {
        let mut session = paid_session("cs_1", "cus_1", &[]);
        session.customer_details = None;
        let h = Harness::new(
            FakePayments::default()
                .with_session(session)
                .with_customer(Customer {
                    id: "cus_1".to_string(),
                    email: Some("billing@globex.test".to_string()),
                    name: None,
                    deleted: false,
                }),
        );

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        let FinalizeOutcome::Completed { tenant, user, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(user.email, "billing@globex.test");
        assert_eq!(tenant.slug, "globex");
    }

    #[tokio::test]
    async fn test_slug_hint_never_reuses_other_tenants_customer() {
        let h = Harness::new(FakePayments::default().with_session(paid_session(
            "cs_1",
            "cus_shared",
            &[("tenantSlug", "acme")],
        )));
        let other = h.store.seed_tenant("other-co", Some("cus_shared"));

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        let FinalizeOutcome::Completed { tenant, user, .. } = outcome else {
            panic!("expected completion");
        };

        assert_eq!(tenant.slug, "acme");
        assert_ne!(tenant.id, other.id);
        assert_eq!(user.tenant_id, tenant.id);

        let tenants = h.store.tenants();
        assert_eq!(tenants.len(), 2);
        let acme = tenants.iter().find(|t| t.slug == "acme").unwrap();
        assert!(acme.stripe_customer_id.is_none());
        let other_after = tenants.iter().find(|t| t.slug == "other-co").unwrap();
        assert_eq!(other_after.stripe_customer_id.as_deref(), Some("cus_shared"));
        assert!(h
            .store
            .audit_types()
            .contains(&"suspicious_activity".to_string()));
    }

    #[tokio::test]
    async fn test_existing_slug_with_different_customer_is_not_rebound() {
        let h = Harness::new(FakePayments::default().with_session(paid_session(
            "cs_1",
            "cus_new",
            &[("tenantSlug", "acme")],
        )));
        h.store.seed_tenant("acme", Some("cus_old"));

        h.finalizer().finalize("cs_1").await.unwrap();

        let tenants = h.store.tenants();
        assert_eq!(tenants.len(), 1);
        assert_eq!(tenants[0].stripe_customer_id.as_deref(), Some("cus_old"));
        assert_eq!(tenants[0].status, TenantStatus::Active);
    }

    #[tokio::test]
    async fn test_matches_existing_tenant_by_customer() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_2", "cus_1", &[])),
        );
        let existing = h.store.seed_tenant("acme", Some("cus_1"));

        let outcome = h.finalizer().finalize("cs_2").await.unwrap();
        let FinalizeOutcome::Completed { tenant, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(tenant.id, existing.id);
        assert_eq!(h.store.tenants().len(), 1);
    }

    #[tokio::test]
    async fn test_derived_slug_gets_suffix_on_unrelated_conflict() {
        let h = Harness::new(FakePayments::default().with_session(paid_session(
            "cs_1",
            "cus_1",
            &[("companyName", "Acme")],
        )));
        h.store.seed_tenant("acme", Some("cus_other"));

        let outcome = h.finalizer().finalize("cs_1").await.unwrap();
        let FinalizeOutcome::Completed { tenant, .. } = outcome else {
            panic!("expected completion");
        };
        assert_eq!(tenant.slug, "acme-2");
    }

    #[tokio::test]
    async fn test_failed_email_releases_claim_for_retry() {
        let h = Harness::new(
            FakePayments::default().with_session(paid_session("cs_1", "cus_1", &[])),
        );
        h.notifier.fail_next.store(true, Ordering::SeqCst);

        assert!(h.finalizer().finalize("cs_1").await.is_err());
        assert!(!h.store.has_marker("finalize-email:cs_1"));
        assert!(!h.store.has_marker("finalize:cs_1"));

        let retry = h.finalizer().finalize("cs_1").await.unwrap();
        assert!(matches!(
            retry,
            FinalizeOutcome::Completed { activation_email_sent: true, .. }
        ));
        assert_eq!(h.notifier.count(), 1);
        assert_eq!(h.store.tenants().len(), 1);
    }

    #[tokio::test]
    async fn test_token_collision_is_not_fatal() {
        let h = Harness::new(
            FakePayments::default()
                .with_session(paid_session("cs_1", "cus_1", &[]))
                .with_session(paid_session("cs_2", "cus_2", &[("companyName", "Globex")])),
        );
        let fixed = || "fixed-secret".to_string();

        h.finalizer().with_secret_source(fixed).finalize("cs_1").await.unwrap();
        let outcome = h
            .finalizer()
            .with_secret_source(fixed)
            .finalize("cs_2")
            .await
            .unwrap();

        assert!(matches!(
            outcome,
            FinalizeOutcome::Completed { activation_email_sent: false, .. }
        ));
        assert!(h.store.has_marker("finalize:cs_2"));
        assert_eq!(h.notifier.count(), 1);
    }

    #[tokio::test]
    async fn test_unknown_session_is_not_found() {
        let h = Harness::new(FakePayments::default());
        let result = h.finalizer().finalize("cs_missing").await;
        assert!(matches!(result, Err(AppError::NotFound(_))));
        let result = h.finalizer().finalize("  ").await;
        assert!(matches!(result, Err(AppError::Validation(_))));
    }
}
