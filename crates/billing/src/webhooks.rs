//! Stripe webhook handling.
//!
//! Consumes billing-provider events exactly-once from the ledger's
//! perspective despite at-least-once delivery. The provider guarantees
//! neither ordering nor uniqueness, so correctness rides on two layers:
//! an atomic per-event claim (INSERT..ON CONFLICT..RETURNING on the seen
//! events table) and the period-level idempotency of the token sync. A
//! handler error does NOT cause a retry from this layer; the provider's
//! retry-with-backoff on non-2xx responses is the retry mechanism.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use sqlx::PgPool;
use stripe::{Event, EventObject, EventType, Invoice, Subscription, Webhook};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::client::StripeClient;
use crate::error::{BillingError, BillingResult};
use crate::subscriptions::{find_base_price_id, SubscriptionStore};
use crate::sync::TokenSyncService;

type HmacSha256 = Hmac<Sha256>;

/// Outcome of handling one webhook event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WebhookOutcome {
    Processed,
    /// Duplicate delivery (or another worker holds the claim); no side
    /// effects were produced.
    AlreadyProcessed,
}

/// Persisted record of a seen webhook event.
#[derive(Debug, Clone, sqlx::FromRow, serde::Serialize)]
pub struct WebhookEventRecord {
    pub id: Uuid,
    pub stripe_event_id: String,
    pub event_type: String,
    pub event_timestamp: OffsetDateTime,
    pub processing_result: String,
    pub processing_started_at: Option<OffsetDateTime>,
    pub error_message: Option<String>,
    pub created_at: OffsetDateTime,
}

/// Result of replaying a webhook event.
#[derive(Debug, Clone, serde::Serialize)]
pub struct WebhookReplayResult {
    pub stripe_event_id: String,
    pub previous_status: String,
    pub new_status: String,
    pub error_message: Option<String>,
}

/// Webhook reconciler for Stripe events.
pub struct WebhookReconciler {
    stripe: StripeClient,
    pool: PgPool,
    store: SubscriptionStore,
    sync: TokenSyncService,
}

impl WebhookReconciler {
    pub fn new(stripe: StripeClient, pool: PgPool, sync: TokenSyncService) -> Self {
        let store = SubscriptionStore::new(pool.clone());
        Self {
            stripe,
            pool,
            store,
            sync,
        }
    }

    /// Verify and parse a Stripe webhook event.
    ///
    /// Tries the library's verification first and falls back to manual
    /// signature verification, which tolerates event payloads from Stripe
    /// API versions newer than the library's pinned one.
    pub fn verify_event(&self, payload: &str, signature: &str) -> BillingResult<Event> {
        let webhook_secret = &self.stripe.config().webhook_secret;

        match Webhook::construct_event(payload, signature, webhook_secret) {
            Ok(event) => return Ok(event),
            Err(e) => {
                tracing::debug!(
                    stripe_error = %e,
                    "Standard webhook parsing failed, trying manual verification"
                );
            }
        }

        // Parse the signature header: t=timestamp,v1=signature,v0=signature
        let mut timestamp: Option<i64> = None;
        let mut v1_signature: Option<String> = None;
        for part in signature.split(',') {
            let kv: Vec<&str> = part.splitn(2, '=').collect();
            if kv.len() == 2 {
                match kv[0] {
                    "t" => timestamp = kv[1].parse().ok(),
                    "v1" => v1_signature = Some(kv[1].to_string()),
                    _ => {}
                }
            }
        }

        let timestamp = timestamp.ok_or_else(|| {
            tracing::error!("Missing timestamp in signature header");
            BillingError::WebhookSignatureInvalid
        })?;
        let v1_signature = v1_signature.ok_or_else(|| {
            tracing::error!("Missing v1 signature in signature header");
            BillingError::WebhookSignatureInvalid
        })?;

        // Reject stale signatures (5 minute tolerance window).
        let now = OffsetDateTime::now_utc().unix_timestamp();
        if (now - timestamp).abs() > 300 {
            tracing::error!(
                timestamp = timestamp,
                now = now,
                "Webhook timestamp outside tolerance window"
            );
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let secret_key = webhook_secret
            .strip_prefix("whsec_")
            .unwrap_or(webhook_secret);
        let signed_payload = format!("{}.{}", timestamp, payload);

        let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes()).map_err(|_| {
            tracing::error!("Invalid webhook secret key");
            BillingError::WebhookSignatureInvalid
        })?;
        mac.update(signed_payload.as_bytes());
        let computed = hex::encode(mac.finalize().into_bytes());

        if computed != v1_signature {
            tracing::error!("Webhook signature mismatch");
            return Err(BillingError::WebhookSignatureInvalid);
        }

        let event: Event = serde_json::from_str(payload).map_err(|e| {
            tracing::error!(parse_error = %e, "Failed to parse webhook event JSON");
            BillingError::WebhookSignatureInvalid
        })?;

        Ok(event)
    }

    /// Handle a verified Stripe event.
    ///
    /// Atomic idempotency: INSERT..ON CONFLICT..RETURNING claims exclusive
    /// processing rights, so two concurrent deliveries of the same event id
    /// cannot both pass an EXISTS check. Events stuck in 'processing' for
    /// over 30 minutes (a crash mid-processing) can be re-claimed.
    pub async fn handle_event(&self, event: Event) -> BillingResult<WebhookOutcome> {
        let event_id = event.id.to_string();
        let event_type_str = event.type_.to_string();
        let event_timestamp = OffsetDateTime::from_unix_timestamp(event.created)
            .unwrap_or_else(|_| OffsetDateTime::now_utc());

        const PROCESSING_TIMEOUT_MINUTES: i32 = 30;

        let claimed: Option<(Uuid,)> = sqlx::query_as(
            r#"
            INSERT INTO billing_webhook_events
                (id, stripe_event_id, event_type, event_timestamp, processing_result, processing_started_at)
            VALUES ($1, $2, $3, $4, 'processing', NOW())
            ON CONFLICT (stripe_event_id) DO UPDATE SET
                processing_result = 'processing',
                processing_started_at = NOW(),
                error_message = CONCAT('Recovered from stuck state at ', NOW()::TEXT)
            WHERE billing_webhook_events.processing_result = 'processing'
              AND billing_webhook_events.processing_started_at < NOW() - ($5 || ' minutes')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(&event_id)
        .bind(&event_type_str)
        .bind(event_timestamp)
        .bind(PROCESSING_TIMEOUT_MINUTES)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| {
            tracing::error!(
                event_id = %event_id,
                error = %e,
                "Failed to claim webhook event for processing"
            );
            BillingError::Database(e.to_string())
        })?;

        if claimed.is_none() {
            tracing::debug!(
                event_id = %event_id,
                event_type = %event_type_str,
                "Duplicate webhook event short-circuited"
            );
            return Ok(WebhookOutcome::AlreadyProcessed);
        }

        tracing::info!(
            event_type = %event.type_,
            event_id = %event.id,
            "Processing Stripe webhook event"
        );

        let result = self.process_event_internal(&event).await;

        // Mark processed regardless of outcome: at most one full processing
        // attempt per event id. Errors are recorded, not retried here.
        let (processing_result, error_message) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        let update_result = sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&processing_result)
        .bind(&error_message)
        .bind(&event_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = update_result {
            // Retry once; the audit record doubles as the idempotency key.
            tracing::warn!(
                event_id = %event_id,
                error = %e,
                "First attempt to update webhook event record failed, retrying"
            );
            if let Err(retry_err) = sqlx::query(
                r#"
                UPDATE billing_webhook_events
                SET processing_result = $1, error_message = $2
                WHERE stripe_event_id = $3
                "#,
            )
            .bind(&processing_result)
            .bind(&error_message)
            .bind(&event_id)
            .execute(&self.pool)
            .await
            {
                tracing::error!(
                    event_id = %event_id,
                    event_type = %event.type_,
                    first_error = %e,
                    retry_error = %retry_err,
                    "CRITICAL: Failed to update webhook audit record after retry. \
                     Event may appear stuck in 'processing' state. \
                     Manual intervention may be required."
                );
            }
        }

        result.map(|_| WebhookOutcome::Processed)
    }

    async fn process_event_internal(&self, event: &Event) -> BillingResult<()> {
        let event_owned = event.clone();

        match event.type_ {
            EventType::CustomerSubscriptionCreated | EventType::CustomerSubscriptionUpdated => {
                self.handle_subscription_upserted(event_owned).await?;
            }
            EventType::CustomerSubscriptionDeleted => {
                self.handle_subscription_deleted(event_owned).await?;
            }
            EventType::InvoicePaymentSucceeded | EventType::InvoicePaid => {
                self.handle_invoice_paid(event_owned).await?;
            }
            EventType::InvoicePaymentFailed => {
                self.handle_invoice_payment_failed(event_owned).await?;
            }
            EventType::CheckoutSessionCompleted => {
                self.handle_checkout_completed(event_owned).await?;
            }
            _ => {
                // Track which event types arrive without a handler; new
                // provider features show up here first.
                tracing::info!(
                    event_type = %event.type_,
                    event_id = %event.id,
                    "Received unhandled Stripe event type - no handler configured"
                );
            }
        }

        Ok(())
    }

    /// subscription created/updated: upsert the record from the provider's
    /// object, then repair the token balance for the (possibly new) period.
    async fn handle_subscription_upserted(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let user_id = self.resolve_user(&subscription).await?;

        let plan = match find_base_price_id(&subscription) {
            Some(price_id) => match self.sync.catalog().plan_for_price_id(&price_id).await {
                Some(plan) => plan,
                None => {
                    // Price id not in the catalog: provider drift. Keep the
                    // stored plan if we have one rather than guessing.
                    if let Some(existing) = self.store.get_by_user(user_id).await? {
                        tracing::warn!(
                            user_id = %user_id,
                            price_id = %price_id,
                            "Price id not found in plan catalog; keeping stored plan"
                        );
                        existing.plan_type
                    } else {
                        return Err(BillingError::InvalidPlan(format!(
                            "Price id '{}' not found in plan catalog",
                            price_id
                        )));
                    }
                }
            },
            None => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Subscription has no base price item".to_string(),
                ))
            }
        };

        self.store
            .upsert_from_stripe(user_id, &subscription, plan)
            .await?;
        self.sync
            .ensure_tokens_synced_for_subscription(user_id, subscription.id.as_str())
            .await?;

        tracing::info!(
            user_id = %user_id,
            subscription_id = %subscription.id,
            plan = %plan,
            status = ?subscription.status,
            "Subscription synced from webhook"
        );
        Ok(())
    }

    /// subscription deleted: status bookkeeping only. Cancellation must not
    /// clear a balance; the explicit downgrade-to-free path does that.
    async fn handle_subscription_deleted(&self, event: Event) -> BillingResult<()> {
        let subscription = self.extract_subscription(event)?;
        let marked = self.store.mark_canceled(subscription.id.as_str()).await?;

        if marked {
            tracing::info!(
                subscription_id = %subscription.id,
                "Subscription marked canceled (tokens untouched)"
            );
        } else {
            tracing::debug!(
                subscription_id = %subscription.id,
                "Deleted subscription has no local record"
            );
        }
        Ok(())
    }

    /// invoice payment succeeded: the renewal trigger. The token sync
    /// decides renewal vs. plan switch; this handler just routes to it.
    async fn handle_invoice_paid(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;

        let Some(subscription_id) = invoice.subscription.as_ref().map(|s| match s {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(sub) => sub.id.to_string(),
        }) else {
            tracing::debug!(
                invoice_id = %invoice.id,
                "Invoice has no subscription; nothing to sync"
            );
            return Ok(());
        };

        let Some(record) = self.store.get_by_stripe_id(&subscription_id).await? else {
            tracing::warn!(
                invoice_id = %invoice.id,
                subscription_id = %subscription_id,
                "Paid invoice for unknown subscription"
            );
            return Ok(());
        };

        self.sync
            .ensure_tokens_synced_for_subscription(record.user_id, &subscription_id)
            .await?;

        tracing::info!(
            user_id = %record.user_id,
            invoice_id = %invoice.id,
            subscription_id = %subscription_id,
            amount = ?invoice.amount_paid,
            "Invoice paid, tokens synced"
        );
        Ok(())
    }

    /// invoice payment failed: record-only, never a token mutation.
    async fn handle_invoice_payment_failed(&self, event: Event) -> BillingResult<()> {
        let invoice = self.extract_invoice(event)?;
        let user_id = match self.user_from_customer(&invoice.customer).await {
            Ok(id) => Some(id),
            Err(_) => None,
        };

        tracing::warn!(
            user_id = ?user_id,
            invoice_id = %invoice.id,
            amount_due = ?invoice.amount_due,
            attempt_count = ?invoice.attempt_count,
            "Invoice payment failed"
        );
        Ok(())
    }

    /// checkout session completed: attach the provider's customer id to the
    /// user record if missing.
    async fn handle_checkout_completed(&self, event: Event) -> BillingResult<()> {
        let session = match event.data.object {
            EventObject::CheckoutSession(session) => session,
            _ => {
                return Err(BillingError::WebhookEventNotSupported(
                    "Expected CheckoutSession".to_string(),
                ))
            }
        };

        let user_id = session
            .client_reference_id
            .as_deref()
            .and_then(|id| Uuid::parse_str(id).ok())
            .or_else(|| {
                session
                    .metadata
                    .as_ref()
                    .and_then(|m| m.get("user_id"))
                    .and_then(|id| Uuid::parse_str(id).ok())
            });

        let customer_id = session.customer.as_ref().map(|c| match c {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(customer) => customer.id.to_string(),
        });

        if let (Some(user_id), Some(customer_id)) = (user_id, customer_id) {
            if self
                .store
                .attach_customer_if_missing(user_id, &customer_id)
                .await?
            {
                tracing::info!(
                    user_id = %user_id,
                    customer_id = %customer_id,
                    "Attached Stripe customer to user from checkout session"
                );
            }
        } else {
            tracing::debug!(
                session_id = %session.id,
                "Checkout session without user reference or customer"
            );
        }
        Ok(())
    }

    /// Resolve the owning user for a subscription: metadata first, then the
    /// customer id against the users table.
    async fn resolve_user(&self, subscription: &Subscription) -> BillingResult<Uuid> {
        if let Some(user_id) = subscription
            .metadata
            .get("user_id")
            .and_then(|id| Uuid::parse_str(id).ok())
        {
            return Ok(user_id);
        }

        let customer_id = match &subscription.customer {
            stripe::Expandable::Id(id) => id.to_string(),
            stripe::Expandable::Object(c) => c.id.to_string(),
        };
        self.store
            .user_for_customer(&customer_id)
            .await?
            .ok_or_else(|| {
                BillingError::NotFound(format!(
                    "No user for Stripe customer '{}' on subscription '{}'",
                    customer_id, subscription.id
                ))
            })
    }

    async fn user_from_customer(
        &self,
        customer: &Option<stripe::Expandable<stripe::Customer>>,
    ) -> BillingResult<Uuid> {
        let customer_id = match customer {
            Some(stripe::Expandable::Id(id)) => id.to_string(),
            Some(stripe::Expandable::Object(c)) => c.id.to_string(),
            None => return Err(BillingError::Internal("No customer on invoice".to_string())),
        };
        self.store
            .user_for_customer(&customer_id)
            .await?
            .ok_or(BillingError::NotFound(format!(
                "No user for Stripe customer '{}'",
                customer_id
            )))
    }

    fn extract_subscription(&self, event: Event) -> BillingResult<Subscription> {
        match event.data.object {
            EventObject::Subscription(subscription) => Ok(subscription),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Subscription".to_string(),
            )),
        }
    }

    fn extract_invoice(&self, event: Event) -> BillingResult<Invoice> {
        match event.data.object {
            EventObject::Invoice(invoice) => Ok(invoice),
            _ => Err(BillingError::WebhookEventNotSupported(
                "Expected Invoice".to_string(),
            )),
        }
    }

    // ============ OPERATOR TOOLING ============

    /// List failed (or stuck) webhook events that can be replayed.
    pub async fn list_failed_webhooks(
        &self,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = sqlx::query_as(
            r#"
            SELECT id, stripe_event_id, event_type, event_timestamp,
                   processing_result, processing_started_at, error_message,
                   created_at
            FROM billing_webhook_events
            WHERE processing_result IN ('error', 'processing')
            ORDER BY created_at DESC
            LIMIT $1 OFFSET $2
            "#,
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;
        Ok(records)
    }

    /// List webhook events with an optional status filter.
    pub async fn list_webhooks(
        &self,
        status_filter: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> BillingResult<Vec<WebhookEventRecord>> {
        let records: Vec<WebhookEventRecord> = match status_filter {
            Some(status) => {
                sqlx::query_as(
                    r#"
                    SELECT id, stripe_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message,
                           created_at
                    FROM billing_webhook_events
                    WHERE processing_result = $1
                    ORDER BY created_at DESC
                    LIMIT $2 OFFSET $3
                    "#,
                )
                .bind(status)
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query_as(
                    r#"
                    SELECT id, stripe_event_id, event_type, event_timestamp,
                           processing_result, processing_started_at, error_message,
                           created_at
                    FROM billing_webhook_events
                    ORDER BY created_at DESC
                    LIMIT $1 OFFSET $2
                    "#,
                )
                .bind(limit)
                .bind(offset)
                .fetch_all(&self.pool)
                .await?
            }
        };
        Ok(records)
    }

    /// Replay a webhook event by fetching it from Stripe and re-processing.
    ///
    /// Useful for recovering from transient errors and for manual
    /// intervention after failed processing. The period-level idempotency
    /// in the token sync makes replays safe for already-applied events.
    pub async fn replay_webhook(
        &self,
        stripe_event_id: &str,
    ) -> BillingResult<WebhookReplayResult> {
        tracing::info!(
            stripe_event_id = %stripe_event_id,
            "Attempting to replay webhook event"
        );

        let existing: Option<(String, Option<String>)> = sqlx::query_as(
            r#"
            SELECT processing_result, error_message
            FROM billing_webhook_events
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .fetch_optional(&self.pool)
        .await?;

        let (previous_status, previous_error) = existing.ok_or_else(|| {
            BillingError::NotFound(format!(
                "Webhook event {} not found in database",
                stripe_event_id
            ))
        })?;

        let event_id = stripe_event_id
            .parse::<stripe::EventId>()
            .map_err(|e| BillingError::InvalidInput(format!("Invalid event ID: {}", e)))?;
        let event = stripe::Event::retrieve(self.stripe.inner(), &event_id, &[])
            .await
            .map_err(|e| {
                BillingError::StripeApi(format!("Failed to fetch event from Stripe: {}", e))
            })?;

        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = 'replaying',
                processing_started_at = NOW(),
                error_message = CONCAT('Replay initiated. Previous status: ', $2::TEXT,
                                       '. Previous error: ', COALESCE($3, 'none'))
            WHERE stripe_event_id = $1
            "#,
        )
        .bind(stripe_event_id)
        .bind(&previous_status)
        .bind(&previous_error)
        .execute(&self.pool)
        .await?;

        let result = self.process_event_internal(&event).await;
        let (new_status, error_message) = match &result {
            Ok(()) => ("success".to_string(), None),
            Err(e) => ("error".to_string(), Some(e.to_string())),
        };

        sqlx::query(
            r#"
            UPDATE billing_webhook_events
            SET processing_result = $1, error_message = $2
            WHERE stripe_event_id = $3
            "#,
        )
        .bind(&new_status)
        .bind(&error_message)
        .bind(stripe_event_id)
        .execute(&self.pool)
        .await?;

        Ok(WebhookReplayResult {
            stripe_event_id: stripe_event_id.to_string(),
            previous_status,
            new_status,
            error_message,
        })
    }
}
