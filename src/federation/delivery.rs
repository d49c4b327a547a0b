//! Activity delivery
//!
//! Handles delivering activities to remote servers.
//!
//! Delivery is best-effort and at-most-once: every inbox gets its own
//! freshly signed POST, failures are logged and dropped, and one inbox's
//! failure never affects another.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use http::HeaderMap;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;

use super::activity::Activity;
use super::fetch::{RemoteFetcher, RequestSigner};
use super::media_type::ACTIVITY_JSON;
use super::signature::{SignOptions, sign_request};
use crate::context::OpContext;
use crate::error::AppError;
use crate::metrics::{
    ACTIVITYPUB_ACTIVITIES_SENT, DELIVERIES_IN_FLIGHT, DELIVERIES_TOTAL,
    DELIVERY_DURATION_SECONDS,
};

/// Looks up the signing key of a local actor at send time
///
/// Deliveries carry only the actor id; key material is fetched when the
/// request is signed and never stored alongside queued work.
pub trait SigningKeyResolver: Send + Sync {
    fn signing_key<'a>(&'a self, actor_id: &'a str) -> BoxFuture<'a, Result<RequestSigner, AppError>>;
}

/// Result of a delivery attempt
#[derive(Debug, Clone)]
pub struct DeliveryResult {
    /// Target inbox URI
    pub inbox_uri: String,
    /// Whether delivery succeeded
    pub success: bool,
    /// Error message if failed
    pub error: Option<String>,
    /// HTTP status code if available
    pub status_code: Option<u16>,
}

/// Deduplicate identical inbox URIs while keeping distinct personal inboxes.
///
/// This preserves recipients on the same domain that use different inbox paths.
pub fn unique_inbox_targets<I>(inbox_uris: I) -> Vec<String>
where
    I: IntoIterator<Item = String>,
{
    let mut seen = HashSet::new();
    inbox_uris
        .into_iter()
        .filter(|inbox| !inbox.is_empty())
        .filter(|inbox| seen.insert(inbox.clone()))
        .collect()
}

/// Activity delivery service
///
/// Sends activities to remote inbox endpoints with bounded concurrency.
#[derive(Clone)]
pub struct DeliveryDispatcher {
    fetcher: RemoteFetcher,
    sign_options: SignOptions,
    keys: Arc<dyn SigningKeyResolver>,
    concurrency: usize,
}

impl DeliveryDispatcher {
    pub fn new(
        fetcher: RemoteFetcher,
        sign_options: SignOptions,
        keys: Arc<dyn SigningKeyResolver>,
        concurrency: usize,
    ) -> Self {
        Self {
            fetcher,
            sign_options,
            keys,
            concurrency: concurrency.max(1),
        }
    }

    /// Deliver `activity`, signed by `actor_id`, to every unique inbox
    ///
    /// Returns one result per unique inbox. Only failures that affect every
    /// target (encoding, missing signing key) are returned as `Err`.
    pub async fn deliver(
        &self,
        activity: &Activity,
        actor_id: &str,
        inboxes: Vec<String>,
        ctx: &OpContext,
    ) -> Result<Vec<DeliveryResult>, AppError> {
        let total_targets = inboxes.len();
        let targets = unique_inbox_targets(inboxes);
        if targets.is_empty() {
            return Ok(Vec::new());
        }

        let body: Arc<[u8]> = activity.encode()?.into();
        let signer = Arc::new(self.keys.signing_key(actor_id).await?);
        let kind = activity.kind();

        tracing::info!(
            activity_id = %activity.id(),
            activity_type = %kind,
            targets = targets.len(),
            deduplicated_from = total_targets,
            "Delivering activity"
        );

        let semaphore = Arc::new(Semaphore::new(self.concurrency));
        let mut tasks = Vec::with_capacity(targets.len());

        for inbox_uri in targets {
            let semaphore = semaphore.clone();
            let body = body.clone();
            let signer = signer.clone();
            let this = self.clone();
            let ctx = ctx.clone();

            tasks.push(tokio::spawn(async move {
                let Ok(_permit) = semaphore.acquire_owned().await else {
                    return DeliveryResult {
                        inbox_uri,
                        success: false,
                        error: Some("delivery pool closed".to_string()),
                        status_code: None,
                    };
                };
                this.deliver_to_inbox(&inbox_uri, &body, &signer, &ctx).await
            }));
        }

        let mut results = Vec::with_capacity(tasks.len());
        for task in tasks {
            match task.await {
                Ok(result) => results.push(result),
                Err(error) => tracing::error!(%error, "Delivery task panicked"),
            }
        }

        let success_count = results.iter().filter(|r| r.success).count();
        if success_count > 0 {
            ACTIVITYPUB_ACTIVITIES_SENT
                .with_label_values(&[kind.as_str()])
                .inc();
        }

        tracing::info!(
            activity_id = %activity.id(),
            succeeded = success_count,
            failed = results.len() - success_count,
            "Batch delivery complete"
        );

        Ok(results)
    }

    /// Deliver in the background, detached from the caller's request
    ///
    /// The task runs under its own context so a finished or dropped inbound
    /// request does not cancel outbound sends.
    pub fn spawn(
        &self,
        activity: Activity,
        actor_id: String,
        inboxes: Vec<String>,
    ) -> JoinHandle<Vec<DeliveryResult>> {
        let this = self.clone();
        tokio::spawn(async move {
            let ctx = OpContext::background();
            match this.deliver(&activity, &actor_id, inboxes, &ctx).await {
                Ok(results) => results,
                Err(error) => {
                    tracing::warn!(
                        activity_id = %activity.id(),
                        %error,
                        "Delivery aborted"
                    );
                    Vec::new()
                }
            }
        })
    }

    async fn deliver_to_inbox(
        &self,
        inbox_uri: &str,
        body: &[u8],
        signer: &RequestSigner,
        ctx: &OpContext,
    ) -> DeliveryResult {
        DELIVERIES_IN_FLIGHT.inc();
        let started = Instant::now();
        let outcome = self.post_signed(inbox_uri, body, signer, ctx).await;
        DELIVERIES_IN_FLIGHT.dec();

        let status = if outcome.is_ok() { "success" } else { "failure" };
        DELIVERIES_TOTAL.with_label_values(&[status]).inc();
        DELIVERY_DURATION_SECONDS
            .with_label_values(&[status])
            .observe(started.elapsed().as_secs_f64());

        match outcome {
            Ok(code) => {
                tracing::debug!(inbox = %inbox_uri, status = code, "Delivered activity");
                DeliveryResult {
                    inbox_uri: inbox_uri.to_string(),
                    success: true,
                    error: None,
                    status_code: Some(code),
                }
            }
            Err((error, code)) => {
                tracing::warn!(inbox = %inbox_uri, %error, "Delivery failed");
                DeliveryResult {
                    inbox_uri: inbox_uri.to_string(),
                    success: false,
                    error: Some(error.to_string()),
                    status_code: code,
                }
            }
        }
    }

    /// One signed POST; `Ok` only on a 2xx response
    async fn post_signed(
        &self,
        inbox_uri: &str,
        body: &[u8],
        signer: &RequestSigner,
        ctx: &OpContext,
    ) -> Result<u16, (AppError, Option<u16>)> {
        let url = ctx
            .run("guard inbox url", self.fetcher.guard(inbox_uri))
            .await
            .map_err(|e| (e, None))?;

        let mut preset = HeaderMap::new();
        preset.insert(
            http::header::CONTENT_TYPE,
            http::HeaderValue::from_static(ACTIVITY_JSON),
        );

        let signed = sign_request(
            "POST",
            url.as_str(),
            &preset,
            Some(body),
            &signer.private_key_pem,
            &signer.key_id,
            &self.sign_options,
        )
        .map_err(|e| (e, None))?;

        let request = signed.apply(self.fetcher.client().post(url)).body(body.to_vec());

        let response = ctx
            .run("deliver activity", async {
                request.send().await.map_err(AppError::from)
            })
            .await
            .map_err(|e| (e, None))?;

        let status = response.status();
        if status.is_success() {
            Ok(status.as_u16())
        } else {
            Err((
                AppError::Delivery(format!("Inbox {} rejected activity: HTTP {}", inbox_uri, status)),
                Some(status.as_u16()),
            ))
        }
    }
}
