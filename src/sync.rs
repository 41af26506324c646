//! Background push of current codes to external HTTP targets.
//!
//! On each tick the dispatcher loads every secret with a fully configured sync target,
//! derives its current code and PUTs it to
//! `<url>/tokens/<target_key>.json?auth=<credential>` with body `{"token": "<code>"}`.
//!
//! - A code equal to the last successfully pushed one for that secret is not sent again.
//! - Targets are processed concurrently and every push is bounded by a timeout, so one
//!   hanging target cannot hold up the others.
//! - Failures are recorded in the status map and never abort the tick. A failed push keeps
//!   the previous `last_code`, so the next tick retries while the code is still unsent.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::RwLock;

use crate::live::derive_code;
use crate::store::{now_string, SecretRecord, SecretStore, SyncTarget};
use crate::ticker::PeriodicTask;
use crate::util::now_unix;
use crate::vault::SecretVault;

/// Longest response body excerpt kept in an error message.
const ERROR_BODY_LIMIT: usize = 200;

/// Observable push state for one secret.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PushTargetStatus {
    pub last_code: Option<String>,
    /// RFC 3339 time of the last successful push
    pub last_push_at: Option<String>,
    pub last_error: Option<String>,
}

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("HTTP {status}: {body}")]
    Status { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Push timed out")]
    Timeout,
}

/// Delivers a code to one external target.
#[async_trait]
pub trait CodePusher: Send + Sync {
    async fn push(&self, target: &SyncTarget, code: &str) -> Result<(), DeliveryError>;
}

/// [`CodePusher`] speaking the `PUT /tokens/<key>.json?auth=<credential>` protocol.
#[derive(Clone)]
pub struct HttpPusher {
    client: reqwest::Client,
}

impl HttpPusher {
    pub fn new(timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        Self { client }
    }

    /// Endpoint for `target` without the credential, safe to log.
    pub fn endpoint(target: &SyncTarget) -> String {
        format!(
            "{}/tokens/{}.json",
            target.url.trim_end_matches('/'),
            target.target_key
        )
    }

    fn request_url(target: &SyncTarget) -> String {
        format!(
            "{}?auth={}",
            Self::endpoint(target),
            urlencoding::encode(&target.credential)
        )
    }
}

#[async_trait]
impl CodePusher for HttpPusher {
    async fn push(&self, target: &SyncTarget, code: &str) -> Result<(), DeliveryError> {
        tracing::info!("PUT {}", Self::endpoint(target));

        let response = self
            .client
            .put(Self::request_url(target))
            .json(&serde_json::json!({ "token": code }))
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    DeliveryError::Timeout
                } else {
                    // reqwest errors embed the URL, which carries the credential.
                    DeliveryError::Transport(e.without_url().to_string())
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(DeliveryError::Status {
                status: status.as_u16(),
                body: body.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }
        Ok(())
    }
}

/// Counts from one dispatcher tick.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub pushed: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Outcome {
    Pushed,
    Skipped,
    Failed,
}

struct Inner {
    store: Arc<dyn SecretStore>,
    vault: SecretVault,
    pusher: Arc<dyn CodePusher>,
    push_timeout: Duration,
    statuses: RwLock<HashMap<i64, PushTargetStatus>>,
}

/// Periodic pusher of codes to external targets. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct SyncDispatcher {
    inner: Arc<Inner>,
}

impl SyncDispatcher {
    pub fn new(
        store: Arc<dyn SecretStore>,
        vault: SecretVault,
        pusher: Arc<dyn CodePusher>,
        push_timeout: Duration,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                vault,
                pusher,
                push_timeout,
                statuses: RwLock::new(HashMap::new()),
            }),
        }
    }

    /// Run ticks every `interval`, starting now.
    pub fn start(&self, interval: Duration) -> PeriodicTask {
        let dispatcher = self.clone();
        tracing::info!(?interval, "Sync dispatcher started");
        PeriodicTask::spawn("sync-dispatcher", interval, move || {
            let dispatcher = dispatcher.clone();
            async move {
                let report = dispatcher.tick().await;
                tracing::debug!(
                    pushed = report.pushed,
                    skipped = report.skipped,
                    failed = report.failed,
                    "Sync tick finished"
                );
            }
        })
    }

    pub async fn tick(&self) -> TickReport {
        self.tick_at(now_unix()).await
    }

    /// Process every configured target once, deriving codes at `now` (unix seconds).
    pub async fn tick_at(&self, now: u64) -> TickReport {
        let targets = match self.inner.store.list_sync_targets().await {
            Ok(targets) => targets,
            Err(e) => {
                tracing::error!("Sync target query failed, skipping tick: {}", e);
                return TickReport::default();
            }
        };

        self.prune_statuses(&targets).await;

        let outcomes = futures::future::join_all(
            targets
                .iter()
                .map(|(record, target)| self.process(record, target, now)),
        )
        .await;

        outcomes
            .into_iter()
            .fold(TickReport::default(), |mut report, outcome| {
                match outcome {
                    Outcome::Pushed => report.pushed += 1,
                    Outcome::Skipped => report.skipped += 1,
                    Outcome::Failed => report.failed += 1,
                }
                report
            })
    }

    /// Copy of the current status map, keyed by secret id.
    pub async fn statuses(&self) -> HashMap<i64, PushTargetStatus> {
        self.inner.statuses.read().await.clone()
    }

    async fn process(&self, record: &SecretRecord, target: &SyncTarget, now: u64) -> Outcome {
        let code = match derive_code(&self.inner.vault, record, now) {
            Ok(derived) => derived.code,
            Err(e) => {
                tracing::warn!(secret_id = record.id, "Cannot derive code for sync: {}", e);
                self.record_failure(record.id, e.to_string()).await;
                return Outcome::Failed;
            }
        };

        let already_pushed = self
            .inner
            .statuses
            .read()
            .await
            .get(&record.id)
            .and_then(|s| s.last_code.as_deref())
            == Some(code.as_str());
        if already_pushed {
            return Outcome::Skipped;
        }

        let push = self.inner.pusher.push(target, &code);
        let delivery = match tokio::time::timeout(self.inner.push_timeout, push).await {
            Ok(result) => result,
            Err(_) => Err(DeliveryError::Timeout),
        };

        match delivery {
            Ok(()) => {
                self.inner.statuses.write().await.insert(
                    record.id,
                    PushTargetStatus {
                        last_code: Some(code),
                        last_push_at: Some(now_string()),
                        last_error: None,
                    },
                );
                tracing::info!(
                    secret_id = record.id,
                    target_key = %target.target_key,
                    "Pushed code"
                );
                Outcome::Pushed
            }
            Err(e) => {
                tracing::warn!(
                    secret_id = record.id,
                    endpoint = %HttpPusher::endpoint(target),
                    "Push failed: {}",
                    e
                );
                self.record_failure(record.id, e.to_string()).await;
                Outcome::Failed
            }
        }
    }

    async fn record_failure(&self, id: i64, error: String) {
        self.inner
            .statuses
            .write()
            .await
            .entry(id)
            .or_default()
            .last_error = Some(error);
    }

    /// Forget secrets that are no longer configured for sync.
    async fn prune_statuses(&self, targets: &[(SecretRecord, SyncTarget)]) {
        let mut statuses = self.inner.statuses.write().await;
        statuses.retain(|id, _| targets.iter().any(|(record, _)| record.id == *id));
    }
}
