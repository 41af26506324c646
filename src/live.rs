//! Live code distribution.
//!
//! Every connected viewer gets its own [`LiveChannel`]: a periodic task that reads all
//! secrets, derives their current codes and pushes the resulting snapshot into a bounded
//! channel. The HTTP layer drains the channel into a server-sent event stream.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::store::{SecretRecord, SecretStore};
use crate::ticker::PeriodicTask;
use crate::totp::{self, Algorithm, TotpError};
use crate::util::now_unix;
use crate::vault::{SecretVault, VaultError};

/// Snapshots buffered per viewer before frames are dropped.
const LIVE_CHANNEL_CAPACITY: usize = 4;

/// One derived code as sent to viewers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TotpCode {
    pub id: i64,
    pub label: String,
    pub issuer: String,
    pub code: String,
    pub remaining: u64,
    pub period: u64,
}

/// Why a single secret could not produce a code.
#[derive(Debug, Error)]
pub enum CodeError {
    #[error(transparent)]
    Vault(#[from] VaultError),

    #[error(transparent)]
    Totp(#[from] TotpError),
}

/// Decrypt one stored secret and derive its code at `now` (unix seconds).
pub fn derive_code(
    vault: &SecretVault,
    record: &SecretRecord,
    now: u64,
) -> Result<TotpCode, CodeError> {
    let algorithm: Algorithm = record.algorithm.parse()?;
    let seed = vault.open(&record.sealed)?;
    let code = totp::generate(&seed, algorithm, record.digits, record.period, now)?;
    Ok(TotpCode {
        id: record.id,
        label: record.label.clone(),
        issuer: record.issuer.clone(),
        code,
        remaining: totp::remaining_seconds(record.period, now),
        period: record.period,
    })
}

/// Codes for every stored secret at `now`, in store order.
///
/// Secrets that fail to decrypt or derive are logged and left out. A store failure
/// yields an empty snapshot.
pub async fn snapshot(store: &dyn SecretStore, vault: &SecretVault, now: u64) -> Vec<TotpCode> {
    let records = match store.list_secrets().await {
        Ok(records) => records,
        Err(e) => {
            tracing::error!("Failed to list secrets for code snapshot: {}", e);
            return Vec::new();
        }
    };

    records
        .iter()
        .filter_map(|record| match derive_code(vault, record, now) {
            Ok(code) => Some(code),
            Err(e) => {
                tracing::warn!(secret_id = record.id, "Skipping secret in snapshot: {}", e);
                None
            }
        })
        .collect()
}

/// A per-viewer feed of code snapshots.
pub struct LiveChannel {
    rx: mpsc::Receiver<Vec<TotpCode>>,
    task: PeriodicTask,
}

impl LiveChannel {
    /// Start producing snapshots: one immediately, then one per `interval`.
    pub fn open(store: Arc<dyn SecretStore>, vault: SecretVault, interval: Duration) -> Self {
        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);

        let task = PeriodicTask::spawn("live-codes", interval, move || {
            let store = store.clone();
            let vault = vault.clone();
            let tx = tx.clone();
            async move {
                if tx.is_closed() {
                    return;
                }
                let codes = snapshot(store.as_ref(), &vault, now_unix()).await;
                match tx.try_send(codes) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::trace!("Viewer is behind, dropping code snapshot");
                    }
                    // Viewer already gone.
                    Err(mpsc::error::TrySendError::Closed(_)) => {}
                }
            }
        });

        Self { rx, task }
    }

    /// Next snapshot, or `None` once the channel is closed and drained.
    pub async fn recv(&mut self) -> Option<Vec<TotpCode>> {
        self.rx.recv().await
    }

    /// Stop the timer and close the channel. Safe to call more than once.
    pub async fn close(&mut self) {
        self.task.stop().await;
        self.rx.close();
    }

    pub fn is_closed(&self) -> bool {
        self.task.is_stopped()
    }
}
