//! Per-user balances.
//!
//! The billing cycle and the purchase path only see the [`Ledger`] trait.
//! Two backends ship here: an in-memory one for tests and embedding, and a
//! checksummed file for single-host deployments.

use crate::persist;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, error, info};
use vps_common::VpsError;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum LedgerError {
    #[error("Ledger unavailable: {0}")]
    Unavailable(String),
    #[error("Insufficient funds: needed {needed:.2}, available {available:.2}")]
    InsufficientFunds { needed: f64, available: f64 },
    #[error("Invalid amount: {0}")]
    InvalidAmount(f64),
    #[error("Ledger storage error: {0}")]
    Storage(String),
}

impl From<LedgerError> for VpsError {
    fn from(err: LedgerError) -> Self {
        match err {
            LedgerError::InsufficientFunds { needed, available } => VpsError::InsufficientFunds(
                format!("this costs {needed:.2} credits and your balance is {available:.2}"),
            ),
            other => VpsError::Ledger(other.to_string()),
        }
    }
}

pub type LedgerResult<T> = std::result::Result<T, LedgerError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransactionKind {
    Debit,
    Credit,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    pub id: String,
    pub user_id: String,
    pub kind: TransactionKind,
    pub amount: f64,
    pub balance_after: f64,
    pub description: String,
    pub timestamp: DateTime<Utc>,
}

#[async_trait]
pub trait Ledger: Send + Sync {
    /// Unknown users have a zero balance.
    async fn balance(&self, user_id: &str) -> LedgerResult<f64>;
    async fn debit(&self, user_id: &str, amount: f64, description: &str)
        -> LedgerResult<Transaction>;
    async fn credit(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction>;
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerState {
    pub balances: HashMap<String, f64>,
    #[serde(default)]
    pub transactions: Vec<Transaction>,
}

impl LedgerState {
    fn balance(&self, user_id: &str) -> f64 {
        self.balances.get(user_id).copied().unwrap_or(0.0)
    }

    fn apply(
        &mut self,
        user_id: &str,
        kind: TransactionKind,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        if !amount.is_finite() || amount <= 0.0 {
            return Err(LedgerError::InvalidAmount(amount));
        }
        let available = self.balance(user_id);
        let balance_after = match kind {
            TransactionKind::Debit if available < amount => {
                return Err(LedgerError::InsufficientFunds {
                    needed: amount,
                    available,
                })
            }
            TransactionKind::Debit => available - amount,
            TransactionKind::Credit => available + amount,
        };

        self.balances.insert(user_id.to_string(), balance_after);
        let tx = Transaction {
            id: uuid::Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            kind,
            amount,
            balance_after,
            description: description.to_string(),
            timestamp: Utc::now(),
        };
        self.transactions.push(tx.clone());
        Ok(tx)
    }
}

#[derive(Default)]
pub struct InMemoryLedger {
    state: RwLock<LedgerState>,
    unavailable: AtomicBool,
}

impl InMemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Simulate an outage: every call fails with `Unavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    pub async fn transactions(&self, user_id: &str) -> Vec<Transaction> {
        self.state
            .read()
            .await
            .transactions
            .iter()
            .filter(|tx| tx.user_id == user_id)
            .cloned()
            .collect()
    }

    fn check_available(&self) -> LedgerResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LedgerError::Unavailable("ledger offline".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl Ledger for InMemoryLedger {
    async fn balance(&self, user_id: &str) -> LedgerResult<f64> {
        self.check_available()?;
        Ok(self.state.read().await.balance(user_id))
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        self.check_available()?;
        self.state
            .write()
            .await
            .apply(user_id, TransactionKind::Debit, amount, description)
    }

    async fn credit(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        self.check_available()?;
        self.state
            .write()
            .await
            .apply(user_id, TransactionKind::Credit, amount, description)
    }
}

/// Ledger persisted to a checksummed JSON file after every change.
pub struct FileLedger {
    path: Arc<PathBuf>,
    state: RwLock<LedgerState>,
}

impl FileLedger {
    pub fn open(path: impl Into<PathBuf>) -> LedgerResult<Self> {
        let path = path.into();
        let state = match std::fs::read(&path) {
            Ok(bytes) => persist::decode_checked::<LedgerState>(&bytes).map_err(|e| {
                // Never reset balances because of an unreadable file
                error!(path = %path.display(), error = %e, "Ledger file unreadable");
                LedgerError::Storage(format!("{}: {e}", path.display()))
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                info!(path = %path.display(), "Starting new ledger");
                LedgerState::default()
            }
            Err(e) => return Err(LedgerError::Storage(e.to_string())),
        };

        Ok(Self {
            path: Arc::new(path),
            state: RwLock::new(state),
        })
    }

    async fn mutate(
        &self,
        user_id: &str,
        kind: TransactionKind,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        let mut current = self.state.write().await;
        let mut next = current.clone();
        let tx = next.apply(user_id, kind, amount, description)?;

        let path = self.path.clone();
        let next = tokio::task::spawn_blocking(move || {
            let bytes = persist::encode_checked(&next)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            persist::write_atomic(&path, &bytes)
                .map_err(|e| LedgerError::Storage(e.to_string()))?;
            Ok::<_, LedgerError>(next)
        })
        .await
        .map_err(|e| LedgerError::Storage(e.to_string()))??;

        *current = next;
        debug!(user_id, ?kind, amount, "Ledger updated");
        Ok(tx)
    }
}

#[async_trait]
impl Ledger for FileLedger {
    async fn balance(&self, user_id: &str) -> LedgerResult<f64> {
        Ok(self.state.read().await.balance(user_id))
    }

    async fn debit(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        self.mutate(user_id, TransactionKind::Debit, amount, description)
            .await
    }

    async fn credit(
        &self,
        user_id: &str,
        amount: f64,
        description: &str,
    ) -> LedgerResult<Transaction> {
        self.mutate(user_id, TransactionKind::Credit, amount, description)
            .await
    }
}
