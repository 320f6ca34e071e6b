//! Monthly billing state machine.
//!
//! ```text
//! current --(interval elapsed)--> charge
//!   charge ok      -> current (last billed = now)
//!   charge failed  -> overdue (grace ends = now + grace)
//! overdue --(each scan, within grace)--> retry charge, grace end unchanged
//! overdue --(now > grace end)--> suspended (terminal)
//! ```
//!
//! A ledger outage is treated like insufficient funds so no cycle is ever
//! silently skipped; it is logged separately for operators.

use crate::ledger::{Ledger, LedgerError, Transaction};
use crate::lifecycle::LifecycleController;
use crate::locks::KeyedLocks;
use crate::notify::{Notification, Notifier};
use crate::pricing::PriceModel;
use crate::registry::Registry;
use crate::scheduler::CycleGuard;
use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;
use tracing::{debug, error, info, instrument, warn};
use vps_common::{InstanceRecord, Result, VpsError};

#[derive(Debug, Clone, PartialEq)]
pub enum BillingOutcome {
    NotDue,
    Charged { amount: f64 },
    /// An overdue instance paid during its grace period.
    Recovered { amount: f64 },
    MarkedOverdue { amount: f64 },
    StillOverdue,
    Suspended,
    AlreadySuspended,
}

#[derive(Debug, Default)]
pub struct BillingReport {
    pub outcomes: Vec<(String, BillingOutcome)>,
    pub errors: Vec<(String, String)>,
}

impl BillingReport {
    pub fn count(&self, pred: impl Fn(&BillingOutcome) -> bool) -> usize {
        self.outcomes.iter().filter(|(_, o)| pred(o)).count()
    }
}

enum ChargeFailure {
    Insufficient { balance: f64 },
    Ledger(LedgerError),
}

pub struct BillingDriver {
    registry: Arc<Registry>,
    locks: Arc<KeyedLocks>,
    controller: Arc<LifecycleController>,
    ledger: Arc<dyn Ledger>,
    notifier: Arc<dyn Notifier>,
    prices: PriceModel,
    interval: Duration,
    grace: Duration,
    guard: CycleGuard,
}

impl BillingDriver {
    pub fn new(
        registry: Arc<Registry>,
        locks: Arc<KeyedLocks>,
        controller: Arc<LifecycleController>,
        ledger: Arc<dyn Ledger>,
        notifier: Arc<dyn Notifier>,
        prices: PriceModel,
    ) -> Self {
        Self {
            registry,
            locks,
            controller,
            ledger,
            notifier,
            prices,
            interval: Duration::days(30),
            grace: Duration::days(3),
            guard: CycleGuard::new("billing"),
        }
    }

    pub fn with_periods(mut self, interval: Duration, grace: Duration) -> Self {
        self.interval = interval;
        self.grace = grace;
        self
    }

    pub fn prices(&self) -> &PriceModel {
        &self.prices
    }

    /// One scan over every instance. `None` if a scan is already running.
    pub async fn run_cycle(&self) -> Option<BillingReport> {
        let _token = self.guard.try_enter()?;
        Some(self.scan_at(Utc::now()).await)
    }

    /// Scan with an explicit clock.
    #[instrument(skip(self))]
    pub async fn scan_at(&self, now: DateTime<Utc>) -> BillingReport {
        let mut report = BillingReport::default();
        for record in self.registry.list().await {
            match self.process_instance(&record.id, now).await {
                Ok(outcome) => {
                    if outcome != BillingOutcome::NotDue {
                        debug!(instance_id = %record.id, ?outcome, "Billing outcome");
                    }
                    report.outcomes.push((record.id, outcome));
                }
                Err(VpsError::NotFound(_)) => {
                    debug!(instance_id = %record.id, "Instance deleted during scan, skipping");
                }
                Err(e) => {
                    error!(instance_id = %record.id, error = %e, "Billing failed for instance");
                    report.errors.push((record.id, e.to_string()));
                }
            }
        }
        report
    }

    /// Advance one instance's billing state. Notifications are sent after
    /// the instance lock is released.
    pub async fn process_instance(&self, id: &str, now: DateTime<Utc>) -> Result<BillingOutcome> {
        let guard = self.locks.acquire(id).await;
        let record = self.registry.get(id).await?;

        if record.is_suspended() {
            return Ok(BillingOutcome::AlreadySuspended);
        }
        if record.payment_overdue && record.grace_expired(now) {
            // The controller takes the instance lock itself
            drop(guard);
            return self.suspend(&record, now).await;
        }

        let (outcome, pending) = self.bill(&record, now).await?;
        drop(guard);
        if let Some(notification) = pending {
            self.notify(&record.owner, notification).await;
        }
        Ok(outcome)
    }

    async fn bill(
        &self,
        record: &InstanceRecord,
        now: DateTime<Utc>,
    ) -> Result<(BillingOutcome, Option<Notification>)> {
        if record.payment_overdue {
            let amount = self.prices.monthly_cost(&record.config.limits());
            return match self.try_charge(record, amount).await {
                Ok(tx) => {
                    let receipt = self.settle(record, tx, now).await?;
                    Ok((BillingOutcome::Recovered { amount }, Some(receipt)))
                }
                Err(_) => Ok((BillingOutcome::StillOverdue, None)),
            };
        }

        if !record.is_billing_due(now, self.interval) {
            return Ok((BillingOutcome::NotDue, None));
        }

        let amount = self.prices.monthly_cost(&record.config.limits());
        match self.try_charge(record, amount).await {
            Ok(tx) => {
                let receipt = self.settle(record, tx, now).await?;
                Ok((BillingOutcome::Charged { amount }, Some(receipt)))
            }
            Err(failure) => {
                let grace = self.grace;
                let updated = self
                    .registry
                    .update(&record.id, |r| r.mark_overdue(now, grace))
                    .await?;
                let grace_period_end = updated.grace_period_end.unwrap_or(now + grace);
                let notification = match failure {
                    ChargeFailure::Insufficient { balance } => Notification::InsufficientFunds {
                        instance_id: record.id.clone(),
                        amount,
                        balance,
                        grace_period_end,
                    },
                    ChargeFailure::Ledger(e) => {
                        warn!(instance_id = %record.id, error = %e, "Marking overdue after ledger failure");
                        Notification::PaymentFailed {
                            instance_id: record.id.clone(),
                            amount,
                            grace_period_end,
                        }
                    }
                };
                warn!(instance_id = %record.id, amount, %grace_period_end, "Payment overdue");
                Ok((BillingOutcome::MarkedOverdue { amount }, Some(notification)))
            }
        }
    }

    async fn try_charge(
        &self,
        record: &InstanceRecord,
        amount: f64,
    ) -> std::result::Result<Transaction, ChargeFailure> {
        let balance = self.ledger.balance(&record.owner).await.map_err(|e| {
            error!(owner = %record.owner, error = %e, "Ledger unavailable during billing");
            ChargeFailure::Ledger(e)
        })?;
        if balance < amount {
            warn!(owner = %record.owner, balance, amount, "Insufficient funds for billing");
            return Err(ChargeFailure::Insufficient { balance });
        }

        let description = format!("VPS Monthly Billing - {}", record.id);
        self.ledger
            .debit(&record.owner, amount, &description)
            .await
            .map_err(|e| match e {
                LedgerError::InsufficientFunds { available, .. } => {
                    ChargeFailure::Insufficient { balance: available }
                }
                other => {
                    error!(owner = %record.owner, error = %other, "Ledger debit failed");
                    ChargeFailure::Ledger(other)
                }
            })
    }

    /// Persist a successful charge and return the receipt to send. The debit
    /// is refunded if the record cannot be saved, so the next scan charges
    /// again cleanly.
    async fn settle(
        &self,
        record: &InstanceRecord,
        tx: Transaction,
        now: DateTime<Utc>,
    ) -> Result<Notification> {
        let updated = match self.registry.update(&record.id, |r| r.mark_paid(now)).await {
            Ok(updated) => updated,
            Err(e) => {
                let reason = format!("Refund: billing record not saved for {}", record.id);
                if let Err(refund) = self.ledger.credit(&record.owner, tx.amount, &reason).await {
                    error!(
                        owner = %record.owner,
                        amount = tx.amount,
                        transaction = %tx.id,
                        error = %refund,
                        "Refund after failed persist also failed"
                    );
                }
                return Err(e);
            }
        };

        info!(instance_id = %record.id, amount = tx.amount, "Instance billed");
        Ok(Notification::BillingSucceeded {
            instance_id: record.id.clone(),
            container: record.short_container_id().to_string(),
            amount: tx.amount,
            next_billing: updated.next_billing_at(self.interval),
        })
    }

    async fn suspend(&self, record: &InstanceRecord, now: DateTime<Utc>) -> Result<BillingOutcome> {
        match self.controller.suspend_overdue(&record.id, now).await? {
            Some(suspended) => {
                let suspended_at = suspended.suspended_at.unwrap_or(now);
                self.notify(
                    &suspended.owner,
                    Notification::Suspended {
                        instance_id: suspended.id.clone(),
                        suspended_at,
                    },
                )
                .await;
                Ok(BillingOutcome::Suspended)
            }
            None => Ok(BillingOutcome::StillOverdue),
        }
    }

    async fn notify(&self, owner: &str, notification: Notification) {
        if let Err(e) = self.notifier.notify(owner, notification).await {
            warn!(%owner, error = %e, "Notification delivery failed; billing state unchanged");
        }
    }
}
