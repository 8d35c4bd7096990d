//! Process-wide daily spend ledger.
//!
//! Shared across concurrent pipelines as `Arc<CostBudget>`. Every read and
//! write goes through one mutex; `try_charge` checks and records in the same
//! critical section so two requests cannot both spend the last dollar.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use chrono::{NaiveDate, Utc};
use serde::Serialize;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::routing::ProcessingRoute;

/// Float slack so a budget of exactly N requests admits the Nth.
const COST_EPSILON: f64 = 1e-9;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BudgetError {
    #[error("Route {route} costs {cost:.4} but only {remaining:.4} of the daily budget remains")]
    Exceeded { route: String, cost: f64, remaining: f64 },
}

/// Point-in-time copy of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetSnapshot {
    pub day: NaiveDate,
    pub daily_limit: f64,
    pub current_spent: f64,
    pub remaining_budget: f64,
    pub receipt_count: u64,
    pub average_cost_per_receipt: f64,
}

#[derive(Debug)]
struct Ledger {
    day: NaiveDate,
    daily_limit: f64,
    current_spent: f64,
    receipt_count: u64,
}

impl Ledger {
    fn remaining(&self) -> f64 {
        (self.daily_limit - self.current_spent).max(0.0)
    }

    fn affords(&self, cost: f64) -> bool {
        cost <= self.remaining() + COST_EPSILON
    }
}

#[derive(Debug)]
pub struct CostBudget {
    ledger: Mutex<Ledger>,
}

impl CostBudget {
    pub fn new(daily_limit: f64) -> Self {
        Self::starting_on(daily_limit, Utc::now().date_naive())
    }

    pub fn starting_on(daily_limit: f64, day: NaiveDate) -> Self {
        Self {
            ledger: Mutex::new(Ledger {
                day,
                daily_limit: daily_limit.max(0.0),
                current_spent: 0.0,
                receipt_count: 0,
            }),
        }
    }

    /// A poisoned lock still holds consistent numbers: every mutation is a
    /// single field update.
    fn lock(&self) -> MutexGuard<'_, Ledger> {
        self.ledger.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn can_afford(&self, route: &ProcessingRoute) -> bool {
        self.lock().affords(route.cost_per_request)
    }

    pub fn remaining(&self) -> f64 {
        self.lock().remaining()
    }

    /// Check and record the route's cost atomically.
    pub fn try_charge(&self, route: &ProcessingRoute) -> Result<(), BudgetError> {
        let mut ledger = self.lock();
        if !ledger.affords(route.cost_per_request) {
            return Err(BudgetError::Exceeded {
                route: route.name.clone(),
                cost: route.cost_per_request,
                remaining: ledger.remaining(),
            });
        }
        ledger.current_spent += route.cost_per_request;
        Ok(())
    }

    /// Record spend unconditionally (e.g. costs reported after the fact).
    pub fn record(&self, cost: f64) {
        if cost > 0.0 {
            self.lock().current_spent += cost;
        }
    }

    /// Count one processed receipt toward the running average.
    pub fn finish_receipt(&self) {
        self.lock().receipt_count += 1;
    }

    pub fn reset(&self) {
        let mut ledger = self.lock();
        ledger.current_spent = 0.0;
        ledger.receipt_count = 0;
    }

    /// Reset if `today` is past the ledger's day. Idempotent within a day.
    pub fn rollover_if_needed(&self, today: NaiveDate) -> bool {
        let mut ledger = self.lock();
        if today <= ledger.day {
            return false;
        }
        tracing::info!(
            previous_day = %ledger.day,
            spent = format!("{:.4}", ledger.current_spent),
            receipts = ledger.receipt_count,
            "Daily budget rolled over"
        );
        ledger.day = today;
        ledger.current_spent = 0.0;
        ledger.receipt_count = 0;
        true
    }

    pub fn snapshot(&self) -> BudgetSnapshot {
        let ledger = self.lock();
        let average = if ledger.receipt_count == 0 {
            0.0
        } else {
            ledger.current_spent / ledger.receipt_count as f64
        };
        BudgetSnapshot {
            day: ledger.day,
            daily_limit: ledger.daily_limit,
            current_spent: ledger.current_spent,
            remaining_budget: ledger.remaining(),
            receipt_count: ledger.receipt_count,
            average_cost_per_receipt: average,
        }
    }
}

/// Background task that calls `rollover_if_needed` every `check_every`
/// until `cancel` fires.
pub fn spawn_daily_rollover(
    budget: Arc<CostBudget>,
    check_every: Duration,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(check_every);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    budget.rollover_if_needed(Utc::now().date_naive());
                }
            }
        }
        tracing::debug!("Budget rollover task stopped");
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::ProviderKind;

    fn route(cost: f64) -> ProcessingRoute {
        ProcessingRoute::new("r", ProviderKind::Gemini, "m", cost, 0.9, 100)
    }

    fn day(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2026, 3, d).unwrap()
    }

    #[test]
    fn charge_reduces_remaining() {
        let budget = CostBudget::new(1.0);
        budget.try_charge(&route(0.25)).unwrap();
        let snap = budget.snapshot();
        assert_eq!(snap.current_spent, 0.25);
        assert_eq!(snap.remaining_budget, 0.75);
    }

    #[test]
    fn charge_beyond_remaining_is_rejected_and_not_recorded() {
        let budget = CostBudget::new(0.01);
        budget.try_charge(&route(0.008)).unwrap();
        let err = budget.try_charge(&route(0.008)).unwrap_err();
        assert!(matches!(err, BudgetError::Exceeded { .. }));
        assert!((budget.snapshot().current_spent - 0.008).abs() < 1e-12);
    }

    #[test]
    fn exact_budget_admits_last_request() {
        let budget = CostBudget::new(0.003);
        for _ in 0..3 {
            budget.try_charge(&route(0.001)).unwrap();
        }
        assert!(budget.try_charge(&route(0.001)).is_err());
    }

    #[test]
    fn zero_cost_route_always_affordable() {
        let budget = CostBudget::new(0.0);
        assert!(budget.can_afford(&route(0.0)));
        assert!(!budget.can_afford(&route(0.001)));
    }

    #[test]
    fn average_cost_per_receipt() {
        let budget = CostBudget::new(10.0);
        budget.record(0.003);
        budget.finish_receipt();
        budget.record(0.001);
        budget.finish_receipt();
        let snap = budget.snapshot();
        assert_eq!(snap.receipt_count, 2);
        assert!((snap.average_cost_per_receipt - 0.002).abs() < 1e-12);
    }

    #[test]
    fn remaining_never_negative() {
        let budget = CostBudget::new(0.01);
        budget.record(0.05);
        assert_eq!(budget.remaining(), 0.0);
    }

    #[test]
    fn reset_clears_spend_and_count() {
        let budget = CostBudget::new(1.0);
        budget.record(0.5);
        budget.finish_receipt();
        budget.reset();
        let snap = budget.snapshot();
        assert_eq!(snap.current_spent, 0.0);
        assert_eq!(snap.receipt_count, 0);
        assert_eq!(snap.daily_limit, 1.0);
    }

    #[test]
    fn rollover_is_idempotent_within_a_day() {
        let budget = CostBudget::starting_on(1.0, day(1));
        budget.record(0.4);

        assert!(!budget.rollover_if_needed(day(1)));
        assert_eq!(budget.snapshot().current_spent, 0.4);

        assert!(budget.rollover_if_needed(day(2)));
        assert_eq!(budget.snapshot().current_spent, 0.0);
        assert_eq!(budget.snapshot().day, day(2));

        budget.record(0.1);
        assert!(!budget.rollover_if_needed(day(2)));
        assert_eq!(budget.snapshot().current_spent, 0.1);
    }

    #[test]
    fn concurrent_charges_never_overspend() {
        let budget = Arc::new(CostBudget::new(0.01));
        let handles: Vec<_> = (0..50)
            .map(|_| {
                let budget = Arc::clone(&budget);
                std::thread::spawn(move || budget.try_charge(&route(0.001)).is_ok())
            })
            .collect();

        let admitted = handles.into_iter().map(|h| h.join().unwrap()).filter(|ok| *ok).count();
        assert_eq!(admitted, 10);
        assert!(budget.snapshot().current_spent <= 0.01 + 1e-9);
    }

    #[tokio::test]
    async fn rollover_task_resets_stale_ledger() {
        let yesterday = Utc::now().date_naive().pred_opt().unwrap();
        let budget = Arc::new(CostBudget::starting_on(1.0, yesterday));
        budget.record(0.7);

        let cancel = CancellationToken::new();
        let handle = spawn_daily_rollover(Arc::clone(&budget), Duration::from_millis(10), cancel.clone());
        tokio::time::sleep(Duration::from_millis(50)).await;
        cancel.cancel();
        handle.await.unwrap();

        assert_eq!(budget.snapshot().current_spent, 0.0);
        assert!(budget.snapshot().day > yesterday);
    }
}
