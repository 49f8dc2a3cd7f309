//! Affiliate commission accrual.
//!
//! Each affiliate has at most one Ongoing payout period, aligned to UTC
//! calendar months. An accrual pass folds every referral's net flow
//! (total deposited minus total withdrawn) into the period, using per
//! referral fold marks so re-running a pass never double counts. Commission
//! is the clamped-at-zero profit times the period rate. When a period's
//! month elapses, a final accrual runs and the period moves to Pending for
//! an operator to finish.

use crate::config::AffiliateConfig;
use crate::errors::{CasinoError, CasinoResult};
use crate::models::{now_secs, PayoutPeriod, PeriodStatus};
use crate::storage::Storage;
use crate::store;
use chrono::{Datelike, TimeZone, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Start of the UTC calendar month containing `ts`.
pub fn month_start(ts: i64) -> i64 {
    let dt = Utc.timestamp_opt(ts, 0).single().unwrap_or_default();
    Utc.with_ymd_and_hms(dt.year(), dt.month(), 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

/// Start of the UTC calendar month after the one containing `ts`.
pub fn next_month_start(ts: i64) -> i64 {
    let dt = Utc.timestamp_opt(ts, 0).single().unwrap_or_default();
    let (year, month) = if dt.month() == 12 {
        (dt.year() + 1, 1)
    } else {
        (dt.year(), dt.month() + 1)
    };
    Utc.with_ymd_and_hms(year, month, 1, 0, 0, 0)
        .single()
        .map(|d| d.timestamp())
        .unwrap_or(ts)
}

#[derive(Debug, Clone, Serialize)]
pub struct AffiliateStats {
    pub affiliate_id: String,
    pub referral_count: usize,
    /// Rate applied to newly opened periods, percent.
    pub commission_rate: u32,
    pub ongoing: Option<PayoutPeriod>,
    pub periods: Vec<PayoutPeriod>,
    /// Commission across Pending and Finished periods.
    pub total_commission: u64,
}

pub struct AffiliateEngine {
    storage: Storage,
    config: AffiliateConfig,
}

impl AffiliateEngine {
    pub fn new(storage: Storage, config: AffiliateConfig) -> Self {
        Self { storage, config }
    }

    /// The affiliate's Ongoing period for `now`, created on first touch and
    /// rotated when the previous one's month has elapsed. Rotation runs a
    /// final accrual into the old period before it goes Pending.
    pub fn ensure_ongoing_period(
        &self,
        affiliate_id: &str,
        now: i64,
    ) -> CasinoResult<PayoutPeriod> {
        if let Some(mut period) = store::load_ongoing_period(&self.storage, affiliate_id)? {
            if now < period.period_end {
                return Ok(period);
            }
            self.accrue_into(&mut period)?;
            period.status = PeriodStatus::Pending;
            store::store_period(&self.storage, &period)?;
            tracing::info!(
                affiliate = %affiliate_id,
                period_id = %period.id,
                commission = period.commission,
                "Payout period closed, pending operator review"
            );
        }

        let period = PayoutPeriod {
            id: Uuid::new_v4().to_string(),
            affiliate_id: affiliate_id.to_string(),
            period_start: month_start(now),
            period_end: next_month_start(now),
            total_profit: 0,
            commission: 0,
            rate: self.config.default_rate_percent,
            status: PeriodStatus::Ongoing,
            finished_at: None,
        };
        store::store_period(&self.storage, &period)?;
        Ok(period)
    }

    /// Fold unaccounted referral net flow into a period. Idempotent: a fold
    /// mark per (affiliate, referral) remembers what was already counted
    /// across all periods, and marks persist in the same batch as the period.
    fn accrue_into(&self, period: &mut PayoutPeriod) -> CasinoResult<()> {
        let referrals = store::load_referrals(&self.storage, &period.affiliate_id);
        let mut marks: Vec<(String, i64)> = Vec::new();

        for account_id in referrals {
            let Some(account) = store::load_account(&self.storage, &account_id)? else {
                tracing::warn!(account = %account_id, "Referral index points at missing account");
                continue;
            };
            let profit = account.total_deposited as i64 - account.total_withdrawn as i64;
            let already =
                store::load_fold_mark(&self.storage, &period.affiliate_id, &account_id);
            let delta = profit - already;
            if delta != 0 {
                period.total_profit += delta;
                marks.push((account_id, profit));
            }
        }

        period.commission =
            (period.total_profit.max(0) as u64).saturating_mul(period.rate as u64) / 100;

        if marks.is_empty() {
            store::store_period(&self.storage, period)?;
        } else {
            store::store_period_with_fold_marks(&self.storage, period, &marks)?;
        }
        Ok(())
    }

    /// One accrual sweep over every affiliate with at least one referral.
    pub fn run_accrual_pass(&self) -> CasinoResult<usize> {
        let now = now_secs();
        let affiliates = store::list_affiliates(&self.storage);
        let count = affiliates.len();
        for affiliate_id in affiliates {
            let mut period = self.ensure_ongoing_period(&affiliate_id, now)?;
            self.accrue_into(&mut period)?;
            tracing::debug!(
                affiliate = %affiliate_id,
                period_id = %period.id,
                total_profit = period.total_profit,
                commission = period.commission,
                "Accrual pass folded period"
            );
        }
        Ok(count)
    }

    /// Operator acknowledgment of a paid-out period: Pending -> Finished.
    pub fn finish_period(&self, affiliate_id: &str, period_id: &str) -> CasinoResult<PayoutPeriod> {
        let Some(mut period) = store::load_period(&self.storage, affiliate_id, period_id)? else {
            return Err(CasinoError::invalid_input(format!(
                "unknown period {} for affiliate {}",
                period_id, affiliate_id
            )));
        };
        if period.status != PeriodStatus::Pending {
            return Err(CasinoError::invalid_game_state(format!(
                "period {} is not pending payout",
                period_id
            )));
        }
        period.status = PeriodStatus::Finished;
        period.finished_at = Some(now_secs());
        store::store_period(&self.storage, &period)?;
        tracing::info!(affiliate = %affiliate_id, period_id = %period_id, "Payout period finished");
        Ok(period)
    }

    pub fn stats(&self, affiliate_id: &str) -> CasinoResult<AffiliateStats> {
        let referrals = store::load_referrals(&self.storage, affiliate_id);
        let periods = store::load_periods(&self.storage, affiliate_id)?;
        let ongoing = store::load_ongoing_period(&self.storage, affiliate_id)?;
        let total_commission = periods
            .iter()
            .filter(|p| p.status != PeriodStatus::Ongoing)
            .map(|p| p.commission)
            .sum();
        Ok(AffiliateStats {
            affiliate_id: affiliate_id.to_string(),
            referral_count: referrals.len(),
            commission_rate: self.config.default_rate_percent,
            ongoing,
            periods,
            total_commission,
        })
    }
}

/// Background worker running the accrual pass on an interval.
pub struct AffiliateWorker {
    engine: Arc<AffiliateEngine>,
    interval: Duration,
}

impl AffiliateWorker {
    pub fn new(engine: Arc<AffiliateEngine>, config: &AffiliateConfig) -> Self {
        Self {
            engine,
            interval: Duration::from_secs(config.accrual_interval_secs),
        }
    }

    pub async fn run(self) {
        let mut ticker = tokio::time::interval(self.interval);
        tracing::info!(interval_secs = self.interval.as_secs(), "Affiliate accrual worker started");
        loop {
            ticker.tick().await;
            match self.engine.run_accrual_pass() {
                Ok(count) if count > 0 => {
                    tracing::debug!(affiliates = count, "Accrual pass complete");
                }
                Ok(_) => {}
                Err(e) => tracing::error!(error = %e, "Accrual pass failed"),
            }
        }
    }
}
