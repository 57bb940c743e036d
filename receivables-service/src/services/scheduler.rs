//! Daily trigger for recurring invoice generation.
//!
//! The scheduler holds no ledger state. Running it twice on the same day is
//! harmless because a template with a successor is never due again, but two
//! replicas must not run it at once.

use super::ledger::LedgerService;
use super::metrics::RECURRING_RUNS_TOTAL;
use crate::config::RecurringConfig;
use crate::models::RecurringRunReport;
use chrono::{DateTime, Days, NaiveTime, Utc};
use service_core::error::AppError;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The first instant strictly after `now` whose UTC wall-clock time is `run_at`.
pub fn next_run_after(now: DateTime<Utc>, run_at: NaiveTime) -> DateTime<Utc> {
    let today = now.date_naive().and_time(run_at).and_utc();
    if today > now {
        return today;
    }
    now.date_naive()
        .checked_add_days(Days::new(1))
        .map(|d| d.and_time(run_at).and_utc())
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

pub struct RecurringScheduler {
    config: RecurringConfig,
    ledger: LedgerService,
    shutdown_token: CancellationToken,
}

impl RecurringScheduler {
    pub fn new(config: RecurringConfig, ledger: LedgerService) -> Self {
        Self {
            config,
            ledger,
            shutdown_token: CancellationToken::new(),
        }
    }

    /// Run one generation pass now and record its outcome.
    pub async fn run_once(&self) -> Result<RecurringRunReport, AppError> {
        let result = self.ledger.generate_recurring_invoices().await;

        match &result {
            Ok(report) => {
                RECURRING_RUNS_TOTAL
                    .with_label_values(&[report.status()])
                    .inc();
                tracing::info!(
                    status = report.status(),
                    scanned = report.scanned,
                    generated = report.generated.len(),
                    skipped = report.skipped,
                    failed = report.failures.len(),
                    "Recurring invoice run finished"
                );
            }
            Err(e) => {
                RECURRING_RUNS_TOTAL.with_label_values(&["failed"]).inc();
                tracing::error!(error = %e, "Recurring invoice run failed");
            }
        }

        result
    }

    /// Spawn the daily loop. Returns `None` when disabled by configuration.
    pub fn start(&self) -> Option<JoinHandle<()>> {
        if !self.config.enabled {
            tracing::info!("Recurring invoice scheduler disabled by configuration");
            return None;
        }

        let scheduler = Self {
            config: self.config.clone(),
            ledger: self.ledger.clone(),
            shutdown_token: self.shutdown_token.clone(),
        };

        Some(tokio::spawn(async move {
            scheduler.run_until_stopped().await;
        }))
    }

    async fn run_until_stopped(&self) {
        let clock = self.ledger.clock();
        loop {
            let now = clock.now();
            let next_run = next_run_after(now, self.config.run_at);
            let wait = (next_run - now).to_std().unwrap_or(Duration::ZERO);

            tracing::info!(next_run = %next_run, "Next recurring invoice run scheduled");

            tokio::select! {
                _ = self.shutdown_token.cancelled() => {
                    tracing::info!("Recurring invoice scheduler shutting down");
                    break;
                }
                _ = tokio::time::sleep(wait) => {
                    // Failures are already logged and counted.
                    let _ = self.run_once().await;
                }
            }
        }
    }

    pub fn shutdown(&self) {
        tracing::info!("Stopping recurring invoice scheduler");
        self.shutdown_token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(h: u32, m: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, m, 0).unwrap()
    }

    #[test]
    fn runs_later_today_when_time_has_not_passed() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 5, 0, 0).unwrap();
        assert_eq!(
            next_run_after(now, at(6, 30)),
            Utc.with_ymd_and_hms(2025, 3, 10, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn runs_tomorrow_once_time_has_passed() {
        let now = Utc.with_ymd_and_hms(2025, 3, 10, 7, 0, 0).unwrap();
        assert_eq!(
            next_run_after(now, at(6, 30)),
            Utc.with_ymd_and_hms(2025, 3, 11, 6, 30, 0).unwrap()
        );
    }

    #[test]
    fn exact_fire_time_schedules_the_next_day() {
        let now = Utc.with_ymd_and_hms(2025, 12, 31, 0, 0, 0).unwrap();
        assert_eq!(
            next_run_after(now, NaiveTime::MIN),
            Utc.with_ymd_and_hms(2026, 1, 1, 0, 0, 0).unwrap()
        );
    }
}
