//! Invoice number allocation.
//!
//! Numbers look like `LWS-25-0042`: a fixed prefix, the two-digit issue year,
//! and a sequence that restarts at 1 every year. The sequence is zero-padded
//! to four digits and widens past 9999.

use super::metrics::INVOICE_NUMBER_CONFLICTS_TOTAL;
use super::store::LedgerTx;
use chrono::{DateTime, Datelike, Utc};
use service_core::error::AppError;
use std::fmt;
use std::str::FromStr;
use tracing::{debug, warn};

const PREFIX: &str = "LWS";

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct InvoiceNumber {
    pub year: u8,
    pub sequence: u32,
}

impl InvoiceNumber {
    pub fn first_of(year: i32) -> Self {
        Self {
            year: two_digit_year(year),
            sequence: 1,
        }
    }

    /// Prefix shared by every number issued in `year`, e.g. `LWS-25-`.
    pub fn year_prefix(year: i32) -> String {
        format!("{}-{:02}-", PREFIX, two_digit_year(year))
    }

    pub fn next(&self) -> Result<Self, AppError> {
        let sequence = self.sequence.checked_add(1).ok_or_else(|| {
            AppError::Fatal(anyhow::anyhow!(
                "Invoice sequence exhausted for year {:02}",
                self.year
            ))
        })?;
        Ok(Self {
            year: self.year,
            sequence,
        })
    }
}

fn two_digit_year(year: i32) -> u8 {
    year.rem_euclid(100) as u8
}

impl fmt::Display for InvoiceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{:02}-{:04}", PREFIX, self.year, self.sequence)
    }
}

impl FromStr for InvoiceNumber {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || AppError::Fatal(anyhow::anyhow!("Malformed invoice number '{}'", s));

        let mut parts = s.split('-');
        let (Some(prefix), Some(year), Some(sequence), None) =
            (parts.next(), parts.next(), parts.next(), parts.next())
        else {
            return Err(malformed());
        };

        let all_digits = |part: &str| !part.is_empty() && part.bytes().all(|b| b.is_ascii_digit());
        if prefix != PREFIX
            || year.len() != 2
            || !all_digits(year)
            || sequence.len() < 4
            || !all_digits(sequence)
        {
            return Err(malformed());
        }

        Ok(Self {
            year: year.parse().map_err(|_| malformed())?,
            sequence: sequence.parse().map_err(|_| malformed())?,
        })
    }
}

/// The number that follows `last` in `year`. A missing `last` starts the year at 1.
pub fn next_invoice_number(last: Option<&str>, year: i32) -> Result<InvoiceNumber, AppError> {
    let Some(last) = last else {
        return Ok(InvoiceNumber::first_of(year));
    };

    let last: InvoiceNumber = last.parse()?;
    if last.year != two_digit_year(year) {
        return Err(AppError::Fatal(anyhow::anyhow!(
            "Invoice number {} does not belong to year {}",
            last,
            year
        )));
    }
    last.next()
}

/// Allocate the next number for the year of `now` inside `tx`.
///
/// Returns `Contention` when a concurrent unit of work claimed the same number;
/// the caller retries from a fresh unit of work.
pub async fn allocate(
    tx: &mut dyn LedgerTx,
    now: DateTime<Utc>,
) -> Result<InvoiceNumber, AppError> {
    let prefix = InvoiceNumber::year_prefix(now.year());
    let last = tx.last_invoice_number(&prefix).await?;
    let number = next_invoice_number(last.as_deref(), now.year())?;

    if let Err(e) = tx.reserve_invoice_number(&number.to_string(), now).await {
        if matches!(e, AppError::Contention(_)) {
            INVOICE_NUMBER_CONFLICTS_TOTAL.inc();
            warn!(invoice_number = %number, "Invoice number already taken");
        }
        return Err(e);
    }
    debug!(invoice_number = %number, "Invoice number allocated");

    Ok(number)
}
