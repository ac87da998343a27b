//! Wall-clock digest scheduling.

use crate::config::DigestConfig;
use crate::errors::Result;
use crate::metrics::{DIGESTS_SENT_TOTAL, DIGEST_FAILURES_TOTAL};
use crate::model::Customer;
use crate::notify::{DigestEmail, DigestRenderer, Mailer};
use crate::store::Store;
use chrono::{DateTime, Duration, LocalResult, NaiveDate, NaiveTime, Offset, TimeZone, Utc};
use chrono_tz::Tz;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Soonest configured time of day strictly after `now`, evaluated in `tz`.
///
/// Times are sorted and scanned in order; if all have passed today the first
/// one tomorrow is used. A time falling in a DST gap is pushed forward by the
/// length of the gap, and an ambiguous one resolves to its earlier instant.
pub fn compute_next_send_time(
    send_times: &[NaiveTime],
    now: DateTime<Utc>,
    tz: &Tz,
) -> DateTime<Utc> {
    let mut times = send_times.to_vec();
    times.sort();

    let today = now.with_timezone(tz).date_naive();
    for time in &times {
        if let Some(candidate) = resolve_local(tz, today, *time) {
            if candidate > now {
                return candidate;
            }
        }
    }

    let tomorrow = today + Duration::days(1);
    times
        .iter()
        .find_map(|time| resolve_local(tz, tomorrow, *time))
        .unwrap_or(now + Duration::days(1))
}

fn resolve_local(tz: &Tz, date: NaiveDate, time: NaiveTime) -> Option<DateTime<Utc>> {
    let local = date.and_time(time);
    let resolved = match tz.from_local_datetime(&local) {
        LocalResult::Single(dt) => Some(dt),
        LocalResult::Ambiguous(earlier, _) => Some(earlier),
        // Skipped by a forward transition: read it with the offset in force
        // just before, which lands the same distance past the gap.
        LocalResult::None => {
            let before = tz.offset_from_utc_datetime(&(local - Duration::days(1))).fix();
            let utc = local - Duration::seconds(i64::from(before.local_minus_utc()));
            return Some(Utc.from_utc_datetime(&utc));
        }
    };
    resolved.map(|dt| dt.with_timezone(&Utc))
}

/// Splits a comma-separated recipient list, dropping entries without an `@`.
pub fn parse_addresses(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|addr| addr.contains('@'))
        .map(str::to_string)
        .collect()
}

pub fn digest_subject(product_name: &str, reference: DateTime<Utc>, tz: &Tz) -> String {
    format!(
        "{} Daily Summary - {}",
        product_name,
        reference.with_timezone(tz).format("%B %-d, %Y")
    )
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct BatchSummary {
    pub sent: usize,
    pub skipped: usize,
    pub failed: usize,
}

enum Delivery {
    Sent,
    NoRecipients,
}

type Clock = Arc<dyn Fn() -> DateTime<Utc> + Send + Sync>;

pub struct DigestScheduler {
    store: Arc<dyn Store>,
    renderer: Arc<dyn DigestRenderer>,
    mailer: Arc<dyn Mailer>,
    config: DigestConfig,
    clock: Clock,
}

impl DigestScheduler {
    pub fn new(
        store: Arc<dyn Store>,
        renderer: Arc<dyn DigestRenderer>,
        mailer: Arc<dyn Mailer>,
        config: DigestConfig,
    ) -> Self {
        Self {
            store,
            renderer,
            mailer,
            config,
            clock: Arc::new(Utc::now),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: impl Fn() -> DateTime<Utc> + Send + Sync + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting digest scheduler with send times {:?} (UTC)",
            self.config.send_times
        );

        loop {
            // Wall clock decides the slot; the sleep itself is monotonic
            let now = (self.clock)();
            let next = compute_next_send_time(&self.config.send_times, now, &Tz::UTC);
            let delay = (next - now).to_std().unwrap_or_default();
            info!("Next digest batch at {}", next);

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }

            if let Err(e) = self.send_batch(next).await {
                error!(
                    "Digest batch failed, retrying schedule in {:?}: {}",
                    self.config.error_retry_delay, e
                );
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(self.config.error_retry_delay) => {}
                }
            }
        }

        info!("Digest scheduler stopped");
    }

    /// Sends one digest per recipient. Per-recipient failures are logged and
    /// counted; only a failure to load the recipients fails the batch.
    pub async fn send_batch(&self, reference: DateTime<Utc>) -> Result<BatchSummary> {
        let recipients = self.store.digest_recipients().await?;
        let mut summary = BatchSummary::default();

        for customer in &recipients {
            match self.send_one(customer, reference).await {
                Ok(Delivery::Sent) => {
                    summary.sent += 1;
                    DIGESTS_SENT_TOTAL.inc();
                }
                Ok(Delivery::NoRecipients) => {
                    summary.skipped += 1;
                    debug!(customer_id = %customer.id, "No valid 'to' address, digest skipped");
                }
                Err(e) => {
                    summary.failed += 1;
                    DIGEST_FAILURES_TOTAL.inc();
                    error!(customer_id = %customer.id, "Failed to send digest: {}", e);
                }
            }
        }

        info!(
            "Digest batch done: {} sent, {} skipped, {} failed",
            summary.sent, summary.skipped, summary.failed
        );
        Ok(summary)
    }

    async fn send_one(&self, customer: &Customer, reference: DateTime<Utc>) -> Result<Delivery> {
        let to = parse_addresses(&customer.email_to);
        if to.is_empty() {
            return Ok(Delivery::NoRecipients);
        }

        let tz = customer.time_zone.parse::<Tz>().unwrap_or_else(|_| {
            warn!(
                customer_id = %customer.id,
                "Unknown time zone '{}', using UTC", customer.time_zone
            );
            Tz::UTC
        });

        let body = self.renderer.render(customer.id, tz, reference).await?;
        let email = DigestEmail {
            to,
            cc: customer.email_cc.as_deref().map(parse_addresses).unwrap_or_default(),
            bcc: customer.email_bcc.as_deref().map(parse_addresses).unwrap_or_default(),
            subject: digest_subject(&self.config.product_name, reference, &tz),
            body,
        };
        self.mailer.send(&email).await?;
        Ok(Delivery::Sent)
    }
}
