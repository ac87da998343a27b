//! Proactive OAuth token refresh.
//!
//! Tokens close to expiry are refreshed with exponential backoff. Once the
//! retry budget is spent the hub moves to `needs_reauth`, which removes it
//! from polling and from further automated refresh until manually cleared.

use crate::bridge::BridgeApi;
use crate::config::TokenConfig;
use crate::errors::{Error, Result};
use crate::metrics::{NEEDS_REAUTH_TOTAL, TOKEN_REFRESH_FAILURES_TOTAL, TOKEN_REFRESH_TOTAL};
use crate::model::{Hub, HubStatus, TokenGrant};
use crate::store::Store;
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Result of one hub's refresh sequence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenRefreshOutcome {
    NotDue,
    Refreshed { attempts: u32 },
    Exhausted { attempts: u32 },
    Cancelled,
}

pub struct TokenLifecycleManager {
    store: Arc<dyn Store>,
    bridge: Arc<dyn BridgeApi>,
    config: TokenConfig,
}

impl TokenLifecycleManager {
    pub fn new(store: Arc<dyn Store>, bridge: Arc<dyn BridgeApi>, config: TokenConfig) -> Self {
        Self {
            store,
            bridge,
            config,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(
            "Starting token refresh loop with check_interval={:?}, threshold={}h, max_retries={}",
            self.config.check_interval,
            self.config.refresh_threshold.num_hours(),
            self.config.max_retries
        );

        let mut ticker = interval(self.config.check_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.check_all(&cancel).await {
                        error!("Token refresh check failed: {}", e);
                    }
                }
            }
        }

        info!("Token refresh loop stopped");
    }

    /// One scan over active hubs.
    pub async fn check_all(&self, cancel: &CancellationToken) -> Result<Vec<TokenRefreshOutcome>> {
        let hubs = self.store.active_hubs().await?;
        let mut outcomes = Vec::with_capacity(hubs.len());

        for hub in &hubs {
            if cancel.is_cancelled() {
                break;
            }
            let outcome = match self.refresh_if_due(hub, Utc::now(), cancel).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(hub_id = %hub.id, "Token refresh for hub failed: {}", e);
                    continue;
                }
            };
            outcomes.push(outcome);
        }

        Ok(outcomes)
    }

    pub async fn refresh_if_due(
        &self,
        hub: &Hub,
        now: DateTime<Utc>,
        cancel: &CancellationToken,
    ) -> Result<TokenRefreshOutcome> {
        let time_until_expiry = hub.token_expires_at - now;
        if time_until_expiry > self.config.refresh_threshold {
            debug!(
                hub_id = %hub.id,
                "Token valid for another {}h, no refresh needed",
                time_until_expiry.num_hours()
            );
            return Ok(TokenRefreshOutcome::NotDue);
        }

        info!(
            hub_id = %hub.id,
            bridge_id = %hub.bridge_id,
            "Token expires at {}, refreshing", hub.token_expires_at
        );
        self.refresh_with_retry(hub, cancel).await
    }

    async fn refresh_with_retry(
        &self,
        hub: &Hub,
        cancel: &CancellationToken,
    ) -> Result<TokenRefreshOutcome> {
        let max_retries = self.config.max_retries;

        for attempt in 1..=max_retries {
            // A grant whose lifetime cannot be represented counts as a failed attempt
            let granted = self
                .bridge
                .refresh_access_token(&hub.refresh_token)
                .await
                .and_then(|grant| token_expiry(&grant, Utc::now()).map(|at| (grant, at)));

            match granted {
                Ok((grant, expires_at)) => {
                    // Bridges may omit rotation; keep the old refresh token then.
                    let refresh_token = grant
                        .refresh_token
                        .as_deref()
                        .filter(|t| !t.is_empty());
                    self.store
                        .update_tokens(hub.id, &grant.access_token, refresh_token, expires_at)
                        .await?;

                    TOKEN_REFRESH_TOTAL.inc();
                    info!(
                        hub_id = %hub.id,
                        attempt,
                        rotated = refresh_token.is_some(),
                        "Token refreshed, new expiry {}", expires_at
                    );
                    return Ok(TokenRefreshOutcome::Refreshed { attempts: attempt });
                }
                Err(e) => {
                    TOKEN_REFRESH_FAILURES_TOTAL.inc();
                    warn!(
                        hub_id = %hub.id,
                        attempt,
                        max_retries,
                        "Token refresh attempt failed: {}", e
                    );

                    if attempt < max_retries {
                        let backoff = self.backoff(attempt);
                        debug!(hub_id = %hub.id, "Retrying token refresh in {:?}", backoff);
                        tokio::select! {
                            _ = cancel.cancelled() => {
                                info!(hub_id = %hub.id, "Token refresh cancelled during backoff");
                                return Ok(TokenRefreshOutcome::Cancelled);
                            }
                            _ = tokio::time::sleep(backoff) => {}
                        }
                    }
                }
            }
        }

        self.store
            .set_hub_status(hub.id, HubStatus::NeedsReauth)
            .await?;
        NEEDS_REAUTH_TOTAL.inc();
        error!(
            hub_id = %hub.id,
            bridge_id = %hub.bridge_id,
            "Token refresh failed {} times, hub marked needs_reauth", max_retries
        );
        Ok(TokenRefreshOutcome::Exhausted {
            attempts: max_retries,
        })
    }

    /// `base * 2^attempt`, with `attempt` 1-indexed.
    fn backoff(&self, attempt: u32) -> Duration {
        let factor = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.config.backoff_base.saturating_mul(factor)
    }
}

fn token_expiry(grant: &TokenGrant, now: DateTime<Utc>) -> Result<DateTime<Utc>> {
    ChronoDuration::try_seconds(grant.expires_in)
        .and_then(|lifetime| now.checked_add_signed(lifetime))
        .ok_or_else(|| {
            Error::Validation(format!(
                "token lifetime of {}s is out of range",
                grant.expires_in
            ))
        })
}
