//! Storage interface shared by the polling, token and digest loops.
//!
//! Every method is one short, self-contained statement. The loops write
//! disjoint hub fields: polling owns the failure/success/poll-time columns,
//! the token manager owns the token/expiry/status columns.

use crate::errors::Result;
use crate::model::{
    Customer, Device, Hub, HubStatus, NewReading, PollingLogEntry, Reading,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

#[async_trait]
pub trait Store: Send + Sync {
    async fn active_hubs(&self) -> Result<Vec<Hub>> {
        self.hubs_by_status(HubStatus::Active).await
    }

    async fn hubs_by_status(&self, status: HubStatus) -> Result<Vec<Hub>>;

    async fn all_hubs(&self) -> Result<Vec<Hub>>;

    async fn hubs_for_customer(&self, customer_id: Uuid) -> Result<Vec<Hub>>;

    /// Successful poll: stamps poll/success time and zeroes the failure counter.
    async fn record_poll_success(
        &self,
        hub_id: Uuid,
        at: DateTime<Utc>,
        battery_polled: bool,
    ) -> Result<()>;

    /// Failed poll: stamps poll time and increments the failure counter.
    async fn record_poll_failure(&self, hub_id: Uuid, at: DateTime<Utc>) -> Result<()>;

    /// Stores refreshed credentials. The refresh token is only replaced when
    /// `refresh_token` is `Some`.
    async fn update_tokens(
        &self,
        hub_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()>;

    async fn set_hub_status(&self, hub_id: Uuid, status: HubStatus) -> Result<()>;

    /// Manual re-activation: status back to active and a fresh failure count.
    async fn reactivate_hub(&self, hub_id: Uuid) -> Result<()>;

    async fn devices_by_hub(&self, hub_id: Uuid) -> Result<Vec<Device>>;

    async fn insert_device(&self, hub_id: Uuid, bridge_device_id: &str, name: &str)
        -> Result<Device>;

    async fn rename_device(&self, device_id: Uuid, name: &str) -> Result<()>;

    async fn insert_reading(&self, reading: &NewReading) -> Result<()>;

    /// Newest first, at most `limit` rows when given.
    async fn readings_for_devices(
        &self,
        device_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reading>>;

    async fn insert_polling_log(&self, entry: &PollingLogEntry) -> Result<()>;

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn delete_polling_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn digest_recipients(&self) -> Result<Vec<Customer>>;
}
