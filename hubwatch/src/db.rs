use crate::errors::{Error, Result};
use crate::metrics::DB_FAILURES_TOTAL;
use crate::model::{Customer, Device, Hub, HubStatus, NewReading, PollingLogEntry, Reading};
use crate::store::Store;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::{PgPool, PgPoolOptions};
use std::time::Duration;
use tracing::info;
use uuid::Uuid;

pub async fn make_pool(database_url: &str) -> Result<PgPool> {
    info!("Connecting to database...");
    let pool = PgPoolOptions::new()
        .max_connections(10)
        .acquire_timeout(Duration::from_secs(10))
        .connect(database_url)
        .await?;

    info!("Database connection established");
    info!("Running database migrations...");
    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Migrations completed");

    Ok(pool)
}

const HUB_COLUMNS: &str = "id, customer_id, bridge_id, name, access_token, refresh_token, \
     token_expires_at, status, consecutive_failures, last_polled_at, last_success_at, \
     last_battery_poll_at";

#[derive(sqlx::FromRow)]
struct HubRow {
    id: Uuid,
    customer_id: Uuid,
    bridge_id: String,
    name: String,
    access_token: String,
    refresh_token: String,
    token_expires_at: DateTime<Utc>,
    status: String,
    consecutive_failures: i32,
    last_polled_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
    last_battery_poll_at: Option<DateTime<Utc>>,
}

impl TryFrom<HubRow> for Hub {
    type Error = Error;

    fn try_from(row: HubRow) -> Result<Self> {
        Ok(Hub {
            id: row.id,
            customer_id: row.customer_id,
            bridge_id: row.bridge_id,
            name: row.name,
            access_token: row.access_token,
            refresh_token: row.refresh_token,
            token_expires_at: row.token_expires_at,
            status: row.status.parse()?,
            consecutive_failures: row.consecutive_failures,
            last_polled_at: row.last_polled_at,
            last_success_at: row.last_success_at,
            last_battery_poll_at: row.last_battery_poll_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ReadingRow {
    id: i64,
    device_id: Uuid,
    ts: DateTime<Utc>,
    kind: String,
    value: serde_json::Value,
}

impl TryFrom<ReadingRow> for Reading {
    type Error = Error;

    fn try_from(row: ReadingRow) -> Result<Self> {
        Ok(Reading {
            id: row.id,
            device_id: row.device_id,
            timestamp: row.ts,
            kind: row.kind.parse()?,
            value: row.value,
        })
    }
}

fn into_hubs(rows: Vec<HubRow>) -> Result<Vec<Hub>> {
    rows.into_iter().map(Hub::try_from).collect()
}

/// Counts a failed statement before handing the error back.
fn track<T>(result: std::result::Result<T, sqlx::Error>) -> Result<T> {
    result.map_err(|e| {
        DB_FAILURES_TOTAL.inc();
        Error::Database(e)
    })
}

/// Postgres-backed [`Store`].
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: PgPool,
}

impl PgStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl Store for PgStore {
    async fn hubs_by_status(&self, status: HubStatus) -> Result<Vec<Hub>> {
        let query = format!("SELECT {} FROM hubs WHERE status = $1 ORDER BY name", HUB_COLUMNS);
        let rows = track(
            sqlx::query_as::<_, HubRow>(&query)
                .bind(status.as_str())
                .fetch_all(&self.pool)
                .await,
        )?;
        into_hubs(rows)
    }

    async fn all_hubs(&self) -> Result<Vec<Hub>> {
        let query = format!("SELECT {} FROM hubs ORDER BY name", HUB_COLUMNS);
        let rows = track(sqlx::query_as::<_, HubRow>(&query).fetch_all(&self.pool).await)?;
        into_hubs(rows)
    }

    async fn hubs_for_customer(&self, customer_id: Uuid) -> Result<Vec<Hub>> {
        let query = format!(
            "SELECT {} FROM hubs WHERE customer_id = $1 ORDER BY name",
            HUB_COLUMNS
        );
        let rows = track(
            sqlx::query_as::<_, HubRow>(&query)
                .bind(customer_id)
                .fetch_all(&self.pool)
                .await,
        )?;
        into_hubs(rows)
    }

    async fn record_poll_success(
        &self,
        hub_id: Uuid,
        at: DateTime<Utc>,
        battery_polled: bool,
    ) -> Result<()> {
        track(
            sqlx::query(
                r#"
                UPDATE hubs
                SET last_polled_at = $2,
                    last_success_at = $2,
                    consecutive_failures = 0,
                    last_battery_poll_at = CASE WHEN $3 THEN $2 ELSE last_battery_poll_at END
                WHERE id = $1
                "#,
            )
            .bind(hub_id)
            .bind(at)
            .bind(battery_polled)
            .execute(&self.pool)
            .await,
        )?;
        Ok(())
    }

    async fn record_poll_failure(&self, hub_id: Uuid, at: DateTime<Utc>) -> Result<()> {
        track(
            sqlx::query(
                r#"
                UPDATE hubs
                SET last_polled_at = $2,
                    consecutive_failures = consecutive_failures + 1
                WHERE id = $1
                "#,
            )
            .bind(hub_id)
            .bind(at)
            .execute(&self.pool)
            .await,
        )?;
        Ok(())
    }

    async fn update_tokens(
        &self,
        hub_id: Uuid,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: DateTime<Utc>,
    ) -> Result<()> {
        track(
            sqlx::query(
                r#"
                UPDATE hubs
                SET access_token = $2,
                    refresh_token = COALESCE($3, refresh_token),
                    token_expires_at = $4
                WHERE id = $1
                "#,
            )
            .bind(hub_id)
            .bind(access_token)
            .bind(refresh_token)
            .bind(expires_at)
            .execute(&self.pool)
            .await,
        )?;
        Ok(())
    }

    async fn set_hub_status(&self, hub_id: Uuid, status: HubStatus) -> Result<()> {
        track(
            sqlx::query("UPDATE hubs SET status = $2 WHERE id = $1")
                .bind(hub_id)
                .bind(status.as_str())
                .execute(&self.pool)
                .await,
        )?;
        Ok(())
    }

    async fn reactivate_hub(&self, hub_id: Uuid) -> Result<()> {
        let result = track(
            sqlx::query(
                "UPDATE hubs SET status = 'active', consecutive_failures = 0 WHERE id = $1",
            )
            .bind(hub_id)
            .execute(&self.pool)
            .await,
        )?;
        if result.rows_affected() == 0 {
            return Err(Error::NotFound(format!("hub {}", hub_id)));
        }
        Ok(())
    }

    async fn devices_by_hub(&self, hub_id: Uuid) -> Result<Vec<Device>> {
        track(
            sqlx::query_as::<_, Device>(
                "SELECT id, hub_id, bridge_device_id, name FROM devices WHERE hub_id = $1",
            )
            .bind(hub_id)
            .fetch_all(&self.pool)
            .await,
        )
    }

    async fn insert_device(
        &self,
        hub_id: Uuid,
        bridge_device_id: &str,
        name: &str,
    ) -> Result<Device> {
        // A concurrent insert of the same device keeps the first row.
        track(
            sqlx::query_as::<_, Device>(
                r#"
                INSERT INTO devices (id, hub_id, bridge_device_id, name)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (hub_id, bridge_device_id)
                    DO UPDATE SET name = devices.name
                RETURNING id, hub_id, bridge_device_id, name
                "#,
            )
            .bind(Uuid::new_v4())
            .bind(hub_id)
            .bind(bridge_device_id)
            .bind(name)
            .fetch_one(&self.pool)
            .await,
        )
    }

    async fn rename_device(&self, device_id: Uuid, name: &str) -> Result<()> {
        track(
            sqlx::query("UPDATE devices SET name = $2 WHERE id = $1")
                .bind(device_id)
                .bind(name)
                .execute(&self.pool)
                .await,
        )?;
        Ok(())
    }

    async fn insert_reading(&self, reading: &NewReading) -> Result<()> {
        track(
            sqlx::query("INSERT INTO readings (device_id, ts, kind, value) VALUES ($1, $2, $3, $4)")
                .bind(reading.device_id)
                .bind(reading.timestamp)
                .bind(reading.kind.as_str())
                .bind(&reading.value)
                .execute(&self.pool)
                .await,
        )?;
        Ok(())
    }

    async fn readings_for_devices(
        &self,
        device_ids: &[Uuid],
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        limit: Option<usize>,
    ) -> Result<Vec<Reading>> {
        // NULL means no limit
        let limit = limit.map(|n| i64::try_from(n).unwrap_or(i64::MAX));
        let rows = track(
            sqlx::query_as::<_, ReadingRow>(
                r#"
                SELECT id, device_id, ts, kind, value
                FROM readings
                WHERE device_id = ANY($1) AND ts >= $2 AND ts <= $3
                ORDER BY ts DESC
                LIMIT $4
                "#,
            )
            .bind(device_ids)
            .bind(from)
            .bind(to)
            .bind(limit)
            .fetch_all(&self.pool)
            .await,
        )?;
        rows.into_iter().map(Reading::try_from).collect()
    }

    async fn insert_polling_log(&self, entry: &PollingLogEntry) -> Result<()> {
        track(
            sqlx::query(
                r#"
                INSERT INTO polling_logs (hub_id, ts, success, error_message, api_calls)
                VALUES ($1, $2, $3, $4, $5)
                "#,
            )
            .bind(entry.hub_id)
            .bind(entry.timestamp)
            .bind(entry.success)
            .bind(entry.error_message.as_deref())
            .bind(entry.api_calls)
            .execute(&self.pool)
            .await,
        )?;
        Ok(())
    }

    async fn delete_readings_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = track(
            sqlx::query("DELETE FROM readings WHERE ts < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await,
        )?;
        Ok(result.rows_affected())
    }

    async fn delete_polling_logs_before(&self, cutoff: DateTime<Utc>) -> Result<u64> {
        let result = track(
            sqlx::query("DELETE FROM polling_logs WHERE ts < $1")
                .bind(cutoff)
                .execute(&self.pool)
                .await,
        )?;
        Ok(result.rows_affected())
    }

    async fn digest_recipients(&self) -> Result<Vec<Customer>> {
        track(
            sqlx::query_as::<_, Customer>(
                r#"
                SELECT id, name, time_zone, email_to, email_cc, email_bcc
                FROM customers
                WHERE digest_enabled
                ORDER BY name
                "#,
            )
            .fetch_all(&self.pool)
            .await,
        )
    }
}
