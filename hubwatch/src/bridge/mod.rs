//! Wire client for the bridge resource API and its OAuth token endpoint.
//!
//! The client is stateless: no retries and no caching. Callers own every
//! resilience policy, which keeps the orchestration loops testable against
//! a fake implementation of [`BridgeApi`].

mod client;
mod types;

pub use client::HueClient;
pub use types::*;

use crate::errors::Result;
use crate::model::TokenGrant;
use async_trait::async_trait;

#[async_trait]
pub trait BridgeApi: Send + Sync {
    async fn fetch_motion_sensors(
        &self,
        access_token: &str,
        application_key: &str,
    ) -> Result<Resources<MotionResource>>;

    async fn fetch_temperature_sensors(
        &self,
        access_token: &str,
        application_key: &str,
    ) -> Result<Resources<TemperatureResource>>;

    async fn fetch_devices(
        &self,
        access_token: &str,
        application_key: &str,
    ) -> Result<Resources<DeviceResource>>;

    async fn fetch_device_power(
        &self,
        access_token: &str,
        application_key: &str,
    ) -> Result<Resources<DevicePowerResource>>;

    async fn refresh_access_token(&self, refresh_token: &str) -> Result<TokenGrant>;
}
