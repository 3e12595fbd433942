//! High-level device handle: typed commands over one KLAP session.

use std::time::Duration;

use chrono::{DateTime, TimeZone};
use serde::de::DeserializeOwned;
use serde_json::{json, Value};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::constants::DEFAULT_HTTP_TIMEOUT;
use crate::discovery;
use crate::error::TapoError;
use crate::session::KlapSession;
use crate::types::{
    energy_window, CurrentPower, DeviceInfo, DeviceRequest, DeviceResponse, DeviceUsage,
    EnergyData, EnergyDataInterval, EnergyUsage,
};

/// Factory for device sessions.
///
/// Carries only the account credentials, the per-request timeout and an
/// ambient cancellation token; stateless beyond that and freely cloneable
/// across tasks. Distinct sessions created from one client are fully
/// independent.
#[derive(Clone)]
pub struct Client {
    username: String,
    password: String,
    timeout: Duration,
    cancel: CancellationToken,
}

impl Client {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            timeout: DEFAULT_HTTP_TIMEOUT,
            cancel: CancellationToken::new(),
        }
    }

    /// Replace the ambient cancellation token observed by sessions and
    /// discovery started from this client.
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Override the per-request HTTP timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Handshake with the device at `host` and return a ready handle.
    ///
    /// `host` is an IP literal or DNS name, optionally with a port.
    pub async fn connect(&self, host: &str) -> Result<P110, TapoError> {
        let session = KlapSession::establish(
            host,
            &self.username,
            &self.password,
            self.timeout,
            self.cancel.clone(),
        )
        .await?;
        Ok(P110 {
            host: host.to_string(),
            session: Mutex::new(session),
        })
    }

    /// Discover the first device on the network and connect to it.
    ///
    /// Devices advertising a non-KLAP encryption scheme are refused with
    /// [`TapoError::UnsupportedScheme`].
    pub async fn connect_first(&self, window: Duration) -> Result<(P110, String), TapoError> {
        let device = discovery::discover_first(&self.cancel, window).await?;
        if !device.is_klap() {
            return Err(TapoError::UnsupportedScheme {
                host: device.host,
                scheme: device
                    .encrypt_scheme
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        debug!(host = %device.host, model = %device.model, "connecting to discovered device");
        let plug = self.connect(&device.host).await?;
        Ok((plug, device.host))
    }
}

/// A connected P110/P115 smart plug.
///
/// Commands are serialized through an internal lock so at most one request
/// is in flight per session and the sequence counter, IV and signature
/// always describe the same request. Concurrent callers are served in FIFO
/// order. A request that fails in flight leaves the session usable; the
/// next command simply sends the next sequence number.
#[derive(Debug)]
pub struct P110 {
    host: String,
    session: Mutex<KlapSession>,
}

impl P110 {
    pub fn host(&self) -> &str {
        &self.host
    }

    /// Frame a command, send it over the session and decode the result.
    async fn execute<T: DeserializeOwned>(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> Result<T, TapoError> {
        let request = serde_json::to_vec(&DeviceRequest { method, params })?;
        let reply = {
            let mut session = self.session.lock().await;
            session.request(&request).await?
        };
        let envelope: DeviceResponse = serde_json::from_slice(&reply)?;
        let result = envelope.into_result()?;
        Ok(serde_json::from_value(result)?)
    }

    /// Fetch device identity, network state and relay status.
    pub async fn get_device_info(&self) -> Result<DeviceInfo, TapoError> {
        self.execute("get_device_info", None).await
    }

    /// Fetch on-time, power and saved-power aggregates.
    pub async fn get_device_usage(&self) -> Result<DeviceUsage, TapoError> {
        self.execute("get_device_usage", None).await
    }

    /// Fetch the instantaneous power draw in milliwatts.
    pub async fn get_current_power(&self) -> Result<CurrentPower, TapoError> {
        self.execute("get_current_power", None).await
    }

    /// Fetch today's and this month's runtime and energy totals.
    pub async fn get_energy_usage(&self) -> Result<EnergyUsage, TapoError> {
        self.execute("get_energy_usage", None).await
    }

    /// Fetch bucketed energy history for the window containing `reference`.
    ///
    /// The window boundaries are computed in `reference`'s own timezone
    /// (see [`energy_window`]). An empty `data` array is a legal reply
    /// meaning no energy was recorded in the window.
    pub async fn get_energy_data<Tz: TimeZone>(
        &self,
        interval: EnergyDataInterval,
        reference: &DateTime<Tz>,
    ) -> Result<EnergyData, TapoError> {
        let (start, end) = energy_window(interval, reference);
        let params = json!({
            "start_timestamp": start,
            "end_timestamp": end,
            "interval": interval.minutes(),
        });
        self.execute("get_energy_data", Some(params)).await
    }

    /// Switch the relay on.
    pub async fn turn_on(&self) -> Result<(), TapoError> {
        self.set_device_on(true).await
    }

    /// Switch the relay off.
    pub async fn turn_off(&self) -> Result<(), TapoError> {
        self.set_device_on(false).await
    }

    async fn set_device_on(&self, on: bool) -> Result<(), TapoError> {
        let _: Value = self
            .execute("set_device_info", Some(json!({ "device_on": on })))
            .await?;
        Ok(())
    }
}
