//! UDP broadcast discovery of Tapo devices on the local network.
//!
//! The client sends a fixed 16-byte probe to `255.255.255.255:20002` and
//! collects replies until the window closes. Each reply carries a 16-byte
//! opaque header followed by a JSON body describing the device and its
//! management encryption scheme. Unparseable packets, error replies and
//! duplicates are skipped silently; only socket setup failures and
//! cancellation surface as errors.

use std::collections::HashSet;
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::constants::{DISCOVERY_HEADER_SIZE, DISCOVERY_MAGIC, DISCOVERY_PORT};
use crate::error::TapoError;

/// A device that answered the discovery broadcast.
///
/// Transient description, not tied to any session.
#[derive(Debug, Clone, Serialize)]
pub struct DiscoveredDevice {
    /// IP the device reports, or the UDP source address when it reports none
    pub host: String,
    pub mac: String,
    pub device_id: String,
    pub model: String,
    /// Advertised management encryption scheme, e.g. "KLAP"
    pub encrypt_scheme: Option<String>,
    pub http_port: Option<u16>,
}

impl DiscoveredDevice {
    /// Whether the device speaks the KLAP session protocol.
    ///
    /// Devices advertising another scheme are surfaced but cannot be
    /// connected to by this library.
    pub fn is_klap(&self) -> bool {
        self.encrypt_scheme.as_deref() == Some("KLAP")
    }
}

#[derive(Deserialize)]
struct DiscoveryReply {
    error_code: i32,
    #[serde(default)]
    result: DiscoveryResult,
}

#[derive(Deserialize, Default)]
struct DiscoveryResult {
    #[serde(default)]
    device_id: String,
    #[serde(default)]
    device_model: String,
    #[serde(default)]
    ip: String,
    #[serde(default)]
    mac: String,
    #[serde(default)]
    mgt_encrypt_schm: Option<EncryptScheme>,
}

#[derive(Deserialize)]
struct EncryptScheme {
    #[serde(default)]
    encrypt_type: String,
    #[serde(default)]
    http_port: u16,
}

/// Broadcast the discovery probe and collect every reply until `window`
/// elapses. Returns an empty list when nothing answers.
pub async fn discover(
    cancel: &CancellationToken,
    window: Duration,
) -> Result<Vec<DiscoveredDevice>, TapoError> {
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    collect(target, cancel, window, false).await
}

/// Like [`discover`], but resolves with the first device that replies.
///
/// Fails with [`TapoError::DeviceNotFound`] when the window elapses with
/// no reply, or [`TapoError::Cancelled`] when the token fires first.
pub async fn discover_first(
    cancel: &CancellationToken,
    window: Duration,
) -> Result<DiscoveredDevice, TapoError> {
    let target = SocketAddr::from((Ipv4Addr::BROADCAST, DISCOVERY_PORT));
    collect(target, cancel, window, true)
        .await?
        .into_iter()
        .next()
        .ok_or(TapoError::DeviceNotFound)
}

async fn collect(
    target: SocketAddr,
    cancel: &CancellationToken,
    window: Duration,
    stop_after_first: bool,
) -> Result<Vec<DiscoveredDevice>, TapoError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await?;
    socket.set_broadcast(true)?;
    socket.send_to(&DISCOVERY_MAGIC, target).await?;
    trace!(%target, "discovery probe sent");

    let deadline = Instant::now() + window;
    let mut devices = Vec::new();
    let mut seen = HashSet::new();
    let mut buf = [0u8; 2048];

    loop {
        let recv = tokio::select! {
            _ = cancel.cancelled() => return Err(TapoError::Cancelled),
            r = timeout_at(deadline, socket.recv_from(&mut buf)) => r,
        };
        let (n, addr) = match recv {
            Ok(Ok(pair)) => pair,
            Ok(Err(err)) => {
                trace!(%err, "discovery read error, skipping");
                continue;
            }
            // window closed
            Err(_) => break,
        };

        let Some(device) = parse_reply(&buf[..n], addr) else {
            continue;
        };
        if !seen.insert(device.host.clone()) {
            continue;
        }
        debug!(host = %device.host, model = %device.model, "discovered device");
        devices.push(device);
        if stop_after_first {
            break;
        }
    }

    Ok(devices)
}

fn parse_reply(datagram: &[u8], addr: SocketAddr) -> Option<DiscoveredDevice> {
    if datagram.len() <= DISCOVERY_HEADER_SIZE {
        return None;
    }
    let reply: DiscoveryReply = serde_json::from_slice(&datagram[DISCOVERY_HEADER_SIZE..]).ok()?;
    if reply.error_code != 0 {
        return None;
    }

    let result = reply.result;
    let host = if result.ip.is_empty() {
        addr.ip().to_string()
    } else {
        result.ip
    };
    let (encrypt_scheme, http_port) = match result.mgt_encrypt_schm {
        Some(schm) => (
            Some(schm.encrypt_type),
            (schm.http_port > 0).then_some(schm.http_port),
        ),
        None => (None, None),
    };

    Some(DiscoveredDevice {
        host,
        mac: result.mac,
        device_id: result.device_id,
        model: result.device_model,
        encrypt_scheme,
        http_port,
    })
}
