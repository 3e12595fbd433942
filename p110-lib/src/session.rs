//! KLAP session transport: two-phase handshake and encrypted request
//! framing over HTTP.
//!
//! # Handshake
//!
//! 1. POST 16 random bytes (`local_seed`) to `/app/handshake1`. The device
//!    replies with 48 bytes: its own `remote_seed` followed by
//!    `SHA256(local_seed || remote_seed || auth_hash)`, and issues the
//!    `TP_SESSIONID` cookie. A hash mismatch means the credentials are
//!    wrong.
//! 2. POST `SHA256(remote_seed || local_seed || auth_hash)` to
//!    `/app/handshake2` with the cookie. 200 OK completes the exchange.
//!
//! Keys are then derived (see [`crate::auth`]) and the session is ready.
//!
//! # Requests
//!
//! Each request increments the sequence counter, encrypts the padded
//! plaintext with AES-128-CBC under `iv_seed || seq_be`, signs with
//! `SHA256(sig_key || seq_be || ciphertext)` and POSTs
//! `signature || ciphertext` to `/app/request?seq=<s>`. The response uses
//! the same framing and the same sequence number.

use std::time::Duration;

use bytes::Bytes;
use rand::RngCore;
use reqwest::header::CONTENT_TYPE;
use subtle::ConstantTimeEq;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::auth::{self, KlapCipher};
use crate::constants::{HANDSHAKE1_RESPONSE_SIZE, SEED_SIZE};
use crate::error::TapoError;

const OCTET_STREAM: &str = "application/octet-stream";

/// Maximum bytes of a non-200 response body carried in the error
const BODY_SNIPPET_LEN: usize = 256;

/// An authenticated, encrypted conversation with one device.
///
/// Only obtainable from [`KlapSession::establish`], so an instance in hand
/// has always completed both handshake phases. The HTTP client's cookie
/// store carries the server-issued session cookie on every request; its
/// connection pool is dropped with the session.
#[derive(Debug)]
pub struct KlapSession {
    http: reqwest::Client,
    base_url: String,
    host: String,
    cipher: KlapCipher,
    cancel: CancellationToken,
}

impl KlapSession {
    /// Run the two-phase handshake against `host` and derive session keys.
    ///
    /// `host` is an IP literal or DNS name, optionally with a port.
    pub async fn establish(
        host: &str,
        username: &str,
        password: &str,
        timeout: Duration,
        cancel: CancellationToken,
    ) -> Result<Self, TapoError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .cookie_store(true)
            .build()?;

        let mut local_seed = [0u8; SEED_SIZE];
        rand::rng().fill_bytes(&mut local_seed);

        let auth_hash = auth::auth_hash(username, password);
        let base_url = format!("http://{host}/app");

        debug!(host, "starting KLAP handshake");

        let body = post_raw(
            &http,
            &cancel,
            format!("{base_url}/handshake1"),
            local_seed.to_vec(),
        )
        .await?;
        if body.len() != HANDSHAKE1_RESPONSE_SIZE {
            return Err(TapoError::Malformed(format!(
                "handshake1 reply was {} bytes, expected {HANDSHAKE1_RESPONSE_SIZE}",
                body.len()
            )));
        }
        let remote_seed = &body[..SEED_SIZE];
        let server_hash = &body[SEED_SIZE..];

        let expected = auth::sha256(&[&local_seed, remote_seed, &auth_hash]);
        if !bool::from(server_hash.ct_eq(&expected)) {
            return Err(TapoError::AuthFailed);
        }
        trace!(host, "server hash verified");

        // Same ingredients as the server proof, seeds in reverse order
        let client_hash = auth::sha256(&[remote_seed, &local_seed, &auth_hash]);
        post_raw(
            &http,
            &cancel,
            format!("{base_url}/handshake2"),
            client_hash.to_vec(),
        )
        .await?;

        let cipher = KlapCipher::new(&local_seed, remote_seed, &auth_hash);
        debug!(host, "KLAP session established");

        Ok(Self {
            http,
            base_url,
            host: host.to_string(),
            cipher,
            cancel,
        })
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// Encrypt `plaintext`, POST it, verify and decrypt the reply.
    ///
    /// Callers must serialize access (the device handle does this with a
    /// lock); the sequence counter advances exactly once per call, even
    /// when the request fails in flight.
    pub async fn request(&mut self, plaintext: &[u8]) -> Result<Vec<u8>, TapoError> {
        let (frame, seq) = self.cipher.encrypt(plaintext)?;
        let url = format!("{}/request?seq={}", self.base_url, seq);
        trace!(host = %self.host, seq, "sending KLAP request");
        let body = post_raw(&self.http, &self.cancel, url, frame).await?;
        self.cipher.decrypt(seq, &body)
    }
}

/// POST a raw octet-stream body, returning the full 200 OK response body.
async fn post_raw(
    http: &reqwest::Client,
    cancel: &CancellationToken,
    url: String,
    body: Vec<u8>,
) -> Result<Bytes, TapoError> {
    let fut = async {
        let resp = http
            .post(&url)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .body(body)
            .send()
            .await?;

        let status = resp.status();
        if status != reqwest::StatusCode::OK {
            let text = resp.text().await.unwrap_or_default();
            let snippet: String = text.chars().take(BODY_SNIPPET_LEN).collect();
            return Err(TapoError::TransportFailed {
                status: status.as_u16(),
                body: snippet,
            });
        }
        Ok(resp.bytes().await?)
    };

    tokio::select! {
        _ = cancel.cancelled() => Err(TapoError::Cancelled),
        result = fut => result,
    }
}
