// Protocol constants for Tapo P110/P115 KLAP devices

use std::time::Duration;

/// UDP port devices listen on for discovery probes
pub const DISCOVERY_PORT: u16 = 20002;

/// Fixed magic payload broadcast during discovery
pub const DISCOVERY_MAGIC: [u8; 16] = [
    0x02, 0x00, 0x00, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x46, 0x3c, 0xb5, 0xd3,
];

/// Discovery replies start with an opaque header this long
pub const DISCOVERY_HEADER_SIZE: usize = 16;

/// Random seed each side contributes during the handshake (bytes)
pub const SEED_SIZE: usize = 16;

/// Credential hash: SHA256(SHA1(username) || SHA1(password))
pub const AUTH_HASH_SIZE: usize = 32;

/// AES-128 session key (bytes)
pub const KEY_SIZE: usize = 16;

/// Leading bytes of the per-request IV; the last 4 are the sequence number
pub const IV_SEED_SIZE: usize = 12;

/// Prefix mixed into every request/response signature (bytes)
pub const SIG_KEY_SIZE: usize = 28;

/// SHA-256 signature prepended to every framed body (bytes)
pub const SIGNATURE_SIZE: usize = 32;

/// AES block size, also the PKCS#7 padding modulus
pub const AES_BLOCK_SIZE: usize = 16;

/// Handshake 1 reply: remote_seed (16) + server_hash (32)
pub const HANDSHAKE1_RESPONSE_SIZE: usize = SEED_SIZE + AUTH_HASH_SIZE;

/// Cookie the device issues on handshake 1 and expects back afterwards
pub const SESSION_COOKIE_NAME: &str = "TP_SESSIONID";

// Default timeout for HTTP operations against the device
pub const DEFAULT_HTTP_TIMEOUT: Duration = Duration::from_secs(10);
