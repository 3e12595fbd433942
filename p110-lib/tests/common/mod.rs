//! Shared fixtures for integration tests.

// Not every test file uses every helper
#![allow(dead_code)]

use p110_lib::auth::{auth_hash, KlapCipher};

pub const USERNAME: &str = "user@example.com";
pub const PASSWORD: &str = "hunter2";

pub const LOCAL_SEED: [u8; 16] = [0x00; 16];
pub const REMOTE_SEED: [u8; 16] = [0xFF; 16];

pub fn test_auth_hash() -> [u8; 32] {
    auth_hash(USERNAME, PASSWORD)
}

/// Cipher with fixed seeds, mirroring what a handshake would derive.
pub fn test_cipher() -> KlapCipher {
    KlapCipher::new(&LOCAL_SEED, &REMOTE_SEED, &test_auth_hash())
}
