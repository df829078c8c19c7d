//! Credentials and sessions
//!
//! - Passwords: salted SHA-256, stretched over [`PASSWORD_ROUNDS`] rounds and
//!   stored as `sha256:<rounds>:<hex>` so the cost can be raised later
//! - Sessions: opaque 256-bit tokens sent as `Authorization: Bearer <token>`;
//!   only their digest is stored

pub mod accounts;

use rand::Rng;
use sha2::{Digest, Sha256};

/// Hash rounds for newly set passwords
pub const PASSWORD_ROUNDS: u32 = 10_000;

/// Shortest accepted password
pub const MIN_PASSWORD_LEN: usize = 8;

/// Generate a new session token
pub fn generate_token() -> String {
    let random_bytes: [u8; 32] = rand::rng().random();
    hex::encode(random_bytes)
}

/// Digest under which a session token is stored
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

/// Generate a random salt for password hashing
pub fn generate_salt() -> String {
    let random_bytes: [u8; 16] = rand::rng().random();
    hex::encode(random_bytes)
}

fn stretch(password: &str, salt: &str, rounds: u32) -> String {
    let mut digest = Sha256::new()
        .chain_update(salt.as_bytes())
        .chain_update(password.as_bytes())
        .finalize();
    for _ in 1..rounds {
        digest = Sha256::new()
            .chain_update(digest)
            .chain_update(salt.as_bytes())
            .finalize();
    }
    hex::encode(digest)
}

/// Hash a password for storage
pub fn hash_password(password: &str, salt: &str) -> String {
    format!(
        "sha256:{}:{}",
        PASSWORD_ROUNDS,
        stretch(password, salt, PASSWORD_ROUNDS)
    )
}

/// Verify a password against a stored hash
pub fn verify_password(password: &str, salt: &str, stored: &str) -> bool {
    let mut parts = stored.splitn(3, ':');
    let (Some("sha256"), Some(rounds), Some(expected)) = (parts.next(), parts.next(), parts.next())
    else {
        return false;
    };
    let Ok(rounds) = rounds.parse::<u32>() else {
        return false;
    };
    if rounds == 0 {
        return false;
    }

    let actual = stretch(password, salt, rounds);
    // Length is fixed; compare every byte regardless of mismatches
    actual.len() == expected.len()
        && actual
            .bytes()
            .zip(expected.bytes())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
}

/// Extract the token from an `Authorization` header value
///
/// Returns None for anything but a non-empty `Bearer` credential.
pub fn parse_bearer(header: &str) -> Option<&str> {
    let (scheme, token) = header.trim().split_once(' ')?;
    if !scheme.eq_ignore_ascii_case("bearer") {
        return None;
    }
    let token = token.trim();
    (!token.is_empty()).then_some(token)
}
