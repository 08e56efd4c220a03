//! Stable per-user identifiers and Postgres role/user name derivation.
//!
//! Every human principal maps deterministically to a persistent Postgres role
//! and same-named schema derived from a SHA-256 digest of their external SSO
//! identifier. Login users are ephemeral: a fresh randomised name and password
//! per issuance, bounded by Postgres's 63-character identifier limit.

use rand::Rng;
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};

const SHORT_DIGEST_LENGTH: usize = 8;
const MAX_SUFFIX_LENGTH: usize = 10;
const RANDOM_PART_LENGTH: usize = 5;
const PASSWORD_LENGTH: usize = 64;

/// Stem budget keeps `user_<stem>_<random>[_suffix]` within 63 characters.
const MAX_STEM_LENGTH: usize = 52;

const BASE36_CHARS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// First 8 hex characters of SHA-256 over the external id.
#[must_use]
pub fn short_digest(external_id: &str) -> String {
    long_digest(external_id)[..SHORT_DIGEST_LENGTH].to_string()
}

/// Full 64-character hex SHA-256 digest of the external id.
#[must_use]
pub fn long_digest(external_id: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(external_id.as_bytes());
    hex::encode(hasher.finalize())
}

/// The persistent role (and same-named schema) for a principal.
#[must_use]
pub fn persistent_role(external_id: &str) -> String {
    format!("_user_{}", short_digest(external_id))
}

/// The persistent role for an application, keyed on its host basename.
#[must_use]
pub fn application_role(host_basename: &str) -> String {
    format!("_user_app_{host_basename}")
}

/// The role (and same-named schema) for a team.
#[must_use]
pub fn team_role(slug: &str) -> String {
    format!("_team_{slug}")
}

/// Generates an ephemeral login user name:
/// `user_<sanitised-email>_<5 base36 chars>[_suffix]`.
///
/// The sanitised email is truncated so the whole name stays within Postgres's
/// 63-character identifier limit regardless of suffix length.
pub fn ephemeral_user_name(email: &str, suffix: &str) -> Result<String> {
    if suffix.len() > MAX_SUFFIX_LENGTH {
        return Err(Error::InvalidArgument(format!(
            "ephemeral user suffix '{suffix}' exceeds {MAX_SUFFIX_LENGTH} characters"
        )));
    }

    let suffix_part = if suffix.is_empty() {
        String::new()
    } else {
        format!("_{suffix}")
    };

    let stem: String = sanitise(email);
    let max_stem = MAX_STEM_LENGTH - suffix_part.len();
    let stem = &stem[..stem.len().min(max_stem)];

    Ok(format!("user_{stem}_{}{suffix_part}", base36_random(RANDOM_PART_LENGTH)))
}

/// Generates a 64-character password from a cryptographically strong RNG.
#[must_use]
pub fn generate_password() -> String {
    let mut bytes = [0u8; PASSWORD_LENGTH / 2];
    rand::thread_rng().fill(&mut bytes);
    hex::encode(bytes)
}

/// Lowercases and replaces anything outside `[a-z0-9]` with `_`.
fn sanitise(value: &str) -> String {
    value
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_lowercase() || c.is_ascii_digit() { c } else { '_' })
        .collect()
}

fn base36_random(len: usize) -> String {
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| BASE36_CHARS[rng.gen_range(0..BASE36_CHARS.len())] as char)
        .collect()
}
