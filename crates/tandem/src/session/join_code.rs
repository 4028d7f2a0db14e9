//! Human-typeable join codes.
//!
//! Codes are eight uppercase hex digits split into two groups (`AB12-CD34`).
//! Uniqueness among active sessions is checked optimistically.

use anyhow::Result;
use rand::RngCore;
use tracing::{debug, warn};

use super::repository::SessionStore;

/// Attempts before falling back to a longer code.
pub const MAX_ATTEMPTS: usize = 8;

/// Generate a random `XXXX-XXXX` code.
pub fn generate() -> String {
    random_code::<4>()
}

/// Generate the longer `XXXX-XXXX-XXXX-XXXX` fallback code.
pub fn generate_long() -> String {
    random_code::<8>()
}

fn random_code<const N: usize>() -> String {
    let mut bytes = [0u8; N];
    rand::rng().fill_bytes(&mut bytes);
    group(&hex::encode_upper(bytes))
}

fn group(digits: &str) -> String {
    digits
        .as_bytes()
        .chunks(4)
        .map(|chunk| String::from_utf8_lossy(chunk).into_owned())
        .collect::<Vec<_>>()
        .join("-")
}

/// Canonical form of a code typed by a person.
pub fn normalize_input(code: &str) -> String {
    code.trim().to_ascii_uppercase()
}

/// Pick a code no active session is using.
pub async fn ensure_unique(store: &SessionStore) -> Result<String> {
    ensure_unique_with(store, generate).await
}

/// Like [`ensure_unique`] with a caller-provided generator.
///
/// The fallback code is not re-checked; the partial unique index on active
/// join codes rejects the insert if it ever collides.
pub async fn ensure_unique_with<F>(store: &SessionStore, mut next_code: F) -> Result<String>
where
    F: FnMut() -> String,
{
    for attempt in 1..=MAX_ATTEMPTS {
        let code = next_code();
        if !store.join_code_in_use(&code).await? {
            return Ok(code);
        }
        debug!(attempt, "Join code collision, retrying");
    }

    warn!(
        attempts = MAX_ATTEMPTS,
        "Exhausted join code attempts, using long code"
    );
    Ok(generate_long())
}
