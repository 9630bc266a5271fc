//! Player-key and manager-id generation.
//!
//! A player key is the only credential binding a client to one side of one
//! game, so keys are drawn from a cryptographically strong source: ten
//! alphanumeric characters give a 62^10 (~8×10^17) keyspace. Collisions are
//! still possible in principle; the store surfaces them as unique-constraint
//! violations and the session layer regenerates and retries.

use rand::distr::Alphanumeric;
use rand::Rng;

/// Length of a player key.
pub const KEY_LEN: usize = 10;

/// Length of a server-process manager id.
pub const MANAGER_ID_LEN: usize = 64;

/// Length of the secret minted for an AI-managed key.
pub const AI_SECRET_LEN: usize = 64;

fn random_alphanumeric(len: usize) -> String {
    // rand's thread-local generator is a CSPRNG reseeded from the OS.
    let rng = rand::rng();
    rng.sample_iter(Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

/// Mints a fresh 10-character player key.
pub fn generate_key() -> String {
    random_alphanumeric(KEY_LEN)
}

/// Mints the 64-character identifier a server process claims keys under.
pub fn generate_manager_id() -> String {
    random_alphanumeric(MANAGER_ID_LEN)
}

/// Mints the secret an external AI worker presents to attach to its key.
pub fn generate_ai_secret() -> String {
    random_alphanumeric(AI_SECRET_LEN)
}

/// Returns `true` if `key` has the shape of a player key.
pub fn is_valid_key(key: &str) -> bool {
    key.len() == KEY_LEN && key.bytes().all(|b| b.is_ascii_alphanumeric())
}

/// Returns `true` if `id` has the shape of a manager id.
pub fn is_valid_manager_id(id: &str) -> bool {
    id.len() == MANAGER_ID_LEN && id.bytes().all(|b| b.is_ascii_alphanumeric())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_keys_are_well_formed() {
        for _ in 0..32 {
            let key = generate_key();
            assert!(is_valid_key(&key), "bad key: {}", key);
        }
        assert!(is_valid_manager_id(&generate_manager_id()));
    }

    #[test]
    fn test_generated_keys_differ() {
        // Not a randomness test, just a guard against a constant generator.
        let a = generate_key();
        let b = generate_key();
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_validation() {
        assert!(is_valid_key("a1B2c3D4e5"));
        assert!(!is_valid_key("short"));
        assert!(!is_valid_key("has space12"));
        assert!(!is_valid_key("elevenchars"));
        assert!(!is_valid_manager_id("too-short"));
    }
}
