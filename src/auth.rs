use rand::RngCore;
use scrypt::password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use scrypt::Scrypt;
use sha2::{Digest, Sha256};

use crate::errors;

/// Hash a password into a PHC string (scrypt, random salt). Pure function,
/// safe to call concurrently.
pub fn hash_password(password: &str) -> errors::Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let phc = Scrypt
        .hash_password(password.as_bytes(), &salt)
        .map_err(|err| anyhow!("cannot hash password: {}", err))?;
    Ok(phc.to_string())
}

/// Returns false on any mismatch, including an unparseable stored hash.
pub fn verify_password(password: &str, phc: &str) -> bool {
    match PasswordHash::new(phc) {
        Ok(parsed_hash) => Scrypt
            .verify_password(password.as_bytes(), &parsed_hash)
            .is_ok(),
        Err(err) => {
            log::error!("stored password hash is not a valid PHC string: {}", err);
            false
        }
    }
}

/// Opaque access token: hex(sha256(random_bytes || username)).
/// High entropy comes from the random bytes, the username digest only makes
/// the token loosely bound to its owner. Validity is enforced by the token
/// registry in the DB, not by the token itself.
pub fn issue_token(username: &str) -> String {
    let mut nonce = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut nonce);
    let mut hasher = Sha256::new();
    hasher.update(nonce);
    hasher.update(username.as_bytes());
    hex::encode(hasher.finalize())
}

/// A well formed token is exactly the hex sha256 digest produced by
/// [`issue_token`]. Anything else can be rejected without hitting the DB.
pub fn is_well_formed_token(token: &str) -> bool {
    token.len() == 64 && token.bytes().all(|b| b.is_ascii_hexdigit())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_then_verify_roundtrip() {
        let phc = hash_password("hunter2").unwrap();
        assert!(verify_password("hunter2", &phc));
        assert!(!verify_password("hunter3", &phc));
    }

    #[test]
    fn verify_rejects_garbage_hash() {
        assert!(!verify_password("hunter2", "not-a-phc-string"));
    }

    #[test]
    fn issued_tokens_are_well_formed_and_unique() {
        let t1 = issue_token("alice");
        let t2 = issue_token("alice");
        assert!(is_well_formed_token(&t1));
        assert!(is_well_formed_token(&t2));
        assert_ne!(t1, t2);
    }

    #[test]
    fn malformed_tokens_are_rejected() {
        assert!(!is_well_formed_token(""));
        assert!(!is_well_formed_token("abc"));
        assert!(!is_well_formed_token(&"g".repeat(64)));
        assert!(!is_well_formed_token(&"a".repeat(63)));
        assert!(!is_well_formed_token(&"a".repeat(65)));
    }
}
