//! Secret hashing and verification.

use argon2::{
    password_hash::{rand_core::OsRng, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Algorithm, Argon2, Params, Version,
};

use crate::error::UserError;

/// Argon2 hashing parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Argon2Params {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Argon2Params {
    fn to_argon2(self) -> Result<Argon2<'static>, UserError> {
        let params = Params::new(self.memory_kib, self.iterations, self.parallelism, None)
            .map_err(|e| UserError::Hash(format!("create argon2 params: {e}")))?;

        Ok(Argon2::new(Algorithm::Argon2id, Version::V0x13, params))
    }
}

impl Default for Argon2Params {
    fn default() -> Self {
        Self {
            memory_kib: 19456, // 19 MB
            iterations: 2,
            parallelism: 1,
        }
    }
}

/// Hashes `secret` into a PHC string with a fresh random salt.
///
/// # Errors
///
/// Returns [`UserError::Hash`] if `params` are out of range or hashing fails.
pub fn hash_secret(secret: &str, params: Argon2Params) -> Result<String, UserError> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = params
        .to_argon2()?
        .hash_password(secret.as_bytes(), &salt)
        .map_err(|e| UserError::Hash(format!("hash secret: {e}")))?;

    Ok(hash.to_string())
}

/// Checks `secret` against a stored PHC hash.
///
/// Verification uses the parameters embedded in the hash itself.
///
/// # Errors
///
/// Returns [`UserError::Hash`] if the stored hash cannot be parsed.
pub fn verify_secret(secret: &str, hash: &str) -> Result<bool, UserError> {
    let parsed = PasswordHash::new(hash).map_err(|e| UserError::Hash(format!("parse hash: {e}")))?;

    Ok(Argon2::default()
        .verify_password(secret.as_bytes(), &parsed)
        .is_ok())
}
