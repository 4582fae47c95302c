use anyhow::{anyhow, Result};
use argon2::{
    password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use rand::rngs::OsRng;
use sha2::{Digest, Sha256};

/// Argon2id PHC string (`$argon2id$v=19$...`) carrying its own salt and params.
pub fn hash_password(password: &str) -> Result<String> {
    let salt = SaltString::generate(&mut OsRng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|error| anyhow!("Password hashing failed: {error}"))?;
    Ok(hash.to_string())
}

/// `Ok(false)` on a wrong password, `Err` when `phc` is not a valid hash.
pub fn verify_password(password: &str, phc: &str) -> Result<bool> {
    let parsed =
        PasswordHash::new(phc).map_err(|error| anyhow!("Stored password hash is malformed: {error}"))?;
    match Argon2::default().verify_password(password.as_bytes(), &parsed) {
        Ok(()) => Ok(true),
        Err(password_hash::Error::Password) => Ok(false),
        Err(error) => Err(anyhow!("Password verification failed: {error}")),
    }
}

/// Short, non-reversible identifier for a secret, safe to log.
pub fn fingerprint(secret: &str) -> String {
    let digest = Sha256::digest(secret.as_bytes());
    hex::encode(digest)[..12].to_string()
}
