use argon2::password_hash::rand_core::OsRng;
use argon2::password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString};
use argon2::{Algorithm, Argon2, Params, Version};

#[derive(thiserror::Error, Debug)]
pub enum CredentialError {
    #[error("invalid hash parameters: {0}")]
    Params(String),
    #[error("hashing failed: {0}")]
    Hash(String),
}

/// Argon2id cost knobs. The defaults follow the argon2 crate's
/// recommended parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HashCost {
    pub memory_kib: u32,
    pub iterations: u32,
    pub parallelism: u32,
}

impl Default for HashCost {
    fn default() -> Self {
        Self {
            memory_kib: Params::DEFAULT_M_COST,
            iterations: Params::DEFAULT_T_COST,
            parallelism: Params::DEFAULT_P_COST,
        }
    }
}

/// One-way hashing and verification of the per-post deletion secret.
#[derive(Clone)]
pub struct CredentialGuard {
    params: Params,
}

impl CredentialGuard {
    pub fn new(cost: HashCost) -> Result<Self, CredentialError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| CredentialError::Params(e.to_string()))?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    /// Hash `secret` under a fresh random salt. Returns a PHC string that
    /// embeds the salt and parameters.
    pub fn hash(&self, secret: &str) -> Result<String, CredentialError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(secret.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| CredentialError::Hash(e.to_string()))
    }

    /// `true` iff `secret` produced `hash`. The final tag comparison is
    /// constant-time; a malformed stored hash simply fails verification.
    pub fn verify(&self, secret: &str, hash: &str) -> bool {
        let Ok(parsed) = PasswordHash::new(hash) else {
            return false;
        };
        self.argon2().verify_password(secret.as_bytes(), &parsed).is_ok()
    }

    /// [`hash`](Self::hash) on the blocking pool.
    pub async fn hash_blocking(&self, secret: &str) -> Result<String, CredentialError> {
        let guard = self.clone();
        let secret = secret.to_owned();
        tokio::task::spawn_blocking(move || guard.hash(&secret))
            .await
            .map_err(|e| CredentialError::Hash(e.to_string()))?
    }

    /// [`verify`](Self::verify) on the blocking pool. A panicked worker
    /// counts as a failed verification.
    pub async fn verify_blocking(&self, secret: &str, hash: &str) -> bool {
        let guard = self.clone();
        let (secret, hash) = (secret.to_owned(), hash.to_owned());
        tokio::task::spawn_blocking(move || guard.verify(&secret, &hash))
            .await
            .unwrap_or(false)
    }
}
