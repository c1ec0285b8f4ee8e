use argon2::password_hash::{self, PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng};
use argon2::{Algorithm, Argon2, Params, Version};

use crate::error::AuthError;

/// Argon2id cost for newly stored hashes.
///
/// Existing hashes carry their own cost in the PHC string, so changing these
/// never invalidates stored users.
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

impl HashCost {
    /// Defaults overlaid with `SONATA_ARGON2_MEMORY_KIB`,
    /// `SONATA_ARGON2_ITERATIONS` and `SONATA_ARGON2_PARALLELISM`.
    pub fn from_env() -> Self {
        let mut cost = Self::default();
        if let Some(m) = env_parse("SONATA_ARGON2_MEMORY_KIB") {
            cost.memory_kib = m;
        }
        if let Some(t) = env_parse("SONATA_ARGON2_ITERATIONS") {
            cost.iterations = t;
        }
        if let Some(p) = env_parse("SONATA_ARGON2_PARALLELISM") {
            cost.parallelism = p;
        }
        cost
    }
}

fn env_parse(key: &str) -> Option<u32> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

/// Hashes and checks passwords as Argon2id PHC strings.
#[derive(Clone, Default)]
pub struct Passwords {
    argon2: Argon2<'static>,
}

impl std::fmt::Debug for Passwords {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Passwords").finish_non_exhaustive()
    }
}

impl Passwords {
    /// Fails when the cost is outside what Argon2 accepts, e.g. less than
    /// 8 KiB of memory per lane.
    pub fn new(cost: HashCost) -> Result<Self, AuthError> {
        let params = Params::new(cost.memory_kib, cost.iterations, cost.parallelism, None)
            .map_err(|e| AuthError::Hash(format!("invalid argon2 cost {:?}: {}", cost, e)))?;
        Ok(Self {
            argon2: Argon2::new(Algorithm::Argon2id, Version::V0x13, params),
        })
    }

    pub fn hash(&self, password: &str) -> Result<String, AuthError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2
            .hash_password(password.as_bytes(), &salt)
            .map(|phc| phc.to_string())
            .map_err(|e| AuthError::Hash(format!("failed to hash password: {}", e)))
    }

    /// `Ok(false)` on a wrong password; a corrupt stored hash is an error.
    pub fn verify(&self, password: &str, phc: &str) -> Result<bool, AuthError> {
        let parsed = PasswordHash::new(phc)
            .map_err(|e| AuthError::Hash(format!("invalid password hash: {}", e)))?;
        match self.argon2.verify_password(password.as_bytes(), &parsed) {
            Ok(()) => Ok(true),
            Err(password_hash::Error::Password) => Ok(false),
            Err(e) => Err(AuthError::Hash(format!("failed to verify password: {}", e))),
        }
    }
}

#[cfg(test)]
pub(crate) fn cheap() -> Passwords {
    Passwords::new(HashCost {
        memory_kib: 64,
        iterations: 1,
        parallelism: 1,
    })
    .unwrap()
}
