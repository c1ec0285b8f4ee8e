use serde::Deserialize;
use sonata_core::{IdentityError, IdentityStore, Verdict};
use std::collections::HashMap;
use std::path::Path;
use std::sync::{PoisonError, RwLock};

use crate::error::AuthError;
use crate::password::Passwords;

/// One entry of a seed file. The password is plaintext and hashed on load.
#[derive(Debug, Clone, Deserialize)]
pub struct SeedUser {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone)]
struct UserRecord {
    password_hash: String,
    email: Option<String>,
}

#[derive(Debug, Default)]
pub struct MemoryIdentityStore {
    users: RwLock<HashMap<String, UserRecord>>,
    passwords: Passwords,
}

impl MemoryIdentityStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// An empty store hashing new passwords with `passwords`.
    pub fn with_passwords(passwords: Passwords) -> Self {
        Self {
            users: RwLock::default(),
            passwords,
        }
    }

    pub fn from_users(users: impl IntoIterator<Item = SeedUser>) -> Result<Self, AuthError> {
        let store = Self::new();
        store.seed(users)?;
        Ok(store)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, AuthError> {
        let store = Self::new();
        store.seed_from_json_file(path)?;
        Ok(store)
    }

    /// Add `users`, replacing any existing entry with the same name.
    /// Returns how many were added.
    pub fn seed(&self, users: impl IntoIterator<Item = SeedUser>) -> Result<usize, AuthError> {
        let mut hashed = Vec::new();
        for user in users {
            let record = UserRecord {
                password_hash: self.passwords.hash(&user.password)?,
                email: user.email,
            };
            hashed.push((user.username, record));
        }
        let count = hashed.len();
        self.users
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .extend(hashed);
        Ok(count)
    }

    /// Seed from a JSON array of [`SeedUser`] objects.
    pub fn seed_from_json_file(&self, path: impl AsRef<Path>) -> Result<usize, AuthError> {
        let raw = std::fs::read(path.as_ref())?;
        let users: Vec<SeedUser> = serde_json::from_slice(&raw)?;
        let count = self.seed(users)?;
        tracing::info!(
            path = %path.as_ref().display(),
            users = count,
            "identity store seeded"
        );
        Ok(count)
    }

    pub fn len(&self) -> usize {
        self.users.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, username: &str) -> bool {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(username)
    }

    pub fn email(&self, username: &str) -> Option<String> {
        self.users
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(username)
            .and_then(|u| u.email.clone())
    }
}

impl IdentityStore for MemoryIdentityStore {
    fn login(&self, username: &str, password: &str) -> Result<Verdict, IdentityError> {
        let hash = {
            let users = self.users.read().unwrap_or_else(PoisonError::into_inner);
            users.get(username).map(|u| u.password_hash.clone())
        };
        // Same message for unknown users and bad passwords.
        let Some(hash) = hash else {
            return Ok(Verdict::failure("Invalid username or password"));
        };
        if self.passwords.verify(password, &hash)? {
            Ok(Verdict::success("Login successful"))
        } else {
            Ok(Verdict::failure("Invalid username or password"))
        }
    }

    fn register(
        &self,
        username: &str,
        password: &str,
        email: Option<&str>,
    ) -> Result<Verdict, IdentityError> {
        if username.is_empty() || password.is_empty() {
            return Ok(Verdict::failure("username and password must not be empty"));
        }
        if self.contains(username) {
            return Ok(Verdict::failure("username already exists"));
        }

        // Hashing is slow: do it unlocked, then re-check under the write lock.
        let record = UserRecord {
            password_hash: self.passwords.hash(password)?,
            email: email.map(str::to_string),
        };
        let mut users = self.users.write().unwrap_or_else(PoisonError::into_inner);
        if users.contains_key(username) {
            return Ok(Verdict::failure("username already exists"));
        }
        users.insert(username.to_string(), record);
        tracing::debug!(username, "user added");
        Ok(Verdict::success("Registration successful"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::password::cheap;
    use std::io::Write;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn register_then_login() {
        let store = MemoryIdentityStore::with_passwords(cheap());
        let v = store.register("alice", "pw", Some("a@example.com")).unwrap();
        assert!(v.success);
        assert!(store.contains("alice"));
        assert_eq!(store.email("alice").as_deref(), Some("a@example.com"));

        assert!(store.login("alice", "pw").unwrap().success);
        let v = store.login("alice", "nope").unwrap();
        assert!(!v.success);
        assert_eq!(v.message, "Invalid username or password");
        assert!(!store.login("ghost", "pw").unwrap().success);
    }

    #[test]
    fn duplicate_and_empty_registrations_fail() {
        let store = MemoryIdentityStore::with_passwords(cheap());
        assert!(store.register("bob", "pw", None).unwrap().success);

        let v = store.register("bob", "other", None).unwrap();
        assert!(!v.success);
        assert_eq!(v.message, "username already exists");

        assert!(!store.register("", "pw", None).unwrap().success);
        assert!(!store.register("carol", "", None).unwrap().success);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn concurrent_registration_of_one_name_admits_one() {
        let store = Arc::new(MemoryIdentityStore::with_passwords(cheap()));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let store = store.clone();
                thread::spawn(move || store.register("dup", "pw", None).unwrap().success)
            })
            .collect();
        let winners = handles
            .into_iter()
            .map(|h| h.join().unwrap())
            .filter(|ok| *ok)
            .count();
        assert_eq!(winners, 1);
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn seeds_from_json_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            br#"[{"username":"alice","password":"pw"},{"username":"bob","password":"x","email":"b@x"}]"#,
        )
        .unwrap();

        let store = MemoryIdentityStore::with_passwords(cheap());
        assert_eq!(store.seed_from_json_file(file.path()).unwrap(), 2);
        assert_eq!(store.len(), 2);
        assert!(store.login("bob", "x").unwrap().success);
        assert_eq!(store.email("bob").as_deref(), Some("b@x"));
    }

    #[test]
    fn bad_seed_file_is_reported() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"{not json").unwrap();
        assert!(matches!(
            MemoryIdentityStore::from_json_file(file.path()),
            Err(AuthError::Json(_))
        ));
        assert!(matches!(
            MemoryIdentityStore::from_json_file("/nonexistent/users.json"),
            Err(AuthError::Io(_))
        ));
    }
}
