//! Default identity store for the Sonata server.
//!
//! Users live in memory behind an `RwLock`; passwords are kept only as
//! Argon2 PHC strings. A store can be seeded from a JSON array of
//! `{"username", "password", "email"?}` objects.

pub mod error;
pub mod password;
pub mod store;

pub use error::AuthError;
pub use password::{HashCost, Passwords};
pub use store::{MemoryIdentityStore, SeedUser};
