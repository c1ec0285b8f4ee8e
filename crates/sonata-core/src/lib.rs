// src/lib.rs
#[cfg(not(target_os = "linux"))]
compile_error!("sonata-core drives epoll(7) directly and only builds on Linux");

pub mod config;
pub mod conn;
pub mod credentials;
pub mod error;
pub mod identity;
pub mod logging;
pub mod metrics;
pub mod mmap;
pub mod parser;
pub mod poller;
pub mod pool;
pub mod response;
pub mod server;
pub mod services;
pub mod slab;
pub mod syscalls;

// Re-exports for users
pub use config::Config;
pub use conn::{Connection, Outcome};
pub use credentials::{CredentialDecoder, Credentials, LenientCredentialDecoder, StrictCredentialDecoder};
pub use error::{SonataError, SonataResult};
pub use identity::{IdentityError, IdentityStore, Verdict};
pub use metrics::{MetricsSnapshot, ServerMetrics};
pub use server::Server;
pub use services::Services;
