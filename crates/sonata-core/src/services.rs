use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::Config;
use crate::credentials::{CredentialDecoder, LenientCredentialDecoder, StrictCredentialDecoder};
use crate::identity::IdentityStore;

/// Everything `process` needs besides the connection itself. Built once and
/// shared by all workers.
pub struct Services {
    pub doc_root: PathBuf,
    pub index_file: Option<String>,
    pub login_redirect: String,
    pub identity: Arc<dyn IdentityStore>,
    pub decoder: Box<dyn CredentialDecoder>,
}

impl Services {
    pub fn new(doc_root: impl Into<PathBuf>, identity: Arc<dyn IdentityStore>) -> Self {
        Self {
            doc_root: doc_root.into(),
            index_file: Some("index.html".to_string()),
            login_redirect: "/welcome.html".to_string(),
            identity,
            decoder: Box::new(LenientCredentialDecoder),
        }
    }

    pub fn from_config(config: &Config, identity: Arc<dyn IdentityStore>) -> Self {
        let decoder: Box<dyn CredentialDecoder> = if config.strict_json {
            Box::new(StrictCredentialDecoder)
        } else {
            Box::new(LenientCredentialDecoder)
        };
        Self {
            doc_root: config.doc_root.clone(),
            index_file: config.index_file.clone(),
            login_redirect: config.login_redirect.clone(),
            identity,
            decoder,
        }
    }

    pub fn with_index_file(mut self, index_file: Option<&str>) -> Self {
        self.index_file = index_file.map(str::to_string);
        self
    }

    pub fn with_login_redirect(mut self, redirect: impl Into<String>) -> Self {
        self.login_redirect = redirect.into();
        self
    }

    pub fn with_decoder(mut self, decoder: impl CredentialDecoder + 'static) -> Self {
        self.decoder = Box::new(decoder);
        self
    }

    pub fn doc_root(&self) -> &Path {
        &self.doc_root
    }
}
