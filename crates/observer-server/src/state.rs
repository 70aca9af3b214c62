use crate::config::ServerConfig;
use anyhow::{Context, Result};
use observer_common::crypto::Decryptor;
use observer_common::sign::Signer;
use observer_storage::StorageEngine;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

#[derive(Clone)]
pub struct AppState {
    pub storage: Arc<dyn StorageEngine>,
    pub config: Arc<ServerConfig>,
    /// Present when a shared secret is configured.
    pub signer: Option<Arc<Signer>>,
    /// Present when a private key is configured.
    pub decryptor: Option<Arc<Decryptor>>,
    /// Cancelled on shutdown; storage calls run under a child of it.
    pub shutdown: CancellationToken,
}

impl AppState {
    pub fn new(
        storage: Arc<dyn StorageEngine>,
        config: ServerConfig,
        shutdown: CancellationToken,
    ) -> Result<Self> {
        let decryptor = config
            .crypto_key
            .as_ref()
            .map(|path| {
                Decryptor::from_pem_file(path)
                    .with_context(|| format!("loading private key {}", path.display()))
            })
            .transpose()?
            .map(Arc::new);
        let signer = config.key.as_deref().map(|key| Arc::new(Signer::new(key)));

        Ok(Self {
            storage,
            config: Arc::new(config),
            signer,
            decryptor,
            shutdown,
        })
    }

    /// Token for one request's storage work.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}
