//! Published nodes provider backends

pub mod file;
pub mod memory;

pub use file::FilePublishedNodesProvider;
pub use memory::InMemoryPublishedNodesProvider;

use async_trait::async_trait;

use crate::config::{BackendConfig, ProviderConfig};
use crate::storage::{
    ChangeSubscription, ConfigurationHandle, DocumentInfo, ProviderError, ProviderState,
    PublishedNodesDocument, PublishedNodesProvider,
};

/// Concrete enum for published nodes backends
pub enum PublishedNodesBackend {
    File(FilePublishedNodesProvider),
    Memory(InMemoryPublishedNodesProvider),
}

#[async_trait]
impl PublishedNodesProvider for PublishedNodesBackend {
    fn handle(&self) -> &ConfigurationHandle {
        match self {
            Self::File(backend) => backend.handle(),
            Self::Memory(backend) => backend.handle(),
        }
    }

    fn state(&self) -> ProviderState {
        match self {
            Self::File(backend) => backend.state(),
            Self::Memory(backend) => backend.state(),
        }
    }

    async fn read(&self) -> Result<PublishedNodesDocument, ProviderError> {
        match self {
            Self::File(backend) => backend.read().await,
            Self::Memory(backend) => backend.read().await,
        }
    }

    async fn write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        match self {
            Self::File(backend) => backend.write(document).await,
            Self::Memory(backend) => backend.write(document).await,
        }
    }

    async fn try_write(&self, document: PublishedNodesDocument) -> Result<(), ProviderError> {
        match self {
            Self::File(backend) => backend.try_write(document).await,
            Self::Memory(backend) => backend.try_write(document).await,
        }
    }

    async fn exists(&self) -> Result<bool, ProviderError> {
        match self {
            Self::File(backend) => backend.exists().await,
            Self::Memory(backend) => backend.exists().await,
        }
    }

    async fn info(&self) -> Result<DocumentInfo, ProviderError> {
        match self {
            Self::File(backend) => backend.info().await,
            Self::Memory(backend) => backend.info().await,
        }
    }

    async fn watch(&self) -> Result<ChangeSubscription, ProviderError> {
        match self {
            Self::File(backend) => backend.watch().await,
            Self::Memory(backend) => backend.watch().await,
        }
    }

    async fn close(&self) -> Result<(), ProviderError> {
        match self {
            Self::File(backend) => backend.close().await,
            Self::Memory(backend) => backend.close().await,
        }
    }
}

/// Factory for creating published nodes providers
pub struct PublishedNodesProviderFactory;

impl PublishedNodesProviderFactory {
    /// Create a provider from configuration, seeding the default document
    /// when `seed_on_start` asks for it
    pub async fn create(config: &ProviderConfig) -> Result<PublishedNodesBackend, ProviderError> {
        let backend = match &config.backend {
            BackendConfig::File { path } => {
                PublishedNodesBackend::File(FilePublishedNodesProvider::new(path.clone(), config)?)
            }
            BackendConfig::Memory { initial } => {
                let initial = initial.clone().map(PublishedNodesDocument::from);
                PublishedNodesBackend::Memory(InMemoryPublishedNodesProvider::new(initial, config))
            }
        };

        if config.seed_on_start && backend.seed_if_absent(config.default_document()).await? {
            log::info!("Seeded empty published nodes document at {}", backend.handle());
        }

        Ok(backend)
    }

    /// Create a provider from the process environment
    pub async fn from_env() -> Result<PublishedNodesBackend, ProviderError> {
        let config = ProviderConfig::from_env()?;
        Self::create(&config).await
    }
}
