// Published Nodes - storage seam for an OPC UA publisher's job configuration

pub mod config;
pub mod storage;

pub use config::{
    BackendConfig, MissingFilePolicy, ProviderConfig, ReadConfig, RetryConfig, WatchConfig,
};
pub use storage::{
    ChangeEvent, ChangeSubscription, ConfigurationHandle, DocumentInfo, ProviderError,
    ProviderState, PublishedNodesDocument, PublishedNodesProvider,
};
pub use storage::backends::{
    FilePublishedNodesProvider, InMemoryPublishedNodesProvider, PublishedNodesBackend,
    PublishedNodesProviderFactory,
};
