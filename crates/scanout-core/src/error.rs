/// A client buffer could not be made display-resident.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ImportError {
    #[error("unsupported format {format:#010x} with modifier {modifier:#018x}")]
    UnsupportedFormat { format: u32, modifier: u64 },

    #[error("no display device available")]
    NoDevice,

    #[error("import failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum CommitError {
    #[error("buffer import failed: {0}")]
    Import(#[from] ImportError),

    #[error("no completion signal available: {0}")]
    FenceAcquisition(String),

    #[error("failed to register completion signal: {0}")]
    Register(std::io::Error),

    #[error("commit pipeline is shut down")]
    ShutDown,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("parse error: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] toml::ser::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}
