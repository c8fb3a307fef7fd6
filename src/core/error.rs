use thiserror::Error;

/// Core error types for fwsync
#[derive(Debug, Error)]
pub enum Error {
    /// I/O operation failed
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization failed
    #[error("JSON error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Rule document or discovery snapshot could not be parsed
    #[error("Document error: {0}")]
    Document(#[from] serde_yaml::Error),

    /// HTTP transport failed while probing or fetching the rule source
    #[error("Transport error for {url}: {message}")]
    Transport { url: String, message: String },

    /// The configured rule source is not exactly one well-formed URI
    #[error("'{uri}' is not a single valid remote URI")]
    InvalidSource { uri: String },

    /// A rule carries an explicit address and a tag expression at the same time
    #[error("Address '{address}' cannot be used together with machine tags [{}]", .tags.join(", "))]
    ConflictingTarget { address: String, tags: Vec<String> },

    /// Discovery collaborator could not answer a membership query
    #[error("Discovery error: {0}")]
    Discovery(String),

    /// Input validation failed
    #[error("Validation error in {field}: {message}")]
    Validation { field: String, message: String },

    /// Rebuild or reload command failed
    #[error("Command '{program}' failed (exit code {}): {stderr}", .exit_code.map_or_else(|| "none".to_string(), |c| c.to_string()))]
    Action {
        program: String,
        exit_code: Option<i32>,
        stderr: String,
    },

    /// Configuration file is unusable
    #[error("Configuration error: {0}")]
    Config(String),
}

impl Error {
    /// True for misconfigurations that stop a cycle before anything is activated
    pub fn is_misconfiguration(&self) -> bool {
        matches!(
            self,
            Error::InvalidSource { .. } | Error::ConflictingTarget { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, Error>;
