use thiserror::Error;

/// Canonical result for the plan graph.
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// Unknown node type ids/names and variant payloads we cannot interpret.
    #[error("not implemented: {0}")]
    NotImplemented(String),

    /// Malformed plan documents (missing or wrong-shaped fields, dangling ids).
    #[error("internal error: {0}")]
    Internal(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Parse error: {0}")]
    Parse(String),

    #[error("Hashing error: {0}")]
    Hash(String),

    #[error("Internal invariant failed: {0}")]
    Invariant(String),
}

impl Error {
    /// True for failures that come from unknown node kinds rather than bad shape.
    pub fn is_not_implemented(&self) -> bool {
        matches!(self, Error::NotImplemented(_))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Hash(e.to_string())
    }
}
