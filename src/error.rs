use thiserror::Error;

pub type Result<T, E = EvalError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum EvalError {
    /// Unsupported task, mode or stage wiring. Raised before any work starts.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Rate limit or timeout that outlived its retry budget.
    #[error("transient provider error (model {model}): {message}")]
    TransientProvider { model: String, message: String },

    /// Auth, model-not-found or connection failure. Aborts the stage.
    #[error("fatal provider error (model {model}): {message}")]
    FatalProvider { model: String, message: String },

    /// Refusal from the provider. Logged, then replaced by the sentinel answer.
    #[error("content policy rejection (model {model}): {message}")]
    ContentPolicy { model: String, message: String },

    /// Response that could not be parsed into a completion.
    #[error("malformed response from {model}: {message}")]
    MalformedResponse { model: String, message: String },

    /// Request that cannot be sent as built, such as an empty conversation.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("item {category}[{index}] failed: {message}")]
    ItemProcessing {
        category: String,
        index: usize,
        message: String,
    },

    #[error("model server failed to start on {address}: {message}")]
    ServerStartup { address: String, message: String },

    #[error("dataset error: {0}")]
    Dataset(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl EvalError {
    pub fn config(msg: impl Into<String>) -> Self {
        EvalError::Configuration(msg.into())
    }

    pub fn io(path: impl AsRef<std::path::Path>, source: std::io::Error) -> Self {
        EvalError::Io {
            path: path.as_ref().display().to_string(),
            source,
        }
    }

    pub fn item(category: impl Into<String>, index: usize, message: impl Into<String>) -> Self {
        EvalError::ItemProcessing {
            category: category.into(),
            index,
            message: message.into(),
        }
    }

    /// Whether the error must abort the whole stage instead of a single slot.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            EvalError::FatalProvider { .. }
                | EvalError::ServerStartup { .. }
                | EvalError::Configuration(_)
        )
    }
}
