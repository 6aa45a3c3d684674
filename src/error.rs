use thiserror::Error;

pub type Result<T> = std::result::Result<T, FlowError>;

#[derive(Debug, Error)]
pub enum FlowError {
    #[error("action is not registered: [{0}]")]
    ActionNotFound(String),
    #[error("object is neither a valid action nor decision: {0}")]
    NotValidObject(String),
    #[error("sequence [{0}] not found")]
    SequenceNotFound(String),
    #[error("script stack overflow: depth {depth} exceeds {limit}")]
    ScriptStackOverflow { depth: usize, limit: usize },
    #[error("script state error: {0}")]
    ScriptState(String),
    #[error("script error in thread `{thread}`: {source}")]
    Script {
        thread: String,
        #[source]
        source: Box<FlowError>,
    },
    #[error("unhandled script error in thread `{thread}`: {source}")]
    NotHandledScript {
        thread: String,
        #[source]
        source: Box<FlowError>,
    },
    #[error("failed to import action `{action}` from `{url}`: {reason}")]
    ImportFailed {
        action: String,
        url: String,
        reason: String,
    },
    #[error(transparent)]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl FlowError {
    pub fn script(thread: impl Into<String>, source: FlowError) -> Self {
        FlowError::Script {
            thread: thread.into(),
            source: Box::new(source),
        }
    }

    pub fn not_handled(thread: impl Into<String>, source: FlowError) -> Self {
        FlowError::NotHandledScript {
            thread: thread.into(),
            source: Box::new(source),
        }
    }

    /// The failure that started a `Script`/`NotHandledScript` chain.
    pub fn root_cause(&self) -> &FlowError {
        match self {
            FlowError::Script { source, .. } | FlowError::NotHandledScript { source, .. } => {
                source.root_cause()
            }
            other => other,
        }
    }
}
