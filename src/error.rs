use std::time::Duration;

use thiserror::Error;

/// Failures reported by a [`crate::channel::RenderChannel`].
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum ChannelError {
    /// A response arrived for an id with no pending request. Fatal to the
    /// channel instance that saw it.
    #[error("render channel desynchronized: response for unknown request '{id}'")]
    ProtocolDesync { id: String },

    /// The template failed to compile or a helper failed while rendering.
    #[error("{message}")]
    Template { message: String },

    #[error("render request '{id}' timed out after {after:?}")]
    Timeout { id: String, after: Duration },

    #[error("render channel closed")]
    Closed,

    #[error("malformed channel message: {0}")]
    Malformed(String),

    #[error("failed to start template sandbox: {0}")]
    Spawn(String),
}

/// Failures talking to the note service.
#[derive(Debug, Error)]
pub enum QueryError {
    #[error("note service unreachable: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("note service returned {status}: {message}")]
    Status { status: u16, message: String },

    #[error("unexpected response from note service: {0}")]
    Decode(String),

    #[error("note service rejected the query: {0}")]
    Invalid(String),

    #[error("invalid note service url: {0}")]
    InvalidUrl(#[from] url::ParseError),
}

/// Failures applying a template suggestion to a matched note.
#[derive(Debug, Error)]
pub enum SuggestionError {
    #[error("no output template named '{0}'")]
    UnknownTemplate(String),

    /// The tab navigated or closed while the suggestion was rendering.
    #[error("page changed before the suggestion was rendered")]
    Stale,

    #[error(transparent)]
    Channel(#[from] ChannelError),
}
