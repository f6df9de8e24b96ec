use std::sync::Arc;

use thiserror::Error;

/// Errors raised by muxer and writer implementations.
#[derive(Error, Debug)]
pub enum ElementError {
    #[error("IO Error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Unknown property '{0}'")]
    UnknownProperty(String),

    #[error("Invalid value {value:?} for property '{name}'")]
    InvalidPropertyValue { name: String, value: String },

    #[error("Preset '{0}' is not supported")]
    UnsupportedPreset(String),

    #[error("Operation not supported: {0}")]
    Unsupported(&'static str),

    #[error("Element is not running")]
    NotRunning,

    #[error("Unknown pad '{0}'")]
    UnknownPad(String),

    #[error("{0}")]
    Other(String),
}

/// Terminal errors reported by the sink.
///
/// Once one of these is raised the sink stops producing output; it is both
/// returned to the thread that hit it and broadcast as an error event.
#[derive(Error, Debug, Clone)]
pub enum SplitMuxError {
    #[error("Timestamping error on input streams: {0}")]
    Timestamp(String),

    #[error("Reference stream ended before any data was received")]
    NoData,

    #[error("No {kind} factory named '{factory}'")]
    MissingFactory { kind: &'static str, factory: String },

    #[error("Could not create {element}: {source}")]
    ElementCreation {
        element: String,
        #[source]
        source: Arc<ElementError>,
    },

    #[error("Could not link stream '{stream}' to {element}: {source}")]
    Link {
        stream: String,
        element: String,
        #[source]
        source: Arc<ElementError>,
    },

    #[error("Could not start {element}: {source}")]
    StateChange {
        element: String,
        #[source]
        source: Arc<ElementError>,
    },

    #[error("Write to {element} failed: {source}")]
    Downstream {
        element: String,
        #[source]
        source: Arc<ElementError>,
    },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Stream request refused: {0}")]
    Request(String),

    #[error("Timed out waiting for end of stream")]
    Timeout,
}

impl SplitMuxError {
    pub(crate) fn creation(element: impl Into<String>, source: ElementError) -> Self {
        SplitMuxError::ElementCreation {
            element: element.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn state_change(element: impl Into<String>, source: ElementError) -> Self {
        SplitMuxError::StateChange {
            element: element.into(),
            source: Arc::new(source),
        }
    }

    pub(crate) fn downstream(element: impl Into<String>, source: ElementError) -> Self {
        SplitMuxError::Downstream {
            element: element.into(),
            source: Arc::new(source),
        }
    }
}

/// Result of handing data to a stream.
#[derive(Error, Debug, Clone)]
pub enum FlowError {
    #[error("Stream is flushing")]
    Flushing,

    #[error("Stream already reached end of stream")]
    Eos,

    #[error(transparent)]
    Error(#[from] SplitMuxError),
}

pub type FlowResult = Result<(), FlowError>;
