//! Failure taxonomy for the locate pipeline
//!
//! Every stage raises a typed fault. [`classify`] folds those faults into the
//! small, stable set of [`ErrorKind`]s that the API and UI understand, each
//! with a fixed remediation hint.

use std::fmt;
use std::io;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Failure raised while turning upload bytes into an RGB image
#[derive(Debug, Error)]
pub enum DecodeFault {
    #[error("empty upload")]
    Empty,
    #[error("unrecognized image format")]
    UnknownFormat,
    #[error("invalid image data: {0}")]
    Image(#[from] image::ImageError),
    #[error("failed to read image data: {0}")]
    Io(#[from] io::Error),
}

/// Failure raised while writing the staged inference file
#[derive(Debug, Error)]
#[error("staging failed during {operation}: {source}")]
pub struct StagingFault {
    pub operation: &'static str,
    #[source]
    pub source: io::Error,
}

impl StagingFault {
    pub fn new(operation: &'static str, source: io::Error) -> Self {
        Self { operation, source }
    }
}

/// Failure reported by (or about) the external geolocation model
#[derive(Debug, Error)]
pub enum ModelFault {
    /// The model raised an error of its own; `error_type` is the model runtime's error class
    #[error("{error_type}: {message}")]
    Raised { error_type: String, message: String },
    /// The model returned output whose shape does not match the expected interface
    #[error("model output has an unexpected shape: {0}")]
    InterfaceShape(String),
    /// The model host process went away
    #[error("model worker exited ({status}){}", format_tail(.stderr_tail))]
    WorkerExited {
        status: String,
        signal: Option<i32>,
        stderr_tail: String,
    },
    #[error("model protocol error: {0}")]
    Protocol(String),
    #[error("model i/o error: {0}")]
    Io(#[from] io::Error),
}

fn format_tail(tail: &str) -> String {
    if tail.is_empty() {
        String::new()
    } else {
        format!(": {}", tail)
    }
}

/// Any fault raised by a pipeline stage, tagged with the stage it came from
#[derive(Debug, Error)]
pub enum PipelineFault {
    #[error("model construction failed: {0}")]
    Load(#[source] ModelFault),
    #[error(transparent)]
    Decode(#[from] DecodeFault),
    #[error(transparent)]
    Staging(#[from] StagingFault),
    #[error("inference failed: {0}")]
    Inference(#[source] ModelFault),
    #[error("pipeline task panicked: {0}")]
    Panicked(String),
}

/// Stable error taxonomy exposed to callers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    ModelLoadFailure,
    VersionIncompatibility,
    ResourceExhaustion,
    DecodeFailure,
    StagingFailure,
    UnclassifiedFailure,
}

/// How a failure should be surfaced to the user
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Surface {
    /// Problem with this upload; shown next to the offending operation
    Inline,
    /// No prediction can proceed; shown as a page-level condition
    PageBlocking,
    /// Environment defect that an operator has to fix
    Operator,
    /// Unknown failure; raw message only
    Raw,
}

impl ErrorKind {
    pub const ALL: [ErrorKind; 6] = [
        ErrorKind::ModelLoadFailure,
        ErrorKind::VersionIncompatibility,
        ErrorKind::ResourceExhaustion,
        ErrorKind::DecodeFailure,
        ErrorKind::StagingFailure,
        ErrorKind::UnclassifiedFailure,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::ModelLoadFailure => "model_load_failure",
            ErrorKind::VersionIncompatibility => "version_incompatibility",
            ErrorKind::ResourceExhaustion => "resource_exhaustion",
            ErrorKind::DecodeFailure => "decode_failure",
            ErrorKind::StagingFailure => "staging_failure",
            ErrorKind::UnclassifiedFailure => "unclassified_failure",
        }
    }

    /// Fixed remediation hint; empty for unclassified failures
    pub fn remediation(&self) -> &'static str {
        match self {
            ErrorKind::ModelLoadFailure => {
                "The geolocation model could not be loaded. Reload the page to try again."
            }
            ErrorKind::VersionIncompatibility => {
                "The model library is incompatible with the installed runtime. Pin a compatible \
                 torch/transformers version for geoclip and restart the worker."
            }
            ErrorKind::ResourceExhaustion => {
                "The server ran out of memory while processing the image. Reload the page and \
                 try a smaller image."
            }
            ErrorKind::DecodeFailure => {
                "The upload could not be read as an image. Upload a JPEG or PNG file."
            }
            ErrorKind::StagingFailure => {
                "The image could not be written to temporary storage. Check free disk space \
                 and permissions of the staging directory."
            }
            ErrorKind::UnclassifiedFailure => "",
        }
    }

    pub fn surface(&self) -> Surface {
        match self {
            ErrorKind::DecodeFailure | ErrorKind::StagingFailure => Surface::Inline,
            ErrorKind::ModelLoadFailure | ErrorKind::ResourceExhaustion => Surface::PageBlocking,
            ErrorKind::VersionIncompatibility => Surface::Operator,
            ErrorKind::UnclassifiedFailure => Surface::Raw,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A classified pipeline failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PredictionError {
    pub kind: ErrorKind,
    pub message: Option<String>,
    pub hint: String,
    pub surface: Surface,
}

impl PredictionError {
    pub fn new(kind: ErrorKind, message: Option<String>) -> Self {
        Self {
            kind,
            message,
            hint: kind.remediation().to_string(),
            surface: kind.surface(),
        }
    }
}

impl fmt::Display for PredictionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.message {
            Some(message) => write!(f, "{}: {}", self.kind, message),
            None => write!(f, "{}", self.kind),
        }
    }
}

impl std::error::Error for PredictionError {}

/// Messages that mean the model ran out of memory
const MEMORY_SIGNATURES: &[&str] = &[
    "out of memory",
    "can't allocate memory",
    "cannot allocate memory",
    "failed to allocate",
    "std::bad_alloc",
];

/// Messages that mean the model library and runtime disagree on an interface
const VERSION_SKEW_SIGNATURES: &[&str] = &[
    "unexpected keyword argument",
    "positional argument",
    "has no attribute",
    "cannot import name",
    "size mismatch",
    "unrecognized configuration class",
    "no module named",
];

const MEMORY_ERROR_TYPES: &[&str] = &["MemoryError", "OutOfMemoryError"];
const VERSION_SKEW_ERROR_TYPES: &[&str] = &["AttributeError", "ImportError", "ModuleNotFoundError"];

const SIGKILL: i32 = 9;

fn matches_any(haystack: &str, needles: &[&str]) -> bool {
    let haystack = haystack.to_ascii_lowercase();
    needles.iter().any(|needle| haystack.contains(needle))
}

fn is_memory_fault(fault: &ModelFault) -> bool {
    match fault {
        ModelFault::Raised {
            error_type,
            message,
        } => {
            MEMORY_ERROR_TYPES.contains(&error_type.as_str())
                || matches_any(message, MEMORY_SIGNATURES)
        }
        ModelFault::WorkerExited {
            signal,
            stderr_tail,
            ..
        } => *signal == Some(SIGKILL) || matches_any(stderr_tail, MEMORY_SIGNATURES),
        ModelFault::Io(err) => err.kind() == io::ErrorKind::OutOfMemory,
        ModelFault::InterfaceShape(_) | ModelFault::Protocol(_) => false,
    }
}

fn is_version_skew(fault: &ModelFault) -> bool {
    match fault {
        ModelFault::InterfaceShape(_) => true,
        ModelFault::Raised {
            error_type,
            message,
        } => {
            VERSION_SKEW_ERROR_TYPES.contains(&error_type.as_str())
                || (error_type == "TypeError" || error_type == "RuntimeError")
                    && matches_any(message, VERSION_SKEW_SIGNATURES)
        }
        _ => false,
    }
}

/// Map a pipeline fault onto the stable taxonomy. Pure and deterministic.
pub fn classify(fault: &PipelineFault) -> PredictionError {
    let kind = match fault {
        PipelineFault::Load(_) => ErrorKind::ModelLoadFailure,
        PipelineFault::Decode(_) => ErrorKind::DecodeFailure,
        PipelineFault::Staging(_) => ErrorKind::StagingFailure,
        PipelineFault::Inference(inner) if is_memory_fault(inner) => ErrorKind::ResourceExhaustion,
        PipelineFault::Inference(inner) if is_version_skew(inner) => {
            ErrorKind::VersionIncompatibility
        }
        PipelineFault::Inference(_) | PipelineFault::Panicked(_) => ErrorKind::UnclassifiedFailure,
    };
    PredictionError::new(kind, Some(fault.to_string()))
}
