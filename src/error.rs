//! Error type for the non-realtime boundary
//!
//! The render path never produces errors; everything it touches is validated
//! when the region table is built. Loading and dispatch setters are the only
//! fallible operations.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("failed to read sample file: {0}")]
    SampleRead(#[from] hound::Error),

    #[error("unsupported sample format: {0}")]
    SampleFormat(String),

    #[error("curve index {0} out of range")]
    CurveIndex(usize),

    #[error("curve definition needs at least two points")]
    CurveTooShort,

    #[error("region {0} references missing sample data")]
    MissingSample(u32),

    #[error("dispatch argument type mismatch at {path}: expected {expected}")]
    ArgumentType { path: String, expected: &'static str },
}
