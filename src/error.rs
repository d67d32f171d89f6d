use thiserror::Error;

/// Errors surfaced to the caller of the transformation engine.
///
/// Anything local and recoverable (a single malformed frame, a clamped token
/// limit) is absorbed with a `log` diagnostic and never reaches this type.
/// Anything that changes the contract with the caller is surfaced verbatim.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// Malformed canonical request, rejected before any upstream call.
    #[error("invalid request: {0}")]
    Validation(String),

    /// The request uses a feature the resolved model/codec does not support.
    #[error("unsupported feature for model '{model}': {feature}")]
    UnsupportedFeature { model: String, feature: String },

    /// Non-2xx from the provider, passed through with its status and body.
    #[error("upstream returned status {status}: {body}")]
    Upstream { status: u16, body: String },

    /// A request or response could not be translated by the codec chain.
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),

    /// The upstream connection failed or was dropped mid-stream.
    #[error("transport error: {0}")]
    Transport(String),
}

/// Errors produced by a single codec operation.
#[derive(Error, Debug)]
pub enum CodecError {
    #[error("missing field: {0}")]
    MissingField(String),

    #[error("unsupported conversion: {0}")]
    UnsupportedConversion(String),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

/// Errors local to one stream, observed while decoding frames.
///
/// `FrameDecode` is absorbed by the state machine (the frame is skipped with
/// a diagnostic and the stream continues); `Aborted` is terminal and is
/// reported only after every open block has been defensively closed.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("could not decode stream frame: {0}")]
    FrameDecode(String),

    #[error("stream aborted: {0}")]
    Aborted(String),
}
