//! JSON (de)serialization of message bodies and of the reply envelope.
//!
//! Every reply produced by a [`RequestDispatcher`](crate::rpc::RequestDispatcher) is an
//! [`Envelope`]: either `{"data": <value>}` or
//! `{"error": {"code": <int>, "reason": {"error": <string>, "message": <string?>}}}`.
pub mod v1;

use serde::{de::DeserializeOwned, Deserialize, Serialize};

use crate::rpc::HandlerError;

/// The content type stamped on every message we publish.
pub const CONTENT_TYPE: &str = "application/json";

/// The reply sent back when a handler panics.
///
/// It is a constant so that producing it can never fail.
pub const INTERNAL_ERROR_BODY: &[u8] =
    br#"{"error":{"code":500,"reason":{"error":"Internal server error"}}}"#;

/// A reply to a request: exactly one of `data` or `error`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Envelope<T> {
    Data(T),
    Error(ApiError),
}

impl<T> Envelope<T> {
    /// Turn the envelope into a `Result`, surfacing remote errors as [`ApiError`].
    pub fn into_result(self) -> Result<T, ApiError> {
        match self {
            Envelope::Data(data) => Ok(data),
            Envelope::Error(error) => Err(error),
        }
    }
}

/// The error half of an [`Envelope`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiError {
    /// An HTTP-like status code.
    pub code: u16,
    pub reason: ApiReason,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ApiReason {
    pub error: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl From<&HandlerError> for ApiError {
    fn from(error: &HandlerError) -> Self {
        Self {
            code: error.status_code(),
            reason: ApiReason {
                error: error.to_string(),
                message: error.message().map(ToOwned::to_owned),
            },
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CodecError {
    #[error("Failed to translate message")]
    Decode(#[source] serde_json::Error),
    #[error("Failed to convert to message")]
    Encode(#[source] serde_json::Error),
}

/// Deserialize a message body.
pub fn translate_message<T: DeserializeOwned>(body: &[u8]) -> Result<T, CodecError> {
    serde_json::from_slice(body).map_err(CodecError::Decode)
}

/// Serialize a value into a message body.
pub fn convert_to_message<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(value).map_err(CodecError::Encode)
}

/// Encode a successful handler outcome as a `{"data": ...}` envelope.
pub fn data_envelope<T: Serialize>(data: &T) -> Result<Vec<u8>, CodecError> {
    convert_to_message(&Envelope::Data(data))
}

/// Encode a failed handler outcome as an `{"error": ...}` envelope.
pub fn error_envelope(error: &HandlerError) -> Result<Vec<u8>, CodecError> {
    convert_to_message(&Envelope::<()>::Error(error.into()))
}
