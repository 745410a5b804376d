use std::fmt;

use crate::codec::CodecError;

/// The error type returned by request handlers.
///
/// It carries everything needed to build the error half of the reply envelope:
/// the underlying error (rendered as `reason.error`), an optional human-readable message
/// (`reason.message`) and an [`ErrorKind`] that resolves the status `code`.
#[derive(Debug)]
pub struct HandlerError {
    kind: ErrorKind,
    inner_error: anyhow::Error,
    message: Option<String>,
}

impl HandlerError {
    pub fn new(kind: ErrorKind, error: impl Into<anyhow::Error>) -> Self {
        Self {
            kind,
            inner_error: error.into(),
            message: None,
        }
    }

    /// Build an error out of a plain message, e.g. `HandlerError::from_message(ErrorKind::NotFound, "bus not found")`.
    pub fn from_message<M>(kind: ErrorKind, error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::new(kind, anyhow::Error::msg(error))
    }

    pub fn bad_request<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::BadRequest, error)
    }

    pub fn validation<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::Validation, error)
    }

    pub fn unauthorized<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::Unauthorized, error)
    }

    pub fn forbidden<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::Forbidden, error)
    }

    pub fn conflict<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::Conflict, error)
    }

    pub fn not_found<M>(error: M) -> Self
    where
        M: fmt::Display + fmt::Debug + Send + Sync + 'static,
    {
        Self::from_message(ErrorKind::NotFound, error)
    }

    /// The error replied when a handler does not complete before its deadline.
    pub fn request_canceled() -> Self {
        Self::from_message(ErrorKind::Unknown, "request canceled")
    }

    /// Attach a human-readable message, surfaced as `reason.message` in the reply.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    pub fn status_code(&self) -> u16 {
        self.kind.status_code()
    }

    pub fn message(&self) -> Option<&str> {
        self.message.as_deref()
    }

    pub fn into_inner(self) -> anyhow::Error {
        self.inner_error
    }
}

impl fmt::Display for HandlerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.inner_error)
    }
}

impl std::error::Error for HandlerError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.inner_error.source()
    }
}

/// Errors without an explicit classification resolve to [`ErrorKind::Unknown`].
impl From<anyhow::Error> for HandlerError {
    fn from(error: anyhow::Error) -> Self {
        Self::new(ErrorKind::Unknown, error)
    }
}

impl From<CodecError> for HandlerError {
    fn from(error: CodecError) -> Self {
        Self::new(ErrorKind::Unknown, error)
    }
}

/// Classification of handler failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The request cannot be processed as it is.
    BadRequest,
    /// The request payload failed validation.
    Validation,
    /// The caller is not authenticated, or its credentials are invalid.
    Unauthorized,
    /// The caller does not have the permission to perform the operation.
    Forbidden,
    /// The operation conflicts with the current state, e.g. a duplicate key.
    Conflict,
    NotFound,
    /// Anything else.
    Unknown,
}

impl ErrorKind {
    /// The status code surfaced as `code` in the reply envelope.
    pub fn status_code(self) -> u16 {
        match self {
            Self::BadRequest | Self::Validation => 400,
            Self::Unauthorized => 401,
            Self::Forbidden => 403,
            Self::NotFound => 404,
            Self::Conflict => 409,
            Self::Unknown => 500,
        }
    }

    pub fn reason_type(self) -> ReasonType {
        match self {
            Self::BadRequest | Self::Conflict | Self::NotFound => ReasonType::Processing,
            Self::Validation => ReasonType::Validation,
            Self::Unauthorized | Self::Forbidden => ReasonType::Authorization,
            Self::Unknown => ReasonType::Unknown,
        }
    }
}

/// Coarse grouping of [`ErrorKind`]s.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReasonType {
    Unknown,
    Processing,
    Authorization,
    Validation,
}

impl fmt::Display for ReasonType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "unknown_error"),
            Self::Processing => write!(f, "processing_error"),
            Self::Authorization => write!(f, "authorization_error"),
            Self::Validation => write!(f, "validation_error"),
        }
    }
}
