//! Request sink: cancellation and response metadata.
//!
//! The HTTP collaborator hands every request a [`Sink`] whose token it
//! cancels on client disconnect. Producers call
//! [`Sink::check_aborted`] at every natural yield point; warper calls
//! propagate the token into the worker.

use tokio_util::sync::CancellationToken;

use crate::error::{GenerateError, GenerateResult};
use crate::resource::FileClass;

/// Per-request cancellation handle.
#[derive(Clone, Debug, Default)]
pub struct Sink {
    token: CancellationToken,
}

impl Sink {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    pub fn with_token(token: CancellationToken) -> Self {
        Self { token }
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Marks the request as abandoned by the client.
    pub fn abort(&self) {
        self.token.cancel();
    }

    pub fn aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Fails with [`GenerateError::Cancelled`] once the client is gone.
    pub fn check_aborted(&self) -> GenerateResult<()> {
        if self.token.is_cancelled() {
            Err(GenerateError::Cancelled)
        } else {
            Ok(())
        }
    }
}

/// A finished tile artifact, ready for the HTTP layer.
#[derive(Clone, Debug, PartialEq)]
pub struct TileResponse {
    pub body: Vec<u8>,
    pub content_type: String,
    pub file_class: FileClass,
    /// Extra headers, e.g. `Content-Encoding: gzip`.
    pub headers: Vec<(String, String)>,
}

impl TileResponse {
    pub fn new(body: Vec<u8>, content_type: impl Into<String>, file_class: FileClass) -> Self {
        Self {
            body,
            content_type: content_type.into(),
            file_class,
            headers: Vec::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}
