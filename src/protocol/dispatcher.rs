//! Handler contract and request/response plumbing.
//!
//! The connection handler loop turns every recognized application message
//! into a [`Request`] and hands it to the registered [`Handler`] together
//! with a [`ResponseWriter`]. The writer is strictly write-once: the second
//! call to [`ResponseWriter::send`] fails with
//! [`UaError::ResponseAlreadySent`], so exactly one response can ever be
//! transmitted per request correlation id.

use crate::error::{Result, UaError};
use crate::protocol::message::Message;

/// A decoded application request as seen by a handler.
#[derive(Debug)]
pub struct Request {
    /// The decoded message. Immutable once dispatched.
    pub message: Message,
    /// Correlation id from the secure-conversation header.
    pub request_id: u32,
    /// Channel the request arrived on.
    pub channel_id: u32,
}

/// Collects at most one response message per request.
#[derive(Debug, Default)]
pub struct ResponseWriter {
    response: Option<Message>,
}

impl ResponseWriter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the response to send. Write-once: a second call is an error
    /// and leaves the first response in place.
    pub fn send(&mut self, msg: Message) -> Result<()> {
        if self.response.is_some() {
            return Err(UaError::ResponseAlreadySent);
        }
        self.response = Some(msg);
        Ok(())
    }

    /// Consume the writer, yielding the response if one was written.
    pub fn into_response(self) -> Option<Message> {
        self.response
    }
}

/// The pluggable application-level interface invoked by the dispatch loop.
///
/// Implementations must be `Send + Sync`: one handler instance is shared by
/// every connection task.
pub trait Handler: Send + Sync {
    fn serve(&self, w: &mut ResponseWriter, r: &Request);
}

/// Adapter letting plain functions and closures serve as handlers.
pub struct HandlerFunc<F>(pub F);

impl<F> Handler for HandlerFunc<F>
where
    F: Fn(&mut ResponseWriter, &Request) + Send + Sync,
{
    fn serve(&self, w: &mut ResponseWriter, r: &Request) {
        (self.0)(w, r)
    }
}
