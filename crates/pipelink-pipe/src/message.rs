use std::fmt;

use bytes::Bytes;

use crate::local::PipeEndpoint;

/// A discrete unit moved through a pipe: an opaque payload plus zero or
/// more attached pipe endpoints.
///
/// Attached endpoints are transferred by value — writing a message moves
/// ownership of its attachments to the receiving end.
pub struct Message {
    payload: Bytes,
    handles: Vec<PipeEndpoint>,
}

impl Message {
    /// Create a message with a payload and no attachments.
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            handles: Vec::new(),
        }
    }

    /// Create a message carrying attached pipe endpoints.
    pub fn with_handles(payload: impl Into<Bytes>, handles: Vec<PipeEndpoint>) -> Self {
        Self {
            payload: payload.into(),
            handles,
        }
    }

    /// Attach an endpoint to this message.
    pub fn attach(&mut self, handle: PipeEndpoint) {
        self.handles.push(handle);
    }

    /// The message payload.
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Attached endpoints, in attachment order.
    pub fn handles(&self) -> &[PipeEndpoint] {
        &self.handles
    }

    /// Transfer ownership of the payload and all attachments to the caller.
    pub fn into_parts(self) -> (Bytes, Vec<PipeEndpoint>) {
        (self.payload, self.handles)
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Message")
            .field("payload_len", &self.payload.len())
            .field("handles", &self.handles.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::pipe_pair;

    #[test]
    fn payload_roundtrip() {
        let msg = Message::new("hello");
        assert_eq!(msg.payload().as_ref(), b"hello");
        assert!(msg.handles().is_empty());

        let (payload, handles) = msg.into_parts();
        assert_eq!(payload.as_ref(), b"hello");
        assert!(handles.is_empty());
    }

    #[test]
    fn attach_transfers_ownership() {
        let (a, _b) = pipe_pair();
        let mut msg = Message::new("carrier");
        msg.attach(a);
        assert_eq!(msg.handles().len(), 1);

        let (_, handles) = msg.into_parts();
        assert_eq!(handles.len(), 1);
    }

    #[test]
    fn debug_redacts_payload_contents() {
        let msg = Message::new("secret-bytes");
        let rendered = format!("{msg:?}");
        assert!(rendered.contains("payload_len"));
        assert!(!rendered.contains("secret-bytes"));
    }
}
