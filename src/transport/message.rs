//! Group message type
//!
//! The unit of data sent on a group channel and delivered to receivers.

use bytes::Bytes;

/// A message sent to or received from a group channel
///
/// Cheap to clone: the payload is reference counted, so every receiver of a
/// fan-out round shares the same allocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupMessage {
    /// Message payload (opaque to this crate)
    payload: Bytes,
    /// Suppress redelivery to the sending process
    dont_loopback: bool,
}

impl GroupMessage {
    /// Create a new message
    pub fn new(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            dont_loopback: false,
        }
    }

    /// Get the payload
    pub fn payload(&self) -> &Bytes {
        &self.payload
    }

    /// Consume the message and return its payload
    pub fn into_payload(self) -> Bytes {
        self.payload
    }

    /// Mark the message so the transport does not deliver it back to the sender
    pub fn set_dont_loopback(&mut self) {
        self.dont_loopback = true;
    }

    /// Check whether self-delivery is suppressed
    pub fn is_dont_loopback(&self) -> bool {
        self.dont_loopback
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Check if the payload is empty
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_message_loops_back() {
        let msg = GroupMessage::new(Bytes::from_static(b"announce"));
        assert!(!msg.is_dont_loopback());
        assert_eq!(msg.len(), 8);
        assert_eq!(msg.payload().as_ref(), b"announce");
    }

    #[test]
    fn test_dont_loopback_survives_clone() {
        let mut msg = GroupMessage::new(vec![1u8, 2, 3]);
        msg.set_dont_loopback();

        let copy = msg.clone();
        assert!(copy.is_dont_loopback());
        assert_eq!(copy.into_payload(), Bytes::from_static(&[1, 2, 3]));
    }
}
