//! Radio transport boundary.
//!
//! The engine hands fully framed MAC PSDUs (without FCS) to a transport and
//! receives inbound PSDUs through the dispatcher. Framing, escaping and
//! checksums towards the radio co-processor belong to the transport.

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

/// Transport failures
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The next hop did not acknowledge the frame
    #[error("No acknowledgment")]
    NoAck,
    /// Clear channel assessment failed
    #[error("Channel access failure")]
    ChannelAccessFailure,
    /// The link to the radio is broken
    #[error("Transport I/O error: {0}")]
    Io(String),
}

impl TransportError {
    /// Whether the failure concerns a single frame rather than the link
    pub fn is_delivery_failure(&self) -> bool {
        matches!(self, TransportError::NoAck | TransportError::ChannelAccessFailure)
    }
}

/// Sink for outbound MAC frames
#[async_trait]
pub trait FrameTransport: Send {
    /// Transmit one frame; resolves once the radio confirmed the transmission
    async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError>;
}

#[cfg(test)]
pub(crate) mod mock {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};

    /// Captures frames and replays scripted transmission results
    #[derive(Clone, Default)]
    pub(crate) struct MockTransport {
        pub(crate) sent: Arc<Mutex<Vec<Bytes>>>,
        pub(crate) results: Arc<Mutex<VecDeque<Result<(), TransportError>>>>,
    }

    impl MockTransport {
        pub(crate) fn new() -> Self {
            Self::default()
        }

        pub(crate) fn fail_next(&self, error: TransportError) {
            self.results.lock().unwrap().push_back(Err(error));
        }

        pub(crate) fn frames(&self) -> Vec<Bytes> {
            self.sent.lock().unwrap().clone()
        }

        pub(crate) fn clear(&self) {
            self.sent.lock().unwrap().clear();
        }
    }

    #[async_trait]
    impl FrameTransport for MockTransport {
        async fn send_frame(&mut self, frame: Bytes) -> Result<(), TransportError> {
            self.sent.lock().unwrap().push(frame);
            self.results.lock().unwrap().pop_front().unwrap_or(Ok(()))
        }
    }
}
