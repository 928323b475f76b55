use thiserror::Error;

/// Domain-level error taxonomy. Every public operation returns one of these
/// instead of panicking on bad input or a misbehaving encoder.
#[derive(Debug, Error)]
pub enum StreamError {
    #[error("resource unsupported: {0}")]
    ResourceUnsupported(String),

    #[error("resource read error: {0}")]
    ResourceRead(String),

    #[error("resource write error: {0}")]
    ResourceWrite(String),

    #[error("resource read/write error: {0}")]
    ResourceRw(String),

    #[error("transport address already in use: {0}")]
    TransmitAddrInUse(String),

    #[error("transmit failed: {0}")]
    TransmitFailed(String),

    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    #[error("ipc failed: {0}")]
    IpcFailed(String),

    #[error("gstreamer state change failed")]
    StateChange(#[from] gstreamer::StateChangeError),

    #[error("gstreamer boolean error: {0}")]
    Glib(#[from] glib::BoolError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, StreamError>;

impl StreamError {
    /// Classify a bus `ResourceError` the way `Target` construction's
    /// sync-handler does: a specific substring is promoted to
    /// `TransmitAddrInUse`, everything else from an open/write failure
    /// becomes `TransmitFailed`.
    pub fn from_bus_resource_error(message: &str) -> StreamError {
        if message.contains("already listening on the same port") {
            StreamError::TransmitAddrInUse(message.to_string())
        } else {
            StreamError::TransmitFailed(message.to_string())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn bind_conflict_message_classifies_as_addr_in_use() {
        let err = StreamError::from_bus_resource_error("srtsink: already listening on the same port");
        assert_matches!(err, StreamError::TransmitAddrInUse(_));
    }

    #[test]
    fn other_resource_messages_classify_as_transmit_failed() {
        let err = StreamError::from_bus_resource_error("srtsink: connection refused");
        assert_matches!(err, StreamError::TransmitFailed(_));
    }
}
