#![expect(
    clippy::module_name_repetitions,
    reason = "Error types include the module name to indicate their scope"
)]

use std::error::Error as StdError;
use std::fmt;

/// Socket client error variants.
#[non_exhaustive]
#[derive(Debug)]
pub enum WsError {
    /// Error connecting to or communicating with the socket server
    Connection(tokio_tungstenite::tungstenite::Error),
    /// A frame stream lagged behind and missed frames
    Lagged {
        /// Number of frames that were missed
        count: u64,
    },
}

impl fmt::Display for WsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "WebSocket connection error: {e}"),
            Self::Lagged { count } => write!(f, "Frame stream lagged, missed {count} frames"),
        }
    }
}

impl StdError for WsError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        match self {
            Self::Connection(e) => Some(e),
            Self::Lagged { .. } => None,
        }
    }
}

impl From<WsError> for crate::error::Error {
    fn from(e: WsError) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, e)
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for crate::error::Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        crate::error::Error::with_source(crate::error::Kind::WebSocket, WsError::Connection(e))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, Kind};

    #[test]
    fn lagged_converts_to_websocket_kind() {
        let error: Error = WsError::Lagged { count: 3 }.into();

        assert_eq!(error.kind(), Kind::WebSocket);
        assert_eq!(
            error.to_string(),
            "WebSocket: Frame stream lagged, missed 3 frames"
        );
        assert!(matches!(
            error.downcast_ref::<WsError>(),
            Some(WsError::Lagged { count: 3 })
        ));
    }
}
