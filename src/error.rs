//! Error types shared by the pool, dispatcher and prediction engine.

use thiserror::Error;

/// Failures surfaced by the miner core.
///
/// Transport and protocol errors are handled where they happen (reconnect,
/// drop the frame); only the owning loop ever sees them.
#[derive(Debug, Error)]
pub enum MinerError {
    /// Connection-level failure, recoverable by reconnecting.
    #[error("transport error: {0}")]
    Transport(String),

    /// Malformed or unexpected frame. The frame is dropped.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Upstream no longer resolves this streamer.
    #[error("streamer {0} does not exist")]
    EntityNotFound(String),

    /// The betting call failed or was rejected.
    #[error("bet placement failed for event {event_id}: {reason}")]
    BetPlacement { event_id: String, reason: String },

    /// Any other API client failure.
    #[error("api error: {0}")]
    Api(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl MinerError {
    /// Short machine-readable cause for log lines.
    pub fn cause(&self) -> &'static str {
        match self {
            MinerError::Transport(_) => "transport",
            MinerError::Protocol(_) => "protocol",
            MinerError::EntityNotFound(_) => "not_found",
            MinerError::BetPlacement { .. } => "bet_placement",
            MinerError::Api(_) => "api",
            MinerError::Io(_) => "io",
            MinerError::Json(_) => "json",
        }
    }

    /// Transport failures clear up once a connection can be opened again.
    pub fn is_recoverable_by_reconnect(&self) -> bool {
        matches!(self, MinerError::Transport(_))
    }
}

pub type Result<T> = std::result::Result<T, MinerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_causes() {
        assert_eq!(MinerError::Transport("x".into()).cause(), "transport");
        assert_eq!(MinerError::Protocol("x".into()).cause(), "protocol");
        assert_eq!(MinerError::EntityNotFound("x".into()).cause(), "not_found");
        assert_eq!(
            MinerError::BetPlacement {
                event_id: "e".into(),
                reason: "r".into()
            }
            .cause(),
            "bet_placement"
        );
    }

    #[test]
    fn test_only_transport_errors_trigger_reconnect() {
        assert!(MinerError::Transport("closed".into()).is_recoverable_by_reconnect());
        assert!(!MinerError::Protocol("bad".into()).is_recoverable_by_reconnect());
        assert!(!MinerError::Api("500".into()).is_recoverable_by_reconnect());
    }

    #[test]
    fn test_display_includes_event() {
        let err = MinerError::BetPlacement {
            event_id: "abc".into(),
            reason: "window closed".into(),
        };
        assert_eq!(
            err.to_string(),
            "bet placement failed for event abc: window closed"
        );
    }
}
