//! Public types for the favorite engine coordinator.

use serde::Serialize;

use crate::storage::traits::StorageError;

/// Engine lifecycle state.
///
/// Use [`super::FavoriteEngine::state()`] to check current state or
/// [`super::FavoriteEngine::state_receiver()`] to watch for changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum EngineState {
    /// Just created, not yet started
    Created,
    /// Connecting to Redis / SQL
    Connecting,
    /// Backends connected, scheduler not running
    Ready,
    /// Serving with the reconciliation scheduler active
    Running,
    /// Graceful shutdown in progress
    ShuttingDown,
}

impl std::fmt::Display for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Created => write!(f, "Created"),
            Self::Connecting => write!(f, "Connecting"),
            Self::Ready => write!(f, "Ready"),
            Self::Running => write!(f, "Running"),
            Self::ShuttingDown => write!(f, "ShuttingDown"),
        }
    }
}

/// Client-visible outcome class of an engine call.
///
/// Only the two expected mutation outcomes are specific; every other failure
/// collapses to `Internal` so cache/store details never reach clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ClientStatus {
    Ok,
    AlreadyExists,
    NotFound,
    Internal,
}

impl ClientStatus {
    pub fn of<T>(result: &Result<T, StorageError>) -> Self {
        match result {
            Ok(_) => Self::Ok,
            Err(e) => Self::from(e),
        }
    }

    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ok => "ok",
            Self::AlreadyExists => "already_exists",
            Self::NotFound => "not_found",
            Self::Internal => "internal",
        }
    }
}

impl From<&StorageError> for ClientStatus {
    fn from(e: &StorageError) -> Self {
        match e {
            StorageError::AlreadyExists => Self::AlreadyExists,
            StorageError::NotFound => Self::NotFound,
            _ => Self::Internal,
        }
    }
}

/// Snapshot for `/ready` and `/health` style endpoints.
#[derive(Debug, Clone, Serialize)]
pub struct HealthCheck {
    pub state: EngineState,
    /// Running and every configured backend answered
    pub healthy: bool,
    /// `None` when no cache is attached
    pub cache_connected: Option<bool>,
    pub cache_latency_ms: Option<u64>,
    /// `None` when no archive is attached
    pub archive_connected: Option<bool>,
    pub archive_latency_ms: Option<u64>,
    /// A reconciliation pass is in flight
    pub reconciling: bool,
    pub pending_delta: Option<u64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_engine_state_display() {
        assert_eq!(format!("{}", EngineState::Created), "Created");
        assert_eq!(format!("{}", EngineState::Running), "Running");
        assert_eq!(format!("{}", EngineState::ShuttingDown), "ShuttingDown");
    }

    #[test]
    fn test_client_status_mapping() {
        assert_eq!(ClientStatus::from(&StorageError::AlreadyExists), ClientStatus::AlreadyExists);
        assert_eq!(ClientStatus::from(&StorageError::NotFound), ClientStatus::NotFound);
        assert_eq!(
            ClientStatus::from(&StorageError::TransientIo("redis down".into())),
            ClientStatus::Internal
        );
        assert_eq!(
            ClientStatus::from(&StorageError::BatchWriteFailure { committed: 0, reason: "x".into() }),
            ClientStatus::Internal
        );
        assert_eq!(ClientStatus::of::<()>(&Ok(())), ClientStatus::Ok);
    }

    #[test]
    fn test_health_check_serializes() {
        let health = HealthCheck {
            state: EngineState::Running,
            healthy: true,
            cache_connected: Some(true),
            cache_latency_ms: Some(1),
            archive_connected: None,
            archive_latency_ms: None,
            reconciling: false,
            pending_delta: Some(3),
        };
        let json = serde_json::to_value(&health).unwrap();
        assert_eq!(json["state"], "Running");
        assert_eq!(json["pending_delta"], 3);
    }
}
