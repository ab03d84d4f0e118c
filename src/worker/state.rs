//! Worker lifecycle state machine.

/// Lifecycle state of the dispatch worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WorkerState {
    /// Not yet connected to the broker.
    Idle,
    /// Broker connection and channel are open.
    Connected,
    /// Queue declared, consumer registered, deliveries flowing.
    Consuming,
    /// Shutdown requested; no new deliveries are taken.
    Closing,
    /// The broker connection could not be established or was lost.
    Faulted,
}

impl WorkerState {
    /// Check if this state allows transitioning to another state.
    pub fn can_transition_to(&self, target: WorkerState) -> bool {
        use WorkerState::*;

        matches!(
            (self, target),
            (Idle, Connected) | (Idle, Faulted) |
            // A caller-supplied delivery stream skips the connect step
            (Idle, Consuming) |
            (Connected, Consuming) | (Connected, Faulted) |
            (Consuming, Closing) | (Consuming, Faulted)
        )
    }
}

impl std::fmt::Display for WorkerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Idle => "idle",
            Self::Connected => "connected",
            Self::Consuming => "consuming",
            Self::Closing => "closing",
            Self::Faulted => "faulted",
        };
        write!(f, "{s}")
    }
}
