use std::fmt::Display;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Lifecycle of a [`WorkerPool`](crate::WorkerPool). Only moves forward.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum PoolState {
    Running,
    Draining,
    Stopped,
}

#[derive(Debug, Error)]
pub enum StateTransitionError {
    #[error("illegal pool transition from {from} to {to}")]
    Illegal {
        from: &'static str,
        to: &'static str,
    },
}

impl Display for PoolState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl PoolState {
    pub fn as_str(&self) -> &'static str {
        match self {
            PoolState::Running => "Running",
            PoolState::Draining => "Draining",
            PoolState::Stopped => "Stopped",
        }
    }

    pub fn mark_as_draining(&self) -> Result<PoolState, StateTransitionError> {
        match self {
            PoolState::Running => Ok(PoolState::Draining),
            state => Err(StateTransitionError::Illegal {
                from: state.as_str(),
                to: "Draining",
            }),
        }
    }

    pub fn mark_as_stopped(&self) -> Result<PoolState, StateTransitionError> {
        match self {
            PoolState::Draining => Ok(PoolState::Stopped),
            state => Err(StateTransitionError::Illegal {
                from: state.as_str(),
                to: "Stopped",
            }),
        }
    }

    pub fn is_accepting(&self) -> bool {
        matches!(self, PoolState::Running)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, PoolState::Stopped)
    }
}
