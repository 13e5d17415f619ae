/// Detection state machine transition table
///
/// Pure: no I/O, no resource handling. The session applies transitions
/// under its lock and performs side effects based on the resulting state.

use crate::error::HotwordError;
use serde::Serialize;

/// Session lifecycle state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DetectionState {
    Uninitialized,
    Initializing,
    Listening,
    /// Transient while a detection is being handled
    Triggered,
    Stopped,
    /// Terminal
    Released,
}

/// Inputs to the state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    /// `create` began
    Initialize,
    /// Initialization finished, pipeline running
    Ready,
    /// `startDetection`
    Start,
    /// `stopDetection`, or end of a trigger cycle under auto-release
    Stop,
    /// Keyword matched
    Trigger,
    /// Trigger handled, keep listening
    Rearm,
    /// `release`
    Release,
}

impl Transition {
    fn operation(self) -> &'static str {
        match self {
            Self::Initialize => "initialize",
            Self::Ready => "finish initialization",
            Self::Start => "start detection",
            Self::Stop => "stop detection",
            Self::Trigger => "trigger",
            Self::Rearm => "re-arm",
            Self::Release => "release",
        }
    }
}

impl DetectionState {
    /// Compute the state after `transition`, or reject it
    pub fn apply(self, transition: Transition) -> Result<Self, HotwordError> {
        use DetectionState::*;

        let next = match (self, transition) {
            (_, Transition::Release) => Released,
            (Uninitialized, Transition::Initialize) => Initializing,
            (Initializing, Transition::Ready) => Listening,
            (Listening | Stopped, Transition::Start) => Listening,
            (Listening | Triggered, Transition::Stop) => Stopped,
            (Listening, Transition::Trigger) => Triggered,
            (Triggered, Transition::Rearm) => Listening,
            (from, t) => return Err(HotwordError::illegal(from, t.operation())),
        };

        Ok(next)
    }

    /// Audio is flowing through the pipeline
    pub fn is_streaming(self) -> bool {
        matches!(self, Self::Listening | Self::Triggered)
    }

    pub fn is_terminal(self) -> bool {
        self == Self::Released
    }
}
