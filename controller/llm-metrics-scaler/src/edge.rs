//! Activation edge tracking per monitor key

/// Last observed activation state of a key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ActivationState {
    /// No successful evaluation yet
    #[default]
    Unknown,
    Inactive,
    Active,
}

impl ActivationState {
    fn from_active(active: bool) -> Self {
        if active {
            Self::Active
        } else {
            Self::Inactive
        }
    }
}

/// Edge detector; lives as long as the key is monitored
#[derive(Debug, Clone, Default)]
pub struct EdgeTracker {
    state: ActivationState,
}

impl EdgeTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn state(&self) -> ActivationState {
        self.state
    }

    /// Record an evaluation and return the new activation value on an edge.
    ///
    /// The first evaluation leaves `Unknown` without an edge since there is
    /// no prior state to compare against.
    pub fn observe(&mut self, active: bool) -> Option<bool> {
        let next = ActivationState::from_active(active);
        let previous = std::mem::replace(&mut self.state, next);
        match previous {
            ActivationState::Unknown => None,
            prev if prev == next => None,
            _ => Some(active),
        }
    }
}
