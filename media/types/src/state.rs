use std::fmt;

use serde::Serialize;

/**
    Lifecycle state of a media source.

    A source only ever moves forward through these states:
    `Initializing` -> `Live` -> `Ended`. `Ended` is terminal.
*/
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceState {
    /// Container opened and probed, decoders not built yet.
    #[default]
    Initializing,
    /// Decoders built, the read loop is running.
    Live,
    /// Read loop finished or aborted, resources released.
    Ended,
}

impl SourceState {
    /**
        Returns true if moving from `self` to `next` respects the forward-only
        lifecycle. Staying in the same state is not a transition.
    */
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Initializing, Self::Live)
                | (Self::Initializing, Self::Ended)
                | (Self::Live, Self::Ended)
        )
    }

    pub const fn is_terminal(self) -> bool {
        matches!(self, Self::Ended)
    }
}

impl fmt::Display for SourceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Initializing => "initializing",
            Self::Live => "live",
            Self::Ended => "ended",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forward_transitions_only() {
        assert!(SourceState::Initializing.can_transition_to(SourceState::Live));
        assert!(SourceState::Live.can_transition_to(SourceState::Ended));
        assert!(!SourceState::Live.can_transition_to(SourceState::Initializing));
        assert!(!SourceState::Ended.can_transition_to(SourceState::Live));
        assert!(!SourceState::Ended.can_transition_to(SourceState::Ended));
    }

    #[test]
    fn ended_is_terminal() {
        assert!(SourceState::Ended.is_terminal());
        assert!(!SourceState::Live.is_terminal());
    }
}
