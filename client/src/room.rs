//! Room snapshot transitions that decide the mesh lifecycle

use shared::Room;

/// What the mesh has to do when the room snapshot changes
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MembershipTransition {
    /// Entered a room: start listening and track its members
    Enter,
    /// Left the room or the game ended: full reset
    Teardown,
    /// Moved straight to another room: full reset, then enter the new one
    Rejoin,
    /// Metadata update within the same room
    Unchanged,
}

impl MembershipTransition {
    pub fn between(previous: Option<&Room>, current: Option<&Room>) -> Self {
        match (previous, current) {
            (None, None) => MembershipTransition::Unchanged,
            (None, Some(_)) => MembershipTransition::Enter,
            (Some(_), None) => MembershipTransition::Teardown,
            (Some(previous), Some(current)) if previous.id != current.id => {
                MembershipTransition::Rejoin
            }
            (Some(previous), Some(current))
                if previous.is_game_started && !current.is_game_started =>
            {
                MembershipTransition::Teardown
            }
            (Some(_), Some(_)) => MembershipTransition::Unchanged,
        }
    }

    pub fn tears_down(self) -> bool {
        matches!(
            self,
            MembershipTransition::Teardown | MembershipTransition::Rejoin
        )
    }

    pub fn enters(self) -> bool {
        matches!(self, MembershipTransition::Enter | MembershipTransition::Rejoin)
    }
}
