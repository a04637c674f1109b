use serde::{Deserialize, Serialize};
use std::fmt;

/// The lifecycle phases a task is driven through, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    BeforeForm,
    AfterForm,
    Invoke,
    Setup,
    BuildCommands,
    SaveResults,
}

impl Phase {
    pub const ALL: [Phase; 6] = [
        Phase::BeforeForm,
        Phase::AfterForm,
        Phase::Invoke,
        Phase::Setup,
        Phase::BuildCommands,
        Phase::SaveResults,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::BeforeForm => "before_form",
            Self::AfterForm => "after_form",
            Self::Invoke => "invoke",
            Self::Setup => "setup",
            Self::BuildCommands => "build_commands",
            Self::SaveResults => "save_results",
        }
    }

    pub fn previous(self) -> Option<Phase> {
        match self {
            Self::BeforeForm => None,
            Self::AfterForm => Some(Self::BeforeForm),
            Self::Invoke => Some(Self::AfterForm),
            Self::Setup => Some(Self::Invoke),
            Self::BuildCommands => Some(Self::Setup),
            Self::SaveResults => Some(Self::BuildCommands),
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
