use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ActionKind {
    Toggle,
    Open,
    Close,
    Reset,
    Restart,
}

impl ActionKind {
    pub const ALL: [ActionKind; 5] = [
        Self::Toggle,
        Self::Open,
        Self::Close,
        Self::Reset,
        Self::Restart,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Toggle => "TOGGLE",
            Self::Open => "OPEN",
            Self::Close => "CLOSE",
            Self::Reset => "RESET",
            Self::Restart => "RESTART",
        }
    }

    pub(crate) fn index(self) -> usize {
        match self {
            Self::Toggle => 0,
            Self::Open => 1,
            Self::Close => 2,
            Self::Reset => 3,
            Self::Restart => 4,
        }
    }
}

/// Wire shape of `/state` and every action route.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DoorState {
    pub open: bool,
}
