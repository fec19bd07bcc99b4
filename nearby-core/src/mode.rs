//! Dual-role mode: which of the broadcaster and receiver roles are active.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// One side of a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Role {
    /// Advertises and streams the local profile to subscribers.
    Broadcaster,
    /// Scans, connects and drains remote profiles.
    Receiver,
}

impl Role {
    pub const fn mode(self) -> Mode {
        match self {
            Role::Broadcaster => Mode::BROADCASTING,
            Role::Receiver => Mode::RECEIVING,
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Broadcaster => f.write_str("broadcaster"),
            Role::Receiver => f.write_str("receiver"),
        }
    }
}

/// Set over {Broadcasting, Receiving}.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Mode {
    broadcasting: bool,
    receiving: bool,
}

impl Mode {
    pub const OFF: Mode = Mode {
        broadcasting: false,
        receiving: false,
    };
    pub const BROADCASTING: Mode = Mode {
        broadcasting: true,
        receiving: false,
    };
    pub const RECEIVING: Mode = Mode {
        broadcasting: false,
        receiving: true,
    };
    pub const DUPLEX: Mode = Mode {
        broadcasting: true,
        receiving: true,
    };

    pub const fn union(self, other: Mode) -> Mode {
        Mode {
            broadcasting: self.broadcasting || other.broadcasting,
            receiving: self.receiving || other.receiving,
        }
    }

    /// Members of `self` not in `other`.
    pub const fn difference(self, other: Mode) -> Mode {
        Mode {
            broadcasting: self.broadcasting && !other.broadcasting,
            receiving: self.receiving && !other.receiving,
        }
    }

    pub const fn intersection(self, other: Mode) -> Mode {
        Mode {
            broadcasting: self.broadcasting && other.broadcasting,
            receiving: self.receiving && other.receiving,
        }
    }

    pub const fn is_broadcasting(self) -> bool {
        self.broadcasting
    }

    pub const fn is_receiving(self) -> bool {
        self.receiving
    }

    pub const fn is_off(self) -> bool {
        !self.broadcasting && !self.receiving
    }

    pub const fn contains(self, role: Role) -> bool {
        match role {
            Role::Broadcaster => self.broadcasting,
            Role::Receiver => self.receiving,
        }
    }

    /// Active roles, broadcaster first.
    pub fn roles(self) -> impl Iterator<Item = Role> {
        [Role::Broadcaster, Role::Receiver]
            .into_iter()
            .filter(move |r| self.contains(*r))
    }

    fn name(self) -> &'static str {
        match (self.broadcasting, self.receiving) {
            (false, false) => "off",
            (true, false) => "broadcasting",
            (false, true) => "receiving",
            (true, true) => "duplex",
        }
    }
}

impl fmt::Display for Mode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Mode {
    type Err = ParseModeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "none" => Ok(Mode::OFF),
            "broadcasting" => Ok(Mode::BROADCASTING),
            "receiving" => Ok(Mode::RECEIVING),
            "duplex" => Ok(Mode::DUPLEX),
            _ => Err(ParseModeError(s.to_owned())),
        }
    }
}

impl TryFrom<String> for Mode {
    type Error = ParseModeError;

    fn try_from(s: String) -> Result<Self, Self::Error> {
        s.parse()
    }
}

impl From<Mode> for String {
    fn from(mode: Mode) -> Self {
        mode.name().to_owned()
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown mode {0:?} (expected off, broadcasting, receiving or duplex)")]
pub struct ParseModeError(String);
