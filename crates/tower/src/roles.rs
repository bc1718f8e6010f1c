// SPDX-License-Identifier: BUSL-1.1
// Copyright (c) 2026 Alfred Jean LLC

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Session role. Determines the default supervision policy and whether a
/// session may degrade to a direct PTY when the sidecar fails to spawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Architect,
    Builder,
    Shell,
    Utility,
    File,
}

impl Role {
    /// Long-running agent roles are restarted when their child exits.
    pub fn default_supervised(&self) -> bool {
        matches!(self, Self::Architect | Self::Builder)
    }

    /// Supervised roles need a sidecar (restart goes through SPAWN), so
    /// they never fall back to a direct PTY.
    pub fn allows_degraded(&self) -> bool {
        matches!(self, Self::Shell | Self::Utility | Self::File)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Architect => "architect",
            Self::Builder => "builder",
            Self::Shell => "shell",
            Self::Utility => "utility",
            Self::File => "file",
        }
    }
}

impl FromStr for Role {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "architect" => Ok(Self::Architect),
            "builder" => Ok(Self::Builder),
            "shell" => Ok(Self::Shell),
            "utility" => Ok(Self::Utility),
            "file" => Ok(Self::File),
            other => Err(format!("unknown role: {other}")),
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
