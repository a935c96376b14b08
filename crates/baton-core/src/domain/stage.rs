//! Stage names and routing targets.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Keyword for "no further stage" in routing tables.
pub const TERMINAL: &str = "terminal";

/// Keyword for "dispatch the same stage again" in failure routes.
pub const RETRY_SAME: &str = "retry-same";

/// Name of one step in the pipeline (e.g. `kyc`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StageName(String);

impl StageName {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Routing keywords cannot be used as stage names.
    pub fn is_reserved(&self) -> bool {
        self.0 == TERMINAL || self.0 == RETRY_SAME
    }
}

impl fmt::Display for StageName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl From<&str> for StageName {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// Where a task goes after a stage succeeds.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum SuccessRoute {
    Stage(StageName),
    /// The task is completed.
    Terminal,
}

/// Where a task goes after a stage fails.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum FailureRoute {
    Stage(StageName),
    /// The task is failed.
    Terminal,
    /// Dispatch the same stage again while attempts remain.
    RetrySame,
}

/// Error for a route string that is not usable in its position.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid route '{0}'")]
pub struct ParseRouteError(pub String);

impl SuccessRoute {
    pub fn stage(&self) -> Option<&StageName> {
        match self {
            Self::Stage(name) => Some(name),
            Self::Terminal => None,
        }
    }
}

impl FailureRoute {
    pub fn stage(&self) -> Option<&StageName> {
        match self {
            Self::Stage(name) => Some(name),
            Self::Terminal | Self::RetrySame => None,
        }
    }
}

impl FromStr for SuccessRoute {
    type Err = ParseRouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" | RETRY_SAME => Err(ParseRouteError(s.to_string())),
            TERMINAL => Ok(Self::Terminal),
            name => Ok(Self::Stage(StageName::new(name))),
        }
    }
}

impl FromStr for FailureRoute {
    type Err = ParseRouteError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "" => Err(ParseRouteError(s.to_string())),
            TERMINAL => Ok(Self::Terminal),
            RETRY_SAME => Ok(Self::RetrySame),
            name => Ok(Self::Stage(StageName::new(name))),
        }
    }
}

impl fmt::Display for SuccessRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(name) => name.fmt(f),
            Self::Terminal => f.write_str(TERMINAL),
        }
    }
}

impl fmt::Display for FailureRoute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Stage(name) => name.fmt(f),
            Self::Terminal => f.write_str(TERMINAL),
            Self::RetrySame => f.write_str(RETRY_SAME),
        }
    }
}
