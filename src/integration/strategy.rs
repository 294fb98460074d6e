use serde::{Deserialize, Serialize};
use std::fmt;

/// Transport binding used to reach a worker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InvocationStrategy {
    /// Call the worker in-line
    #[default]
    Direct,
    /// Publish to the target's queue; a consumer hands it to the worker
    Queued,
    /// Publish an invocation event; the target's bus subscriber answers it
    Event,
    /// Consume the worker's chunked response, collected into a JSON array
    Stream,
}

impl InvocationStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Queued => "queued",
            Self::Event => "event",
            Self::Stream => "stream",
        }
    }
}

impl fmt::Display for InvocationStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for InvocationStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "queued" => Ok(Self::Queued),
            "event" => Ok(Self::Event),
            "stream" => Ok(Self::Stream),
            _ => Err(format!("Invalid invocation strategy: {s}")),
        }
    }
}
