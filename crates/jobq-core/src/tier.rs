use crate::DispatchError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Priority class of a job.
/// Lower numerical values are dispatched first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(u8)]
pub enum Tier {
    Enterprise = 0,
    Pro = 1,
    Indie = 2,
    Free = 3,
}

impl Tier {
    /// Every tier, highest priority first.
    pub const ALL: [Tier; 4] = [Tier::Enterprise, Tier::Pro, Tier::Indie, Tier::Free];

    /// Get the raw tier value
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Get the tier name
    pub fn as_str(&self) -> &'static str {
        match self {
            Tier::Enterprise => "enterprise",
            Tier::Pro => "pro",
            Tier::Indie => "indie",
            Tier::Free => "free",
        }
    }
}

impl Default for Tier {
    fn default() -> Self {
        Tier::Free
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl TryFrom<u8> for Tier {
    type Error = DispatchError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Tier::Enterprise),
            1 => Ok(Tier::Pro),
            2 => Ok(Tier::Indie),
            3 => Ok(Tier::Free),
            other => Err(DispatchError::InvalidJobSpec(format!(
                "tier {} out of range 0..=3",
                other
            ))),
        }
    }
}

impl From<Tier> for u8 {
    fn from(tier: Tier) -> Self {
        tier.value()
    }
}

impl FromStr for Tier {
    type Err = DispatchError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "enterprise" => Ok(Tier::Enterprise),
            "pro" => Ok(Tier::Pro),
            "indie" => Ok(Tier::Indie),
            "free" => Ok(Tier::Free),
            _ => Err(DispatchError::InvalidJobSpec(format!("unknown tier: {}", s))),
        }
    }
}
