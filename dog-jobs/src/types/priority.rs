use serde::{Deserialize, Serialize};

/// Priority tiers for dispatch ordering (higher values = dispatched first)
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobPriority {
    /// Dispatched only when no normal or high work is eligible
    Low = 1,

    /// Default tier
    #[default]
    Normal = 2,

    /// Always dispatched first
    High = 3,
}

impl JobPriority {
    /// All tiers in dispatch order (high to low)
    pub fn dispatch_order() -> &'static [JobPriority] {
        &[Self::High, Self::Normal, Self::Low]
    }

    /// Position of this tier in per-tier storage (0 = high)
    pub fn tier_index(self) -> usize {
        match self {
            Self::High => 0,
            Self::Normal => 1,
            Self::Low => 2,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Low => "low",
            Self::Normal => "normal",
            Self::High => "high",
        }
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::Low),
            "normal" => Ok(Self::Normal),
            "high" => Ok(Self::High),
            _ => Err(format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ordering_matches_dispatch_order() {
        assert!(JobPriority::High > JobPriority::Normal);
        assert!(JobPriority::Normal > JobPriority::Low);
        let order = JobPriority::dispatch_order();
        assert_eq!(order[0].tier_index(), 0);
        assert_eq!(order[2], JobPriority::Low);
    }

    #[test]
    fn parses_case_insensitively() {
        assert_eq!("HIGH".parse::<JobPriority>(), Ok(JobPriority::High));
        assert!("critical".parse::<JobPriority>().is_err());
    }
}
