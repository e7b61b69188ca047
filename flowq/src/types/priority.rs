use serde::{Deserialize, Serialize};

/// Numeric dispatch priority. Higher values dispatch first.
///
/// Any integer is accepted; the named levels are conveniences for producers
/// that do not need fine-grained scores.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobPriority(pub i64);

// Waiting order: (Reverse(priority), created_at, insertion sequence).
// Higher priority first, FIFO by creation time within the same priority.

impl JobPriority {
    pub const LOW: Self = Self(1);
    pub const NORMAL: Self = Self(5);
    pub const HIGH: Self = Self(10);
    pub const CRITICAL: Self = Self(100);

    /// Get the numeric value for ordering
    pub fn value(self) -> i64 {
        self.0
    }
}

impl Default for JobPriority {
    fn default() -> Self {
        Self::NORMAL
    }
}

impl From<i64> for JobPriority {
    fn from(value: i64) -> Self {
        Self(value)
    }
}

impl From<i32> for JobPriority {
    fn from(value: i32) -> Self {
        Self(value as i64)
    }
}

impl std::fmt::Display for JobPriority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobPriority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "low" => Ok(Self::LOW),
            "normal" => Ok(Self::NORMAL),
            "high" => Ok(Self::HIGH),
            "critical" => Ok(Self::CRITICAL),
            other => other
                .parse::<i64>()
                .map(Self)
                .map_err(|_| format!("Invalid priority: {}", s)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_named_levels_order() {
        assert!(JobPriority::CRITICAL > JobPriority::HIGH);
        assert!(JobPriority::HIGH > JobPriority::NORMAL);
        assert!(JobPriority::NORMAL > JobPriority::LOW);
    }

    #[test]
    fn test_parse_named_and_numeric() {
        assert_eq!("high".parse::<JobPriority>(), Ok(JobPriority::HIGH));
        assert_eq!("-3".parse::<JobPriority>(), Ok(JobPriority(-3)));
        assert!("soon".parse::<JobPriority>().is_err());
    }

    #[test]
    fn test_serializes_as_plain_number() {
        assert_eq!(serde_json::to_string(&JobPriority(9)).unwrap(), "9");
    }
}
