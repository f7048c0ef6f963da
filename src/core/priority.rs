//! Task priority levels
//!
//! Priorities only matter while a task waits in a pool's bounded queue:
//! a released worker is handed to the highest-priority waiter, FIFO within
//! one level.

use crate::core::{OrchestratorError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Task priority levels (higher number = higher priority)
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work
    Low = 1,
    /// Default for most tasks
    #[default]
    Normal = 5,
    /// Served ahead of normal work
    High = 8,
    /// Served first
    Critical = 10,
}

impl Priority {
    /// Get the numeric value of the priority
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Map an arbitrary ordinal to the nearest level at or below it
    ///
    /// Values under `Normal` are `Low`; values above `Critical` saturate.
    pub fn from_ordinal(value: i64) -> Self {
        match value {
            i64::MIN..=4 => Priority::Low,
            5..=7 => Priority::Normal,
            8..=9 => Priority::High,
            _ => Priority::Critical,
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = OrchestratorError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "low" => Ok(Priority::Low),
            "normal" => Ok(Priority::Normal),
            "high" => Ok(Priority::High),
            "critical" => Ok(Priority::Critical),
            other => other
                .parse::<i64>()
                .map(Priority::from_ordinal)
                .map_err(|_| OrchestratorError::invalid_task(format!("unknown priority '{}'", s))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_priority_ordering() {
        assert!(Priority::Critical > Priority::High);
        assert!(Priority::High > Priority::Normal);
        assert!(Priority::Normal > Priority::Low);
        assert_eq!(Priority::default(), Priority::Normal);
    }

    #[test]
    fn test_priority_values() {
        assert_eq!(Priority::Low.value(), 1);
        assert_eq!(Priority::Normal.value(), 5);
        assert_eq!(Priority::High.value(), 8);
        assert_eq!(Priority::Critical.value(), 10);
    }

    #[test]
    fn test_priority_parse() {
        assert_eq!("HIGH".parse::<Priority>().unwrap(), Priority::High);
        assert_eq!("10".parse::<Priority>().unwrap(), Priority::Critical);
        assert_eq!("6".parse::<Priority>().unwrap(), Priority::Normal);
        assert_eq!("0".parse::<Priority>().unwrap(), Priority::Low);
        assert!("urgent".parse::<Priority>().is_err());
    }
}
