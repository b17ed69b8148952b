//! Task type and resource profile.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::CoreError;

/// The closed set of task types Tasker knows how to execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskType {
    /// Sum two numbers.
    Sum,
    /// Current weather for a city (Open-Meteo).
    Weather,
    /// Single chat completion (OpenAI).
    #[serde(rename = "chatgpt")]
    ChatGpt,
}

impl TaskType {
    /// Every task type, in registration order.
    pub const ALL: [TaskType; 3] = [TaskType::Sum, TaskType::Weather, TaskType::ChatGpt];

    /// Wire name used in requests, records and metrics labels.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Sum => "sum",
            Self::Weather => "weather",
            Self::ChatGpt => "chatgpt",
        }
    }

    /// Resource profile of the type's handler.
    pub fn profile(&self) -> ResourceProfile {
        match self {
            Self::Sum => ResourceProfile::Cpu,
            Self::Weather | Self::ChatGpt => ResourceProfile::ExternalIo,
        }
    }
}

impl fmt::Display for TaskType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskType {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| CoreError::UnknownTaskType(s.to_owned()))
    }
}

/// What a handler spends its time on.
///
/// Handlers that only compute locally never share a queue with handlers
/// that call out to external services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceProfile {
    /// Local computation only.
    Cpu,
    /// Performs outbound network calls.
    ExternalIo,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_known_names() {
        assert_eq!("sum".parse::<TaskType>().unwrap(), TaskType::Sum);
        assert_eq!("weather".parse::<TaskType>().unwrap(), TaskType::Weather);
        assert_eq!("chatgpt".parse::<TaskType>().unwrap(), TaskType::ChatGpt);
    }

    #[test]
    fn test_parse_unknown_name() {
        assert_eq!(
            "invalid".parse::<TaskType>().unwrap_err(),
            CoreError::UnknownTaskType("invalid".to_string())
        );
    }

    #[test]
    fn test_serde_names_match_wire_names() {
        for t in TaskType::ALL {
            let json = serde_json::to_string(&t).unwrap();
            assert_eq!(json, format!("\"{}\"", t.as_str()));
        }
    }

    #[test]
    fn test_profiles() {
        assert_eq!(TaskType::Sum.profile(), ResourceProfile::Cpu);
        assert_eq!(TaskType::Weather.profile(), ResourceProfile::ExternalIo);
        assert_eq!(TaskType::ChatGpt.profile(), ResourceProfile::ExternalIo);
    }
}
