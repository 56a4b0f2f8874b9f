use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use dimload_utils::error::Error;

/// How a run was started.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerMode {
    Manual,
    Scheduled,
    Recovery,
}

impl TriggerMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerMode::Manual => "manual",
            TriggerMode::Scheduled => "scheduled",
            TriggerMode::Recovery => "recovery",
        }
    }
}

impl FromStr for TriggerMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "manual" => Ok(TriggerMode::Manual),
            "scheduled" => Ok(TriggerMode::Scheduled),
            "recovery" => Ok(TriggerMode::Recovery),
            other => Err(Error::Configuration(format!("unknown trigger mode '{other}'"))),
        }
    }
}

impl fmt::Display for TriggerMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What caused a scheduled trigger.
#[derive(Debug, Clone, PartialEq)]
pub enum Trigger {
    /// Fired on a fixed interval
    Interval(Duration),
    /// Fired once when the engine starts
    Startup,
}

/// An event delivered to the engine loop.
#[derive(Debug, Clone)]
pub struct TriggerEvent {
    /// Checkpoint environment the run is for
    pub environment: String,
    pub trigger: Trigger,
}

impl TriggerEvent {
    pub fn mode(&self) -> TriggerMode {
        TriggerMode::Scheduled
    }
}
