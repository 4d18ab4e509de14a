//! Leveled messages emitted by long-running monitors.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer, de::Error as _};

/// Severity of a [`MonitorMessage`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MonitorLevel {
    #[default]
    Normal,
    Info,
    Warn,
    /// Terminal: the whole monitoring pipeline shuts down.
    Error,
}

impl MonitorLevel {
    const fn as_u8(self) -> u8 {
        match self {
            Self::Normal => 0,
            Self::Info => 1,
            Self::Warn => 2,
            Self::Error => 3,
        }
    }
}

impl TryFrom<u8> for MonitorLevel {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, u8> {
        match value {
            0 => Ok(MonitorLevel::Normal),
            1 => Ok(MonitorLevel::Info),
            2 => Ok(MonitorLevel::Warn),
            3 => Ok(MonitorLevel::Error),
            other => Err(other),
        }
    }
}

impl Serialize for MonitorLevel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for MonitorLevel {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Self::try_from(raw).map_err(|v| D::Error::custom(format!("unknown monitor level {v}")))
    }
}

/// A message from a monitor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MonitorMessage {
    pub level: MonitorLevel,
    pub message: String,
}

impl MonitorMessage {
    /// Create a message at `level`.
    #[must_use]
    pub fn new(level: MonitorLevel, message: impl Into<String>) -> Self {
        Self {
            level,
            message: message.into(),
        }
    }

    /// Create an informational message.
    #[must_use]
    pub fn info(message: impl Into<String>) -> Self {
        Self::new(MonitorLevel::Info, message)
    }

    /// Create a warning.
    #[must_use]
    pub fn warn(message: impl Into<String>) -> Self {
        Self::new(MonitorLevel::Warn, message)
    }

    /// Create a terminal error message.
    #[must_use]
    pub fn error(message: impl Into<String>) -> Self {
        Self::new(MonitorLevel::Error, message)
    }

    /// Whether this message should shut the pipeline down.
    #[must_use]
    pub fn is_error(&self) -> bool {
        self.level == MonitorLevel::Error
    }
}

impl fmt::Display for MonitorMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.level {
            MonitorLevel::Normal | MonitorLevel::Info => f.write_str(&self.message),
            MonitorLevel::Warn => write!(f, "Warning: {}", self.message),
            MonitorLevel::Error => write!(f, "Error: {}", self.message),
        }
    }
}
