//! Typed device commands.
//!
//! A [`CommandKind`] is the verb plus its typed parameters and serializes
//! directly to the board's `{command, parameters}` wire object. Legacy
//! colon-separated strings (`LED:COLOR:FFD700`) are decoded once, at the
//! boundary, through [`std::str::FromStr`].

use std::collections::VecDeque;
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;

use crate::error::Error;
use crate::error::Result;

pub const DEFAULT_TIMEOUT_MS: u64 = 5_000;
pub const DEFAULT_RETRIES: u32 = 3;
pub const DEFAULT_PRIORITY: u8 = 5;
pub const MAX_PRIORITY: u8 = 10;

/// An RGB color normalized to `#RRGGBB`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    /// Accepts `RRGGBB` or `#RRGGBB`, any case.
    pub fn parse(s: &str) -> Result<Self> {
        let hex = s.trim().trim_start_matches('#');
        if hex.len() != 6 || !hex.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::validation("color", format!("'{}' is not a hex color", s)));
        }
        Ok(Self(format!("#{}", hex.to_ascii_uppercase())))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for Color {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        Self::parse(&value)
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Display for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// The verb and parameters understood by the LED boards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "command", content = "parameters", rename_all = "snake_case")]
pub enum CommandKind {
    Ping,
    Reset,
    AllOn,
    AllOff,
    /// Brightness in percent (0-100)
    Brightness { level: u8 },
    SolidColor { color: Color },
    Animation {
        name: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        speed: Option<f32>,
    },
    WinnerSpotlight {
        entity_id: u32,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        color: Option<Color>,
    },
    /// A named firmware mode (e.g. `chaos_mode`)
    Mode { name: String },
    EmergencyStop { immediate: bool },
}

impl CommandKind {
    pub fn animation(name: impl Into<String>) -> Self {
        Self::Animation {
            name: name.into(),
            speed: None,
        }
    }

    /// The wire verb
    pub fn verb(&self) -> &'static str {
        match self {
            CommandKind::Ping => "ping",
            CommandKind::Reset => "reset",
            CommandKind::AllOn => "all_on",
            CommandKind::AllOff => "all_off",
            CommandKind::Brightness { .. } => "brightness",
            CommandKind::SolidColor { .. } => "solid_color",
            CommandKind::Animation { .. } => "animation",
            CommandKind::WinnerSpotlight { .. } => "winner_spotlight",
            CommandKind::Mode { .. } => "mode",
            CommandKind::EmergencyStop { .. } => "emergency_stop",
        }
    }

    pub fn validate(&self) -> Result<()> {
        match self {
            CommandKind::Brightness { level } if *level > 100 => Err(Error::validation(
                "level",
                format!("brightness {} exceeds 100", level),
            )),
            CommandKind::Animation { name, speed } => {
                validate_name("name", name)?;
                match speed {
                    Some(s) if !s.is_finite() || *s <= 0.0 => {
                        Err(Error::validation("speed", "must be a positive number"))
                    }
                    _ => Ok(()),
                }
            }
            CommandKind::Mode { name } => validate_name("name", name),
            _ => Ok(()),
        }
    }
}

fn validate_name(field: &str, name: &str) -> Result<()> {
    if name.is_empty()
        || !name
            .chars()
            .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
    {
        return Err(Error::validation(
            field,
            format!("'{}' must be lowercase letters, digits, or underscores", name),
        ));
    }
    Ok(())
}

impl FromStr for CommandKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let parts: Vec<&str> = s.trim().split(':').collect();
        let bad = || Error::validation("command", format!("unrecognized command '{}'", s));
        let kind = match parts.as_slice() {
            ["PING"] => CommandKind::Ping,
            ["RESET"] => CommandKind::Reset,
            ["EMERGENCY_STOP"] => CommandKind::EmergencyStop { immediate: true },
            ["LED", "ALL_ON"] => CommandKind::AllOn,
            ["LED", "ALL_OFF"] => CommandKind::AllOff,
            ["LED", "BRIGHTNESS", level] => CommandKind::Brightness {
                level: level.parse().map_err(|_| bad())?,
            },
            ["LED", "COLOR", hex] => CommandKind::SolidColor {
                color: Color::parse(hex)?,
            },
            ["ANIMATION", "WINNER_SPOTLIGHT", id] => CommandKind::WinnerSpotlight {
                entity_id: id.parse().map_err(|_| bad())?,
                color: None,
            },
            ["ANIMATION", name] => CommandKind::animation(name.to_ascii_lowercase()),
            ["MODE", name] => CommandKind::Mode {
                name: name.to_ascii_lowercase(),
            },
            _ => return Err(bad()),
        };
        kind.validate()?;
        Ok(kind)
    }
}

/// A command plus delivery metadata. Immutable once constructed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Command {
    pub kind: CommandKind,
    pub timeout_ms: u64,
    /// Advisory retry budget; honored only by [`super::retry::Retrying`]
    pub retries: u32,
    /// 0-10, higher runs first
    pub priority: u8,
    pub created_at: DateTime<Utc>,
}

impl Command {
    pub fn new(kind: CommandKind) -> Self {
        Self {
            kind,
            timeout_ms: DEFAULT_TIMEOUT_MS,
            retries: DEFAULT_RETRIES,
            priority: DEFAULT_PRIORITY,
            created_at: Utc::now(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout_ms = timeout.as_millis() as u64;
        self
    }

    pub fn with_priority(mut self, priority: u8) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = retries;
        self
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn verb(&self) -> &'static str {
        self.kind.verb()
    }

    pub fn validate(&self) -> Result<()> {
        if self.priority > MAX_PRIORITY {
            return Err(Error::validation(
                "priority",
                format!("{} exceeds {}", self.priority, MAX_PRIORITY),
            ));
        }
        if self.timeout_ms == 0 {
            return Err(Error::validation("timeout_ms", "must be positive"));
        }
        self.kind.validate()
    }
}

/// Pending commands for one device: priority-descending, FIFO within a priority.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct CommandQueue {
    items: VecDeque<Command>,
}

impl CommandQueue {
    pub fn push(&mut self, command: Command) {
        let at = self
            .items
            .iter()
            .position(|c| c.priority < command.priority)
            .unwrap_or(self.items.len());
        self.items.insert(at, command);
    }

    pub fn pop(&mut self) -> Option<Command> {
        self.items.pop_front()
    }

    /// Empty the queue, returning how many commands were dropped
    pub fn clear(&mut self) -> usize {
        let n = self.items.len();
        self.items.clear();
        n
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

/// Classification of a single dispatch attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum::Display)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum CommandStatus {
    Success,
    /// The device answered with an error or an unusable reply
    Failed,
    Timeout,
    DeviceOffline,
    InvalidCommand,
    /// No such device in the registry
    NotFound,
}

/// Result of one dispatch attempt against one device.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CommandOutcome {
    pub device_id: String,
    pub command: String,
    pub status: CommandStatus,
    pub message: String,
    #[serde(default)]
    pub data: Option<serde_json::Value>,
    /// Seconds
    pub response_time: f64,
    #[serde(default)]
    pub http_status: Option<u16>,
    /// [`Error::code`] of the failure; absent on success
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl CommandOutcome {
    pub(crate) fn refused(
        device_id: &str,
        command: &Command,
        status: CommandStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            device_id: device_id.to_string(),
            command: command.verb().to_string(),
            status,
            message: message.into(),
            data: None,
            response_time: 0.0,
            http_status: None,
            code: None,
        }
        .with_code()
    }

    /// Fill in `code` from the current status
    pub(crate) fn with_code(mut self) -> Self {
        self.code = self.error().map(|e| e.code().to_string());
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == CommandStatus::Success
    }

    /// The failure as an [`Error`], or `None` on success
    pub fn error(&self) -> Option<Error> {
        let device_id = self.device_id.clone();
        let message = self.message.clone();
        match self.status {
            CommandStatus::Success => None,
            CommandStatus::NotFound => Some(Error::not_found("device", device_id)),
            CommandStatus::InvalidCommand => Some(Error::validation("command", message)),
            CommandStatus::Timeout | CommandStatus::DeviceOffline => {
                Some(Error::Unreachable { device_id, message })
            }
            CommandStatus::Failed => Some(Error::DeviceReported { device_id, message }),
        }
    }

    pub fn into_result(self) -> Result<CommandOutcome> {
        match self.error() {
            Some(e) => Err(e),
            None => Ok(self),
        }
    }
}
