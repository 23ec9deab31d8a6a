//! Limiter options shared by every limiter variant, and window-key naming.

use serde::{Deserialize, Serialize};

use crate::error::{LimiterError, Result};

/// Default points per window.
pub const DEFAULT_POINTS: u64 = 4;
/// Default window duration in seconds.
pub const DEFAULT_DURATION_SECS: u64 = 1;
/// Default key prefix.
pub const DEFAULT_KEY_PREFIX: &str = "rlflx";

/// Configuration common to all limiters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimiterOptions {
    /// Maximum points per window
    #[serde(default = "default_points")]
    pub points: u64,

    /// Window duration in seconds, 0 for a window that never resets
    #[serde(default = "default_duration")]
    pub duration: u64,

    /// Seconds to block a key once it goes over limit, 0 disables blocking
    #[serde(default)]
    pub block_duration: u64,

    /// Spread allowed actions evenly over the window
    #[serde(default)]
    pub exec_evenly: bool,

    /// Lower bound for the even-spacing delay
    #[serde(default)]
    pub exec_evenly_min_delay_ms: u64,

    /// Prefix for window keys, empty to disable prefixing
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,

    /// Consumed points at which a key is blocked in process memory, 0 disables
    #[serde(default)]
    pub in_memory_block_on_consumed: u64,

    /// Seconds a key stays in the in-memory block cache
    #[serde(default)]
    pub in_memory_block_duration: u64,
}

impl Default for LimiterOptions {
    fn default() -> Self {
        Self {
            points: default_points(),
            duration: default_duration(),
            block_duration: 0,
            exec_evenly: false,
            exec_evenly_min_delay_ms: 0,
            key_prefix: default_key_prefix(),
            in_memory_block_on_consumed: 0,
            in_memory_block_duration: 0,
        }
    }
}

fn default_points() -> u64 {
    DEFAULT_POINTS
}

fn default_duration() -> u64 {
    DEFAULT_DURATION_SECS
}

fn default_key_prefix() -> String {
    DEFAULT_KEY_PREFIX.to_string()
}

impl LimiterOptions {
    /// Options with the given points and duration, defaults elsewhere.
    pub fn new(points: u64, duration: u64) -> Self {
        Self {
            points,
            duration,
            ..Self::default()
        }
    }

    /// Check the invariants every limiter relies on.
    pub fn validate(&self) -> Result<()> {
        if self.points == 0 {
            return Err(LimiterError::Config("points must be at least 1".to_string()));
        }
        if i64::try_from(self.points).is_err() {
            return Err(LimiterError::Config(format!("points ({}) is out of range", self.points)));
        }
        if self.in_memory_block_on_consumed > 0 && self.in_memory_block_on_consumed < self.points {
            return Err(LimiterError::Config(format!(
                "in_memory_block_on_consumed ({}) must be 0 or at least points ({})",
                self.in_memory_block_on_consumed, self.points
            )));
        }
        if self.in_memory_block_duration > 0 && self.in_memory_block_on_consumed == 0 {
            return Err(LimiterError::Config(
                "in_memory_block_duration requires in_memory_block_on_consumed to be set".to_string(),
            ));
        }
        Ok(())
    }

    /// Window duration in milliseconds.
    pub fn duration_ms(&self) -> u64 {
        self.duration.saturating_mul(1000)
    }

    /// Block duration in milliseconds.
    pub fn block_duration_ms(&self) -> u64 {
        self.block_duration.saturating_mul(1000)
    }

    /// In-memory block duration in milliseconds.
    pub fn in_memory_block_duration_ms(&self) -> u64 {
        self.in_memory_block_duration.saturating_mul(1000)
    }

    /// The window key for `key`.
    pub fn get_key(&self, key: &str) -> String {
        if self.key_prefix.is_empty() {
            key.to_string()
        } else {
            format!("{}:{}", self.key_prefix, key)
        }
    }

    /// Strip the prefix from a window key.
    pub fn parse_key<'a>(&self, rl_key: &'a str) -> &'a str {
        if self.key_prefix.is_empty() {
            return rl_key;
        }
        rl_key
            .strip_prefix(self.key_prefix.as_str())
            .and_then(|rest| rest.strip_prefix(':'))
            .unwrap_or(rl_key)
    }
}

/// Convert a point count for signed counter arithmetic.
pub(crate) fn signed_points(points: u64) -> Result<i64> {
    i64::try_from(points).map_err(|_| LimiterError::Config(format!("{} points is out of range", points)))
}

/// Per-call options passed through every verb.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallOptions {
    /// Window duration for records created by this call only.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_duration_ms: Option<u64>,
}

impl CallOptions {
    /// Options overriding the window duration of newly created records.
    pub fn with_custom_duration_ms(ms: u64) -> Self {
        Self {
            custom_duration_ms: Some(ms),
        }
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.custom_duration_ms.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let opts = LimiterOptions::default();
        assert_eq!(opts.points, 4);
        assert_eq!(opts.duration, 1);
        assert_eq!(opts.key_prefix, "rlflx");
        assert!(opts.validate().is_ok());
    }

    #[test]
    fn test_get_key_and_parse_key() {
        let opts = LimiterOptions::default();
        assert_eq!(opts.get_key("user:42"), "rlflx:user:42");
        assert_eq!(opts.parse_key("rlflx:user:42"), "user:42");

        let bare = LimiterOptions {
            key_prefix: String::new(),
            ..LimiterOptions::default()
        };
        assert_eq!(bare.get_key("10.0.0.1"), "10.0.0.1");
        assert_eq!(bare.parse_key("10.0.0.1"), "10.0.0.1");
    }

    #[test]
    fn test_validate_points() {
        let opts = LimiterOptions::new(0, 1);
        assert!(matches!(opts.validate(), Err(LimiterError::Config(_))));

        let opts = LimiterOptions::new(u64::MAX, 1);
        assert!(matches!(opts.validate(), Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_validate_in_memory_block() {
        let mut opts = LimiterOptions::new(5, 1);
        opts.in_memory_block_on_consumed = 3;
        assert!(matches!(opts.validate(), Err(LimiterError::Config(_))));

        opts.in_memory_block_on_consumed = 5;
        opts.in_memory_block_duration = 10;
        assert!(opts.validate().is_ok());

        opts.in_memory_block_on_consumed = 0;
        assert!(matches!(opts.validate(), Err(LimiterError::Config(_))));
    }

    #[test]
    fn test_durations_saturate() {
        let mut opts = LimiterOptions::new(1, u64::MAX);
        opts.block_duration = u64::MAX / 10;
        assert_eq!(opts.duration_ms(), u64::MAX);
        assert_eq!(opts.block_duration_ms(), u64::MAX);
    }

    #[test]
    fn test_from_yaml() {
        let yaml = r#"
points: 10
block_duration: 60
key_prefix: login
"#;
        let opts: LimiterOptions = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(opts.points, 10);
        assert_eq!(opts.duration, 1);
        assert_eq!(opts.block_duration_ms(), 60_000);
        assert_eq!(opts.key_prefix, "login");
    }
}
