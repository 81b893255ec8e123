//! Handoff configuration from environment variables.
//!
//! # Environment Variables
//!
//! - `MOLT_PROFILE`: platform profile (`posix` or `reduced`). Default: `posix`
//! - `MOLT_SIGNAL_QUEUE`: pending signal notifications kept. Default: `2`
//!
//! Running a service without the fork primitive:
//! ```bash
//! MOLT_PROFILE=reduced ./my-service
//! ```

use tracing::{info, warn};

use crate::platform::Profile;

pub const PROFILE_VAR: &str = "MOLT_PROFILE";
pub const SIGNAL_QUEUE_VAR: &str = "MOLT_SIGNAL_QUEUE";

/// Default capacity of the signal queue.
pub const DEFAULT_SIGNAL_QUEUE: usize = 2;

/// Settings the controller starts from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HandoffConfig {
    /// Platform profile, selects the signal set and launch primitives.
    pub profile: Profile,
    /// Capacity of the signal queue.
    pub queue_capacity: usize,
}

impl Default for HandoffConfig {
    fn default() -> Self {
        Self {
            profile: Profile::default(),
            queue_capacity: DEFAULT_SIGNAL_QUEUE,
        }
    }
}

impl HandoffConfig {
    /// Load configuration from environment variables.
    ///
    /// Unparseable values fall back to the defaults with a warning.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let profile = match lookup(PROFILE_VAR) {
            None => Profile::default(),
            Some(value) => Profile::parse(&value).unwrap_or_else(|| {
                warn!(value = %value, "Unknown {PROFILE_VAR}, using default");
                Profile::default()
            }),
        };

        let queue_capacity = match lookup(SIGNAL_QUEUE_VAR) {
            None => DEFAULT_SIGNAL_QUEUE,
            Some(value) => match value.trim().parse::<usize>() {
                Ok(capacity) if capacity > 0 => capacity,
                _ => {
                    warn!(value = %value, "Invalid {SIGNAL_QUEUE_VAR}, using default");
                    DEFAULT_SIGNAL_QUEUE
                }
            },
        };

        Self {
            profile,
            queue_capacity,
        }
    }

    /// Log the effective configuration.
    pub fn log_config(&self) {
        info!(
            profile = %self.profile,
            queue_capacity = self.queue_capacity,
            "Handoff configuration"
        );
        if self.profile == Profile::Reduced {
            info!("Fork-exec handoff: disabled (reduced profile)");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(vars: &[(&str, &str)]) -> HandoffConfig {
        let vars: HashMap<&str, &str> = vars.iter().copied().collect();
        HandoffConfig::from_lookup(|key| vars.get(key).map(|v| v.to_string()))
    }

    #[test]
    fn test_defaults() {
        assert_eq!(config(&[]), HandoffConfig::default());
        assert_eq!(HandoffConfig::default().queue_capacity, 2);
        assert_eq!(HandoffConfig::default().profile, Profile::Posix);
    }

    #[test]
    fn test_reads_profile_and_capacity() {
        let config = config(&[(PROFILE_VAR, "REDUCED"), (SIGNAL_QUEUE_VAR, " 8 ")]);
        assert_eq!(config.profile, Profile::Reduced);
        assert_eq!(config.queue_capacity, 8);
    }

    #[test]
    fn test_invalid_values_fall_back() {
        let config = config(&[(PROFILE_VAR, "windows"), (SIGNAL_QUEUE_VAR, "0")]);
        assert_eq!(config, HandoffConfig::default());
        assert_eq!(
            self::config(&[(SIGNAL_QUEUE_VAR, "lots")]).queue_capacity,
            DEFAULT_SIGNAL_QUEUE
        );
    }
}
