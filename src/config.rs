// ABOUTME: Resolved engine configuration with defaults and load-time validation.
// ABOUTME: Raw formats are parsed by the embedding layer; durations are seconds.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::agent::{AgentSpec, Role, default_agents};
use crate::coordinator::{RateLimitTable, default_rate_limits};
use crate::error::ConfigError;
use crate::source::CandidateFilter;

/// Serde codec for `Duration` as (fractional) seconds.
pub mod secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_f64(value.as_secs_f64())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Duration::try_from_secs_f64(secs).map_err(serde::de::Error::custom)
    }
}

/// Backoff schedule for restarting failed resident agents.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RestartBackoff {
    #[serde(with = "secs")]
    pub initial: Duration,
    #[serde(with = "secs")]
    pub max: Duration,
    /// Restart attempts before giving up; zero disables restarts.
    pub max_attempts: u32,
}

impl Default for RestartBackoff {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(60),
            max_attempts: 5,
        }
    }
}

impl RestartBackoff {
    /// Delay before the given one-based attempt: doubling, capped at `max`.
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u32.saturating_pow(attempt.saturating_sub(1));
        self.initial.saturating_mul(factor).min(self.max)
    }
}

/// Engine configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Gap between poll cycles.
    #[serde(with = "secs")]
    pub poll_interval: Duration,

    /// Lease granted with each claim.
    #[serde(with = "secs")]
    pub lease_duration: Duration,

    /// Attempts per phase before the run fails.
    pub max_retries: u32,

    /// Runs allowed in flight at once.
    pub max_concurrent_runs: usize,

    pub rate_limits: RateLimitTable,

    /// Deferrals longer than this are treated as rejections.
    #[serde(with = "secs")]
    pub max_defer: Duration,

    /// How long an on-demand agent may sit idle before it is stopped.
    #[serde(with = "secs")]
    pub idle_timeout: Duration,

    /// Upper bound on a single generation call.
    #[serde(with = "secs")]
    pub generate_timeout: Duration,

    pub restart_backoff: RestartBackoff,

    pub agents: Vec<AgentSpec>,

    /// Which items are candidates, and when a claim must be given up.
    pub trigger: CandidateFilter,

    /// Post a comment when an item is claimed.
    pub acknowledge_claims: bool,

    /// Identity used for the poller's own writes.
    pub actor: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_secs(60),
            lease_duration: Duration::from_secs(600),
            max_retries: 3,
            max_concurrent_runs: 2,
            rate_limits: default_rate_limits(),
            max_defer: Duration::from_secs(300),
            idle_timeout: Duration::from_secs(300),
            generate_timeout: Duration::from_secs(480),
            restart_backoff: RestartBackoff::default(),
            agents: default_agents(),
            trigger: CandidateFilter::default(),
            acknowledge_claims: true,
            actor: "fixloop".to_string(),
        }
    }
}

impl Config {
    /// Check the configuration for values the engine cannot run with.
    pub fn validate(&self) -> Result<(), ConfigError> {
        positive("poll_interval", self.poll_interval)?;
        positive("lease_duration", self.lease_duration)?;
        positive("generate_timeout", self.generate_timeout)?;
        positive("restart_backoff.initial", self.restart_backoff.initial)?;

        // A single call or deferral must fit inside one lease.
        if self.generate_timeout >= self.lease_duration {
            return Err(invalid("generate_timeout", "must be shorter than lease_duration"));
        }
        if self.max_defer >= self.lease_duration {
            return Err(invalid("max_defer", "must be shorter than lease_duration"));
        }

        if self.max_retries == 0 {
            return Err(invalid("max_retries", "must be at least 1"));
        }
        if self.max_concurrent_runs == 0 {
            return Err(invalid("max_concurrent_runs", "must be at least 1"));
        }
        if self.actor.trim().is_empty() {
            return Err(invalid("actor", "must not be empty"));
        }

        for (kind, limits) in &self.rate_limits {
            for window in &limits.windows {
                if window.limit == 0 {
                    return Err(ConfigError::RateLimit {
                        kind: *kind,
                        reason: "window limit must be at least 1".to_string(),
                    });
                }
                if window.period.is_zero() {
                    return Err(ConfigError::RateLimit {
                        kind: *kind,
                        reason: "window period must be positive".to_string(),
                    });
                }
            }
        }

        if self.trigger.trigger_labels.is_empty() {
            return Err(invalid("trigger.trigger_labels", "must not be empty"));
        }
        for pattern in self
            .trigger
            .trigger_labels
            .iter()
            .chain(&self.trigger.exclude_labels)
        {
            glob::Pattern::new(pattern).map_err(|e| ConfigError::Pattern {
                pattern: pattern.clone(),
                reason: e.to_string(),
            })?;
        }

        validate_agents(&self.agents)
    }
}

/// Every agent id unique, every role served by exactly one agent.
pub fn validate_agents(agents: &[AgentSpec]) -> Result<(), ConfigError> {
    let mut ids = HashSet::new();
    let mut roles: HashMap<Role, &str> = HashMap::new();

    for spec in agents {
        if spec.agent_id.trim().is_empty() {
            return Err(invalid("agents.agent_id", "must not be empty"));
        }
        if !ids.insert(spec.agent_id.as_str()) {
            return Err(ConfigError::DuplicateAgent(spec.agent_id.clone()));
        }
        if roles.insert(spec.role, &spec.agent_id).is_some() {
            return Err(ConfigError::DuplicateRole(spec.role));
        }
    }

    match Role::ALL.iter().find(|role| !roles.contains_key(*role)) {
        Some(role) => Err(ConfigError::UnmappedRole(*role)),
        None => Ok(()),
    }
}

fn positive(field: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(invalid(field, "must be positive"));
    }
    Ok(())
}

fn invalid(field: &'static str, reason: &str) -> ConfigError {
    ConfigError::Invalid {
        field,
        reason: reason.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agent::LifecycleStrategy;
    use crate::coordinator::OperationKind;

    #[test]
    fn test_default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn test_deserialize_partial_config() {
        let config: Config = serde_json::from_str(
            r#"{
                "poll_interval": 30,
                "lease_duration": 900.5,
                "max_retries": 5,
                "agents": [
                    {"agent_id": "plan", "role": "planner"},
                    {"agent_id": "dev", "role": "developer"},
                    {"agent_id": "rev", "role": "reviewer", "strategy": "always_on"}
                ],
                "trigger": {"trigger_labels": ["bot:*"]}
            }"#,
        )
        .unwrap();

        assert_eq!(config.poll_interval, Duration::from_secs(30));
        assert_eq!(config.lease_duration, Duration::from_millis(900_500));
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.max_concurrent_runs, 2);
        assert_eq!(config.agents[2].strategy, Some(LifecycleStrategy::AlwaysOn));
        assert_eq!(config.trigger.trigger_labels, vec!["bot:*"]);
        assert_eq!(config.trigger.exclude_labels, vec!["wontfix", "blocked"]);
        config.validate().unwrap();
    }

    #[test]
    fn test_deserialize_rate_limits() {
        let config: Config = serde_json::from_str(
            r#"{
                "rate_limits": {
                    "comment": {
                        "windows": [
                            {"limit": 3, "period": 60},
                            {"limit": 200, "period": 86400, "kind": "fixed"}
                        ],
                        "cooldown": 20
                    }
                }
            }"#,
        )
        .unwrap();

        let comment = &config.rate_limits[&OperationKind::Comment];
        assert_eq!(comment.windows.len(), 2);
        assert_eq!(comment.cooldown, Duration::from_secs(20));
        assert!(!config.rate_limits.contains_key(&OperationKind::Publish));
    }

    #[test]
    fn test_negative_duration_rejected() {
        let result = serde_json::from_str::<Config>(r#"{"poll_interval": -1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_zero_retries_rejected() {
        let config = Config {
            max_retries: 0,
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "max_retries",
                ..
            })
        ));
    }

    #[test]
    fn test_waits_longer_than_lease_rejected() {
        let config = Config {
            generate_timeout: Duration::from_secs(900),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "generate_timeout",
                ..
            })
        ));

        let config = Config {
            max_defer: Duration::from_secs(600),
            ..Config::default()
        };
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid {
                field: "max_defer",
                ..
            })
        ));
    }

    #[test]
    fn test_zero_window_limit_rejected() {
        let mut config = Config::default();
        config
            .rate_limits
            .get_mut(&OperationKind::Publish)
            .unwrap()
            .windows[0]
            .limit = 0;
        assert!(matches!(
            config.validate(),
            Err(ConfigError::RateLimit {
                kind: OperationKind::Publish,
                ..
            })
        ));
    }

    #[test]
    fn test_bad_label_pattern_rejected() {
        let mut config = Config::default();
        config.trigger.exclude_labels.push("[oops".into());
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Pattern { .. })
        ));
    }

    #[test]
    fn test_duplicate_agent_id_rejected() {
        let agents = vec![
            AgentSpec::new("a", Role::Planner),
            AgentSpec::new("a", Role::Developer),
            AgentSpec::new("b", Role::Reviewer),
        ];
        assert!(matches!(
            validate_agents(&agents),
            Err(ConfigError::DuplicateAgent(id)) if id == "a"
        ));
    }

    #[test]
    fn test_role_mapped_twice_rejected() {
        let agents = vec![
            AgentSpec::new("a", Role::Planner),
            AgentSpec::new("b", Role::Planner),
        ];
        assert!(matches!(
            validate_agents(&agents),
            Err(ConfigError::DuplicateRole(Role::Planner))
        ));
    }

    #[test]
    fn test_unmapped_role_rejected() {
        let agents = vec![
            AgentSpec::new("a", Role::Planner),
            AgentSpec::new("b", Role::Developer),
        ];
        assert!(matches!(
            validate_agents(&agents),
            Err(ConfigError::UnmappedRole(Role::Reviewer))
        ));
    }

    #[test]
    fn test_restart_backoff_doubles_and_caps() {
        let backoff = RestartBackoff {
            initial: Duration::from_secs(1),
            max: Duration::from_secs(10),
            max_attempts: 6,
        };
        let delays: Vec<u64> = (1..=6).map(|a| backoff.delay(a).as_secs()).collect();
        assert_eq!(delays, vec![1, 2, 4, 8, 10, 10]);
    }
}
