use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration as StdDuration;

use anyhow::{Context, bail};
use chrono::Duration;

use guildhall_engine::EngineConfig;
use guildhall_engine::matchmaking::MatchmakingPolicy;
use guildhall_engine::polls::PollPolicy;
use guildhall_engine::reminders::ReminderPolicy;
use guildhall_engine::retry::RetryPolicy;

const PLACEHOLDER_SECRETS: &[&str] = &["change-me-to-a-random-string", "dev-secret-change-me"];

#[derive(Debug, Clone)]
pub struct Config {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub jwt_secret: String,
    pub mm_interface: String,
    pub mm_lobby_target: String,
    pub mm_announce_target: String,
    pub mm_grace: Duration,
    pub mm_reminder_offsets: Vec<Duration>,
    pub mm_award_chance: u8,
    pub poll_sweep: StdDuration,
    pub webhook_url: Option<String>,
    pub sink_timeout: StdDuration,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build the config from any key lookup. Unset and empty values fall
    /// back to their defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

        let jwt_secret = var("GUILDHALL_JWT_SECRET").context("GUILDHALL_JWT_SECRET must be set")?;
        if PLACEHOLDER_SECRETS.contains(&jwt_secret.as_str()) {
            bail!("GUILDHALL_JWT_SECRET is still a placeholder, set a random secret");
        }

        let award_chance: u8 = parsed(&var, "GUILDHALL_MM_AWARD_CHANCE", 10)?;
        if award_chance > 100 {
            bail!("GUILDHALL_MM_AWARD_CHANCE must be a percentage, got {}", award_chance);
        }
        let sweep_secs: u64 = parsed(&var, "GUILDHALL_POLL_SWEEP_SECS", 60)?;
        let timeout_secs: u64 = parsed(&var, "GUILDHALL_SINK_TIMEOUT_SECS", 30)?;
        if timeout_secs == 0 {
            bail!("GUILDHALL_SINK_TIMEOUT_SECS must be at least 1");
        }

        Ok(Self {
            host: var("GUILDHALL_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parsed(&var, "GUILDHALL_PORT", 3000)?,
            db_path: PathBuf::from(
                var("GUILDHALL_DB_PATH").unwrap_or_else(|| "guildhall.db".into()),
            ),
            jwt_secret,
            mm_interface: var("GUILDHALL_MM_INTERFACE").unwrap_or_else(|| "gateway".into()),
            mm_lobby_target: var("GUILDHALL_MM_LOBBY_TARGET")
                .unwrap_or_else(|| "matchmaking".into()),
            mm_announce_target: var("GUILDHALL_MM_ANNOUNCE_TARGET")
                .unwrap_or_else(|| "general".into()),
            mm_grace: Duration::minutes(parsed(&var, "GUILDHALL_MM_GRACE_MINUTES", 30)?),
            mm_reminder_offsets: match var("GUILDHALL_MM_REMINDER_MINUTES") {
                Some(raw) => minute_list(&raw)?,
                None => vec![Duration::minutes(30), Duration::minutes(10), Duration::minutes(1)],
            },
            mm_award_chance: award_chance,
            poll_sweep: StdDuration::from_secs(sweep_secs.max(1)),
            webhook_url: var("GUILDHALL_WEBHOOK_URL"),
            sink_timeout: StdDuration::from_secs(timeout_secs),
        })
    }

    pub fn engine_config(&self) -> EngineConfig {
        let notify_retry = RetryPolicy::default().with_timeout(self.sink_timeout);
        EngineConfig {
            matchmaking: MatchmakingPolicy {
                default_interface: self.mm_interface.clone(),
                lobby_target: self.mm_lobby_target.clone(),
                announce_target: self.mm_announce_target.clone(),
                grace: self.mm_grace,
                reminder_offsets: self.mm_reminder_offsets.clone(),
                award_chance: self.mm_award_chance,
                ui_retry: RetryPolicy::interactive().with_timeout(self.sink_timeout),
                ..MatchmakingPolicy::default()
            },
            reminders: ReminderPolicy {
                retry: notify_retry.clone(),
                ..ReminderPolicy::default()
            },
            polls: PollPolicy {
                sweep_interval: self.poll_sweep,
            },
            notify_retry,
        }
    }
}

fn parsed<T, F>(var: &F, key: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("{} has an invalid value: {:?}", key, raw)),
        None => Ok(default),
    }
}

/// "30,10,1" -> offsets in minutes. Zero and negative entries are refused.
fn minute_list(raw: &str) -> anyhow::Result<Vec<Duration>> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            let minutes: i64 = s
                .parse()
                .with_context(|| format!("bad reminder offset {:?}", s))?;
            if minutes <= 0 {
                bail!("reminder offsets must be positive, got {}", minutes);
            }
            Ok(Duration::minutes(minutes))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> anyhow::Result<Config> {
        let vars: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        Config::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_apply_when_unset() {
        let cfg = config(&[("GUILDHALL_JWT_SECRET", "s3cret")]).unwrap();
        assert_eq!(cfg.port, 3000);
        assert_eq!(cfg.db_path, PathBuf::from("guildhall.db"));
        assert_eq!(cfg.mm_grace, Duration::minutes(30));
        assert_eq!(cfg.mm_reminder_offsets.len(), 3);
        assert_eq!(cfg.mm_award_chance, 10);
        assert!(cfg.webhook_url.is_none());

        let engine = cfg.engine_config();
        assert_eq!(engine.matchmaking.lobby_target, "matchmaking");
        assert_eq!(engine.polls.sweep_interval, StdDuration::from_secs(60));
    }

    #[test]
    fn secret_is_required_and_not_a_placeholder() {
        assert!(config(&[]).is_err());
        assert!(config(&[("GUILDHALL_JWT_SECRET", "dev-secret-change-me")]).is_err());
    }

    #[test]
    fn overrides_are_parsed() {
        let cfg = config(&[
            ("GUILDHALL_JWT_SECRET", "s3cret"),
            ("GUILDHALL_PORT", "8080"),
            ("GUILDHALL_MM_REMINDER_MINUTES", "60, 15"),
            ("GUILDHALL_MM_AWARD_CHANCE", "0"),
            ("GUILDHALL_POLL_SWEEP_SECS", "0"),
            ("GUILDHALL_SINK_TIMEOUT_SECS", "5"),
            ("GUILDHALL_WEBHOOK_URL", "http://127.0.0.1:9000/hook"),
        ])
        .unwrap();
        assert_eq!(cfg.port, 8080);
        assert_eq!(cfg.mm_reminder_offsets, vec![Duration::minutes(60), Duration::minutes(15)]);
        assert_eq!(cfg.mm_award_chance, 0);
        assert_eq!(cfg.poll_sweep, StdDuration::from_secs(1));
        assert_eq!(cfg.engine_config().notify_retry.timeout, StdDuration::from_secs(5));
        assert_eq!(cfg.webhook_url.as_deref(), Some("http://127.0.0.1:9000/hook"));
    }

    #[test]
    fn malformed_values_are_refused() {
        let secret = ("GUILDHALL_JWT_SECRET", "s3cret");
        assert!(config(&[secret, ("GUILDHALL_PORT", "eighty")]).is_err());
        assert!(config(&[secret, ("GUILDHALL_MM_REMINDER_MINUTES", "10,-1")]).is_err());
        assert!(config(&[secret, ("GUILDHALL_MM_AWARD_CHANCE", "150")]).is_err());
    }
}
