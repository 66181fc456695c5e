use std::str::FromStr;

use anyhow::{Context, Result, anyhow, bail};
use chrono_tz::Tz;

use crate::audience::AudienceMode;

pub const DEFAULT_RETENTION_DAYS: i64 = 30;

pub struct SecretString(String);

impl SecretString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl std::fmt::Debug for SecretString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Display::fmt(self, f)
    }
}

/// Knobs shared by every function.
#[derive(Clone, Debug)]
pub struct Settings {
    pub time_zone: Tz,
    pub audience: AudienceMode,
    pub email_enabled: bool,
    /// Conditionally flip `isTriggered` before sending, so overlapping runs
    /// cannot both deliver the same group.
    pub claim_groups: bool,
    pub require_developer: bool,
    pub retention_days: i64,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            time_zone: Tz::UTC,
            audience: AudienceMode::AllUsers,
            email_enabled: false,
            claim_groups: true,
            require_developer: true,
            retention_days: DEFAULT_RETENTION_DAYS,
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let time_zone = match optional_var("CMMS_TIME_ZONE") {
            Some(tz) => Tz::from_str(&tz).map_err(|e| anyhow!("Invalid CMMS_TIME_ZONE {tz}: {e}"))?,
            None => defaults.time_zone,
        };

        let audience = match optional_var("CMMS_AUDIENCE") {
            Some(mode) => mode
                .parse::<AudienceMode>()
                .context("Invalid CMMS_AUDIENCE")?,
            None => defaults.audience,
        };

        let retention_days = match optional_var("CMMS_RETENTION_DAYS") {
            Some(days) => {
                let days: i64 = days
                    .parse()
                    .with_context(|| format!("Invalid CMMS_RETENTION_DAYS: {days}"))?;
                if days <= 0 {
                    bail!("CMMS_RETENTION_DAYS must be positive, got {days}");
                }
                days
            }
            None => defaults.retention_days,
        };

        Ok(Self {
            time_zone,
            audience,
            email_enabled: env_flag("CMMS_EMAIL_ENABLED", defaults.email_enabled)?,
            claim_groups: env_flag("CMMS_CLAIM_GROUPS", defaults.claim_groups)?,
            require_developer: env_flag("CMMS_REQUIRE_DEVELOPER", defaults.require_developer)?,
            retention_days,
        })
    }
}

#[derive(Debug)]
pub struct Config {
    pub service_account_key: SecretString,
    /// Falls back to the project of the service account when unset.
    pub project_id: Option<String>,
    pub settings: Settings,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let service_account_key = std::env::var("GOOGLE_SERVICE_ACCOUNT_KEY")
            .map(SecretString)
            .context("GOOGLE_SERVICE_ACCOUNT_KEY env var not set")?;

        Ok(Self {
            service_account_key,
            project_id: optional_var("FIREBASE_PROJECT_ID"),
            settings: Settings::from_env()?,
        })
    }
}

fn optional_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_flag(name: &str, default: bool) -> Result<bool> {
    match optional_var(name) {
        Some(value) => parse_flag(&value).with_context(|| format!("Invalid {name}")),
        None => Ok(default),
    }
}

fn parse_flag(value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("Expected a boolean, got {other}"),
    }
}
