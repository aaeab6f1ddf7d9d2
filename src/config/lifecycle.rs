//! Instance lifecycle and periodic scheduler configuration.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Instance lifecycle policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LifecycleConfig {
    /// Startup budget before an instance is marked Failed.
    pub startup_timeout_secs: u64,
    /// Delay between provider polls while an instance starts.
    pub monitor_poll_interval_ms: u64,
    /// Delete records of instances the provider no longer lists instead of
    /// marking them Terminated.
    pub remove_obsolete: bool,
    /// Terminal records are deleted by reconciliation after this long.
    pub terminal_retention_hours: u64,
    /// An operation token with no job behind it is released by
    /// reconciliation only once it is older than this.
    pub orphan_grace_secs: u64,
}

impl Default for LifecycleConfig {
    fn default() -> Self {
        Self {
            startup_timeout_secs: 600,
            monitor_poll_interval_ms: 10_000,
            remove_obsolete: false,
            terminal_retention_hours: 168,
            orphan_grace_secs: 120,
        }
    }
}

impl LifecycleConfig {
    /// Validate lifecycle configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.startup_timeout_secs == 0 {
            return Err("startup_timeout_secs must be greater than 0".into());
        }
        if self.monitor_poll_interval_ms == 0 {
            return Err("monitor_poll_interval_ms must be greater than 0".into());
        }
        Ok(())
    }

    /// Startup budget.
    #[must_use]
    pub const fn startup_timeout(&self) -> Duration {
        Duration::from_secs(self.startup_timeout_secs)
    }

    /// Monitor poll delay.
    #[must_use]
    pub const fn monitor_poll_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_poll_interval_ms)
    }

    /// Retention window for terminal records.
    #[must_use]
    pub const fn terminal_retention(&self) -> Duration {
        Duration::from_secs(self.terminal_retention_hours * 3600)
    }

    /// Minimum age of a token before reconciliation may release it.
    #[must_use]
    pub const fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }
}

/// Auto-stop scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AutoStopConfig {
    /// Run the scheduler at all.
    pub enabled: bool,
    /// Tick interval.
    pub interval_secs: u64,
    /// Idle time after which a running instance is stopped.
    pub idle_threshold_minutes: u64,
}

impl Default for AutoStopConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 300,
            idle_threshold_minutes: 20,
        }
    }
}

/// Spot migration scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MigrationConfig {
    /// Run the scheduler at all.
    pub enabled: bool,
    /// Tick interval.
    pub interval_secs: u64,
    /// Minimum time between migration attempts for one instance.
    pub min_interval_secs: u64,
    /// Expiry of the cooldown record.
    pub cooldown_ttl_secs: u64,
}

impl Default for MigrationConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 900,
            min_interval_secs: 3_600,
            cooldown_ttl_secs: 3 * 24 * 3_600,
        }
    }
}

/// Reconciliation and job purge scheduler.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MaintenanceConfig {
    /// Run the scheduler at all.
    pub enabled: bool,
    /// Tick interval.
    pub interval_secs: u64,
}

impl Default for MaintenanceConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: 600,
        }
    }
}

/// All periodic schedulers.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulersConfig {
    /// Auto-stop settings.
    pub auto_stop: AutoStopConfig,
    /// Migration settings.
    pub migration: MigrationConfig,
    /// Maintenance settings.
    pub maintenance: MaintenanceConfig,
    /// Budget for a single tick; a tick that overruns is abandoned.
    pub run_timeout_secs: u64,
}

impl Default for SchedulersConfig {
    fn default() -> Self {
        Self {
            auto_stop: AutoStopConfig::default(),
            migration: MigrationConfig::default(),
            maintenance: MaintenanceConfig::default(),
            run_timeout_secs: 120,
        }
    }
}

impl SchedulersConfig {
    /// Validate scheduler configuration values.
    pub fn validate(&self) -> Result<(), String> {
        if self.run_timeout_secs == 0 {
            return Err("run_timeout_secs must be greater than 0".into());
        }
        for (name, interval) in [
            ("auto_stop", self.auto_stop.interval_secs),
            ("migration", self.migration.interval_secs),
            ("maintenance", self.maintenance.interval_secs),
        ] {
            if interval == 0 {
                return Err(format!("{name}.interval_secs must be greater than 0"));
            }
        }
        if self.auto_stop.idle_threshold_minutes == 0 {
            return Err("auto_stop.idle_threshold_minutes must be greater than 0".into());
        }
        Ok(())
    }
}
