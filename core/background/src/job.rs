//! Job classes, their scheduling policies and scheduling requests.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use fitsync_common::duration::millis;
use fitsync_common::Error;

/// A named recurring unit of background work.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobClass {
    /// Incremental sync.
    Sync,
    /// Full sync.
    DataSync,
    /// Local housekeeping.
    Maintenance,
    /// Refresh of locally scheduled notifications.
    NotificationRefresh,
}

impl JobClass {
    pub const ALL: [JobClass; 4] = [
        JobClass::Sync,
        JobClass::DataSync,
        JobClass::Maintenance,
        JobClass::NotificationRefresh,
    ];

    /// Identifier registered with the OS.
    pub fn job_id(&self) -> &'static str {
        match self {
            JobClass::Sync => "sync",
            JobClass::DataSync => "data-sync",
            JobClass::Maintenance => "maintenance",
            JobClass::NotificationRefresh => "notification-refresh",
        }
    }

    /// Cadence and requirements used when none are configured.
    pub fn default_policy(&self) -> JobPolicy {
        match self {
            JobClass::Sync => JobPolicy {
                cadence: Duration::from_secs(15 * 60),
                requires_network: true,
                requires_power: false,
                budget: Duration::from_secs(30),
            },
            JobClass::DataSync => JobPolicy {
                cadence: Duration::from_secs(60 * 60),
                requires_network: true,
                requires_power: true,
                budget: Duration::from_secs(5 * 60),
            },
            JobClass::Maintenance => JobPolicy {
                cadence: Duration::from_secs(24 * 60 * 60),
                requires_network: false,
                requires_power: true,
                budget: Duration::from_secs(2 * 60),
            },
            JobClass::NotificationRefresh => JobPolicy {
                cadence: Duration::from_secs(60 * 60),
                requires_network: false,
                requires_power: false,
                budget: Duration::from_secs(30),
            },
        }
    }
}

impl fmt::Display for JobClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.job_id())
    }
}

impl FromStr for JobClass {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobClass::ALL
            .into_iter()
            .find(|class| class.job_id() == s)
            .ok_or_else(|| Error::InvalidInput(format!("Unknown job class: {}", s)))
    }
}

/// When and under which conditions a job class may run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPolicy {
    /// Minimum time between the end of one run and the start of the next.
    #[serde(with = "millis")]
    pub cadence: Duration,
    pub requires_network: bool,
    pub requires_power: bool,
    /// Advisory execution budget; the OS may grant less.
    #[serde(with = "millis")]
    pub budget: Duration,
}

impl JobPolicy {
    pub fn with_cadence(mut self, cadence: Duration) -> Self {
        self.cadence = cadence;
        self
    }

    pub fn with_budget(mut self, budget: Duration) -> Self {
        self.budget = budget;
        self
    }

    pub fn with_requirements(mut self, network: bool, power: bool) -> Self {
        self.requires_network = network;
        self.requires_power = power;
        self
    }
}

/// A request for the OS to run a job no earlier than a given time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScheduledJob {
    pub job_id: String,
    pub earliest_next_run: DateTime<Utc>,
    pub requires_network: bool,
    pub requires_power: bool,
    #[serde(with = "millis")]
    pub max_execution_budget: Duration,
}

impl ScheduledJob {
    /// The next run of `class` after `now` under `policy`.
    pub fn next_run(class: JobClass, policy: &JobPolicy, now: DateTime<Utc>) -> Self {
        let cadence = chrono::Duration::from_std(policy.cadence).unwrap_or(chrono::Duration::MAX);
        Self {
            job_id: class.job_id().to_string(),
            earliest_next_run: now.checked_add_signed(cadence).unwrap_or(DateTime::<Utc>::MAX_UTC),
            requires_network: policy.requires_network,
            requires_power: policy.requires_power,
            max_execution_budget: policy.budget,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_job_ids_roundtrip() {
        for class in JobClass::ALL {
            assert_eq!(class.job_id().parse::<JobClass>().unwrap(), class);
        }
        assert!("refresh".parse::<JobClass>().is_err());
    }

    #[test]
    fn test_each_class_has_its_own_cadence() {
        let sync = JobClass::Sync.default_policy();
        let maintenance = JobClass::Maintenance.default_policy();
        assert!(sync.cadence < maintenance.cadence);
        assert!(sync.requires_network);
        assert!(!maintenance.requires_network);
    }

    #[test]
    fn test_next_run_uses_cadence() {
        let now = Utc::now();
        let policy = JobClass::DataSync.default_policy();
        let job = ScheduledJob::next_run(JobClass::DataSync, &policy, now);

        assert_eq!(job.job_id, "data-sync");
        assert_eq!(job.earliest_next_run, now + chrono::Duration::hours(1));
        assert!(job.requires_power);
        assert_eq!(job.max_execution_budget, Duration::from_secs(300));
    }
}
