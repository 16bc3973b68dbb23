//! Runner domain model
//!
//! Represents a remote worker process that polls the orchestrator for jobs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use uuid::Uuid;

use crate::domain::job::JobType;

/// A registered runner
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Runner {
    /// Identity minted at registration
    pub id: Uuid,

    pub name: String,

    /// Digest of the bearer secret handed to the runner at registration
    #[serde(skip_serializing, default)]
    pub token: String,

    /// Capability: a concrete job type or `All`
    pub job_type: JobType,

    /// Routing label
    pub zone: String,

    /// Administrative kill switch. Inactive runners still authenticate but
    /// never receive jobs.
    pub active: bool,

    /// Last successful authenticated call
    pub contacted_at: DateTime<Utc>,

    pub created_at: DateTime<Utc>,

    pub version: Option<String>,
    pub platform: Option<String>,
    pub arch: Option<String>,
    pub extra: Option<HashMap<String, String>>,
}

impl Runner {
    /// Merge runner-reported info; absent fields keep their current value.
    ///
    /// The zone is fixed at registration, where user runners get it
    /// namespaced, and only changes through administration.
    pub fn apply_info(&mut self, info: RunnerInfo) {
        if let Some(name) = info.name {
            self.name = name;
        }
        if let Some(version) = info.version {
            self.version = Some(version);
        }
        if let Some(platform) = info.platform {
            self.platform = Some(platform);
        }
        if let Some(arch) = info.arch {
            self.arch = Some(arch);
        }
        if let Some(extra) = info.extra {
            self.extra = Some(extra);
        }
    }
}

/// Self-reported runner metadata, sent at registration and on every poll
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunnerInfo {
    #[serde(default)]
    pub name: Option<String>,
    /// Read at registration only
    #[serde(default)]
    pub zone: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub platform: Option<String>,
    #[serde(default)]
    pub arch: Option<String>,
    /// Free-form hints; `jobType` selects the initial capability
    #[serde(default)]
    pub extra: Option<HashMap<String, String>>,
}

impl RunnerInfo {
    /// The capability requested through `extra.jobType`, if it names a known type.
    pub fn requested_job_type(&self) -> Option<JobType> {
        self.extra
            .as_ref()
            .and_then(|extra| extra.get("jobType"))
            .and_then(|value| value.parse().ok())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn runner() -> Runner {
        let now = Utc::now();
        Runner {
            id: Uuid::nil(),
            name: "runner-1".to_string(),
            token: String::new(),
            job_type: JobType::All,
            zone: "[USER:alice]-eu".to_string(),
            active: true,
            contacted_at: now,
            created_at: now,
            version: None,
            platform: None,
            arch: None,
            extra: None,
        }
    }

    #[test]
    fn test_apply_info_keeps_zone() {
        let mut runner = runner();
        runner.apply_info(RunnerInfo {
            name: Some("renamed".to_string()),
            zone: Some("eu".to_string()),
            version: Some("1.2.0".to_string()),
            ..Default::default()
        });

        assert_eq!(runner.name, "renamed");
        assert_eq!(runner.version.as_deref(), Some("1.2.0"));
        assert_eq!(runner.zone, "[USER:alice]-eu");
        assert_eq!(runner.platform, None);
    }

    #[test]
    fn test_requested_job_type() {
        let mut info = RunnerInfo::default();
        assert_eq!(info.requested_job_type(), None);

        info.extra = Some(HashMap::from([(
            "jobType".to_string(),
            "LabAnalyze".to_string(),
        )]));
        assert_eq!(info.requested_job_type(), Some(JobType::LabAnalyze));

        info.extra = Some(HashMap::from([(
            "jobType".to_string(),
            "Nonsense".to_string(),
        )]));
        assert_eq!(info.requested_job_type(), None);
    }
}
