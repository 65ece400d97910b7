//! Broker envelopes.
//!
//! The dispatch API publishes one JSON envelope per job onto a single Redis
//! list; worker processes consume them one at a time. The broker delivers
//! at least once, so every handler must be idempotent against redelivery.

use serde::{Deserialize, Serialize};

/// Task name carried by defense envelopes.
pub const TASK_RUN_DEFENSE_JOB: &str = "run_defense_job";
/// Task name carried by attack envelopes.
pub const TASK_RUN_ATTACK_JOB: &str = "run_attack_job";

/// A work envelope, tagged by task name.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "task")]
pub enum TaskEnvelope {
    /// Instantiate a defense container and drain its attack queue.
    #[serde(rename = "run_defense_job")]
    RunDefenseJob {
        job_id: String,
        defense_submission_id: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        scope: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        include_behavior_different: Option<bool>,
    },
    /// Validate an attack and route it to every validated defense.
    #[serde(rename = "run_attack_job")]
    RunAttackJob {
        job_id: String,
        attack_submission_id: String,
    },
}

impl TaskEnvelope {
    /// The job row this envelope refers to.
    pub fn job_id(&self) -> &str {
        match self {
            Self::RunDefenseJob { job_id, .. } => job_id,
            Self::RunAttackJob { job_id, .. } => job_id,
        }
    }

    /// Task name as it appears on the wire.
    pub fn task_name(&self) -> &'static str {
        match self {
            Self::RunDefenseJob { .. } => TASK_RUN_DEFENSE_JOB,
            Self::RunAttackJob { .. } => TASK_RUN_ATTACK_JOB,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defense_envelope_roundtrip() {
        let env = TaskEnvelope::RunDefenseJob {
            job_id: "j-1".into(),
            defense_submission_id: "d-1".into(),
            scope: None,
            include_behavior_different: Some(true),
        };
        let json = serde_json::to_string(&env).unwrap();
        assert!(json.contains(r#""task":"run_defense_job""#));
        assert!(!json.contains("scope"));
        let back: TaskEnvelope = serde_json::from_str(&json).unwrap();
        assert_eq!(back, env);
    }

    #[test]
    fn attack_envelope_parses_wire_form() {
        let json = r#"{"task":"run_attack_job","job_id":"j-2","attack_submission_id":"a-9"}"#;
        let env: TaskEnvelope = serde_json::from_str(json).unwrap();
        assert_eq!(env.job_id(), "j-2");
        assert_eq!(env.task_name(), TASK_RUN_ATTACK_JOB);
    }

    #[test]
    fn unknown_task_is_rejected() {
        let json = r#"{"task":"run_mystery_job","job_id":"j-3"}"#;
        assert!(serde_json::from_str::<TaskEnvelope>(json).is_err());
    }
}
