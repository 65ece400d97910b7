//! Shared contracts for the Crucible evaluation pipeline.
//!
//! Three things live here, and nothing else:
//! - the broker envelope exchanged between the dispatch API and workers,
//! - the defense wire contract (probe payload, gateway headers, prediction
//!   parsing),
//! - the worker settings file (`crucible.yaml`).
//!
//! Everything that touches a database, Redis, or Docker lives in the crates
//! that own those dependencies; this crate stays dependency-light so every
//! component can agree on the contracts without dragging in a runtime.

pub mod envelope;
pub mod settings;
pub mod wire;

pub use envelope::{TaskEnvelope, TASK_RUN_ATTACK_JOB, TASK_RUN_DEFENSE_JOB};
pub use settings::{
    DefenseJobSettings, EvaluationSettings, SourceSettings, WorkerSettings,
};
pub use wire::{
    parse_prediction, probe_payload, PredictionError, HEADER_GATEWAY_AUTH, HEADER_TARGET_URL,
};

/// Default broker queue name when none is configured.
pub const DEFAULT_QUEUE: &str = "crucible";
