//! Scoring artifacts and their versioned lifecycle
//!
//! - `artifact`: the in-memory scoring capability (tract ONNX by default)
//! - `bundle`: on-disk bundle layout, metadata and validation
//! - `registry`: the persisted versionId -> ModelVersion mapping
//! - `manager`: import / validate / deploy / rollback / delete
//! - `assignments`: which agents currently score with which version

mod artifact;
mod assignments;
mod bundle;
mod manager;
mod registry;


pub use artifact::{
    ArtifactLoader, LoadedModel, ModelOutput, OnnxArtifact, OnnxLoader, OutputKind,
    ScoringArtifact,
};
pub use assignments::ModelAssignments;
pub use bundle::{
    read_metadata, validate_bundle, BasicMetrics, BundleMetadata, EvaluationInfo, ModelInfo,
    QualityFloors, TrainingInfo, ValidationReport, ARTIFACT_FILE, DEFAULT_MAX_ARTIFACT_BYTES,
    METADATA_FILE, OPTIONAL_MEMBERS, REQUIRED_MEMBERS,
};
pub use manager::{
    ImportOptions, ModelLifecycleManager, ModelStoreConfig, BUNDLES_DIR, DEFAULT_SLOT,
    REGISTRY_FILE,
};
pub use registry::{ModelStatus, ModelVersion, RegistryMap, RegistryStore, StatusTransition};
