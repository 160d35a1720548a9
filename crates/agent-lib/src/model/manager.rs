//! Model lifecycle manager
//!
//! Owns the versioned bundle store and the deploy/rollback state machine:
//!
//! ```text
//! imported -> available -> deployed <-> rolled_back
//! ```
//!
//! Every mutating operation holds one async mutex across the full
//! read-modify-write of the registry file. Listing reads the file without
//! the lock. Deployed artifacts are published per slot through a `watch`
//! channel, so agents always see a whole artifact or none.

use super::artifact::{ArtifactLoader, LoadedModel};
use super::assignments::ModelAssignments;
use super::bundle::{
    copy_dir_all, read_metadata, validate_bundle, BundleMetadata, QualityFloors,
    ValidationReport, ARTIFACT_FILE, DEFAULT_MAX_ARTIFACT_BYTES, REQUIRED_MEMBERS,
};
use super::registry::{ModelStatus, ModelVersion, RegistryMap, RegistryStore};
use crate::error::{ModelError, RegistryConflict};
use crate::io::StatusPublisher;
use crate::observability::{AgentMetrics, StructuredLogger};
use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

/// Registry file name inside the store directory
pub const REGISTRY_FILE: &str = "registry.json";

/// Bundle directory inside the store directory
pub const BUNDLES_DIR: &str = "bundles";

pub const DEFAULT_SLOT: &str = "default";

/// Configuration for the model store
#[derive(Debug, Clone)]
pub struct ModelStoreConfig {
    pub store_dir: PathBuf,
    pub max_artifact_bytes: u64,
    pub quality: QualityFloors,
    /// Slot used by imports that name none
    pub default_slot: String,
}

impl ModelStoreConfig {
    pub fn new(store_dir: impl Into<PathBuf>) -> Self {
        Self {
            store_dir: store_dir.into(),
            ..Default::default()
        }
    }
}

impl Default for ModelStoreConfig {
    fn default() -> Self {
        Self {
            store_dir: PathBuf::from("/var/lib/netsentry/models"),
            max_artifact_bytes: DEFAULT_MAX_ARTIFACT_BYTES,
            quality: QualityFloors::default(),
            default_slot: DEFAULT_SLOT.to_string(),
        }
    }
}

/// Options for [`ModelLifecycleManager::import_version`]
#[derive(Debug, Clone)]
pub struct ImportOptions {
    /// Explicit version id; a timestamp-derived id is generated otherwise
    pub version_id: Option<String>,
    pub slot: Option<String>,
    /// Run full bundle validation. Required members are checked regardless.
    pub validate: bool,
}

impl Default for ImportOptions {
    fn default() -> Self {
        Self {
            version_id: None,
            slot: None,
            validate: true,
        }
    }
}

impl ImportOptions {
    pub fn with_version_id(mut self, id: impl Into<String>) -> Self {
        self.version_id = Some(id.into());
        self
    }

    pub fn with_slot(mut self, slot: impl Into<String>) -> Self {
        self.slot = Some(slot.into());
        self
    }

    pub fn without_validation(mut self) -> Self {
        self.validate = false;
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Activation {
    Deploy,
    Rollback,
}

impl Activation {
    fn operation(&self) -> &'static str {
        match self {
            Activation::Deploy => "deploy",
            Activation::Rollback => "rollback",
        }
    }

    /// Status the superseded deployed version moves to
    fn superseded_status(&self) -> ModelStatus {
        match self {
            Activation::Deploy => ModelStatus::Available,
            Activation::Rollback => ModelStatus::RolledBack,
        }
    }
}

type SlotSender = watch::Sender<Option<Arc<LoadedModel>>>;

/// Versioned registry of scoring artifacts
pub struct ModelLifecycleManager {
    config: ModelStoreConfig,
    store: RegistryStore,
    bundles_dir: PathBuf,
    loader: Arc<dyn ArtifactLoader>,
    publisher: Arc<dyn StatusPublisher>,
    assignments: Arc<ModelAssignments>,
    write_lock: Mutex<()>,
    slots: DashMap<String, SlotSender>,
    metrics: AgentMetrics,
    logger: StructuredLogger,
}

impl ModelLifecycleManager {
    /// Open (or create) the store under `config.store_dir`
    pub fn new(
        config: ModelStoreConfig,
        loader: Arc<dyn ArtifactLoader>,
        publisher: Arc<dyn StatusPublisher>,
        assignments: Arc<ModelAssignments>,
    ) -> Result<Self, ModelError> {
        let bundles_dir = config.store_dir.join(BUNDLES_DIR);
        fs::create_dir_all(&bundles_dir)?;
        let store = RegistryStore::new(config.store_dir.join(REGISTRY_FILE));

        info!(store_dir = ?config.store_dir, "Model store opened");

        Ok(Self {
            config,
            store,
            bundles_dir,
            loader,
            publisher,
            assignments,
            write_lock: Mutex::new(()),
            slots: DashMap::new(),
            metrics: AgentMetrics::new(),
            logger: StructuredLogger::new("netsentry"),
        })
    }

    pub fn with_logger(mut self, logger: StructuredLogger) -> Self {
        self.logger = logger;
        self
    }

    pub fn config(&self) -> &ModelStoreConfig {
        &self.config
    }

    pub fn assignments(&self) -> Arc<ModelAssignments> {
        self.assignments.clone()
    }

    /// Copy a bundle into the store and register it.
    ///
    /// The bundle is staged beside the store and only renamed into place
    /// once it passes the checks, so a failed import leaves neither a
    /// registry entry nor a bundle directory behind.
    pub async fn import_version(
        &self,
        source: &Path,
        options: ImportOptions,
    ) -> Result<ModelVersion, ModelError> {
        let result = self.import_locked(source, options).await;
        self.metrics.record_model_operation("import", result.is_ok());
        result
    }

    async fn import_locked(
        &self,
        source: &Path,
        options: ImportOptions,
    ) -> Result<ModelVersion, ModelError> {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.store.load()?;

        let version_id = match options.version_id {
            Some(id) => id,
            None => generate_version_id(&registry),
        };
        check_version_id(&version_id)?;
        if registry.contains_key(&version_id) {
            return Err(RegistryConflict::DuplicateVersion(version_id).into());
        }
        let slot = options
            .slot
            .unwrap_or_else(|| self.config.default_slot.clone());

        let staging = self.bundles_dir.join(format!(".staging-{}", version_id));
        let target = self.bundles_dir.join(&version_id);

        let gate = {
            let source = source.to_path_buf();
            let staging = staging.clone();
            let loader = self.loader.clone();
            let quality = self.config.quality;
            let max_bytes = self.config.max_artifact_bytes;
            let validate = options.validate;
            blocking(move || {
                if staging.exists() {
                    fs::remove_dir_all(&staging)?;
                }
                if !source.is_dir() {
                    return Ok(ValidationReport::from_parts(
                        vec![format!("bundle path {:?} is not a directory", source)],
                        vec![],
                    ));
                }
                copy_dir_all(&source, &staging)?;
                if validate {
                    Ok(validate_bundle(&staging, loader.as_ref(), &quality, max_bytes))
                } else {
                    Ok(required_members_report(&staging))
                }
            })
            .await?
        };

        if !gate.is_valid {
            remove_dir_logged(&staging).await;
            warn!(
                version = %version_id,
                errors = ?gate.errors,
                "Bundle rejected at import"
            );
            return Err(ModelError::Validation(gate));
        }

        let (checksum, size_bytes, metrics_snapshot) = {
            let from = staging.clone();
            let to = target.clone();
            let staged = blocking(move || {
                if to.exists() {
                    fs::remove_dir_all(&to)?;
                }
                fs::rename(&from, &to)?;
                let (checksum, size) = checksum_file(&to.join(ARTIFACT_FILE))?;
                let snapshot = read_metadata(&to)
                    .map(|m| m.metrics_snapshot())
                    .unwrap_or_default();
                Ok((checksum, size, snapshot))
            })
            .await;
            match staged {
                Ok(parts) => parts,
                Err(e) => {
                    remove_dir_logged(&staging).await;
                    remove_dir_logged(&target).await;
                    return Err(e);
                }
            }
        };

        let validation = if options.validate {
            gate
        } else {
            ValidationReport::not_run()
        };
        let mut version = ModelVersion {
            version_id: version_id.clone(),
            slot,
            bundle_path: target.clone(),
            artifact_path: target.join(ARTIFACT_FILE),
            created_at: Utc::now(),
            status: ModelStatus::Imported,
            validation,
            metrics_snapshot,
            checksum,
            size_bytes,
            deployed_at: None,
            history: Vec::new(),
        };
        if options.validate {
            version.transition(ModelStatus::Available, "validated at import");
        }

        registry.insert(version_id.clone(), version.clone());
        if let Err(e) = self.store.save(&registry) {
            remove_dir_logged(&target).await;
            return Err(e);
        }

        self.logger.log_model_imported(
            &version.version_id,
            &version.slot,
            version.validation.is_valid,
            version.validation.warnings.len(),
        );
        self.publish_version(&version).await;
        Ok(version)
    }

    /// Validate an arbitrary bundle directory without importing it
    pub async fn validate_bundle(&self, path: &Path) -> ValidationReport {
        let path = path.to_path_buf();
        let loader = self.loader.clone();
        let quality = self.config.quality;
        let max_bytes = self.config.max_artifact_bytes;
        let result = blocking(move || {
            Ok(validate_bundle(&path, loader.as_ref(), &quality, max_bytes))
        })
        .await;
        match result {
            Ok(report) => report,
            Err(e) => {
                ValidationReport::from_parts(vec![format!("validation aborted: {}", e)], vec![])
            }
        }
    }

    /// Re-validate a stored bundle. A valid `imported` version becomes
    /// `available`; the report replaces the stored one either way.
    pub async fn validate_version(&self, version_id: &str) -> Result<ValidationReport, ModelError> {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.store.load()?;
        let bundle = registry
            .get(version_id)
            .map(|v| v.bundle_path.clone())
            .ok_or_else(|| ModelError::NotFound(version_id.to_string()))?;

        let report = self.validate_bundle(&bundle).await;

        let version = registry
            .get_mut(version_id)
            .ok_or_else(|| ModelError::NotFound(version_id.to_string()))?;
        version.validation = report.clone();
        if report.is_valid && version.status == ModelStatus::Imported {
            version.transition(ModelStatus::Available, "validated");
        }
        let snapshot = version.clone();
        self.store.save(&registry)?;

        self.metrics.record_model_operation("validate", report.is_valid);
        self.publish_version(&snapshot).await;
        Ok(report)
    }

    /// Deploy a version into its slot.
    ///
    /// Returns `true` when the slot's deployed version changed and `false`
    /// when the target was already deployed. A version that has not been
    /// validated yet is validated first.
    pub async fn deploy(&self, version_id: &str) -> Result<bool, ModelError> {
        let result = self.activate(version_id, Activation::Deploy).await;
        self.metrics.record_model_operation("deploy", result.is_ok());
        result
    }

    /// Re-activate an existing version without re-validating it. The
    /// version it replaces is recorded as `rolled_back`.
    pub async fn rollback(&self, version_id: &str) -> Result<bool, ModelError> {
        let result = self.activate(version_id, Activation::Rollback).await;
        self.metrics.record_model_operation("rollback", result.is_ok());
        result
    }

    async fn activate(&self, version_id: &str, mode: Activation) -> Result<bool, ModelError> {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.store.load()?;
        let target = registry
            .get(version_id)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(version_id.to_string()))?;

        if target.status == ModelStatus::Deployed {
            let published = self
                .deployed_model(&target.slot)
                .map(|m| m.version_id == target.version_id)
                .unwrap_or(false);
            if !published {
                let loaded = self.load_stored(&target).await?;
                self.publish_slot(&target.slot, Some(loaded));
            }
            debug!(version = %version_id, "Version already deployed");
            return Ok(false);
        }
        if !target.status.is_deployable() {
            return Err(ModelError::NotFound(version_id.to_string()));
        }

        if mode == Activation::Deploy && target.status == ModelStatus::Imported {
            let report = self.validate_bundle(&target.bundle_path).await;
            if !report.is_valid {
                if let Some(v) = registry.get_mut(version_id) {
                    v.validation = report.clone();
                }
                self.store.save(&registry)?;
                return Err(ModelError::Validation(report));
            }
            if let Some(v) = registry.get_mut(version_id) {
                v.validation = report;
                v.transition(ModelStatus::Available, "validated before deploy");
            }
        }

        // Load before touching the registry so a bad artifact changes nothing
        let loaded = self.load_stored(&target).await?;

        let previous = registry
            .values()
            .find(|v| v.slot == target.slot && v.status == ModelStatus::Deployed)
            .map(|v| v.version_id.clone());

        if let Some(ref prev) = previous {
            if let Some(v) = registry.get_mut(prev) {
                v.transition(
                    mode.superseded_status(),
                    format!("superseded by {} ({})", version_id, mode.operation()),
                );
            }
        }
        if let Some(v) = registry.get_mut(version_id) {
            v.transition(ModelStatus::Deployed, mode.operation());
        }
        self.store.save(&registry)?;

        self.publish_slot(&target.slot, Some(loaded));

        self.metrics
            .set_deployed_model(&target.slot, previous.as_deref(), version_id);
        match mode {
            Activation::Deploy => {
                self.logger
                    .log_model_deployed(&target.slot, previous.as_deref(), version_id)
            }
            Activation::Rollback => {
                self.logger
                    .log_model_rolled_back(&target.slot, previous.as_deref(), version_id)
            }
        }

        if let Some(prev) = previous.as_ref().and_then(|p| registry.get(p)) {
            self.publish_version(prev).await;
        }
        if let Some(current) = registry.get(version_id) {
            self.publish_version(current).await;
        }
        Ok(true)
    }

    /// Remove a version and its bundle.
    ///
    /// Refused while the version is deployed or assigned to any agent.
    pub async fn delete(&self, version_id: &str) -> Result<bool, ModelError> {
        let result = self.delete_locked(version_id).await;
        self.metrics.record_model_operation("delete", result.is_ok());
        result
    }

    async fn delete_locked(&self, version_id: &str) -> Result<bool, ModelError> {
        let _guard = self.write_lock.lock().await;
        let mut registry = self.store.load()?;
        let version = registry
            .get(version_id)
            .cloned()
            .ok_or_else(|| ModelError::NotFound(version_id.to_string()))?;

        if version.status == ModelStatus::Deployed {
            return Err(RegistryConflict::DeleteWhileDeployed(version_id.to_string()).into());
        }
        let agents = self.assignments.agents_for(version_id);
        if !agents.is_empty() {
            return Err(RegistryConflict::DeleteWhileAssigned {
                version: version_id.to_string(),
                agents,
            }
            .into());
        }

        registry.remove(version_id);
        self.store.save(&registry)?;
        remove_dir_logged(&version.bundle_path).await;

        self.logger.log_model_deleted(version_id);
        let mut deleted = version;
        deleted.transition(ModelStatus::Deleted, "deleted");
        self.publish_version(&deleted).await;
        Ok(true)
    }

    /// All versions, oldest first. Reads without the write lock.
    pub fn list_versions(&self) -> Result<Vec<ModelVersion>, ModelError> {
        let mut versions: Vec<ModelVersion> = self.store.load()?.into_values().collect();
        versions.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.version_id.cmp(&b.version_id))
        });
        Ok(versions)
    }

    pub fn get_version(&self, version_id: &str) -> Result<ModelVersion, ModelError> {
        self.store
            .load()?
            .remove(version_id)
            .ok_or_else(|| ModelError::NotFound(version_id.to_string()))
    }

    /// Parsed `metadata.json` of a stored bundle
    pub fn get_metadata(&self, version_id: &str) -> Result<BundleMetadata, ModelError> {
        let version = self.get_version(version_id)?;
        read_metadata(&version.bundle_path).map_err(|source| ModelError::Load {
            version: version_id.to_string(),
            source,
        })
    }

    /// Load a stored version into memory without deploying it
    pub async fn load_version(&self, version_id: &str) -> Result<Arc<LoadedModel>, ModelError> {
        let version = self.get_version(version_id)?;
        self.load_stored(&version).await
    }

    /// Load an artifact straight from a path outside the store: either a
    /// bundle directory or an artifact file (metadata is read from the
    /// file's directory when present)
    pub async fn load_bundle(
        &self,
        path: &Path,
        slot: &str,
    ) -> Result<Arc<LoadedModel>, ModelError> {
        let (bundle, artifact) = if path.is_dir() {
            (path.to_path_buf(), path.join(ARTIFACT_FILE))
        } else {
            let parent = path
                .parent()
                .map(Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            (parent, path.to_path_buf())
        };
        let version_id = format!("path:{}", path.display());
        self.load_artifact(version_id, slot.to_string(), bundle, artifact)
            .await
    }

    async fn load_stored(&self, version: &ModelVersion) -> Result<Arc<LoadedModel>, ModelError> {
        self.load_artifact(
            version.version_id.clone(),
            version.slot.clone(),
            version.bundle_path.clone(),
            version.artifact_path.clone(),
        )
        .await
    }

    async fn load_artifact(
        &self,
        version_id: String,
        slot: String,
        bundle: PathBuf,
        artifact: PathBuf,
    ) -> Result<Arc<LoadedModel>, ModelError> {
        let loader = self.loader.clone();
        let id = version_id.clone();
        let loaded = tokio::task::spawn_blocking(move || -> anyhow::Result<LoadedModel> {
            if !artifact.exists() {
                anyhow::bail!("artifact {:?} does not exist", artifact);
            }
            let metadata = if bundle.join(super::bundle::METADATA_FILE).exists() {
                Some(read_metadata(&bundle)?)
            } else {
                None
            };
            let model_type = metadata.as_ref().and_then(|m| m.model_type());
            let feature_names = metadata
                .as_ref()
                .map(|m| m.feature_names().to_vec())
                .unwrap_or_default();
            let width = Some(feature_names.len()).filter(|n| *n > 0);
            let artifact = loader.load(&artifact, model_type, width)?;
            Ok(LoadedModel {
                version_id: id,
                slot,
                feature_names,
                artifact,
            })
        })
        .await
        .map_err(|e| ModelError::Load {
            version: version_id.clone(),
            source: anyhow::anyhow!("load task failed: {}", e),
        })?;

        match loaded {
            Ok(model) => {
                debug!(version = %version_id, "Model artifact loaded");
                Ok(Arc::new(model))
            }
            Err(source) => {
                warn!(version = %version_id, error = %source, "Failed to load model artifact");
                Err(ModelError::Load {
                    version: version_id,
                    source,
                })
            }
        }
    }

    /// Reload artifacts of versions already marked `deployed`, e.g. after
    /// a restart. Versions that fail to load are logged and skipped.
    pub async fn restore_deployed(&self) -> Result<usize, ModelError> {
        let registry = self.store.load()?;
        let mut restored = 0;
        for version in registry.values().filter(|v| v.status == ModelStatus::Deployed) {
            match self.load_stored(version).await {
                Ok(loaded) => {
                    self.publish_slot(&version.slot, Some(loaded));
                    self.metrics
                        .set_deployed_model(&version.slot, None, &version.version_id);
                    info!(
                        version = %version.version_id,
                        slot = %version.slot,
                        "Restored deployed model"
                    );
                    restored += 1;
                }
                Err(e) => {
                    warn!(
                        version = %version.version_id,
                        error = %e,
                        "Deployed model could not be restored"
                    );
                }
            }
        }
        Ok(restored)
    }

    /// Follow the deployed artifact of `slot`
    pub fn subscribe(&self, slot: &str) -> watch::Receiver<Option<Arc<LoadedModel>>> {
        self.slots
            .entry(slot.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .subscribe()
    }

    /// Current deployed artifact of `slot`, if any
    pub fn deployed_model(&self, slot: &str) -> Option<Arc<LoadedModel>> {
        self.slots.get(slot).and_then(|s| s.borrow().clone())
    }

    fn publish_slot(&self, slot: &str, model: Option<Arc<LoadedModel>>) {
        self.slots
            .entry(slot.to_string())
            .or_insert_with(|| watch::channel(None).0)
            .send_replace(model);
    }

    async fn publish_version(&self, version: &ModelVersion) {
        let key = format!("model:{}:status", version.version_id);
        let value = serde_json::json!({
            "versionId": version.version_id,
            "slot": version.slot,
            "status": version.status,
            "timestamp": Utc::now(),
            "isValid": version.validation.is_valid,
            "warnings": version.validation.warnings.len(),
            "deployedAt": version.deployed_at,
        });
        if let Err(e) = self.publisher.publish(&key, value).await {
            warn!(key = %key, error = %e, "Failed to publish model status");
        }
    }
}

/// Run blocking filesystem work off the async workers
async fn blocking<T, F>(f: F) -> Result<T, ModelError>
where
    F: FnOnce() -> Result<T, ModelError> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| ModelError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))?
}

async fn remove_dir_logged(path: &Path) {
    let owned = path.to_path_buf();
    let result = tokio::task::spawn_blocking(move || {
        if owned.exists() {
            fs::remove_dir_all(&owned)
        } else {
            Ok(())
        }
    })
    .await;
    match result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            warn!(path = %path.display(), error = %e, "Failed to remove bundle directory")
        }
        Err(e) => warn!(path = %path.display(), error = %e, "Bundle removal task failed"),
    }
}

/// Report covering only the required members
fn required_members_report(bundle: &Path) -> ValidationReport {
    let errors = REQUIRED_MEMBERS
        .iter()
        .filter(|m| !bundle.join(m).exists())
        .map(|m| format!("required bundle member `{}` is missing", m))
        .collect();
    ValidationReport::from_parts(errors, vec![])
}

fn checksum_file(path: &Path) -> Result<(String, u64), ModelError> {
    let mut file = fs::File::open(path)?;
    let mut hasher = Sha256::new();
    let size = std::io::copy(&mut file, &mut hasher)?;
    Ok((hex::encode(hasher.finalize()), size))
}

fn generate_version_id(registry: &RegistryMap) -> String {
    let base = Utc::now().format("%Y%m%d_%H%M%S_%3f").to_string();
    if !registry.contains_key(&base) {
        return base;
    }
    let mut n = 1;
    loop {
        let candidate = format!("{}-{}", base, n);
        if !registry.contains_key(&candidate) {
            return candidate;
        }
        n += 1;
    }
}

/// Version ids become directory names
fn check_version_id(id: &str) -> Result<(), ModelError> {
    let valid = !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'));
    if valid {
        Ok(())
    } else {
        Err(ModelError::InvalidVersionId(id.to_string()))
    }
}
