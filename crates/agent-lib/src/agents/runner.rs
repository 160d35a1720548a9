//! Shared cycle machinery for every agent strategy
//!
//! The runner owns an agent's config, extractor, classifier and runtime
//! state. Strategies only decide which [`DetectionPlan`] a cycle uses.

use super::{AgentConfig, AgentContext, AgentRuntimeState, AgentStatus, CycleOutcome, SkipReason};
use crate::anomaly::AnomalyClassifier;
use crate::error::CycleError;
use crate::features::FeatureExtractor;
use crate::model::LoadedModel;
use crate::models::{Anomaly, FeatureVector};
use chrono::Utc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex, PoisonError, RwLock as StdRwLock};
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// How one cycle scores its vectors. Taken once per cycle, so a deploy
/// mid-cycle never mixes two artifacts.
#[derive(Debug, Clone)]
pub enum DetectionPlan {
    /// Rule path only
    Rules,
    /// Model path only; a scoring failure fails the cycle
    Model(Arc<LoadedModel>),
    /// Both paths on every vector; model failures fall back to the rule results
    Augmented(Arc<LoadedModel>),
    /// Model path, rules only when the model fails or is unsupported
    Fallback(Arc<LoadedModel>),
}

impl DetectionPlan {
    pub fn model(&self) -> Option<&Arc<LoadedModel>> {
        match self {
            DetectionPlan::Rules => None,
            DetectionPlan::Model(m) | DetectionPlan::Augmented(m) | DetectionPlan::Fallback(m) => {
                Some(m)
            }
        }
    }
}

/// Scheduling, status and pipeline shared by all strategies
pub struct CycleRunner {
    config: AgentConfig,
    extractor: FeatureExtractor,
    classifier: AnomalyClassifier,
    ctx: AgentContext,
    state: StdRwLock<AgentRuntimeState>,
    /// Held for the whole cycle; `try_lock` failure means overlap
    cycle_lock: Mutex<()>,
    started: AtomicBool,
    stop_requested: AtomicBool,
    last_cycle_start: StdMutex<Option<Instant>>,
    current_model: StdRwLock<Option<String>>,
}

impl CycleRunner {
    pub fn new(config: AgentConfig, ctx: &AgentContext) -> Self {
        Self {
            extractor: config.feature_extractor(),
            classifier: config.classifier(),
            config,
            ctx: ctx.clone(),
            state: StdRwLock::new(AgentRuntimeState::default()),
            cycle_lock: Mutex::new(()),
            started: AtomicBool::new(false),
            stop_requested: AtomicBool::new(false),
            last_cycle_start: StdMutex::new(None),
            current_model: StdRwLock::new(None),
        }
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &AgentConfig {
        &self.config
    }

    pub fn classifier(&self) -> &AnomalyClassifier {
        &self.classifier
    }

    pub fn state(&self) -> AgentRuntimeState {
        self.state
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_due(&self, now: Instant) -> bool {
        if !self.is_started() || self.stop_requested.load(Ordering::SeqCst) {
            return false;
        }
        let last = *self
            .last_cycle_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match last {
            None => true,
            Some(t) => now.saturating_duration_since(t) >= self.config.analysis_interval,
        }
    }

    pub fn current_model(&self) -> Option<String> {
        self.current_model
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Record which registry version the agent scores with
    pub fn note_model(&self, version: Option<&str>) {
        let version = version.map(str::to_string);
        *self
            .current_model
            .write()
            .unwrap_or_else(PoisonError::into_inner) = version.clone();

        let Some(models) = self.ctx.models.as_ref() else {
            return;
        };
        let assignments = models.assignments();
        match version {
            // Path-loaded artifacts live outside the registry
            Some(v) if !v.starts_with("path:") => assignments.assign(&self.config.id, &v),
            _ => {
                assignments.release(&self.config.id);
            }
        }
    }

    /// Mark the agent started. `readiness` carries the reason when the
    /// strategy cannot score yet; the agent then sits `inactive` but stays
    /// schedulable.
    pub async fn start(&self, readiness: Result<(), String>) -> AgentStatus {
        self.stop_requested.store(false, Ordering::SeqCst);
        self.started.store(true, Ordering::SeqCst);
        let status = match readiness {
            Ok(()) => AgentStatus::Active,
            Err(_) => AgentStatus::Inactive,
        };
        self.transition(status, readiness.err()).await;
        status
    }

    pub async fn stop(&self) {
        self.stop_requested.store(true, Ordering::SeqCst);
        self.started.store(false, Ordering::SeqCst);
        self.note_model(None);
        // An in-flight cycle moves to inactive itself when it ends
        if let Ok(_idle) = self.cycle_lock.try_lock() {
            self.transition(AgentStatus::Inactive, Some("stopped".to_string()))
                .await;
        }
    }

    pub async fn stop_and_wait(&self, timeout: Duration) -> bool {
        self.stop().await;
        match tokio::time::timeout(timeout, self.cycle_lock.lock()).await {
            Ok(_idle) => true,
            Err(_) => {
                warn!(
                    agent_id = %self.config.id,
                    timeout_ms = timeout.as_millis() as u64,
                    "In-flight cycle did not finish before timeout"
                );
                false
            }
        }
    }

    /// Run one cycle. `plan` is consulted after the overlap check; an
    /// `Err` reason means there is no model to score with.
    pub async fn run_cycle<F>(&self, plan: F) -> CycleOutcome
    where
        F: FnOnce() -> Result<DetectionPlan, String> + Send,
    {
        if !self.is_started() {
            self.ctx.metrics.inc_cycles_skipped();
            return CycleOutcome::Skipped(SkipReason::NotStarted);
        }
        if self.stop_requested.load(Ordering::SeqCst) {
            self.ctx.metrics.inc_cycles_skipped();
            return CycleOutcome::Skipped(SkipReason::Stopped);
        }
        let _cycle = match self.cycle_lock.try_lock() {
            Ok(guard) => guard,
            Err(_) => {
                debug!(agent_id = %self.config.id, "Previous cycle still analyzing, skipping tick");
                self.ctx.metrics.inc_cycles_skipped();
                return CycleOutcome::Skipped(SkipReason::Overlap);
            }
        };
        *self
            .last_cycle_start
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let plan = match plan() {
            Ok(plan) => plan,
            Err(reason) => {
                self.note_model(None);
                let state = self.state();
                if state.status != AgentStatus::Inactive
                    || state.reason.as_deref() != Some(reason.as_str())
                {
                    self.transition(AgentStatus::Inactive, Some(reason)).await;
                }
                return CycleOutcome::ModelUnavailable;
            }
        };
        self.note_model(plan.model().map(|m| m.version_id.as_str()));
        // stop() may have released the model between the check above and here
        if self.stop_requested.load(Ordering::SeqCst) {
            self.note_model(None);
            self.transition(AgentStatus::Inactive, Some("stopped".to_string()))
                .await;
            self.ctx.metrics.inc_cycles_skipped();
            return CycleOutcome::Skipped(SkipReason::Stopped);
        }

        self.transition(AgentStatus::Analyzing, None).await;
        let started = Instant::now();
        let result = self.execute(&plan).await;
        let elapsed = started.elapsed();
        self.ctx.metrics.observe_cycle_latency(elapsed.as_secs_f64());

        let stopping = self.stop_requested.load(Ordering::SeqCst);
        if stopping {
            self.note_model(None);
        }
        match result {
            Ok((entities, anomalies)) => {
                {
                    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                    state.last_run_at = Some(Utc::now());
                    state.last_error = None;
                    state.failed_stage = None;
                    state.cycles_completed += 1;
                }
                self.ctx.metrics.inc_cycles_completed();
                self.ctx
                    .logger
                    .log_cycle_completed(&self.config.id, entities, anomalies, elapsed.as_millis());
                if stopping {
                    self.transition(AgentStatus::Inactive, Some("stopped".to_string()))
                        .await;
                } else {
                    self.transition(AgentStatus::Active, None).await;
                }
                CycleOutcome::Completed {
                    entities,
                    anomalies,
                }
            }
            Err(e) => {
                let message = e.to_string();
                {
                    let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
                    state.last_run_at = Some(Utc::now());
                    state.last_error = Some(message.clone());
                    state.failed_stage = Some(e.stage());
                    state.cycles_failed += 1;
                }
                self.ctx.metrics.inc_cycles_failed();
                self.ctx.logger.log_cycle_failed(&self.config.id, &message);
                if stopping {
                    self.transition(AgentStatus::Inactive, Some("stopped".to_string()))
                        .await;
                } else {
                    self.transition(AgentStatus::Error, None).await;
                }
                CycleOutcome::Failed(message)
            }
        }
    }

    /// fetch -> extract -> classify -> persist
    async fn execute(&self, plan: &DetectionPlan) -> Result<(usize, usize), CycleError> {
        let window_end = Utc::now();
        let window_start = chrono::Duration::from_std(self.config.lookback)
            .ok()
            .and_then(|lookback| window_end.checked_sub_signed(lookback))
            .ok_or_else(|| {
                CycleError::Fetch(anyhow::anyhow!(
                    "lookback of {}s reaches past the representable time range",
                    self.config.lookback.as_secs()
                ))
            })?;
        let entries = self
            .ctx
            .log_source
            .fetch_logs(&self.config.source_filters, window_start, window_end)
            .await
            .map_err(CycleError::Fetch)?;

        let vectors = self.extractor.extract(&entries);
        let mut anomalies = Vec::new();
        for vector in vectors.values() {
            anomalies.extend(self.detect(plan, vector)?);
        }

        for anomaly in &anomalies {
            self.ctx
                .sink
                .persist_anomaly(anomaly)
                .await
                .map_err(CycleError::Persist)?;
            self.ctx.logger.log_anomaly(anomaly);
            self.ctx
                .metrics
                .inc_anomalies_detected(&anomaly.detection_method.to_string());
        }

        debug!(
            agent_id = %self.config.id,
            entries = entries.len(),
            entities = vectors.len(),
            anomalies = anomalies.len(),
            "Cycle pipeline finished"
        );
        Ok((vectors.len(), anomalies.len()))
    }

    fn detect(
        &self,
        plan: &DetectionPlan,
        vector: &FeatureVector,
    ) -> Result<Vec<Anomaly>, CycleError> {
        match plan {
            DetectionPlan::Rules => Ok(self.classifier.classify_rules(vector)),
            DetectionPlan::Model(model) => Ok(self
                .classifier
                .classify_model(vector, model)
                .map_err(CycleError::Detection)?
                .unwrap_or_default()),
            DetectionPlan::Augmented(model) => {
                Ok(self.classifier.classify(vector, Some(model.as_ref())))
            }
            DetectionPlan::Fallback(model) => match self.classifier.classify_model(vector, model) {
                Ok(Some(hits)) => Ok(hits),
                Ok(None) => Ok(self.classifier.classify_rules(vector)),
                Err(e) => {
                    warn!(
                        agent_id = %self.config.id,
                        entity_id = %vector.entity_id,
                        error = %e,
                        "Model path failed, falling back to rules"
                    );
                    Ok(self.classifier.classify_rules(vector))
                }
            },
        }
    }

    async fn transition(&self, to: AgentStatus, reason: Option<String>) {
        let (from, snapshot) = {
            let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
            let from = state.status;
            state.status = to;
            state.reason = reason;
            (from, state.clone())
        };
        if from != to {
            self.ctx.logger.log_agent_status(
                &self.config.id,
                &from.to_string(),
                &to.to_string(),
                snapshot.reason.as_deref(),
            );
        }
        self.publish(&snapshot).await;
    }

    async fn publish(&self, state: &AgentRuntimeState) {
        let key = format!("agent:{}:status", self.config.id);
        let value = serde_json::json!({
            "agentId": self.config.id,
            "strategy": self.config.strategy.name(),
            "status": state.status,
            "timestamp": Utc::now(),
            "lastRunAt": state.last_run_at,
            "lastError": state.last_error,
            "reason": state.reason,
        });
        if let Err(e) = self.ctx.publisher.publish(&key, value).await {
            warn!(agent_id = %self.config.id, error = %e, "Failed to publish agent status");
        }
    }
}
