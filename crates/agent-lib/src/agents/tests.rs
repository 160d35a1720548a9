//! Agent strategy and registry tests with in-memory collaborators

use super::*;
use crate::anomaly::types;
use crate::io::{AnomalySink, LogSource, MemoryStatusStore};
use crate::model::{
    ImportOptions, ModelAssignments, ModelLifecycleManager, ModelStoreConfig, DEFAULT_SLOT,
};
use crate::models::{Anomaly, DetectionMethod, LogEntry};
use crate::test_support::{valid_bundle, write_bundle, metadata, TextLoader};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde_json::json;
use std::collections::BTreeSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;
use tokio::sync::{broadcast, Notify};

/// Log source over a fixed set of entries
#[derive(Default)]
struct MemoryLogSource {
    entries: Vec<LogEntry>,
    fail: AtomicBool,
    gate: Option<Arc<Notify>>,
}

#[async_trait]
impl LogSource for MemoryLogSource {
    async fn fetch_logs(
        &self,
        sources: &BTreeSet<String>,
        window_start: DateTime<Utc>,
        window_end: DateTime<Utc>,
    ) -> Result<Vec<LogEntry>> {
        if let Some(gate) = &self.gate {
            gate.notified().await;
        }
        if self.fail.load(Ordering::SeqCst) {
            anyhow::bail!("log store unreachable");
        }
        Ok(self
            .entries
            .iter()
            .filter(|e| crate::io::matches_sources(sources, e))
            .filter(|e| e.timestamp >= window_start && e.timestamp < window_end)
            .cloned()
            .collect())
    }
}

#[derive(Default)]
struct MemorySink {
    anomalies: Mutex<Vec<Anomaly>>,
}

impl MemorySink {
    fn take(&self) -> Vec<Anomaly> {
        std::mem::take(&mut *self.anomalies.lock().unwrap())
    }
}

#[async_trait]
impl AnomalySink for MemorySink {
    async fn persist_anomaly(&self, anomaly: &Anomaly) -> Result<()> {
        self.anomalies.lock().unwrap().push(anomaly.clone());
        Ok(())
    }
}

/// One access point reporting 12 auth failures a minute ago
fn auth_flood() -> Vec<LogEntry> {
    vec![LogEntry::new("wifi", Utc::now() - chrono::Duration::minutes(1))
        .with_entity("ap-1")
        .with_field("authFailures", json!(12))]
}

struct Fixture {
    temp: TempDir,
    source: Arc<MemoryLogSource>,
    sink: Arc<MemorySink>,
    status: Arc<MemoryStatusStore>,
    manager: Arc<ModelLifecycleManager>,
    ctx: AgentContext,
}

impl Fixture {
    fn new() -> Self {
        Self::with_source(MemoryLogSource {
            entries: auth_flood(),
            ..Default::default()
        })
    }

    fn with_source(source: MemoryLogSource) -> Self {
        let temp = TempDir::new().unwrap();
        let source = Arc::new(source);
        let sink = Arc::new(MemorySink::default());
        let status = Arc::new(MemoryStatusStore::new());
        let manager = Arc::new(
            ModelLifecycleManager::new(
                ModelStoreConfig::new(temp.path().join("store")),
                Arc::new(TextLoader),
                status.clone(),
                Arc::new(ModelAssignments::new()),
            )
            .unwrap(),
        );
        let ctx = AgentContext::new(source.clone(), sink.clone(), status.clone())
            .with_models(manager.clone());
        Self {
            temp,
            source,
            sink,
            status,
            manager,
            ctx,
        }
    }

    fn bundle(&self, name: &str, artifact: &str) -> PathBuf {
        let dir = self.temp.path().join("incoming").join(name);
        write_bundle(&dir, Some(artifact), Some(metadata(&["auth_failures", "error_count"])));
        dir
    }

    async fn deploy(&self, id: &str) {
        let dir = self.temp.path().join("incoming").join(id);
        valid_bundle(&dir, 0.99);
        self.manager
            .import_version(&dir, ImportOptions::default().with_version_id(id))
            .await
            .unwrap();
        assert!(self.manager.deploy(id).await.unwrap());
    }

    fn agent(&self, config: AgentConfig) -> Arc<dyn Agent> {
        build_agent(config, &self.ctx).unwrap()
    }
}

fn ml(id: &str, model: ModelRef) -> AgentConfig {
    AgentConfig::rule_based(id).with_strategy(Strategy::Ml { model })
}

fn hybrid(id: &str, model: ModelRef, fallback_only: bool) -> AgentConfig {
    AgentConfig::rule_based(id).with_strategy(Strategy::Hybrid {
        model,
        fallback_only,
    })
}

#[tokio::test]
async fn test_rule_cycle_persists_anomalies() {
    let fx = Fixture::new();
    let agent = fx.agent(AgentConfig::rule_based("rules-1"));

    assert_eq!(agent.status().status, AgentStatus::Initialized);
    assert_eq!(agent.start().await, AgentStatus::Active);

    let outcome = agent.run_analysis_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            entities: 1,
            anomalies: 1
        }
    );

    let anomalies = fx.sink.take();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].anomaly_type, types::AUTH_FAILURE);
    assert_eq!(anomalies[0].entity_id, "ap-1");
    assert_eq!(anomalies[0].source_agent_id, "rules-1");
    assert_eq!(anomalies[0].detection_method, DetectionMethod::Rule);
    assert_eq!(anomalies[0].severity, 5);

    let state = agent.status();
    assert_eq!(state.status, AgentStatus::Active);
    assert!(state.last_run_at.is_some());
    assert_eq!(state.cycles_completed, 1);

    let record = fx.status.get("agent:rules-1:status").unwrap();
    assert_eq!(record["status"], "active");
    assert_eq!(record["strategy"], "rule");
}

#[tokio::test]
async fn test_source_filter_excludes_other_sources() {
    let fx = Fixture::new();
    let agent = fx.agent(AgentConfig::rule_based("dns-only").with_sources(["dns"]));
    agent.start().await;

    let outcome = agent.run_analysis_cycle().await;
    assert_eq!(
        outcome,
        CycleOutcome::Completed {
            entities: 0,
            anomalies: 0
        }
    );
    assert!(fx.sink.take().is_empty());
}

#[tokio::test]
async fn test_cycle_before_start_is_skipped() {
    let fx = Fixture::new();
    let agent = fx.agent(AgentConfig::rule_based("idle"));

    assert_eq!(
        agent.run_analysis_cycle().await,
        CycleOutcome::Skipped(SkipReason::NotStarted)
    );
    assert!(!agent.is_due(Instant::now()));
}

#[tokio::test]
async fn test_overlapping_cycle_is_skipped() {
    let gate = Arc::new(Notify::new());
    let fx = Fixture::with_source(MemoryLogSource {
        entries: auth_flood(),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let agent = fx.agent(AgentConfig::rule_based("slow"));
    agent.start().await;

    let first = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run_analysis_cycle().await })
    };
    while agent.status().status != AgentStatus::Analyzing {
        tokio::task::yield_now().await;
    }

    assert_eq!(
        agent.run_analysis_cycle().await,
        CycleOutcome::Skipped(SkipReason::Overlap)
    );

    gate.notify_one();
    assert!(matches!(
        first.await.unwrap(),
        CycleOutcome::Completed { anomalies: 1, .. }
    ));
    assert_eq!(agent.status().cycles_completed, 1);
}

#[tokio::test]
async fn test_stop_waits_for_in_flight_cycle() {
    let gate = Arc::new(Notify::new());
    let fx = Fixture::with_source(MemoryLogSource {
        entries: auth_flood(),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    let agent = fx.agent(AgentConfig::rule_based("stopping"));
    agent.start().await;

    let cycle = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run_analysis_cycle().await })
    };
    while agent.status().status != AgentStatus::Analyzing {
        tokio::task::yield_now().await;
    }

    assert!(!agent.stop_and_wait(Duration::from_millis(20)).await);
    gate.notify_one();
    assert!(matches!(cycle.await.unwrap(), CycleOutcome::Completed { .. }));

    let state = agent.status();
    assert_eq!(state.status, AgentStatus::Inactive);
    assert!(!agent.is_due(Instant::now()));
    assert_eq!(
        agent.run_analysis_cycle().await,
        CycleOutcome::Skipped(SkipReason::NotStarted)
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_stop_racing_cycle_start_leaves_model_released() {
    let fx = Fixture::new();
    fx.deploy("v1").await;
    let model = fx.manager.deployed_model(DEFAULT_SLOT).unwrap();
    let runner = Arc::new(runner::CycleRunner::new(
        ml("ml-race", ModelRef::Slot(DEFAULT_SLOT.to_string())),
        &fx.ctx,
    ));
    runner.start(Ok(())).await;

    // stop() lands after the stop check but before the model is recorded
    let outcome = tokio::spawn({
        let runner = runner.clone();
        async move {
            runner
                .run_cycle(|| {
                    tokio::task::block_in_place(|| {
                        tokio::runtime::Handle::current().block_on(runner.stop())
                    });
                    Ok(runner::DetectionPlan::Model(model))
                })
                .await
        }
    })
    .await
    .unwrap();

    assert_eq!(outcome, CycleOutcome::Skipped(SkipReason::Stopped));
    assert_eq!(runner.state().status, AgentStatus::Inactive);
    assert!(runner.current_model().is_none());
    assert!(fx.manager.assignments().agents_for("v1").is_empty());
    assert!(fx.sink.take().is_empty());
}

#[tokio::test]
async fn test_stop_mid_cycle_releases_model_assignment() {
    let gate = Arc::new(Notify::new());
    let fx = Fixture::with_source(MemoryLogSource {
        entries: auth_flood(),
        gate: Some(gate.clone()),
        ..Default::default()
    });
    fx.deploy("v1").await;
    let agent = fx.agent(ml("ml-stopping", ModelRef::Slot(DEFAULT_SLOT.to_string())));
    agent.start().await;

    let cycle = {
        let agent = agent.clone();
        tokio::spawn(async move { agent.run_analysis_cycle().await })
    };
    while agent.status().status != AgentStatus::Analyzing {
        tokio::task::yield_now().await;
    }

    fx.deploy("v2").await;
    agent.stop().await;
    gate.notify_one();
    assert!(matches!(cycle.await.unwrap(), CycleOutcome::Completed { .. }));

    assert_eq!(agent.status().status, AgentStatus::Inactive);
    assert!(fx.manager.delete("v1").await.unwrap());
}

#[tokio::test]
async fn test_ml_agent_without_model_goes_inactive() {
    let fx = Fixture::new();
    let missing = ModelRef::Path(PathBuf::from("/nonexistent/model.onnx"));
    let agent = fx.agent(ml("ml-missing", missing));

    assert_eq!(agent.start().await, AgentStatus::Inactive);
    let state = agent.status();
    assert_eq!(state.reason.as_deref(), Some(NO_MODEL_REASON));

    assert_eq!(agent.run_analysis_cycle().await, CycleOutcome::ModelUnavailable);
    assert!(fx.sink.take().is_empty());
    assert_eq!(agent.status().status, AgentStatus::Inactive);

    let record = fx.status.get("agent:ml-missing:status").unwrap();
    assert_eq!(record["status"], "inactive");
    assert_eq!(record["reason"], NO_MODEL_REASON);
}

#[tokio::test]
async fn test_ml_agent_follows_slot_deploys() {
    let fx = Fixture::new();
    let agent = fx.agent(ml("ml-slot", ModelRef::Slot("default".to_string())));

    assert_eq!(agent.start().await, AgentStatus::Inactive);
    assert_eq!(agent.run_analysis_cycle().await, CycleOutcome::ModelUnavailable);

    fx.deploy("v1").await;
    let outcome = agent.run_analysis_cycle().await;
    assert!(matches!(outcome, CycleOutcome::Completed { anomalies: 1, .. }));
    assert_eq!(agent.status().status, AgentStatus::Active);
    assert_eq!(agent.model_version().as_deref(), Some("v1"));

    let anomalies = fx.sink.take();
    assert_eq!(anomalies[0].detection_method, DetectionMethod::Model);
    assert_eq!(anomalies[0].model_version.as_deref(), Some("v1"));
    assert_eq!(anomalies[0].anomaly_type, types::AUTH_FAILURE);

    // v1 stays assigned until the agent's next cycle picks up v2
    fx.deploy("v2").await;
    assert!(fx.manager.delete("v1").await.unwrap_err().is_conflict());
    agent.run_analysis_cycle().await;
    assert_eq!(agent.model_version().as_deref(), Some("v2"));
    assert!(fx.manager.delete("v1").await.unwrap());
}

#[tokio::test]
async fn test_ml_agent_scoring_failure_fails_cycle() {
    let fx = Fixture::new();
    let bundle = fx.bundle("broken", "fail");
    let agent = fx.agent(ml("ml-broken", ModelRef::Path(bundle)));

    assert_eq!(agent.start().await, AgentStatus::Active);
    assert!(matches!(agent.run_analysis_cycle().await, CycleOutcome::Failed(_)));

    let state = agent.status();
    assert_eq!(state.status, AgentStatus::Error);
    assert!(state.last_error.is_some());
    assert_eq!(state.cycles_failed, 1);
    assert!(fx.sink.take().is_empty());
}

#[tokio::test]
async fn test_ml_agent_requires_model_manager() {
    let fx = Fixture::new();
    let ctx = AgentContext::new(fx.source.clone(), fx.sink.clone(), fx.status.clone());
    let result = build_agent(ml("orphan", ModelRef::Slot("default".to_string())), &ctx);
    assert!(matches!(result, Err(ConfigError::Invalid { .. })));
}

#[tokio::test]
async fn test_hybrid_fallback_only_uses_rules_when_model_fails() {
    let fx = Fixture::new();
    let bundle = fx.bundle("broken", "fail");
    let agent = fx.agent(hybrid("hy-fallback", ModelRef::Path(bundle), true));

    assert_eq!(agent.start().await, AgentStatus::Active);
    assert!(matches!(
        agent.run_analysis_cycle().await,
        CycleOutcome::Completed { anomalies: 1, .. }
    ));
    let anomalies = fx.sink.take();
    assert_eq!(anomalies[0].detection_method, DetectionMethod::Rule);
}

#[tokio::test]
async fn test_hybrid_fallback_only_prefers_model() {
    let fx = Fixture::new();
    let bundle = fx.bundle("good", "proba:0.99");
    let agent = fx.agent(hybrid("hy-model", ModelRef::Path(bundle), true));

    agent.start().await;
    agent.run_analysis_cycle().await;
    let anomalies = fx.sink.take();
    assert_eq!(anomalies.len(), 1);
    assert_eq!(anomalies[0].detection_method, DetectionMethod::Model);
}

#[tokio::test]
async fn test_hybrid_runs_both_paths() {
    let fx = Fixture::new();
    let bundle = fx.bundle("good", "proba:0.99");
    let agent = fx.agent(hybrid("hy-both", ModelRef::Path(bundle), false));

    agent.start().await;
    agent.run_analysis_cycle().await;
    let methods: Vec<DetectionMethod> = fx.sink.take().iter().map(|a| a.detection_method).collect();
    assert_eq!(methods, vec![DetectionMethod::Rule, DetectionMethod::Model]);
}

#[tokio::test]
async fn test_hybrid_without_model_runs_rules() {
    let fx = Fixture::new();
    let agent = fx.agent(hybrid("hy-rules", ModelRef::Version("missing".to_string()), false));

    assert_eq!(agent.start().await, AgentStatus::Active);
    assert!(matches!(
        agent.run_analysis_cycle().await,
        CycleOutcome::Completed { anomalies: 1, .. }
    ));
    assert_eq!(agent.model_version(), None);
}

#[tokio::test]
async fn test_fetch_failure_sets_error_then_recovers() {
    let fx = Fixture::new();
    let agent = fx.agent(AgentConfig::rule_based("flaky"));
    agent.start().await;

    fx.source.fail.store(true, Ordering::SeqCst);
    let outcome = agent.run_analysis_cycle().await;
    match outcome {
        CycleOutcome::Failed(msg) => assert!(msg.contains("log store unreachable")),
        other => panic!("expected failure, got {:?}", other),
    }
    assert_eq!(agent.status().status, AgentStatus::Error);
    assert_eq!(fx.status.get("agent:flaky:status").unwrap()["status"], "error");

    fx.source.fail.store(false, Ordering::SeqCst);
    assert!(matches!(agent.run_analysis_cycle().await, CycleOutcome::Completed { .. }));
    let state = agent.status();
    assert_eq!(state.status, AgentStatus::Active);
    assert!(state.last_error.is_none());
}

#[tokio::test]
async fn test_out_of_range_lookback_fails_cycle() {
    let fx = Fixture::new();
    // 10^12 minutes converts to a chrono duration but underflows the window start;
    // u64::MAX seconds does not convert at all
    for (id, lookback) in [
        ("deep", Duration::from_secs(60_000_000_000_000)),
        ("deeper", Duration::from_secs(u64::MAX)),
    ] {
        let agent = fx.agent(AgentConfig::rule_based(id).with_lookback(lookback));
        agent.start().await;

        let handle = tokio::spawn({
            let agent = agent.clone();
            async move { agent.run_analysis_cycle().await }
        });
        match handle.await.unwrap() {
            CycleOutcome::Failed(msg) => assert!(msg.contains("representable time range")),
            other => panic!("expected failure, got {:?}", other),
        }

        let state = agent.status();
        assert_eq!(state.status, AgentStatus::Error);
        assert_eq!(state.failed_stage, Some(CycleStage::Fetch));
        assert!(state.last_error.is_some());
    }
}

#[tokio::test]
async fn test_is_due_respects_interval() {
    let fx = Fixture::new();
    let agent = fx.agent(AgentConfig::rule_based("paced").with_interval(Duration::from_secs(60)));
    agent.start().await;

    assert!(agent.is_due(Instant::now()));
    agent.run_analysis_cycle().await;
    assert!(!agent.is_due(Instant::now()));
    assert!(agent.is_due(Instant::now() + Duration::from_secs(61)));
}

// ── Registry ───────────────────────────────────────────────────────

fn registry(fx: &Fixture) -> AgentRegistry {
    AgentRegistry::new(fx.ctx.clone()).with_shutdown_timeout(Duration::from_secs(1))
}

#[tokio::test]
async fn test_registry_rejects_duplicate_ids() {
    let fx = Fixture::new();
    let registry = registry(&fx);

    registry.create_agent(AgentConfig::rule_based("a")).unwrap();
    let err = registry.create_agent(AgentConfig::rule_based("a")).err().unwrap();
    assert!(matches!(err, ConfigError::DuplicateAgent(id) if id == "a"));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_registry_unknown_agent() {
    let fx = Fixture::new();
    let registry = registry(&fx);

    assert!(matches!(
        registry.start_agent("ghost").await,
        Err(ConfigError::UnknownAgent(_))
    ));
    assert!(matches!(
        registry.unregister_agent("ghost").await,
        Err(ConfigError::UnknownAgent(_))
    ));
}

#[tokio::test]
async fn test_registry_lists_sorted_summaries() {
    let fx = Fixture::new();
    let registry = registry(&fx);
    registry.create_agent(AgentConfig::rule_based("b")).unwrap();
    registry
        .create_agent(ml("a", ModelRef::Slot("default".to_string())))
        .unwrap();

    assert_eq!(registry.start_all().await, 1);
    let rows = registry.list_agents();
    let ids: Vec<&str> = rows.iter().map(|r| r.id.as_str()).collect();
    assert_eq!(ids, vec!["a", "b"]);
    assert_eq!(rows[0].strategy, "ml");
    assert_eq!(rows[0].state.status, AgentStatus::Inactive);
    assert_eq!(rows[1].state.status, AgentStatus::Active);
}

#[tokio::test]
async fn test_registry_tick_runs_due_agents_once() {
    let fx = Fixture::new();
    let registry = registry(&fx);
    registry.create_agent(AgentConfig::rule_based("r1")).unwrap();
    registry.create_agent(AgentConfig::rule_based("r2")).unwrap();
    registry.create_agent(AgentConfig::rule_based("never-started")).unwrap();
    registry.start_agent("r1").await.unwrap();
    registry.start_agent("r2").await.unwrap();

    let handles = registry.tick();
    assert_eq!(handles.len(), 2);
    for handle in handles {
        assert!(matches!(handle.await.unwrap(), CycleOutcome::Completed { .. }));
    }
    assert_eq!(fx.sink.take().len(), 2);

    // Interval has not elapsed yet
    assert!(registry.tick().is_empty());
}

#[tokio::test]
async fn test_registry_restart_and_unregister() {
    let fx = Fixture::new();
    let registry = registry(&fx);
    registry.create_agent(AgentConfig::rule_based("r1")).unwrap();

    registry.start_agent("r1").await.unwrap();
    registry.stop_agent("r1").await.unwrap();
    assert_eq!(registry.get("r1").unwrap().status().status, AgentStatus::Inactive);

    assert_eq!(registry.restart_agent("r1").await.unwrap(), AgentStatus::Active);

    let removed = registry.unregister_agent("r1").await.unwrap();
    assert_eq!(removed.status().status, AgentStatus::Inactive);
    assert!(registry.get("r1").is_none());
}

#[tokio::test]
async fn test_registry_unregister_releases_model_assignment() {
    let fx = Fixture::new();
    fx.deploy("v1").await;
    let registry = registry(&fx);
    registry
        .create_agent(ml("ml-1", ModelRef::Slot("default".to_string())))
        .unwrap();
    registry.start_agent("ml-1").await.unwrap();

    assert_eq!(fx.manager.assignments().agents_for("v1"), vec!["ml-1".to_string()]);
    registry.unregister_agent("ml-1").await.unwrap();
    assert!(fx.manager.assignments().agents_for("v1").is_empty());
}

#[tokio::test]
async fn test_registry_replace_config_restarts_agent() {
    let fx = Fixture::new();
    let registry = registry(&fx);
    registry.create_agent(AgentConfig::rule_based("swap")).unwrap();
    registry.start_agent("swap").await.unwrap();

    let status = registry
        .replace_config(ml("swap", ModelRef::Slot("default".to_string())))
        .await
        .unwrap();
    assert_eq!(status, AgentStatus::Inactive);
    assert_eq!(registry.get("swap").unwrap().config().strategy.name(), "ml");

    let err = registry
        .replace_config(AgentConfig::rule_based("other"))
        .await
        .unwrap_err();
    assert!(matches!(err, ConfigError::UnknownAgent(_)));
}

#[tokio::test]
async fn test_registry_run_until_shutdown() {
    let fx = Fixture::new();
    let registry = Arc::new(registry(&fx));
    registry.create_agent(AgentConfig::rule_based("loop")).unwrap();
    registry.start_all().await;

    let (tx, rx) = broadcast::channel(1);
    let driver = tokio::spawn(registry.clone().run(Duration::from_millis(10), rx));

    while registry.get("loop").unwrap().status().cycles_completed == 0 {
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    tx.send(()).unwrap();
    driver.await.unwrap();

    let agent = registry.get("loop").unwrap();
    assert_eq!(agent.status().status, AgentStatus::Inactive);
    assert!(!agent.is_due(Instant::now()));
    assert_eq!(fx.sink.take().len(), 1);
}
