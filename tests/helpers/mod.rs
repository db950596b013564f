//! Shared test doubles: a scripted vision model, a fake job registry, a
//! canned image provider, and a generator for a complete profile tree.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use strum::IntoEnumIterator;
use tokio::sync::Mutex;
use uuid::Uuid;

use visionflow::broker::memory::MemoryBroker;
use visionflow::db::{self, store::StateStore};
use visionflow::models::job::{
    AnalysisRef, AnalysisSubmission, ClientRef, MediaRef, ProjectRef, ProjectStatus, RegistryJob,
};
use visionflow::models::qa::QaTier;
use visionflow::models::report::QualityReport;
use visionflow::models::task::AnalysisType;
use visionflow::profiles::ProfileRegistry;
use visionflow::qa::QaPipeline;
use visionflow::services::images::{ImageError, ImageProvider};
use visionflow::services::notify::{NotificationSink, NotifyChannel};
use visionflow::services::registry::{JobRegistry, RegistryError};
use visionflow::services::vision::{ModelCall, ModelError, VisionModel};
use visionflow::worker::{MediaLocks, WorkerContext};

// ── Scripted vision model ───────────────────────────────────────────────

pub type ModelScript = dyn Fn(&ModelCall) -> Result<String, ModelError> + Send + Sync;

/// Vision model driven by a test-supplied closure; every call is recorded.
pub struct ScriptedModel {
    script: Box<ModelScript>,
    pub calls: std::sync::Mutex<Vec<ModelCall>>,
}

impl ScriptedModel {
    pub fn new(script: impl Fn(&ModelCall) -> Result<String, ModelError> + Send + Sync + 'static) -> Self {
        Self {
            script: Box::new(script),
            calls: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }
}

#[async_trait]
impl VisionModel for ScriptedModel {
    async fn generate(&self, call: &ModelCall) -> Result<String, ModelError> {
        self.calls.lock().unwrap().push(call.clone());
        (self.script)(call)
    }
}

// ── Fake registry ───────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub enum RegistryEvent {
    Status(Uuid, ProjectStatus),
    Submission(Uuid, Uuid, Uuid, AnalysisSubmission),
    Report(Uuid, QualityReport),
}

#[derive(Default)]
pub struct FakeRegistry {
    jobs: Mutex<VecDeque<RegistryJob>>,
    pub events: Mutex<Vec<RegistryEvent>>,
}

impl FakeRegistry {
    pub fn with_job(job: RegistryJob) -> Self {
        let registry = Self::default();
        registry.jobs.try_lock().unwrap().push_back(job);
        registry
    }

    pub async fn push_job(&self, job: RegistryJob) {
        self.jobs.lock().await.push_back(job);
    }

    pub async fn status_updates(&self) -> Vec<ProjectStatus> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::Status(_, s) => Some(*s),
                _ => None,
            })
            .collect()
    }

    pub async fn submissions(&self) -> Vec<AnalysisSubmission> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::Submission(_, _, _, s) => Some(s.clone()),
                _ => None,
            })
            .collect()
    }

    pub async fn reports(&self) -> Vec<QualityReport> {
        self.events
            .lock()
            .await
            .iter()
            .filter_map(|e| match e {
                RegistryEvent::Report(_, r) => Some(r.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl JobRegistry for FakeRegistry {
    async fn next_job(&self) -> Result<Option<RegistryJob>, RegistryError> {
        Ok(self.jobs.lock().await.pop_front())
    }

    async fn update_project_status(
        &self,
        project_id: Uuid,
        status: ProjectStatus,
    ) -> Result<(), RegistryError> {
        self.events
            .lock()
            .await
            .push(RegistryEvent::Status(project_id, status));
        Ok(())
    }

    async fn submit_analysis_result(
        &self,
        project_id: Uuid,
        media_id: Uuid,
        analysis_id: Uuid,
        submission: &AnalysisSubmission,
    ) -> Result<(), RegistryError> {
        self.events.lock().await.push(RegistryEvent::Submission(
            project_id,
            media_id,
            analysis_id,
            submission.clone(),
        ));
        Ok(())
    }

    async fn submit_report(
        &self,
        project_id: Uuid,
        report: &QualityReport,
    ) -> Result<(), RegistryError> {
        self.events
            .lock()
            .await
            .push(RegistryEvent::Report(project_id, report.clone()));
        Ok(())
    }
}

// ── Fake image provider & notification sink ─────────────────────────────

pub struct FakeImages;

#[async_trait]
impl ImageProvider for FakeImages {
    async fn fetch(
        &self,
        _media_id: Uuid,
        _optimised_url: &str,
        _greyscale_url: Option<&str>,
    ) -> Result<Vec<u8>, ImageError> {
        Ok(vec![0xFF, 0xD8, 0xFF, 0xE0, 1, 2, 3, 4])
    }
}

#[derive(Default)]
pub struct RecordingSink {
    pub notifications: std::sync::Mutex<Vec<(NotifyChannel, serde_json::Value)>>,
}

#[async_trait]
impl NotificationSink for RecordingSink {
    async fn notify(&self, channel: NotifyChannel, payload: serde_json::Value) {
        self.notifications.lock().unwrap().push((channel, payload));
    }
}

// ── Profile tree generation ─────────────────────────────────────────────

pub fn analysis_yaml(analysis_type: AnalysisType) -> String {
    format!(
        r#"analysis_type: {analysis_type}
version: "1.0.0"
model:
  name: "qwen2.5vl:32b"
  temperature: 0.1
  context_size: 32768
  max_output_tokens: 1024
prompts:
  system: "You are an expert {analysis_type} analyst. Respond with JSON only."
  user: "Analyse the following image and describe its {analysis_type}: {{{{IMAGE}}}}"
  placeholders: [IMAGE]
output_schema:
  fields:
    - name: findings
      kind: array
      min_items: 1
      max_items: 32
    - name: summary
      kind: string
      min_length: 3
      max_length: 500
prohibited_phrases:
  - "this image shows"
  - "as an ai"
"#
    )
}

pub fn corrective_yaml(analysis_type: AnalysisType, tier: QaTier) -> String {
    let review = match tier {
        QaTier::Structural => String::new(),
        QaTier::ContentQuality => format!(
            r#"review_prompt:
  system: "You review {analysis_type} analyses for phrasing and tone."
  user: "Respond with a JSON verdict (pass, issues) for: {{{{PRIOR_OUTPUT}}}}"
  placeholders: [PRIOR_OUTPUT]
"#
        ),
        QaTier::DomainExpert => format!(
            r#"review_prompt:
  system: "You are a domain expert in {analysis_type}."
  user: "Judge accuracy against the image. Output under review: {{{{PRIOR_OUTPUT}}}}"
  placeholders: [IMAGE, PRIOR_OUTPUT]
"#
        ),
    };
    format!(
        r#"analysis_type: {analysis_type}
tier: {tier}
version: "1.0.0"
model:
  name: "qwen2.5vl:latest"
  temperature: 0.05
  context_size: 32768
  max_output_tokens: 1024
{review}rewrite_prompt:
  system: "You fix {analysis_type} analyses."
  user: "Image: {{{{IMAGE}}}}. Rewrite this output, fixing the identified defects: {{{{PRIOR_OUTPUT}}}}"
  placeholders: [IMAGE, PRIOR_OUTPUT]
"#
    )
}

/// Write a complete, valid profile tree (21 analysis + 63 corrective
/// stage documents) under `dir`.
pub fn write_profile_tree(dir: &Path) {
    for analysis_type in AnalysisType::iter() {
        let analysis_dir = dir.join("analysis");
        std::fs::create_dir_all(&analysis_dir).unwrap();
        std::fs::write(
            analysis_dir.join(format!("{analysis_type}.yaml")),
            analysis_yaml(analysis_type),
        )
        .unwrap();
        for tier in QaTier::ALL {
            let corrective_dir = dir.join("corrective").join(analysis_type.to_string());
            std::fs::create_dir_all(&corrective_dir).unwrap();
            std::fs::write(
                corrective_dir.join(format!("{tier}.yaml")),
                corrective_yaml(analysis_type, tier),
            )
            .unwrap();
        }
    }
}

// ── Registry job fixtures ───────────────────────────────────────────────

pub fn make_job(media_count: usize, analysis_slugs: &[&str]) -> RegistryJob {
    RegistryJob {
        client: ClientRef {
            id: Uuid::new_v4(),
            slug: "acme".into(),
            name: "Acme Studios".into(),
        },
        project: ProjectRef {
            id: Uuid::new_v4(),
            slug: "spring-catalog".into(),
            name: "Spring Catalog".into(),
        },
        media: (0..media_count)
            .map(|i| MediaRef {
                id: Uuid::new_v4(),
                filename: format!("img-{i}.jpg"),
                optimised_path: format!("https://img.example/{i}/opt.jpg"),
                greyscale_path: Some(format!("https://img.example/{i}/grey.jpg")),
            })
            .collect(),
        analyses: analysis_slugs
            .iter()
            .map(|slug| AnalysisRef {
                id: Uuid::new_v4(),
                name: slug.to_string(),
                slug: slug.to_string(),
            })
            .collect(),
    }
}

// ── Full in-process harness ─────────────────────────────────────────────

pub struct Harness {
    pub store: StateStore,
    pub broker: Arc<MemoryBroker>,
    pub profiles: Arc<ProfileRegistry>,
    pub model: Arc<ScriptedModel>,
    pub registry: Arc<FakeRegistry>,
    pub sink: Arc<RecordingSink>,
    pub ctx: Arc<WorkerContext>,
    pub orchestrator: Arc<visionflow::orchestrator::Orchestrator>,
    pub config_dir: tempfile::TempDir,
}

pub async fn harness(
    registry: FakeRegistry,
    script: impl Fn(&ModelCall) -> Result<String, ModelError> + Send + Sync + 'static,
) -> Harness {
    harness_with(registry, script, 1000, Duration::from_secs(300)).await
}

pub async fn harness_with(
    registry: FakeRegistry,
    script: impl Fn(&ModelCall) -> Result<String, ModelError> + Send + Sync + 'static,
    queue_capacity: usize,
    inflight_ttl: Duration,
) -> Harness {
    let config_dir = tempfile::tempdir().unwrap();
    write_profile_tree(config_dir.path());
    let profiles = Arc::new(ProfileRegistry::load(config_dir.path()).unwrap());

    let pool = db::init_pool("sqlite::memory:").await.unwrap();
    db::run_migrations(&pool).await.unwrap();
    let store = StateStore::new(pool);

    let broker = Arc::new(MemoryBroker::new(queue_capacity, inflight_ttl));
    let model = Arc::new(ScriptedModel::new(script));
    let registry = Arc::new(registry);
    let sink = Arc::new(RecordingSink::default());
    let semaphore = Arc::new(tokio::sync::Semaphore::new(8));

    let qa = QaPipeline::new(store.clone(), model.clone(), semaphore.clone());
    let ctx = Arc::new(WorkerContext {
        store: store.clone(),
        broker: broker.clone(),
        profiles: profiles.clone(),
        model: model.clone(),
        images: Arc::new(FakeImages),
        qa,
        semaphore,
        media_locks: MediaLocks::default(),
    });
    let orchestrator = Arc::new(visionflow::orchestrator::Orchestrator::new(
        store.clone(),
        broker.clone(),
        registry.clone(),
        profiles.clone(),
        sink.clone(),
        Duration::from_secs(10),
    ));

    Harness {
        store,
        broker,
        profiles,
        model,
        registry,
        sink,
        ctx,
        orchestrator,
        config_dir,
    }
}

/// Spawn `workers` workers and pump the orchestrator loops until the
/// process reaches a terminal status, then stop the workers.
pub async fn drive_process(
    h: &Harness,
    process_id: Uuid,
    workers: usize,
    timeout: Duration,
) -> visionflow::models::process::Process {
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let mut handles = Vec::new();
    for index in 0..workers {
        let worker =
            visionflow::worker::AnalysisWorker::new(index, h.ctx.clone(), shutdown_rx.clone());
        handles.push(tokio::spawn(worker.run()));
    }
    let deadline = std::time::Instant::now() + timeout;
    let process = loop {
        let _ = h.orchestrator.notify_processing_once().await;
        let _ = h
            .orchestrator
            .drain_completions_once(Duration::from_millis(25))
            .await;
        let process = h.store.get_process(process_id).await.unwrap().unwrap();
        if process.status.is_terminal() {
            break process;
        }
        if std::time::Instant::now() > deadline {
            let _ = shutdown_tx.send(true);
            panic!("process did not reach a terminal status: {process:?}");
        }
    };
    shutdown_tx.send(true).unwrap();
    for handle in handles {
        let _ = handle.await;
    }
    process
}

/// A well-formed analysis output that passes every local check.
pub fn good_output() -> String {
    r#"{"findings": ["warm palette", "soft light"], "summary": "Warm, softly lit interior."}"#
        .to_string()
}

/// A passing agent verdict, high confidence.
pub fn pass_verdict() -> String {
    r#"{"pass": true, "confidence": 0.95}"#.to_string()
}
