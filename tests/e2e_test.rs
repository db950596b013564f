//! Live end-to-end test against real services.
//!
//! Requires a running Redis and an Ollama runtime with the configured
//! models pulled, plus environment variables:
//! DATABASE_URL, REDIS_URL, MODEL_BASE_URL, CONFIG_DIR.
//!
//! Run with: cargo test --test e2e_test -- --ignored

mod helpers;

use std::time::Duration;

use visionflow::broker::redis::RedisBroker;
use visionflow::broker::{Priority, QueueBroker, QueueKey};
use visionflow::config::AppConfig;
use visionflow::db::{self, store::StateStore};
use visionflow::models::task::AnalysisType;
use visionflow::profiles::ProfileRegistry;
use visionflow::services::vision::{ModelCall, OllamaClient, VisionModel};

#[tokio::test]
#[ignore] // Run with: cargo test --test e2e_test -- --ignored
async fn live_stack_smoke() {
    let config = AppConfig::from_env().expect("environment not configured for e2e");

    // State store connects and migrates.
    let pool = db::init_pool(&config.database_url)
        .await
        .expect("state store unreachable");
    db::run_migrations(&pool).await.expect("migrations failed");
    let store = StateStore::new(pool);
    let job = helpers::make_job(1, &["colors"]);
    let process = store
        .create_process(&job, serde_json::json!({}))
        .await
        .expect("process row");
    assert_eq!(process.total_tasks, 0);

    // Profiles load from the configured tree.
    let profiles = ProfileRegistry::load(&config.config_dir).expect("profile tree invalid");
    let set = profiles.snapshot().await;
    let profile = set
        .analysis_profile(AnalysisType::Colors)
        .expect("colors profile");

    // Redis broker round-trip.
    let redis_url = config.redis_url.as_deref().expect("REDIS_URL required");
    let broker =
        RedisBroker::new(redis_url, 100, Duration::from_secs(60)).expect("redis unreachable");
    let queue = QueueKey::Analysis(AnalysisType::Colors);
    let task_id = uuid::Uuid::new_v4();
    assert!(broker.enqueue(queue, task_id, Priority::Normal).await.unwrap());
    let delivery = broker
        .dequeue(queue, Duration::from_secs(2))
        .await
        .unwrap()
        .expect("delivery");
    assert_eq!(delivery.task_id, task_id);
    broker.ack(&delivery).await.unwrap();

    // Model runtime answers a minimal prompt.
    let model = OllamaClient::new(&config.model_base_url);
    assert!(model.is_ready().await, "model runtime not ready");
    let mut call = ModelCall::from_params(&profile.model, profile.deadline_seconds);
    call.system = "Answer with a single JSON object.".into();
    call.user = r#"Return {"ok": true} and nothing else."#.into();
    let response = model.generate(&call).await.expect("generation failed");
    assert!(response.contains("ok"));

    println!("✅ live stack smoke passed");
}
