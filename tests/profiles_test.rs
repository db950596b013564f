//! Profile registry behavior: startup validation, hot reload with
//! atomic swap, failed reloads leaving the active set intact, and pinned
//! version history.

mod helpers;

use visionflow::models::qa::QaTier;
use visionflow::models::task::AnalysisType;
use visionflow::profiles::ProfileRegistry;

#[tokio::test]
async fn full_tree_loads_and_serves_every_profile() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    let registry = ProfileRegistry::load(dir.path()).unwrap();
    let set = registry.snapshot().await;

    use strum::IntoEnumIterator;
    for analysis_type in AnalysisType::iter() {
        assert!(set.analysis_profile(analysis_type).is_some());
        for tier in QaTier::ALL {
            assert!(set.corrective_stage(analysis_type, tier).is_some());
        }
    }
    assert_eq!(set.version, "set-1");
}

#[test]
fn missing_profile_is_fatal_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    std::fs::remove_file(dir.path().join("analysis/colors.yaml")).unwrap();
    assert!(ProfileRegistry::load(dir.path()).is_err());
}

#[test]
fn invalid_profile_is_fatal_at_startup() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    std::fs::write(
        dir.path().join("analysis/colors.yaml"),
        helpers::analysis_yaml(AnalysisType::Colors).replace("temperature: 0.1", "temperature: 9.0"),
    )
    .unwrap();
    assert!(ProfileRegistry::load(dir.path()).is_err());
}

#[tokio::test]
async fn reload_without_changes_is_a_noop() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    let registry = ProfileRegistry::load(dir.path()).unwrap();

    let report = registry.reload().await;
    assert!(!report.swapped);
    assert!(report.changed.is_empty());
    assert!(report.failed.is_empty());
    assert_eq!(registry.snapshot().await.version, "set-1");
}

#[tokio::test]
async fn changed_profile_swaps_the_set_and_notifies_subscribers() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    let registry = ProfileRegistry::load(dir.path()).unwrap();
    let mut subscription = registry.subscribe();

    let updated = helpers::analysis_yaml(AnalysisType::Colors)
        .replace("- \"this image shows\"", "- \"this image shows\"\n  - \"the picture depicts\"");
    std::fs::write(dir.path().join("analysis/colors.yaml"), updated).unwrap();

    let report = registry.reload().await;
    assert!(report.swapped);
    assert_eq!(report.changed, vec!["analysis/colors.yaml".to_string()]);
    assert_eq!(registry.snapshot().await.version, "set-2");

    let notification = tokio::time::timeout(std::time::Duration::from_secs(1), subscription.recv())
        .await
        .expect("subscriber notified")
        .unwrap();
    assert!(notification.swapped);
    assert_eq!(notification.version.as_deref(), Some("set-2"));

    // The new set carries the new phrase; tasks pinned on set-1 still
    // resolve the old one.
    let current = registry.snapshot().await;
    let profile = current.analysis_profile(AnalysisType::Colors).unwrap();
    assert!(profile
        .prohibited_phrases
        .iter()
        .any(|p| p == "the picture depicts"));

    let pinned = registry.pinned("set-1").await.expect("history retains set-1");
    let old_profile = pinned.analysis_profile(AnalysisType::Colors).unwrap();
    assert!(!old_profile
        .prohibited_phrases
        .iter()
        .any(|p| p == "the picture depicts"));
}

#[tokio::test]
async fn failed_reload_keeps_the_active_set() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    let registry = ProfileRegistry::load(dir.path()).unwrap();

    std::fs::write(dir.path().join("analysis/colors.yaml"), "not: [valid").unwrap();
    let report = registry.reload().await;
    assert!(!report.swapped);
    assert!(!report.failed.is_empty());

    // Active set unchanged and still fully usable.
    let set = registry.snapshot().await;
    assert_eq!(set.version, "set-1");
    assert!(set.analysis_profile(AnalysisType::Colors).is_some());
}

#[tokio::test]
async fn corrective_template_validation_applies_on_reload() {
    let dir = tempfile::tempdir().unwrap();
    helpers::write_profile_tree(dir.path());
    let registry = ProfileRegistry::load(dir.path()).unwrap();

    // Strip {{IMAGE}} from a rewrite prompt; the reload must reject it.
    let broken = helpers::corrective_yaml(AnalysisType::Colors, QaTier::ContentQuality)
        .replace("Image: {{IMAGE}}. ", "");
    std::fs::write(
        dir.path().join("corrective/colors/content_quality.yaml"),
        broken,
    )
    .unwrap();
    let report = registry.reload().await;
    assert!(!report.swapped);
    assert_eq!(report.failed.len(), 1);
    assert!(report.failed[0].0.contains("corrective/colors/content_quality.yaml"));
}
