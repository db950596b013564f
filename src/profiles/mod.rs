//! Profile registry: loads and validates the analysis and corrective
//! configuration tree, serves immutable snapshots to workers, and swaps
//! the active set atomically on reload.

pub mod schema;
pub mod template;
pub mod watcher;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use strum::IntoEnumIterator;
use tokio::sync::{broadcast, RwLock};
use tracing::{info, warn};

use crate::models::qa::QaTier;
use crate::models::task::AnalysisType;
use crate::profiles::schema::{AnalysisProfile, CorrectiveStage};

/// How many superseded profile sets stay resolvable by version, so tasks
/// pinned at QA entry can finish under the rules they started with.
const PINNED_SET_HISTORY: usize = 8;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("config directory not found: {0}")]
    DirectoryNotFound(PathBuf),

    #[error("missing profile file: {0}")]
    MissingProfile(PathBuf),

    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("{path}: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

/// An immutable, versioned snapshot of every profile.
#[derive(Debug)]
pub struct ProfileSet {
    /// Monotonic set version, stamped at swap time.
    pub version: String,
    analysis: HashMap<AnalysisType, Arc<AnalysisProfile>>,
    corrective: HashMap<(AnalysisType, QaTier), Arc<CorrectiveStage>>,
    /// Raw file contents keyed by relative path, used to diff reloads.
    sources: BTreeMap<String, String>,
}

impl ProfileSet {
    pub fn analysis_profile(&self, analysis_type: AnalysisType) -> Option<Arc<AnalysisProfile>> {
        self.analysis.get(&analysis_type).cloned()
    }

    pub fn corrective_stage(
        &self,
        analysis_type: AnalysisType,
        tier: QaTier,
    ) -> Option<Arc<CorrectiveStage>> {
        self.corrective.get(&(analysis_type, tier)).cloned()
    }

    /// Per-profile versions, frozen into each process's config snapshot.
    pub fn snapshot_json(&self) -> serde_json::Value {
        let analysis: BTreeMap<String, String> = self
            .analysis
            .iter()
            .map(|(t, p)| (t.to_string(), p.version.clone()))
            .collect();
        serde_json::json!({
            "set_version": self.version,
            "analysis_versions": analysis,
        })
    }
}

/// Outcome of one reload cycle.
#[derive(Debug, Clone)]
pub struct ReloadReport {
    /// New active set version, when a swap happened.
    pub version: Option<String>,
    pub swapped: bool,
    /// Relative paths whose content changed since the active set.
    pub changed: Vec<String>,
    /// Relative path plus reason for every profile that failed validation.
    pub failed: Vec<(String, String)>,
}

impl ReloadReport {
    fn noop(active_version: &str) -> Self {
        Self {
            version: Some(active_version.to_string()),
            swapped: false,
            changed: Vec::new(),
            failed: Vec::new(),
        }
    }
}

struct Inner {
    active: Arc<ProfileSet>,
    history: VecDeque<Arc<ProfileSet>>,
    swap_counter: u64,
}

/// Serves the active profile set. Reads clone an `Arc` under a read lock;
/// reload validates the whole tree before touching the active pointer.
pub struct ProfileRegistry {
    dir: PathBuf,
    inner: RwLock<Inner>,
    tx: broadcast::Sender<ReloadReport>,
}

impl ProfileRegistry {
    /// Load the full tree at startup. Any invalid profile is fatal here,
    /// unlike reload, which keeps the prior set.
    pub fn load(dir: impl Into<PathBuf>) -> Result<Self, ProfileError> {
        let dir = dir.into();
        let loaded = load_tree(&dir)?;
        let set = Arc::new(build_set("set-1".to_string(), loaded));
        info!(version = %set.version, "profile set loaded");
        let (tx, _) = broadcast::channel(16);
        Ok(Self {
            dir,
            inner: RwLock::new(Inner {
                active: set,
                history: VecDeque::new(),
                swap_counter: 1,
            }),
            tx,
        })
    }

    /// Current active set. Callers hold the snapshot for the duration of a
    /// task so a concurrent swap cannot change behavior mid-flight.
    pub async fn snapshot(&self) -> Arc<ProfileSet> {
        self.inner.read().await.active.clone()
    }

    /// Resolve a previously active set by version, for tasks pinned before
    /// a swap. Falls back to `None` once the set ages out of the history.
    pub async fn pinned(&self, version: &str) -> Option<Arc<ProfileSet>> {
        let inner = self.inner.read().await;
        if inner.active.version == version {
            return Some(inner.active.clone());
        }
        inner
            .history
            .iter()
            .find(|s| s.version == version)
            .cloned()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ReloadReport> {
        self.tx.subscribe()
    }

    /// Re-read the tree, validate, and swap if anything changed. On any
    /// validation failure the active set is left untouched and the report
    /// lists the failures.
    pub async fn reload(&self) -> ReloadReport {
        let sources = match read_sources(&self.dir) {
            Ok(s) => s,
            Err(e) => {
                warn!(error = %e, "profile reload aborted: tree unreadable");
                return ReloadReport {
                    version: None,
                    swapped: false,
                    changed: Vec::new(),
                    failed: vec![(self.dir.display().to_string(), e.to_string())],
                };
            }
        };

        let mut inner = self.inner.write().await;

        let changed: Vec<String> = sources
            .iter()
            .filter(|(path, content)| inner.active.sources.get(*path) != Some(*content))
            .map(|(path, _)| path.clone())
            .collect();
        if changed.is_empty() && sources.len() == inner.active.sources.len() {
            return ReloadReport::noop(&inner.active.version);
        }

        match parse_sources(&self.dir, sources) {
            Ok(loaded) => {
                inner.swap_counter += 1;
                let version = format!("set-{}", inner.swap_counter);
                let set = Arc::new(build_set(version.clone(), loaded));
                let previous = std::mem::replace(&mut inner.active, set);
                inner.history.push_front(previous);
                inner.history.truncate(PINNED_SET_HISTORY);
                let report = ReloadReport {
                    version: Some(version.clone()),
                    swapped: true,
                    changed,
                    failed: Vec::new(),
                };
                info!(version = %version, changed = report.changed.len(), "profile set swapped");
                // Listeners run on their own task, never under the writer lock.
                let tx = self.tx.clone();
                let notification = report.clone();
                drop(inner);
                tokio::spawn(async move {
                    let _ = tx.send(notification);
                });
                report
            }
            Err(failures) => {
                warn!(failures = failures.len(), "profile reload rejected; keeping active set");
                ReloadReport {
                    version: Some(inner.active.version.clone()),
                    swapped: false,
                    changed,
                    failed: failures,
                }
            }
        }
    }
}

struct LoadedTree {
    analysis: Vec<(AnalysisType, AnalysisProfile)>,
    corrective: Vec<(AnalysisType, QaTier, CorrectiveStage)>,
    sources: BTreeMap<String, String>,
}

fn analysis_rel_path(t: AnalysisType) -> String {
    format!("analysis/{t}.yaml")
}

fn corrective_rel_path(t: AnalysisType, tier: QaTier) -> String {
    format!("corrective/{t}/{tier}.yaml")
}

fn read_sources(dir: &Path) -> Result<BTreeMap<String, String>, ProfileError> {
    if !dir.is_dir() {
        return Err(ProfileError::DirectoryNotFound(dir.to_path_buf()));
    }
    let mut sources = BTreeMap::new();
    for t in AnalysisType::iter() {
        let mut rels = vec![analysis_rel_path(t)];
        for tier in QaTier::ALL {
            rels.push(corrective_rel_path(t, tier));
        }
        for rel in rels {
            let path = dir.join(&rel);
            let content = std::fs::read_to_string(&path).map_err(|source| {
                if source.kind() == std::io::ErrorKind::NotFound {
                    ProfileError::MissingProfile(path.clone())
                } else {
                    ProfileError::Io {
                        path: path.clone(),
                        source,
                    }
                }
            })?;
            sources.insert(rel, content);
        }
    }
    Ok(sources)
}

/// Parse and validate every source file; collects all failures instead of
/// stopping at the first so the reload report is complete.
fn parse_sources(
    _dir: &Path,
    sources: BTreeMap<String, String>,
) -> Result<LoadedTree, Vec<(String, String)>> {
    let mut analysis = Vec::new();
    let mut corrective = Vec::new();
    let mut failures = Vec::new();

    for t in AnalysisType::iter() {
        let rel = analysis_rel_path(t);
        let raw = sources.get(&rel).expect("source map covers closed set");
        match AnalysisProfile::from_yaml(raw, t) {
            Ok(profile) => analysis.push((t, profile)),
            Err(e) => failures.push((rel, e.to_string())),
        }
        for tier in QaTier::ALL {
            let rel = corrective_rel_path(t, tier);
            let raw = sources.get(&rel).expect("source map covers closed set");
            match CorrectiveStage::from_yaml(raw, t, tier) {
                Ok(stage) => corrective.push((t, tier, stage)),
                Err(e) => failures.push((rel, e.to_string())),
            }
        }
    }

    if failures.is_empty() {
        Ok(LoadedTree {
            analysis,
            corrective,
            sources,
        })
    } else {
        Err(failures)
    }
}

fn load_tree(dir: &Path) -> Result<LoadedTree, ProfileError> {
    let sources = read_sources(dir)?;
    parse_sources(dir, sources).map_err(|mut failures| {
        let (rel, reason) = failures.remove(0);
        ProfileError::Invalid {
            path: dir.join(rel),
            reason,
        }
    })
}

fn build_set(version: String, tree: LoadedTree) -> ProfileSet {
    ProfileSet {
        version,
        analysis: tree
            .analysis
            .into_iter()
            .map(|(t, p)| (t, Arc::new(p)))
            .collect(),
        corrective: tree
            .corrective
            .into_iter()
            .map(|(t, tier, s)| ((t, tier), Arc::new(s)))
            .collect(),
        sources: tree.sources,
    }
}
