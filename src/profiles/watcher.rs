//! Polls the configuration tree for changes and triggers a reload when the
//! directory signature moves. Polling keeps behavior identical across
//! local filesystems and network mounts.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::watch;
use tracing::{debug, warn};

use crate::profiles::ProfileRegistry;

const POLL_INTERVAL: Duration = Duration::from_secs(2);

/// Newest mtime and file count under the tree; cheap to compare between
/// polls and insensitive to edit ordering.
fn tree_signature(dir: &Path) -> (Option<SystemTime>, usize) {
    let mut newest: Option<SystemTime> = None;
    let mut count = 0usize;
    let mut pending: Vec<PathBuf> = vec![dir.to_path_buf()];
    while let Some(path) = pending.pop() {
        let Ok(entries) = std::fs::read_dir(&path) else {
            continue;
        };
        for entry in entries.flatten() {
            let path = entry.path();
            if path.is_dir() {
                pending.push(path);
            } else if path.extension().is_some_and(|e| e == "yaml" || e == "yml") {
                count += 1;
                if let Ok(meta) = entry.metadata() {
                    if let Ok(mtime) = meta.modified() {
                        newest = Some(newest.map_or(mtime, |n| n.max(mtime)));
                    }
                }
            }
        }
    }
    (newest, count)
}

/// Run until the shutdown flag flips. Each detected change triggers one
/// registry reload; a failed reload leaves the active set in place and is
/// retried on the next change.
pub async fn watch_config_tree(
    dir: PathBuf,
    registry: Arc<ProfileRegistry>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut signature = tree_signature(&dir);
    loop {
        tokio::select! {
            _ = tokio::time::sleep(POLL_INTERVAL) => {}
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
        }
        let current = tree_signature(&dir);
        if current != signature {
            signature = current;
            debug!("config tree changed, reloading profiles");
            let report = registry.reload().await;
            if !report.failed.is_empty() {
                for (path, reason) in &report.failed {
                    warn!(%path, %reason, "profile rejected during hot reload");
                }
            }
        }
    }
}
