use crate::step::Step;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::{debug, info};

/// Decides, once per run-loop iteration, whether the script must be re-resolved.
///
/// Two triggers: a watched source's modification time changed, or an operator
/// asked for a reload. Writes made by the repair loop are acknowledged so they
/// do not count as outside edits.
#[derive(Debug, Default)]
pub struct ReloadCoordinator {
    watched: HashMap<PathBuf, Option<SystemTime>>,
    requested: bool,
}

fn modified(path: &Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

fn normalize(path: &Path) -> PathBuf {
    path.canonicalize().unwrap_or_else(|_| path.to_path_buf())
}

impl ReloadCoordinator {
    pub fn new(sources: &[PathBuf]) -> Self {
        let mut coordinator = Self::default();
        coordinator.rebaseline(sources);
        coordinator
    }

    /// Watch exactly `sources`, taking their current modification times as the baseline.
    pub fn rebaseline(&mut self, sources: &[PathBuf]) {
        self.watched = sources
            .iter()
            .map(|path| {
                let path = normalize(path);
                let mtime = modified(&path);
                (path, mtime)
            })
            .collect();
        debug!("Watching {} script sources", self.watched.len());
    }

    pub fn request(&mut self) {
        self.requested = true;
    }

    /// Accept the current contents of `path` as known.
    pub fn acknowledge(&mut self, path: &Path) {
        let path = normalize(path);
        if let Some(mtime) = self.watched.get_mut(&path) {
            *mtime = modified(&path);
            debug!("Acknowledged write to {}", path.display());
        }
    }

    pub fn changed_sources(&self) -> Vec<PathBuf> {
        let mut changed: Vec<PathBuf> = self
            .watched
            .iter()
            .filter(|(path, mtime)| modified(path) != **mtime)
            .map(|(path, _)| path.clone())
            .collect();
        changed.sort();
        changed
    }

    /// Non-blocking check. Clears a pending operator request.
    pub fn should_reload(&mut self) -> bool {
        if std::mem::take(&mut self.requested) {
            info!("Reload requested by operator");
            return true;
        }
        let changed = self.changed_sources();
        if changed.is_empty() {
            return false;
        }
        info!("Script sources changed: {:?}", changed);
        true
    }
}

/// Keep the steps before `index` and take the rest from the fresh resolution.
/// When `index` is past the end of `fresh`, nothing is left to run.
pub fn reconcile(current: &[Step], index: usize, fresh: Vec<Step>) -> Vec<Step> {
    let executed = index.min(current.len());
    let mut steps: Vec<Step> = current[..executed].to_vec();
    steps.extend(fresh.into_iter().skip(index));
    steps
}
