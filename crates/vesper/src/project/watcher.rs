//! Project File Watcher
//!
//! Watches the project directory and feeds configuration changes to the
//! runtime, one at a time.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use super::loader::{is_config_file, normalize_path};
use super::settings::{HANDLERS_DIR, SCHEDULES_DIR, SETTINGS_FILE};
use crate::Runtime;

/// File change event
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// A handler file was created, modified or removed
    Handler(PathBuf),
    /// A schedule file was created, modified or removed
    Schedule(PathBuf),
    /// The settings file was modified
    Settings,
}

/// Project file watcher
pub struct ProjectWatcher {
    runtime: Arc<Runtime>,
    rx: mpsc::Receiver<FileChange>,
    /// The underlying watcher (kept alive)
    _watcher: RecommendedWatcher,
}

impl ProjectWatcher {
    /// Create a new project watcher
    pub fn new(runtime: Arc<Runtime>) -> Result<Self, notify::Error> {
        let project_path = normalize_path(runtime.root());
        let (tx, rx) = mpsc::channel(100);

        let root = project_path.clone();
        let mut watcher = notify::recommended_watcher(move |res: Result<Event, notify::Error>| match res {
            Ok(event) => {
                for change in classify_event(&root, &event) {
                    let _ = tx.blocking_send(change);
                }
            }
            Err(e) => {
                error!("File watcher error: {}", e);
            }
        })?;

        watcher.watch(&project_path, RecursiveMode::Recursive)?;
        info!("Watching project directory: {}", project_path.display());

        Ok(Self {
            runtime,
            rx,
            _watcher: watcher,
        })
    }

    /// Run the watcher loop
    pub async fn run(mut self) {
        info!("Starting file watcher loop");

        while let Some(first) = self.rx.recv().await {
            // a single save usually produces several events
            let mut batch = vec![first];
            while let Ok(next) = self.rx.try_recv() {
                if !batch.contains(&next) {
                    batch.push(next);
                }
            }
            for change in batch {
                self.runtime.apply_change(change).await;
            }
        }

        info!("File watcher loop ended");
    }
}

/// Map a notify event to the configuration changes it implies
pub fn classify_event(project_path: &Path, event: &Event) -> Vec<FileChange> {
    match event.kind {
        EventKind::Modify(_) | EventKind::Create(_) | EventKind::Remove(_) => {}
        _ => {
            debug!("Ignoring event kind: {:?}", event.kind);
            return Vec::new();
        }
    }

    let mut changes = Vec::new();
    for path in &event.paths {
        if let Some(change) = classify_path(project_path, path) {
            if !changes.contains(&change) {
                changes.push(change);
            }
        }
    }
    changes
}

/// Map one path under the project root to a change
pub fn classify_path(project_path: &Path, path: &Path) -> Option<FileChange> {
    let rel_path = path.strip_prefix(project_path).ok()?;
    let mut components = rel_path.components();
    let first = components.next()?.as_os_str().to_str()?;
    let rest = components.as_path();

    if first == SETTINGS_FILE && rest.as_os_str().is_empty() {
        return Some(FileChange::Settings);
    }
    // only direct children of the kind directories
    if rest.components().count() != 1 || !is_config_file(rest) {
        return None;
    }
    match first {
        HANDLERS_DIR => Some(FileChange::Handler(path.to_path_buf())),
        SCHEDULES_DIR => Some(FileChange::Schedule(path.to_path_buf())),
        _ => None,
    }
}
