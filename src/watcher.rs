//! Filesystem watch → `FileEvent` stream, one watcher per registered
//! repository root. Grounded on the reference daemon's
//! `repo::watcher::start_watcher` (debounced `notify-debouncer-full` setup
//! with events forwarded onto the tokio runtime from the watcher's own OS
//! thread).

use notify_debouncer_full::notify::{EventKind, RecursiveMode};
use notify_debouncer_full::{new_debouncer, DebounceEventResult, Debouncer, FileIdMap};
use std::path::PathBuf;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKindTag {
    Create,
    Modify,
    Delete,
    Rename,
}

#[derive(Debug, Clone)]
pub struct FileEvent {
    pub repo_root: PathBuf,
    pub path: PathBuf,
    pub detected_at: Instant,
    pub kind: EventKindTag,
}

const WATCH_DEBOUNCE: Duration = Duration::from_millis(300);

/// Starts a watcher rooted at `repo_root`, forwarding every relevant event
/// as a `FileEvent` on `tx`. Holding the returned `Debouncer` keeps the
/// watch alive; dropping it stops watching.
pub fn start_watcher(
    repo_root: PathBuf,
    tx: mpsc::Sender<FileEvent>,
) -> notify_debouncer_full::notify::Result<
    Debouncer<notify_debouncer_full::notify::RecommendedWatcher, FileIdMap>,
> {
    let rt_handle = tokio::runtime::Handle::current();
    let root_for_events = repo_root.clone();

    let mut debouncer = new_debouncer(
        WATCH_DEBOUNCE,
        None,
        move |result: DebounceEventResult| match result {
            Ok(events) => {
                for event in events {
                    let Some(kind) = classify_kind(&event.event.kind) else {
                        continue;
                    };
                    for path in event.event.paths.iter().cloned() {
                        let tx = tx.clone();
                        let repo_root = root_for_events.clone();
                        rt_handle.spawn(async move {
                            let _ = tx
                                .send(FileEvent {
                                    repo_root,
                                    path,
                                    detected_at: Instant::now(),
                                    kind,
                                })
                                .await;
                        });
                    }
                }
            }
            Err(errors) => {
                for e in errors {
                    warn!(err = %e, "filesystem watch error");
                }
            }
        },
    )?;

    use notify_debouncer_full::notify::Watcher as _;
    debouncer.watcher().watch(&repo_root, RecursiveMode::Recursive)?;
    Ok(debouncer)
}

fn classify_kind(kind: &EventKind) -> Option<EventKindTag> {
    match kind {
        EventKind::Create(_) => Some(EventKindTag::Create),
        EventKind::Modify(notify_debouncer_full::notify::event::ModifyKind::Name(_)) => {
            Some(EventKindTag::Rename)
        }
        EventKind::Modify(_) => Some(EventKindTag::Modify),
        EventKind::Remove(_) => Some(EventKindTag::Delete),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn watcher_reports_modified_file() {
        let dir = tempfile::tempdir().unwrap();
        let file_path = dir.path().join("a.txt");
        std::fs::write(&file_path, b"initial").unwrap();

        let (tx, mut rx) = mpsc::channel(16);
        let _debouncer = start_watcher(dir.path().to_path_buf(), tx).unwrap();

        tokio::time::sleep(Duration::from_millis(100)).await;
        std::fs::write(&file_path, b"changed").unwrap();

        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("channel closed");
        assert_eq!(event.repo_root, dir.path());
    }
}
