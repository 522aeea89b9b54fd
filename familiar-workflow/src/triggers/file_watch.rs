//! File change triggers.
//!
//! A [`FileWatcher`] owns the OS watcher and the task that debounces its
//! events. Dropping it stops both.

use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Trailing-edge debouncer: collects changed paths and reports them once the
/// window has passed without further events.
#[derive(Debug)]
pub struct Debouncer {
    window: Duration,
    deadline: Option<Instant>,
    pending: BTreeSet<PathBuf>,
}

impl Debouncer {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            deadline: None,
            pending: BTreeSet::new(),
        }
    }

    /// Record an event and push the deadline out.
    pub fn record(&mut self, paths: impl IntoIterator<Item = PathBuf>, now: Instant) {
        self.pending.extend(paths);
        self.deadline = Some(now + self.window);
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Take the batch if its deadline has passed.
    pub fn take_due(&mut self, now: Instant) -> Option<Vec<PathBuf>> {
        match self.deadline {
            Some(deadline) if now >= deadline => {
                self.deadline = None;
                Some(std::mem::take(&mut self.pending).into_iter().collect())
            }
            _ => None,
        }
    }
}

/// Expand a leading `~/` against `$HOME`.
pub fn expand_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), std::env::var_os("HOME")) {
        (Some(rest), Some(home)) => Path::new(&home).join(rest),
        _ if path == "~" => std::env::var_os("HOME").map_or_else(|| PathBuf::from(path), PathBuf::from),
        _ => PathBuf::from(path),
    }
}

/// A live file watch.
pub struct FileWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl FileWatcher {
    /// Watch `paths` and call `on_change` once per debounced burst.
    ///
    /// Fails if any path cannot be watched. Must be called inside a tokio
    /// runtime.
    pub fn start<F>(
        paths: &[String],
        recursive: bool,
        debounce: Duration,
        on_change: F,
    ) -> notify::Result<Self>
    where
        F: Fn(Vec<PathBuf>) + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<notify::Result<notify::Event>>();
        let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
            let _ = tx.send(res);
        })?;

        let mode = if recursive {
            RecursiveMode::Recursive
        } else {
            RecursiveMode::NonRecursive
        };
        for path in paths {
            watcher.watch(&expand_home(path), mode)?;
        }

        let task = tokio::spawn(async move {
            let mut debouncer = Debouncer::new(debounce);
            loop {
                let deadline = debouncer.deadline();
                let wait = async move {
                    match deadline {
                        Some(d) => tokio::time::sleep_until(d).await,
                        None => std::future::pending().await,
                    }
                };

                tokio::select! {
                    event = rx.recv() => match event {
                        Some(Ok(event)) => {
                            if matches!(event.kind, EventKind::Access(_)) {
                                continue;
                            }
                            debouncer.record(event.paths, Instant::now());
                        }
                        Some(Err(e)) => tracing::warn!(error = %e, "File watch error"),
                        None => break,
                    },
                    _ = wait => {
                        if let Some(changed) = debouncer.take_due(Instant::now()) {
                            on_change(changed);
                        }
                    }
                }
            }
        });

        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for FileWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    #[test]
    fn test_debouncer_collapses_burst() {
        let start = Instant::now();
        let mut debouncer = Debouncer::new(Duration::from_secs(5));
        assert!(debouncer.take_due(start).is_none());

        debouncer.record([PathBuf::from("/a")], start);
        debouncer.record([PathBuf::from("/b")], start + Duration::from_secs(3));
        debouncer.record([PathBuf::from("/a")], start + Duration::from_secs(4));

        // Deadline moved to 4s + 5s
        assert!(debouncer.take_due(start + Duration::from_secs(8)).is_none());
        let batch = debouncer.take_due(start + Duration::from_secs(9)).unwrap();
        assert_eq!(batch, vec![PathBuf::from("/a"), PathBuf::from("/b")]);
        assert!(debouncer.deadline().is_none());
        assert!(debouncer.take_due(start + Duration::from_secs(60)).is_none());
    }

    #[test]
    fn test_expand_home() {
        assert_eq!(expand_home("/etc/hosts"), PathBuf::from("/etc/hosts"));
        if let Some(home) = std::env::var_os("HOME") {
            assert_eq!(expand_home("~/notes"), Path::new(&home).join("notes"));
        }
    }

    #[tokio::test]
    async fn test_unwatchable_path_is_an_error() {
        let result = FileWatcher::start(
            &["/definitely/not/a/real/path".to_string()],
            false,
            Duration::from_millis(10),
            |_| {},
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_burst_of_writes_fires_once() {
        let tmp = TempDir::new().unwrap();
        let fired = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&fired);
        let _watcher = FileWatcher::start(
            &[tmp.path().to_string_lossy().into_owned()],
            true,
            Duration::from_millis(300),
            move |paths| sink.lock().unwrap().push(paths),
        )
        .unwrap();

        for i in 0..5 {
            std::fs::write(tmp.path().join("notes.md"), format!("edit {i}")).unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }

        for _ in 0..50 {
            if !fired.lock().unwrap().is_empty() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert_eq!(fired.lock().unwrap().len(), 1);
    }
}
