use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use futures_util::StreamExt;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::gc::{GarbageCollector, GcStatus};
use crate::pagination::BlobListing;
use crate::BlobResult;

const PROGRESS_INTERVAL: u64 = 100;

/// Unique identifier of a submitted GC command
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CommandId(pub String);

impl CommandId {
    pub fn new() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for CommandId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for CommandId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for CommandId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

/// Request for one full GC pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GcCommand {
    /// `false` computes what would be reclaimed without deleting anything
    pub delete: bool,
}

impl GcCommand {
    pub fn delete() -> Self {
        Self { delete: true }
    }

    pub fn dry_run() -> Self {
        Self { delete: false }
    }
}

/// Every live blob reference known to the consumer
///
/// A key is yielded once per reference, so duplicates are expected.
pub trait LiveBlobSource: Send + Sync {
    fn live_keys(&self) -> BoxStream<'static, BlobResult<String>>;
}

impl LiveBlobSource for Vec<String> {
    fn live_keys(&self) -> BoxStream<'static, BlobResult<String>> {
        futures::stream::iter(self.clone().into_iter().map(Ok)).boxed()
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum GcCommandState {
    Scheduled,
    Running,
    Completed,
    Aborted { error: String },
}

impl GcCommandState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Aborted { .. })
    }
}

/// Progress report of a GC command
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GcCommandStatus {
    pub id: CommandId,
    pub gc_id: String,
    pub delete: bool,
    pub state: GcCommandState,
    /// Live references handled so far
    pub processed: u64,
    /// Live references that were not deletion candidates
    pub skipped: u64,
    /// Final totals, once completed
    pub result: Option<GcStatus>,
    pub submitted_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

type CommandTable = Arc<RwLock<HashMap<CommandId, GcCommandStatus>>>;

/// Runs GC passes on behalf of a batch framework and tracks their progress
pub struct GcCommandRunner<L: ?Sized> {
    gc: Arc<GarbageCollector<L>>,
    live: Arc<dyn LiveBlobSource>,
    commands: CommandTable,
}

impl<L: BlobListing + ?Sized + 'static> GcCommandRunner<L> {
    pub fn new(gc: GarbageCollector<L>, live: Arc<dyn LiveBlobSource>) -> Self {
        Self {
            gc: Arc::new(gc),
            live,
            commands: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn gc(&self) -> &GarbageCollector<L> {
        &self.gc
    }

    /// Schedule a pass on the current tokio runtime
    pub fn submit(&self, command: GcCommand) -> CommandId {
        let id = self.register(command);
        let gc = Arc::clone(&self.gc);
        let live = Arc::clone(&self.live);
        let commands = Arc::clone(&self.commands);
        let task_id = id.clone();
        tokio::spawn(async move {
            Self::execute(&gc, live.as_ref(), &commands, &task_id, command).await;
        });
        id
    }

    /// Run a pass to completion on the calling task
    pub async fn run(&self, command: GcCommand) -> GcCommandStatus {
        let id = self.register(command);
        Self::execute(&self.gc, self.live.as_ref(), &self.commands, &id, command).await
    }

    pub fn status(&self, id: &CommandId) -> Option<GcCommandStatus> {
        self.commands.read().get(id).cloned()
    }

    fn register(&self, command: GcCommand) -> CommandId {
        let id = CommandId::new();
        let status = GcCommandStatus {
            id: id.clone(),
            gc_id: self.gc.id(),
            delete: command.delete,
            state: GcCommandState::Scheduled,
            processed: 0,
            skipped: 0,
            result: None,
            submitted_at: Utc::now(),
            finished_at: None,
        };
        self.commands.write().insert(id.clone(), status);
        id
    }

    async fn execute(
        gc: &GarbageCollector<L>,
        live: &dyn LiveBlobSource,
        commands: &CommandTable,
        id: &CommandId,
        command: GcCommand,
    ) -> GcCommandStatus {
        let update = |f: &dyn Fn(&mut GcCommandStatus)| {
            if let Some(status) = commands.write().get_mut(id) {
                f(status);
            }
        };
        update(&|s| s.state = GcCommandState::Running);
        info!(command = %id, gc = %gc.id(), delete = command.delete, "GC command started");

        let outcome = Self::mark_and_sweep(gc, live, command, |processed, skipped| {
            update(&|s| {
                s.processed = processed;
                s.skipped = skipped;
            })
        })
        .await;

        match outcome {
            Ok(result) => {
                update(&|s| {
                    s.state = GcCommandState::Completed;
                    s.result = Some(result);
                    s.finished_at = Some(Utc::now());
                });
                info!(command = %id, "GC command completed");
            }
            Err(e) => {
                let error = e.to_string();
                update(&|s| {
                    s.state = GcCommandState::Aborted {
                        error: error.clone(),
                    };
                    s.finished_at = Some(Utc::now());
                });
                warn!(command = %id, error = %e, "GC command aborted");
            }
        }
        let status = commands.read().get(id).cloned();
        status.unwrap_or_else(|| GcCommandStatus {
            id: id.clone(),
            gc_id: gc.id(),
            delete: command.delete,
            state: GcCommandState::Aborted {
                error: "command status lost".to_string(),
            },
            processed: 0,
            skipped: 0,
            result: None,
            submitted_at: Utc::now(),
            finished_at: Some(Utc::now()),
        })
    }

    async fn mark_and_sweep<F>(
        gc: &GarbageCollector<L>,
        live: &dyn LiveBlobSource,
        command: GcCommand,
        progress: F,
    ) -> BlobResult<GcStatus>
    where
        F: Fn(u64, u64),
    {
        let mut pass = gc.compute_to_delete().await?;
        let mut processed = 0u64;
        let mut skipped = 0u64;
        let mut keys = live.live_keys();
        while let Some(key) = keys.next().await {
            if !pass.mark(&key?) {
                skipped += 1;
            }
            processed += 1;
            if processed % PROGRESS_INTERVAL == 0 {
                progress(processed, skipped);
            }
        }
        progress(processed, skipped);
        gc.remove_unmarked_blobs_and_update_status(pass, command.delete)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::KeyStrategyDigest;
    use crate::{BlobError, InMemoryBlobStore};
    use std::time::Duration;

    const FOO_MD5: &str = "acbd18db4cc2f85cedef654fccc4a4d8";
    const BAR_MD5: &str = "37b51d194a7513e45b56f6524f2d51f2";

    fn runner(live: Vec<String>) -> (Arc<InMemoryBlobStore>, GcCommandRunner<InMemoryBlobStore>) {
        let store = Arc::new(InMemoryBlobStore::new("cmd"));
        store.insert(FOO_MD5, &b"foo"[..]);
        store.insert(BAR_MD5, &b"bar"[..]);
        let gc = GarbageCollector::new(store.clone(), KeyStrategyDigest::md5());
        (store, GcCommandRunner::new(gc, Arc::new(live)))
    }

    #[tokio::test]
    async fn test_run_counts_references() {
        let live = vec![FOO_MD5.to_string(), FOO_MD5.to_string(), "elsewhere".to_string()];
        let (store, runner) = runner(live);

        let status = runner.run(GcCommand::delete()).await;
        assert_eq!(status.state, GcCommandState::Completed);
        assert_eq!(status.processed, 3);
        assert_eq!(status.skipped, 2);
        assert_eq!(status.result.unwrap().num_binaries_gc, 1);
        assert!(store.get(BAR_MD5).is_none());
        assert_eq!(runner.status(&status.id).unwrap().state, GcCommandState::Completed);
    }

    #[tokio::test]
    async fn test_submit_runs_in_background() {
        let (store, runner) = runner(vec![]);
        let id = runner.submit(GcCommand::dry_run());

        let mut status = runner.status(&id).unwrap();
        while !status.state.is_terminal() {
            tokio::time::sleep(Duration::from_millis(5)).await;
            status = runner.status(&id).unwrap();
        }
        assert_eq!(status.state, GcCommandState::Completed);
        assert_eq!(status.result.unwrap().num_binaries_gc, 2);
        // dry run
        assert_eq!(store.len(), 2);
    }

    struct FailingSource;

    impl LiveBlobSource for FailingSource {
        fn live_keys(&self) -> BoxStream<'static, BlobResult<String>> {
            futures::stream::iter(vec![Err(BlobError::invalid("repository unavailable"))]).boxed()
        }
    }

    #[tokio::test]
    async fn test_source_failure_aborts_without_deleting() {
        let store = Arc::new(InMemoryBlobStore::new("cmd"));
        store.insert(FOO_MD5, &b"foo"[..]);
        let gc = GarbageCollector::new(store.clone(), KeyStrategyDigest::md5());
        let runner = GcCommandRunner::new(gc, Arc::new(FailingSource));

        let status = runner.run(GcCommand::delete()).await;
        assert!(matches!(status.state, GcCommandState::Aborted { .. }));
        assert!(status.finished_at.is_some());
        assert_eq!(store.len(), 1);
    }
}
