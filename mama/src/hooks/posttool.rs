//! Post-tool contract persistence: after an edit-class tool succeeds, extract
//! contracts from the touched file and save the new ones as decisions.
//!
//! The API surface is synchronous and infallible; extraction and persistence
//! run on a bounded background worker with a drop-oldest queue. Errors go to
//! logs, never into the turn loop.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::Notify;
use tracing::{debug, warn};

use crate::hooks::contracts::extract_contracts;
use crate::memory::{DecisionRecord, MemoryApi};

/// Tools whose success means a file (or build state) changed.
const EDIT_TOOLS: [&str; 6] = ["write_file", "apply_patch", "Edit", "Write", "test", "build"];

/// Paths that never carry contract-worthy changes.
const LOW_PRIORITY_MARKERS: [&str; 9] = [
    "/docs/",
    "/doc/",
    "/tests/",
    "/test/",
    "/examples/",
    "/example/",
    "node_modules/",
    ".test.",
    ".spec.",
];
const LOW_PRIORITY_EXTENSIONS: [&str; 4] = ["md", "json", "yaml", "yml"];

pub fn is_edit_tool(name: &str) -> bool {
    EDIT_TOOLS.contains(&name)
}

pub fn is_low_priority_path(path: &str) -> bool {
    let normalized = path.replace('\\', "/");
    if LOW_PRIORITY_MARKERS.iter().any(|m| normalized.contains(m)) {
        return true;
    }
    let file_name = normalized.rsplit('/').next().unwrap_or(&normalized);
    if file_name.starts_with(".env") {
        return true;
    }
    Path::new(&normalized)
        .extension()
        .and_then(|e| e.to_str())
        .is_some_and(|ext| LOW_PRIORITY_EXTENSIONS.contains(&ext))
}

#[derive(Debug, Clone)]
pub struct PostToolConfig {
    /// Maximum contracts persisted per processed file.
    pub contract_save_limit: usize,
    /// Queue capacity; the oldest pending job is dropped on overflow.
    pub queue_capacity: usize,
}

impl Default for PostToolConfig {
    fn default() -> Self {
        Self {
            contract_save_limit: 20,
            queue_capacity: 32,
        }
    }
}

struct Job {
    file_path: String,
}

struct Shared {
    queue: Mutex<VecDeque<Job>>,
    notify: Notify,
    busy: AtomicBool,
    processed: AtomicUsize,
    shutdown: AtomicBool,
}

/// Extracts API/type/SQL/GraphQL contracts after file edits.
pub struct PostToolHandler {
    shared: Arc<Shared>,
    config: PostToolConfig,
}

impl PostToolHandler {
    pub fn new(memory: Arc<dyn MemoryApi>, config: PostToolConfig) -> Self {
        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            busy: AtomicBool::new(false),
            processed: AtomicUsize::new(0),
            shutdown: AtomicBool::new(false),
        });
        let worker_shared = shared.clone();
        let limit = config.contract_save_limit;
        tokio::spawn(async move {
            loop {
                let job = {
                    let mut queue = worker_shared.queue.lock().unwrap();
                    queue.pop_front()
                };
                match job {
                    Some(job) => {
                        worker_shared.busy.store(true, Ordering::SeqCst);
                        process_job(&memory, &job, limit).await;
                        worker_shared.busy.store(false, Ordering::SeqCst);
                        worker_shared.processed.fetch_add(1, Ordering::SeqCst);
                    }
                    None => {
                        if worker_shared.shutdown.load(Ordering::SeqCst) {
                            return;
                        }
                        worker_shared.notify.notified().await;
                    }
                }
            }
        });
        Self { shared, config }
    }

    /// Fire-and-forget submission. Non-edit tools and low-priority paths are
    /// ignored; a full queue drops its oldest entry. Never throws.
    pub fn process_in_background(&self, tool_name: &str, file_path: &str) {
        if !is_edit_tool(tool_name) || is_low_priority_path(file_path) {
            return;
        }
        let mut queue = self.shared.queue.lock().unwrap();
        if queue.len() >= self.config.queue_capacity {
            let dropped = queue.pop_front();
            if let Some(dropped) = dropped {
                debug!(file = %dropped.file_path, "post-tool queue full, dropping oldest");
            }
        }
        queue.push_back(Job {
            file_path: file_path.to_string(),
        });
        drop(queue);
        self.shared.notify.notify_one();
    }

    /// How many jobs the worker has completed. Test hook.
    pub fn processed_count(&self) -> usize {
        self.shared.processed.load(Ordering::SeqCst)
    }

    /// Waits until the queue is drained and the worker is idle.
    pub async fn wait_idle(&self) {
        loop {
            let empty = self.shared.queue.lock().unwrap().is_empty();
            if empty && !self.shared.busy.load(Ordering::SeqCst) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

impl Drop for PostToolHandler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        self.shared.notify.notify_one();
    }
}

async fn process_job(memory: &Arc<dyn MemoryApi>, job: &Job, limit: usize) {
    let content = match std::fs::read_to_string(&job.file_path) {
        Ok(content) => content,
        Err(e) => {
            debug!(file = %job.file_path, error = %e, "post-tool read skipped");
            return;
        }
    };
    let contracts = extract_contracts(&job.file_path, &content);
    let mut saved = 0usize;
    for contract in contracts {
        if saved >= limit {
            debug!(file = %job.file_path, "contract save limit reached");
            break;
        }
        // Duplicate check first; same topic and decision text means skip.
        let duplicate = match memory.suggest(&contract.topic, 3).await {
            Ok(response) => response.results.iter().any(|item| {
                item.topic.eq_ignore_ascii_case(&contract.topic)
                    && item.decision.eq_ignore_ascii_case(&contract.detail)
            }),
            Err(e) => {
                warn!(error = %e, "contract duplicate check failed, saving anyway");
                false
            }
        };
        if duplicate {
            continue;
        }
        let record = DecisionRecord {
            topic: contract.topic.clone(),
            decision: contract.detail.clone(),
            reasoning: format!("extracted from {} line {}", contract.file, contract.line),
            confidence: contract.confidence,
            kind: "user_decision".to_string(),
        };
        if let Err(e) = memory.save(record).await {
            warn!(error = %e, topic = %contract.topic, "contract save failed");
        } else {
            saved += 1;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MockMemoryApi;

    #[test]
    fn edit_tool_and_path_filters() {
        assert!(is_edit_tool("Write"));
        assert!(is_edit_tool("apply_patch"));
        assert!(!is_edit_tool("Read"));
        assert!(!is_edit_tool("mama_save"));

        assert!(is_low_priority_path("/repo/docs/guide.md"));
        assert!(is_low_priority_path("/repo/src/app.test.ts"));
        assert!(is_low_priority_path("/repo/tests/fixture.rs"));
        assert!(is_low_priority_path("/repo/.env.local"));
        assert!(is_low_priority_path("/repo/config.yaml"));
        assert!(is_low_priority_path("/repo/package.json"));
        assert!(!is_low_priority_path("/repo/src/routes.ts"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn extracts_and_saves_contracts_in_background() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("routes.js");
        std::fs::write(&file, "app.get('/users', listUsers);\n").unwrap();

        let memory = Arc::new(MockMemoryApi::new());
        let handler = PostToolHandler::new(memory.clone(), PostToolConfig::default());
        handler.process_in_background("Write", file.to_str().unwrap());
        handler.wait_idle().await;

        let items = memory.items();
        assert_eq!(items.len(), 1);
        assert_eq!(items[0].topic, "API: GET /users");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn duplicate_contracts_are_not_resaved() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("routes.js");
        std::fs::write(&file, "app.get('/users', listUsers);\n").unwrap();

        let memory = Arc::new(MockMemoryApi::new());
        let handler = PostToolHandler::new(memory.clone(), PostToolConfig::default());
        handler.process_in_background("Write", file.to_str().unwrap());
        handler.wait_idle().await;
        handler.process_in_background("Write", file.to_str().unwrap());
        handler.wait_idle().await;

        assert_eq!(memory.items().len(), 1);
        assert_eq!(handler.processed_count(), 2);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn memory_failures_never_escape() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("routes.js");
        std::fs::write(&file, "app.get('/users', h);\n").unwrap();

        let memory = Arc::new(MockMemoryApi::new());
        memory.fail_all();
        let handler = PostToolHandler::new(memory, PostToolConfig::default());
        handler.process_in_background("Write", file.to_str().unwrap());
        handler.wait_idle().await;
        assert_eq!(handler.processed_count(), 1);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn non_edit_and_low_priority_are_ignored() {
        let memory = Arc::new(MockMemoryApi::new());
        let handler = PostToolHandler::new(memory.clone(), PostToolConfig::default());
        handler.process_in_background("Read", "/repo/src/app.ts");
        handler.process_in_background("Write", "/repo/docs/guide.md");
        handler.wait_idle().await;
        assert_eq!(handler.processed_count(), 0);
        assert!(memory.items().is_empty());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn full_queue_drops_oldest() {
        let memory = Arc::new(MockMemoryApi::new());
        let handler = PostToolHandler::new(
            memory,
            PostToolConfig {
                queue_capacity: 2,
                ..Default::default()
            },
        );
        // Nonexistent paths: jobs drain as cheap no-ops.
        handler.process_in_background("Write", "/gone/a.ts");
        handler.process_in_background("Write", "/gone/b.ts");
        handler.process_in_background("Write", "/gone/c.ts");
        handler.wait_idle().await;
        // At most capacity + in-flight jobs processed; nothing panicked.
        assert!(handler.processed_count() <= 3);
    }
}
