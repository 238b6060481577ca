//! Generation task registry - tracks active generations and their cancel tokens

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;

/// Active generation
pub struct GenerationTask {
    pub request_id: String,
    pub model_id: String,
    pub thread_id: Option<String>,
    pub cancel_token: CancellationToken,
}

/// Registry of active generations (keyed by request_id)
#[derive(Default)]
pub struct GenerationTaskRegistry {
    tasks: DashMap<String, GenerationTask>,
}

impl GenerationTaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a new generation; returns its request id.
    ///
    /// The registry's token is a child of `parent`, so cancelling either stops
    /// the generation.
    pub fn register(&self, model_id: &str, thread_id: Option<&str>, parent: Option<&CancellationToken>) -> (String, CancellationToken) {
        let request_id = uuid::Uuid::new_v4().to_string();
        let cancel_token = match parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        self.tasks.insert(
            request_id.clone(),
            GenerationTask {
                request_id: request_id.clone(),
                model_id: model_id.to_string(),
                thread_id: thread_id.map(str::to_string),
                cancel_token: cancel_token.clone(),
            },
        );
        (request_id, cancel_token)
    }

    /// Remove a task from the registry
    pub fn remove(&self, request_id: &str) {
        self.tasks.remove(request_id);
    }

    /// Cancel a specific generation by request id
    pub fn cancel_generation(&self, request_id: &str) -> bool {
        self.tasks
            .remove(request_id)
            .map(|(_, task)| task.cancel_token.cancel())
            .is_some()
    }

    /// Cancel and remove every generation on a thread
    pub fn cancel_thread(&self, thread_id: &str) -> usize {
        self.cancel_where(|task| task.thread_id.as_deref() == Some(thread_id))
    }

    /// Cancel and remove every generation against a model
    pub fn cancel_model(&self, model_id: &str) -> usize {
        self.cancel_where(|task| task.model_id == model_id)
    }

    pub fn cancel_all(&self) -> usize {
        self.cancel_where(|_| true)
    }

    /// Check if there's an active generation on a thread
    pub fn is_thread_processing(&self, thread_id: &str) -> bool {
        self.tasks
            .iter()
            .any(|entry| entry.thread_id.as_deref() == Some(thread_id))
    }

    pub fn active_for_model(&self, model_id: &str) -> usize {
        self.tasks.iter().filter(|entry| entry.model_id == model_id).count()
    }

    fn cancel_where(&self, matches: impl Fn(&GenerationTask) -> bool) -> usize {
        let to_cancel: Vec<String> = self
            .tasks
            .iter()
            .filter(|entry| matches(entry.value()))
            .map(|entry| entry.request_id.clone())
            .collect();

        let mut cancelled = 0;
        for request_id in to_cancel {
            if let Some((_, task)) = self.tasks.remove(&request_id) {
                task.cancel_token.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }
}
