//! Stack of attempt contexts active in this process.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Identifiers attached to every record emitted while an attempt runs.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AttemptContext {
    pub run_id: String,
    pub task_id: String,
    pub attempt_number: u32,
    #[serde(default)]
    pub worker_id: Option<String>,
}

impl AttemptContext {
    pub fn new(run_id: impl Into<String>, task_id: impl Into<String>, attempt_number: u32) -> Self {
        Self {
            run_id: run_id.into(),
            task_id: task_id.into(),
            attempt_number,
            worker_id: None,
        }
    }

    /// Attribute pairs in the form exported with spans and logs.
    pub fn attributes(&self) -> Vec<(&'static str, serde_json::Value)> {
        let mut attrs = vec![
            ("run.id", serde_json::Value::from(self.run_id.clone())),
            ("task.id", serde_json::Value::from(self.task_id.clone())),
            ("attempt.number", serde_json::Value::from(self.attempt_number)),
        ];
        if let Some(ref worker_id) = self.worker_id {
            attrs.push(("worker.id", serde_json::Value::from(worker_id.clone())));
        }
        attrs
    }
}

#[derive(Debug, Default)]
struct StackInner {
    next_id: AtomicU64,
    entries: Mutex<Vec<(u64, AttemptContext)>>,
}

/// Explicit "current attempt" stack.
///
/// The executor pushes a context when an attempt starts and the returned
/// guard pops it when dropped, so a context can never outlive its attempt.
#[derive(Debug, Clone, Default)]
pub struct AttemptContextStack {
    inner: Arc<StackInner>,
}

impl AttemptContextStack {
    pub fn new() -> Self {
        Self::default()
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(u64, AttemptContext)>> {
        self.inner.entries.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn push(&self, context: AttemptContext) -> ContextGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.entries().push((id, context));
        ContextGuard {
            stack: self.clone(),
            id,
        }
    }

    pub fn current(&self) -> Option<AttemptContext> {
        self.entries().last().map(|(_, ctx)| ctx.clone())
    }

    pub fn depth(&self) -> usize {
        self.entries().len()
    }
}

/// Pops its context from the stack on drop.
#[derive(Debug)]
pub struct ContextGuard {
    stack: AttemptContextStack,
    id: u64,
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        // Remove by id so out-of-order drops cannot pop someone else's context.
        self.stack.entries().retain(|(id, _)| *id != self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_guard_pops_on_drop() {
        let stack = AttemptContextStack::new();
        {
            let _guard = stack.push(AttemptContext::new("run_1", "t", 1));
            assert_eq!(stack.current().unwrap().run_id, "run_1");
        }
        assert!(stack.current().is_none());
    }

    #[test]
    fn test_nested_contexts_restore_outer() {
        let stack = AttemptContextStack::new();
        let _outer = stack.push(AttemptContext::new("outer", "t", 1));
        let inner = stack.push(AttemptContext::new("inner", "t", 1));
        assert_eq!(stack.current().unwrap().run_id, "inner");
        drop(inner);
        assert_eq!(stack.current().unwrap().run_id, "outer");
    }

    #[test]
    fn test_out_of_order_drop_keeps_latest() {
        let stack = AttemptContextStack::new();
        let first = stack.push(AttemptContext::new("first", "t", 1));
        let _second = stack.push(AttemptContext::new("second", "t", 1));
        drop(first);
        assert_eq!(stack.current().unwrap().run_id, "second");
        assert_eq!(stack.depth(), 1);
    }
}
