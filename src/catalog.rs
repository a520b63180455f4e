//! Registry of the tasks a worker can execute.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;

use crate::context::TaskContext;
use crate::task::{Task, TaskConfig, TaskError};

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CatalogError {
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    #[error("unknown task '{0}'")]
    UnknownTask(String),
}

/// Type-erased task that can be stored in the catalog.
#[async_trait]
pub trait ErasedTask: Send + Sync {
    /// Run the task with JSON input, returning JSON output.
    async fn run_erased(
        &self,
        input: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError>;
}

struct TaskWrapper<T>(T);

#[async_trait]
impl<T: Task> ErasedTask for TaskWrapper<T> {
    async fn run_erased(
        &self,
        input: serde_json::Value,
        ctx: &TaskContext,
    ) -> Result<serde_json::Value, TaskError> {
        let typed: T::Input =
            serde_json::from_value(input).map_err(|e| TaskError::InvalidInput(e.to_string()))?;
        let output = self.0.run(typed, ctx).await?;
        serde_json::to_value(output)
            .map_err(|e| TaskError::permanent(anyhow::anyhow!("failed to serialize output: {e}")))
    }
}

/// A registered task.
pub struct TaskDefinition {
    pub id: String,
    pub config: TaskConfig,
    pub handler: Arc<dyn ErasedTask>,
}

impl std::fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

/// Frozen set of task definitions.
///
/// Built once at startup; lookups take no locks and can run concurrently.
#[derive(Debug, Clone, Default)]
pub struct TaskCatalog {
    tasks: Arc<HashMap<String, Arc<TaskDefinition>>>,
}

impl TaskCatalog {
    pub fn builder() -> TaskCatalogBuilder {
        TaskCatalogBuilder::default()
    }

    pub fn lookup(&self, id: &str) -> Result<Arc<TaskDefinition>, CatalogError> {
        self.tasks
            .get(id)
            .cloned()
            .ok_or_else(|| CatalogError::UnknownTask(id.to_string()))
    }

    pub fn contains(&self, id: &str) -> bool {
        self.tasks.contains_key(id)
    }

    /// Registered task identifiers, sorted.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<_> = self.tasks.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

/// Collects task registrations before the catalog is frozen.
#[derive(Default)]
pub struct TaskCatalogBuilder {
    tasks: HashMap<String, Arc<TaskDefinition>>,
}

impl TaskCatalogBuilder {
    /// Register a typed task under its own identifier.
    pub fn register<T: Task>(self, task: T) -> Result<Self, CatalogError> {
        let definition = TaskDefinition {
            id: task.id().to_string(),
            config: task.config(),
            handler: Arc::new(TaskWrapper(task)),
        };
        self.register_definition(definition)
    }

    pub fn register_definition(mut self, definition: TaskDefinition) -> Result<Self, CatalogError> {
        if self.tasks.contains_key(&definition.id) {
            return Err(CatalogError::DuplicateTask(definition.id));
        }
        self.tasks
            .insert(definition.id.clone(), Arc::new(definition));
        Ok(self)
    }

    pub fn build(self) -> TaskCatalog {
        TaskCatalog {
            tasks: Arc::new(self.tasks),
        }
    }
}
