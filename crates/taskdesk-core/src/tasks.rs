//! Task endpoints built on the authenticated executor.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, warn};

use crate::api::{ApiClient, ApiError, ApiResponse, RequestOptions};
use crate::models::{NewTask, Priority, Task, TaskOrder, TaskStatus, TaskUpdate};

/// Code some servers return, with a 2xx status, for a repeated delete
const ALREADY_DELETED_CODE: &str = "TASK_ALREADY_DELETED";

/// How a delete request ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
    Deleted,
    /// The server no longer had the task.
    AlreadyDeleted,
    /// A delete for the same task is still running; nothing was sent.
    InProgress,
}

#[derive(Serialize)]
struct ReorderBody<'a> {
    tasks: &'a [TaskOrder],
}

#[derive(Clone)]
pub struct TaskService {
    client: ApiClient,
    deleting: Arc<Mutex<HashSet<i64>>>,
}

/// Releases a task id from the in-flight delete set.
struct DeleteGuard<'a> {
    deleting: &'a Mutex<HashSet<i64>>,
    id: i64,
}

impl Drop for DeleteGuard<'_> {
    fn drop(&mut self) {
        self.deleting
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

impl TaskService {
    pub fn new(client: ApiClient) -> Self {
        Self {
            client,
            deleting: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    fn tasks_from(response: ApiResponse) -> Result<Vec<Task>, ApiError> {
        if response.data.is_null() {
            return Ok(Vec::new());
        }
        Ok(response.into_typed::<Vec<Task>>()?.data)
    }

    pub async fn fetch_tasks(&self) -> Result<Vec<Task>, ApiError> {
        let response = self.client.get("/tasks", RequestOptions::default()).await?;
        let tasks = Self::tasks_from(response)?;
        debug!(count = tasks.len(), "Fetched tasks");
        Ok(tasks)
    }

    /// Full-text search. A blank query returns nothing without calling the API.
    pub async fn search_tasks(&self, query: &str) -> Result<Vec<Task>, ApiError> {
        let query = query.trim();
        if query.is_empty() {
            return Ok(Vec::new());
        }
        let path = format!("/tasks?search={}", urlencoding::encode(query));
        let response = self.client.get(&path, RequestOptions::default()).await?;
        Self::tasks_from(response)
    }

    pub async fn create_task(&self, task: &NewTask) -> Result<Task, ApiError> {
        let response = self.client.post("/tasks", task, RequestOptions::default()).await?;
        let created: Task = response.into_typed()?.data;
        info!(task_id = created.id, "Task created");
        Ok(created)
    }

    pub async fn update_task(&self, id: i64, update: &TaskUpdate) -> Result<Task, ApiError> {
        let path = format!("/tasks/{}", id);
        let response = self.client.put(&path, update, RequestOptions::default()).await?;
        Ok(response.into_typed()?.data)
    }

    pub async fn set_priority(&self, id: i64, priority: Priority) -> Result<Task, ApiError> {
        let update = TaskUpdate {
            priority: Some(priority),
            ..TaskUpdate::default()
        };
        self.update_task(id, &update).await
    }

    pub async fn set_status(&self, id: i64, status: TaskStatus) -> Result<Task, ApiError> {
        let update = TaskUpdate {
            status: Some(status),
            ..TaskUpdate::default()
        };
        self.update_task(id, &update).await
    }

    /// Delete a task, suppressing duplicate requests for the same id while
    /// one is in flight. A task the server no longer has counts as deleted.
    pub async fn delete_task(&self, id: i64) -> Result<DeleteOutcome, ApiError> {
        {
            let mut deleting = self.deleting.lock().unwrap_or_else(|e| e.into_inner());
            if !deleting.insert(id) {
                warn!(task_id = id, "Duplicate delete suppressed");
                return Ok(DeleteOutcome::InProgress);
            }
        }
        let _guard = DeleteGuard {
            deleting: &self.deleting,
            id,
        };

        let path = format!("/tasks/{}", id);
        match self.client.del(&path, RequestOptions::default()).await {
            Ok(response) if Self::is_already_deleted(&response.data) => {
                debug!(task_id = id, "Task was already deleted");
                Ok(DeleteOutcome::AlreadyDeleted)
            }
            Ok(_) => {
                info!(task_id = id, "Task deleted");
                Ok(DeleteOutcome::Deleted)
            }
            Err(ApiError::ClientError { status: 404, .. }) => {
                debug!(task_id = id, "Task not found, treating as deleted");
                Ok(DeleteOutcome::AlreadyDeleted)
            }
            Err(e) => Err(e),
        }
    }

    fn is_already_deleted(data: &Value) -> bool {
        data.get("code").and_then(Value::as_str) == Some(ALREADY_DELETED_CODE)
    }

    /// Persist the given display order; each task's new `order` is its index.
    pub async fn reorder_tasks(&self, ids: &[i64]) -> Result<Vec<TaskOrder>, ApiError> {
        let orders: Vec<TaskOrder> = ids
            .iter()
            .zip(0..)
            .map(|(&id, order)| TaskOrder { id, order })
            .collect();

        let body = ReorderBody { tasks: &orders };
        self.client
            .put("/tasks/reorder", &body, RequestOptions::default())
            .await?;
        Ok(orders)
    }

    /// Number of deletes currently in flight.
    pub fn deletes_in_flight(&self) -> usize {
        self.deleting.lock().unwrap_or_else(|e| e.into_inner()).len()
    }
}
