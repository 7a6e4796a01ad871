use chrono::NaiveDate;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskStatus {
    #[default]
    Pending,
    Completed,
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TaskStatus::Pending => write!(f, "pending"),
            TaskStatus::Completed => write!(f, "completed"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    #[default]
    Medium,
    Low,
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "high" | "h" => Ok(Priority::High),
            "medium" | "med" | "m" => Ok(Priority::Medium),
            "low" | "l" => Ok(Priority::Low),
            other => Err(format!("unknown priority: {}", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::High => write!(f, "high"),
            Priority::Medium => write!(f, "medium"),
            Priority::Low => write!(f, "low"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: i64,
    pub title: String,
    #[serde(default)]
    pub status: TaskStatus,
    #[serde(default)]
    pub priority: Priority,
    /// Either `YYYY-MM-DD` or a full RFC 3339 timestamp, depending on the endpoint.
    pub date: String,
    #[serde(default)]
    pub order: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

impl Task {
    pub fn is_completed(&self) -> bool {
        self.status == TaskStatus::Completed
    }

    /// Calendar day the task is scheduled for, if the date parses.
    pub fn day(&self) -> Option<NaiveDate> {
        let prefix = self.date.get(..10)?;
        NaiveDate::parse_from_str(prefix, "%Y-%m-%d").ok()
    }

    pub fn is_on(&self, day: NaiveDate) -> bool {
        self.day() == Some(day)
    }
}

/// Body for `POST /tasks`.
#[derive(Debug, Clone, Default, Serialize)]
pub struct NewTask {
    pub title: String,
    pub priority: Priority,
    pub date: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
}

/// Body for `PUT /tasks/{id}`. Unset fields are left untouched by the server.
#[derive(Debug, Clone, Default, Serialize)]
pub struct TaskUpdate {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<TaskStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<Priority>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub date: Option<String>,
}

/// One entry of the `PUT /tasks/reorder` payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskOrder {
    pub id: i64,
    pub order: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TaskSortColumn {
    #[default]
    Order,
    Priority,
    Title,
}

impl std::str::FromStr for TaskSortColumn {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "order" => Ok(TaskSortColumn::Order),
            "priority" => Ok(TaskSortColumn::Priority),
            "title" => Ok(TaskSortColumn::Title),
            other => Err(format!("unknown sort column: {}", other)),
        }
    }
}

impl TaskSortColumn {
    pub fn sort(&self, tasks: &mut [Task]) {
        match self {
            TaskSortColumn::Order => tasks.sort_by_key(|t| t.order),
            TaskSortColumn::Priority => tasks.sort_by_key(|t| (t.priority, t.order)),
            TaskSortColumn::Title => {
                tasks.sort_by(|a, b| a.title.to_lowercase().cmp(&b.title.to_lowercase()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(id: i64, title: &str, priority: Priority, order: i64) -> Task {
        Task {
            id,
            title: title.to_string(),
            status: TaskStatus::Pending,
            priority,
            date: "2026-10-16T09:00:00.000000Z".to_string(),
            order,
            created_at: None,
            updated_at: None,
        }
    }

    #[test]
    fn test_parse_task_from_api() {
        let json = r#"{"id": 3, "title": "Ship it", "status": "completed", "priority": "high", "date": "2026-10-16", "order": 2, "created_at": "2026-10-01T00:00:00Z"}"#;
        let t: Task = serde_json::from_str(json).unwrap();
        assert!(t.is_completed());
        assert_eq!(t.priority, Priority::High);
        assert_eq!(t.day(), NaiveDate::from_ymd_opt(2026, 10, 16));
    }

    #[test]
    fn test_is_on_handles_timestamps_and_garbage() {
        let day = NaiveDate::from_ymd_opt(2026, 10, 16).unwrap();
        assert!(task(1, "a", Priority::Low, 0).is_on(day));

        let mut bad = task(2, "b", Priority::Low, 0);
        bad.date = "soon".to_string();
        assert_eq!(bad.day(), None);
        assert!(!bad.is_on(day));
    }

    #[test]
    fn test_sort_columns() {
        let mut tasks = vec![
            task(1, "bravo", Priority::Low, 0),
            task(2, "Alpha", Priority::High, 2),
            task(3, "charlie", Priority::High, 1),
        ];

        TaskSortColumn::Priority.sort(&mut tasks);
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![3, 2, 1]);

        TaskSortColumn::Title.sort(&mut tasks);
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![2, 1, 3]);

        TaskSortColumn::Order.sort(&mut tasks);
        let ids: Vec<i64> = tasks.iter().map(|t| t.id).collect();
        assert_eq!(ids, vec![1, 3, 2]);
    }

    #[test]
    fn test_task_update_skips_unset_fields() {
        let update = TaskUpdate {
            status: Some(TaskStatus::Completed),
            ..Default::default()
        };
        assert_eq!(
            serde_json::to_value(&update).unwrap(),
            serde_json::json!({"status": "completed"})
        );
    }

    #[test]
    fn test_priority_from_str() {
        assert_eq!("H".parse::<Priority>(), Ok(Priority::High));
        assert_eq!("medium".parse::<Priority>(), Ok(Priority::Medium));
        assert!("urgent".parse::<Priority>().is_err());
    }
}
