//! Data models for taskdesk entities.
//!
//! - `User`: the signed-in account, persisted alongside the credential, and `ProfileUpdate`
//! - `Task`: a dated to-do item plus its request shapes (`NewTask`, `TaskUpdate`, `TaskOrder`)

pub mod task;
pub mod user;

pub use task::{NewTask, Priority, Task, TaskOrder, TaskSortColumn, TaskStatus, TaskUpdate};
pub use user::{ProfileUpdate, User};
