//! Taskdesk Core - authenticated task service client.
//!
//! This crate contains the front-end-independent parts of taskdesk:
//! - `api`: request executor with timeout, retry and transparent refresh
//! - `auth`: credential store, single-flight refresh, session lifecycle
//! - `storage`: durable key-value media for the session
//! - `models`: task and user types
//! - `tasks`: task endpoints
//! - `config`: application configuration
//!
//! `Taskdesk` wires these together into one owned context.

pub mod api;
pub mod auth;
pub mod config;
pub mod models;
pub mod storage;
pub mod tasks;

use std::sync::Arc;

use reqwest::Client;
use tokio::sync::broadcast;

pub use api::{ApiClient, ApiError, ApiRequest, ApiResponse, RequestOptions};
pub use auth::{SessionEvent, SessionManager, SignInReason};
pub use config::Config;
pub use tasks::{DeleteOutcome, TaskService};

/// Capacity of the session event channel
const EVENT_CHANNEL_CAPACITY: usize = 32;

/// Everything a front end needs, built from one `Config`.
pub struct Taskdesk {
    pub store: Arc<auth::CredentialStore>,
    pub coordinator: Arc<auth::RefreshCoordinator>,
    pub client: ApiClient,
    pub session: Arc<SessionManager>,
    pub tasks: TaskService,
    events: broadcast::Sender<SessionEvent>,
}

impl Taskdesk {
    pub fn new(config: &Config, medium: Arc<dyn storage::KeyValueStore>) -> Result<Self, ApiError> {
        // The refresh endpoint authenticates with the session cookie set at sign-in.
        let http = Client::builder().cookie_store(true).build()?;
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);

        let store = Arc::new(auth::CredentialStore::new(medium));
        let gateway = auth::AuthGateway::new(http.clone(), &config.api_base_url, &config.origin);
        let coordinator = auth::RefreshCoordinator::new(gateway.clone(), store.clone(), events.clone());
        let client = ApiClient::new(
            http,
            &config.api_base_url,
            &config.origin,
            config.request_policy(),
            store.clone(),
            coordinator.clone(),
        );
        let session = Arc::new(SessionManager::new(
            store.clone(),
            gateway,
            coordinator.clone(),
            client.clone(),
            events.clone(),
            config.session_policy(),
        ));
        let tasks = TaskService::new(client.clone());

        Ok(Self {
            store,
            coordinator,
            client,
            session,
            tasks,
            events,
        })
    }

    /// Build with the storage medium named in the config.
    pub fn from_config(config: &Config) -> anyhow::Result<Self> {
        let medium = config.open_storage()?;
        Ok(Self::new(config, medium)?)
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }
}
