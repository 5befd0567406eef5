use std::collections::HashMap;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;
use tokio::sync::Mutex;
use tower_http::cors::CorsLayer;

use crate::api::handlers;
use crate::service::{ImageService, Session};

/// Remembered selections before the least recently used one is forgotten.
pub const DEFAULT_SESSION_CAPACITY: usize = 10_000;

pub struct AppState {
    pub service: ImageService,
    sessions: Mutex<SessionTable>,
}

impl AppState {
    pub fn new(service: ImageService) -> Self {
        AppState::with_session_capacity(service, DEFAULT_SESSION_CAPACITY)
    }

    pub fn with_session_capacity(service: ImageService, capacity: usize) -> Self {
        AppState {
            service,
            sessions: Mutex::new(SessionTable::new(capacity)),
        }
    }

    /// The user's stored selection, or a fresh session; reads never add entries.
    pub async fn session(&self, user: &str) -> Session {
        self.sessions
            .lock()
            .await
            .get(user)
            .unwrap_or_else(|| self.service.new_session())
    }

    pub async fn store_session(&self, user: &str, session: Session) {
        self.sessions.lock().await.insert(user, session);
    }

    pub async fn session_count(&self) -> usize {
        self.sessions.lock().await.entries.len()
    }
}

/// Workflow selection per user id, bounded by least-recent use.
struct SessionTable {
    entries: HashMap<String, (Session, u64)>,
    clock: u64,
    capacity: usize,
}

impl SessionTable {
    fn new(capacity: usize) -> Self {
        SessionTable {
            entries: HashMap::new(),
            clock: 0,
            capacity: capacity.max(1),
        }
    }

    fn tick(&mut self) -> u64 {
        self.clock += 1;
        self.clock
    }

    fn get(&mut self, user: &str) -> Option<Session> {
        let now = self.tick();
        self.entries.get_mut(user).map(|(session, touched)| {
            *touched = now;
            *session
        })
    }

    fn insert(&mut self, user: &str, session: Session) {
        let now = self.tick();
        if !self.entries.contains_key(user) && self.entries.len() >= self.capacity {
            let oldest = self
                .entries
                .iter()
                .min_by_key(|(_, (_, touched))| *touched)
                .map(|(user, _)| user.clone());
            if let Some(evicted) = oldest {
                tracing::debug!(user = %evicted, "Session table full; forgetting selection");
                self.entries.remove(&evicted);
            }
        }
        self.entries.insert(user.to_string(), (session, now));
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(handlers::root))
        .route("/health", get(handlers::health))
        .route("/generate", post(handlers::generate))
        .route("/generate_from_image", post(handlers::generate_from_image))
        .route("/workflows", get(handlers::list_workflows))
        .route("/workflows/select", post(handlers::select_workflow))
        .route("/workflows/reload", post(handlers::reload_workflows))
        .route("/workflows/:index", get(handlers::describe_workflow))
        .layer(CorsLayer::permissive())
        .with_state(state)
}
