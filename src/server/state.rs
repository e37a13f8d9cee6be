use axum::http::StatusCode;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;
use tracing::debug;
use uuid::Uuid;

use crate::detection::FieldDetector;
use crate::raster::Rasterizer;
use crate::session::SharedSession;
use crate::settings;

pub(crate) struct ServerState {
    pub(crate) settings: settings::Settings,
    pub(crate) rasterizer: Arc<dyn Rasterizer>,
    pub(crate) detector: Arc<dyn FieldDetector>,
    pub(crate) sessions: RwLock<HashMap<Uuid, SessionEntry>>,
}

pub(crate) struct SessionEntry {
    session: SharedSession,
    last_used: Mutex<Instant>,
}

impl SessionEntry {
    fn new(session: SharedSession) -> Self {
        Self {
            session,
            last_used: Mutex::new(Instant::now()),
        }
    }

    fn touch(&self) -> SharedSession {
        *self.last_used.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        self.session.clone()
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(*self.last_used.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl ServerState {
    pub(crate) fn new(
        settings: settings::Settings,
        rasterizer: Arc<dyn Rasterizer>,
        detector: Arc<dyn FieldDetector>,
    ) -> Self {
        Self {
            settings,
            rasterizer,
            detector,
            sessions: RwLock::new(HashMap::new()),
        }
    }

    pub(crate) async fn session(&self, id: &str) -> Result<SharedSession, ServerError> {
        let unknown = || ServerError::not_found(format!("unknown session: {}", id));
        let id = Uuid::parse_str(id.trim()).map_err(|_| unknown())?;
        self.sessions
            .read()
            .await
            .get(&id)
            .map(SessionEntry::touch)
            .ok_or_else(unknown)
    }

    pub(crate) async fn insert(&self, session: SharedSession) -> Uuid {
        self.evict_idle(Instant::now()).await;
        let id = Uuid::new_v4();
        self.sessions
            .write()
            .await
            .insert(id, SessionEntry::new(session));
        id
    }

    pub(crate) async fn remove(&self, id: &str) -> Result<(), ServerError> {
        let unknown = || ServerError::not_found(format!("unknown session: {}", id));
        let id = Uuid::parse_str(id.trim()).map_err(|_| unknown())?;
        self.sessions
            .write()
            .await
            .remove(&id)
            .map(|_| ())
            .ok_or_else(unknown)
    }

    pub(crate) fn session_ttl(&self) -> Option<Duration> {
        Some(self.settings.session_ttl_secs)
            .filter(|secs| *secs > 0)
            .map(Duration::from_secs)
    }

    /// Drops sessions unused for longer than the configured ttl and returns
    /// how many were dropped.
    pub(crate) async fn evict_idle(&self, now: Instant) -> usize {
        let Some(ttl) = self.session_ttl() else {
            return 0;
        };
        let mut sessions = self.sessions.write().await;
        let before = sessions.len();
        sessions.retain(|id, entry| {
            let keep = entry.idle_for(now) <= ttl;
            if !keep {
                debug!("session {} expired after {}s idle", id, ttl.as_secs());
            }
            keep
        });
        before - sessions.len()
    }
}

#[derive(Debug)]
pub(crate) struct ServerError {
    pub(crate) status: StatusCode,
    pub(crate) message: String,
}

impl ServerError {
    pub(crate) fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    pub(crate) fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    pub(crate) fn unprocessable(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            message: message.into(),
        }
    }

    pub(crate) fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl From<anyhow::Error> for ServerError {
    fn from(err: anyhow::Error) -> Self {
        ServerError::internal(format!("{:#}", err))
    }
}
