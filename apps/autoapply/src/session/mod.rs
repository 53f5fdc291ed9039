//! Session Store: the single owner of the auth token and cached user profile.
//!
//! Every mutation is written to the local store before it returns, so a crash
//! right after `set_session` never loses the token. Nothing here talks to the
//! network.

use std::sync::{Arc, PoisonError, RwLock};

use serde::Serialize;
use thiserror::Error;
use tracing::{info, warn};

use crate::models::user::UserProfile;
use crate::store::{self, LocalStore, StoreError, TOKEN_KEY, TOKEN_KIND_KEY, USER_KEY};

pub const DEFAULT_TOKEN_KIND: &str = "bearer";

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Missing access token")]
    InvalidSession,

    #[error("Failed to persist session: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Session {
    pub token: Option<String>,
    pub token_kind: String,
    pub user: Option<UserProfile>,
}

impl Default for Session {
    fn default() -> Self {
        Self {
            token: None,
            token_kind: DEFAULT_TOKEN_KIND.to_string(),
            user: None,
        }
    }
}

pub struct SessionStore {
    store: Arc<dyn LocalStore>,
    current: RwLock<Session>,
}

impl SessionStore {
    /// Restores whatever session was persisted by a previous run.
    pub fn load(backing: Arc<dyn LocalStore>) -> Result<Self, SessionError> {
        let token: Option<String> =
            store::load::<String>(backing.as_ref(), TOKEN_KEY)?.filter(|t| !t.is_empty());
        let token_kind = store::load::<String>(backing.as_ref(), TOKEN_KIND_KEY)?
            .filter(|k| !k.is_empty())
            .unwrap_or_else(|| DEFAULT_TOKEN_KIND.to_string());
        // A profile that no longer parses is dropped rather than blocking startup.
        let user = store::load::<UserProfile>(backing.as_ref(), USER_KEY).unwrap_or_else(|e| {
            warn!("Discarding unreadable cached user profile: {e}");
            None
        });

        Ok(Self {
            store: backing,
            current: RwLock::new(Session {
                token,
                token_kind,
                user,
            }),
        })
    }

    pub fn get_token(&self) -> Option<String> {
        self.read().token.clone()
    }

    pub fn token_kind(&self) -> String {
        self.read().token_kind.clone()
    }

    pub fn user(&self) -> Option<UserProfile> {
        self.read().user.clone()
    }

    /// Token presence only; says nothing about whether the server still accepts it.
    pub fn is_authenticated(&self) -> bool {
        self.read().token.is_some()
    }

    pub fn snapshot(&self) -> Session {
        self.read().clone()
    }

    /// Replaces the whole session. An absent profile removes any cached one.
    pub fn set_session(
        &self,
        token: Option<&str>,
        token_kind: Option<&str>,
        user: Option<UserProfile>,
    ) -> Result<(), SessionError> {
        let token = token
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .ok_or(SessionError::InvalidSession)?;
        let token_kind = token_kind
            .map(str::trim)
            .filter(|k| !k.is_empty())
            .unwrap_or(DEFAULT_TOKEN_KIND);

        let next = Session {
            token: Some(token.to_string()),
            token_kind: token_kind.to_string(),
            user,
        };

        let mut current = self.write();
        if let Err(e) = self.persist(&next) {
            if let Err(restore) = self.persist(&current) {
                warn!("Failed to restore previous session after write error: {restore}");
            }
            return Err(e.into());
        }
        *current = next;
        info!("Session stored ({token_kind} token)");
        Ok(())
    }

    /// Swaps in a freshly fetched profile, keeping the token.
    pub fn set_user(&self, user: UserProfile) -> Result<(), SessionError> {
        let mut current = self.write();
        if current.token.is_none() {
            return Err(SessionError::InvalidSession);
        }
        store::save(self.store.as_ref(), USER_KEY, &user)?;
        current.user = Some(user);
        Ok(())
    }

    /// Forgets the session. Always succeeds: a store failure is logged and the
    /// in-memory session is cleared regardless. A token that cannot be removed
    /// is blanked instead, which `load` treats as no token.
    pub fn clear_session(&self) {
        let mut current = self.write();
        if let Err(e) = self.store.remove(TOKEN_KEY) {
            warn!("Failed to remove {TOKEN_KEY} from local store, blanking it: {e}");
            if let Err(e) = store::save(self.store.as_ref(), TOKEN_KEY, &"") {
                warn!("Failed to blank {TOKEN_KEY}, it will be restored on next start: {e}");
            }
        }
        for key in [TOKEN_KIND_KEY, USER_KEY] {
            if let Err(e) = self.store.remove(key) {
                warn!("Failed to remove {key} from local store: {e}");
            }
        }
        if current.token.is_some() {
            info!("Session cleared");
        }
        *current = Session::default();
    }

    /// Writes the token last, so a partial failure never pairs a new token
    /// with stale profile data.
    fn persist(&self, session: &Session) -> Result<(), StoreError> {
        store::save(self.store.as_ref(), TOKEN_KIND_KEY, &session.token_kind)?;
        match &session.user {
            Some(profile) => store::save(self.store.as_ref(), USER_KEY, profile)?,
            None => self.store.remove(USER_KEY)?,
        }
        match &session.token {
            Some(token) => store::save(self.store.as_ref(), TOKEN_KEY, token),
            None => self.store.remove(TOKEN_KEY),
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Session> {
        self.current.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Session> {
        self.current.write().unwrap_or_else(PoisonError::into_inner)
    }
}
