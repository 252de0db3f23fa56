use std::collections::HashMap;
use std::sync::RwLock;

use chrono::{DateTime, Duration, Utc};
use data_encoding::BASE64URL_NOPAD;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::store::{KeyedStore, Role};

/// Bytes of entropy behind a session id.
const SESSION_ID_LENGTH: usize = 32;

/// An authenticated session, minted only after both factors succeed.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Session {
    id: String,
    identity: String,
    role: Role,
    created_at: DateTime<Utc>,
    expires_at: DateTime<Utc>,
    origin: String,
}

impl Session {
    pub(crate) fn mint(identity: &str, role: Role, origin: &str, ttl: Duration) -> Self {
        let mut bytes = [0; SESSION_ID_LENGTH];
        rand::thread_rng().fill_bytes(&mut bytes);
        let created_at = Utc::now();
        Self {
            id: BASE64URL_NOPAD.encode(&bytes),
            identity: identity.to_string(),
            role,
            created_at,
            expires_at: created_at + ttl,
            origin: origin.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn expires_at(&self) -> DateTime<Utc> {
        self.expires_at
    }

    pub fn origin(&self) -> &str {
        &self.origin
    }

    /// Does this session permit the given role?
    pub fn permits(&self, target: Role) -> bool {
        self.role == target
    }

    /// Expiry is enforced lazily on read, never by an active timer.
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now > self.expires_at
    }
}

/// In-memory session table: at most one active session per identity,
/// addressable by session id.
pub(crate) struct SessionStore {
    by_identity: KeyedStore<String, Option<Session>>,
    ids: RwLock<HashMap<String, String>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            by_identity: KeyedStore::new(),
            ids: RwLock::new(HashMap::new()),
        }
    }

    /// Store a freshly minted session, returning the prior session for
    /// the same identity if one was displaced.
    pub fn insert(&self, session: Session) -> Option<Session> {
        let identity = session.identity.clone();
        let prior = self
            .by_identity
            .with_entry(&identity, || None, |slot| slot.replace(session.clone()));
        let mut ids = self.ids.write().expect("session id index lock poisoned");
        if let Some(ref displaced) = prior {
            ids.remove(&displaced.id);
        }
        ids.insert(session.id.clone(), session.identity.clone());
        prior
    }

    /// Look a session up by id, removing and hiding it if expired.
    pub fn get(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let identity = self
            .ids
            .read()
            .expect("session id index lock poisoned")
            .get(session_id)
            .cloned()?;
        let session = self
            .by_identity
            .with_existing(&identity, |slot| slot.clone())
            .flatten()?;
        if session.is_expired(now) {
            self.remove(session_id);
            return None;
        }
        Some(session)
    }

    /// Remove a session by id, returning it if it was present.
    pub fn remove(&self, session_id: &str) -> Option<Session> {
        let identity = self
            .ids
            .write()
            .expect("session id index lock poisoned")
            .remove(session_id)?;
        self.by_identity
            .with_existing(&identity, |slot| slot.take())
            .flatten()
    }

    /// Drop every expired session.
    pub fn prune(&self, now: DateTime<Utc>) {
        let mut dropped = Vec::new();
        self.by_identity.retain(|_, slot| match slot {
            Some(session) if !session.is_expired(now) => true,
            Some(session) => {
                dropped.push(session.id.clone());
                false
            }
            None => false,
        });
        let mut ids = self.ids.write().expect("session id index lock poisoned");
        for id in dropped {
            ids.remove(&id);
        }
    }
}
