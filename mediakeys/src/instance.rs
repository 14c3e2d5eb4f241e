use crate::{DrmSystemId, Error, InitData, KeySession, KeySessionState, KeySystem, Result};
use log::{debug, info};
use parking_lot::Mutex;
use std::{collections::HashMap, sync::Arc};

#[derive(Default)]
struct Sessions {
    by_init_data: HashMap<InitData, Arc<KeySession>>,
    next_id: u64,
    closed: bool,
}

/// Shared handle carrying the resolved DRM system and its key sessions.
///
/// Holds at most one live session per distinct init data.
pub struct CdmInstance {
    drm_system_id: DrmSystemId,
    key_system: Box<dyn KeySystem>,
    sessions: Mutex<Sessions>,
}

impl std::fmt::Debug for CdmInstance {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CdmInstance")
            .field("drm_system_id", &self.drm_system_id)
            .field("sessions", &self.sessions.lock().by_init_data.len())
            .finish()
    }
}

impl CdmInstance {
    pub fn new(key_system: impl KeySystem + 'static) -> Arc<Self> {
        Arc::new(Self {
            drm_system_id: key_system.drm_system_id(),
            key_system: Box::new(key_system),
            sessions: Mutex::new(Sessions::default()),
        })
    }

    pub fn drm_system_id(&self) -> DrmSystemId {
        self.drm_system_id
    }

    /// Session for `init_data`, created on first use.
    ///
    /// A session that was closed on its own is replaced by a fresh one.
    pub fn session_for(&self, init_data: &InitData) -> Result<Arc<KeySession>> {
        let mut sessions = self.sessions.lock();

        if sessions.closed {
            return Err(Error::Closed);
        }

        if let Some(session) = sessions.by_init_data.get(init_data) {
            if session.state() != KeySessionState::Closed {
                return Ok(session.clone());
            }
        }

        sessions.next_id += 1;
        let session_id = sessions.next_id.to_string();
        let session = Arc::new(KeySession::new(
            session_id.clone(),
            self.drm_system_id,
            init_data.clone(),
            self.key_system.create_session(&session_id)?,
        ));

        debug!(
            "created session {} for {} ({:?})",
            session_id, self.drm_system_id, init_data
        );
        sessions
            .by_init_data
            .insert(init_data.clone(), session.clone());
        Ok(session)
    }

    pub fn session(&self, session_id: &str) -> Option<Arc<KeySession>> {
        self.sessions
            .lock()
            .by_init_data
            .values()
            .find(|x| x.session_id() == session_id)
            .cloned()
    }

    pub fn sessions(&self) -> Vec<Arc<KeySession>> {
        self.sessions.lock().by_init_data.values().cloned().collect()
    }

    /// Close and forget one session.
    pub fn remove_session(&self, session_id: &str) -> bool {
        let removed = {
            let mut sessions = self.sessions.lock();
            let key = sessions
                .by_init_data
                .iter()
                .find(|(_, x)| x.session_id() == session_id)
                .map(|(x, _)| x.clone());
            key.and_then(|x| sessions.by_init_data.remove(&x))
        };

        match removed {
            Some(session) => {
                session.close();
                true
            }
            None => false,
        }
    }

    /// Close every session. Later [`CdmInstance::session_for`] calls fail with `Closed`.
    pub fn close(&self) {
        let sessions = {
            let mut sessions = self.sessions.lock();
            if sessions.closed {
                return;
            }
            sessions.closed = true;
            std::mem::take(&mut sessions.by_init_data)
        };

        info!(
            "closing {} instance with {} session(s)",
            self.drm_system_id,
            sessions.len()
        );
        for session in sessions.into_values() {
            session.close();
        }
    }

    pub fn is_closed(&self) -> bool {
        self.sessions.lock().closed
    }
}
