use super::{KeySystem, SessionBackend, platform::PlatformSession};
use crate::{DrmSystemId, PlatformCdm, Result};
use std::sync::Arc;

/// Microsoft PlayReady through the platform CDM.
///
/// A rejected license is final for the session.
#[derive(Clone)]
pub struct PlayReady {
    platform: Arc<dyn PlatformCdm>,
}

impl PlayReady {
    pub fn new(platform: Arc<dyn PlatformCdm>) -> Self {
        Self { platform }
    }
}

impl KeySystem for PlayReady {
    fn drm_system_id(&self) -> DrmSystemId {
        DrmSystemId::PLAYREADY
    }

    fn create_session(&self, _session_id: &str) -> Result<Box<dyn SessionBackend>> {
        Ok(Box::new(PlatformSession {
            label: "playready",
            drm_system_id: DrmSystemId::PLAYREADY,
            platform: self.platform.clone(),
            retry: false,
            handle: None,
            statuses: Vec::new(),
        }))
    }
}
