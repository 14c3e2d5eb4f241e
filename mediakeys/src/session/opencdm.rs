use super::{KeySystem, SessionBackend, platform::PlatformSession};
use crate::{DrmSystemId, PlatformCdm, Result};
use std::sync::Arc;

/// Any system served by an OpenCDM style service, usually Widevine or PlayReady.
///
/// The service may ask for individualization before the license request and
/// accepts a new license after a rejected one.
#[derive(Clone)]
pub struct OpenCdm {
    drm_system_id: DrmSystemId,
    platform: Arc<dyn PlatformCdm>,
}

impl OpenCdm {
    pub fn new(drm_system_id: DrmSystemId, platform: Arc<dyn PlatformCdm>) -> Self {
        Self {
            drm_system_id,
            platform,
        }
    }
}

impl KeySystem for OpenCdm {
    fn drm_system_id(&self) -> DrmSystemId {
        self.drm_system_id
    }

    fn create_session(&self, _session_id: &str) -> Result<Box<dyn SessionBackend>> {
        Ok(Box::new(PlatformSession {
            label: "opencdm",
            drm_system_id: self.drm_system_id,
            platform: self.platform.clone(),
            retry: true,
            handle: None,
            statuses: Vec::new(),
        }))
    }
}
