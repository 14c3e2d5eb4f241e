use super::{KeyStatus, LicenseRequest, MessageType, SessionBackend};
use crate::{DrmSystemId, EncryptedSampleMetadata, Error, InitData, KeyId, Result};
use log::{debug, warn};
use std::sync::Arc;

/// Challenge produced by a platform CDM for a new session.
#[derive(Clone, Debug, Default)]
pub struct PlatformChallenge {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    /// License acquisition url embedded in the challenge, if any.
    pub destination: Option<String>,
}

/// Opaque platform CDM holding the keys itself.
///
/// Sessions are addressed by the handle returned from
/// [`PlatformCdm::construct_session`].
pub trait PlatformCdm: Send + Sync {
    fn construct_session(
        &self,
        drm_system_id: DrmSystemId,
        init_data: &InitData,
    ) -> Result<(String, PlatformChallenge)>;

    /// Process a license response, returning the resulting key statuses.
    fn update(&self, handle: &str, response: &[u8]) -> Result<Vec<(KeyId, KeyStatus)>>;

    fn decrypt(&self, handle: &str, sample: &EncryptedSampleMetadata, data: &mut [u8])
    -> Result<()>;

    fn release(&self, handle: &str);
}

/// Session backend forwarding to a [`PlatformCdm`].
pub(super) struct PlatformSession {
    pub(super) label: &'static str,
    pub(super) drm_system_id: DrmSystemId,
    pub(super) platform: Arc<dyn PlatformCdm>,
    pub(super) retry: bool,
    pub(super) handle: Option<String>,
    pub(super) statuses: Vec<(KeyId, KeyStatus)>,
}

impl PlatformSession {
    fn handle(&self) -> Result<&str> {
        self.handle
            .as_deref()
            .ok_or(Error::InvalidState("platform session not constructed"))
    }
}

impl SessionBackend for PlatformSession {
    fn generate_request(&mut self, init_data: &InitData) -> Result<LicenseRequest> {
        let (handle, challenge) = self
            .platform
            .construct_session(self.drm_system_id, init_data)?;

        debug!(
            "{} platform session {} constructed, {:?} to {}",
            self.label,
            handle,
            challenge.message_type,
            challenge.destination.as_deref().unwrap_or("<unknown>")
        );
        self.handle = Some(handle);

        Ok(LicenseRequest {
            message_type: challenge.message_type,
            payload: challenge.payload,
            destination: challenge.destination,
        })
    }

    fn update(&mut self, response: &[u8]) -> Result<()> {
        let statuses = self.platform.update(self.handle()?, response)?;

        if !statuses.iter().any(|(_, x)| *x == KeyStatus::Usable) {
            warn!(
                "{} license produced no usable key ({} key statuses)",
                self.label,
                statuses.len()
            );
            return Err(Error::License("no usable key in license".to_owned()));
        }

        self.statuses = statuses;
        Ok(())
    }

    fn decrypt(&mut self, sample: &EncryptedSampleMetadata, data: &mut [u8]) -> Result<()> {
        sample.validate(data.len())?;
        self.platform.decrypt(self.handle()?, sample, data)
    }

    fn close(&mut self) {
        if let Some(handle) = self.handle.take() {
            self.platform.release(&handle);
        }

        for (_, status) in &mut self.statuses {
            *status = KeyStatus::Released;
        }
    }

    fn allows_retry(&self) -> bool {
        self.retry
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.statuses.clone()
    }
}
