//! License exchange state machine and the DRM backends behind it.
//!
//! [`KeySession`] implements the state machine once. Everything that differs
//! between DRM systems lives behind [`SessionBackend`], created by a
//! [`KeySystem`]:
//!
//! | Key system  | Backend | Keys held by |
//! |-------------|---------|--------------|
//! | [`ClearKey`]  | in-crate JSON license, [`Cipher`](crate::Cipher) | this crate |
//! | [`PlayReady`] | [`PlatformCdm`] | platform |
//! | [`OpenCdm`]   | [`PlatformCdm`] | platform |

mod clearkey;
mod opencdm;
mod platform;
mod playready;

pub use clearkey::{ClearKey, jwk_set};
pub use opencdm::OpenCdm;
pub use platform::{PlatformCdm, PlatformChallenge};
pub use playready::PlayReady;

use crate::{DrmSystemId, EncryptedSampleMetadata, Error, InitData, KeyId, KeyWait, Result};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};

/// State of a [`KeySession`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeySessionState {
    Uninitialized,
    KeyRequested,
    KeyReady,
    KeyError,
    Closed,
}

/// EME message type of a license exchange message.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum MessageType {
    #[default]
    LicenseRequest,
    LicenseRenewal,
    LicenseRelease,
    IndividualizationRequest,
}

/// Message the application has to deliver to a license server.
#[derive(Clone, Debug, Default)]
pub struct LicenseRequest {
    pub message_type: MessageType,
    pub payload: Vec<u8>,
    /// License server url when the backend knows it.
    pub destination: Option<String>,
}

/// Status of a single content key.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyStatus {
    Usable,
    Expired,
    Released,
    InternalError,
}

/// Backend specific half of a key session.
///
/// Implementations are driven by [`KeySession`], which serialises all calls
/// and owns the state machine. `update` must be atomic: when it fails, keys
/// that were usable before stay usable.
pub trait SessionBackend: Send {
    fn generate_request(&mut self, init_data: &InitData) -> Result<LicenseRequest>;
    fn update(&mut self, response: &[u8]) -> Result<()>;
    fn decrypt(&mut self, sample: &EncryptedSampleMetadata, data: &mut [u8]) -> Result<()>;
    fn close(&mut self);

    /// Whether another `update` may follow a rejected one.
    fn allows_retry(&self) -> bool {
        false
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        Vec::new()
    }
}

/// Factory for the sessions of one DRM system.
pub trait KeySystem: Send + Sync {
    fn drm_system_id(&self) -> DrmSystemId;
    fn create_session(&self, session_id: &str) -> Result<Box<dyn SessionBackend>>;
}

struct Inner {
    state: KeySessionState,
    backend: Box<dyn SessionBackend>,
    listeners: Vec<Weak<KeyWait>>,
}

/// One license exchange for one init data of one DRM system.
pub struct KeySession {
    session_id: String,
    drm_system_id: DrmSystemId,
    init_data: InitData,
    inner: Mutex<Inner>,
}

impl std::fmt::Debug for KeySession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeySession")
            .field("session_id", &self.session_id)
            .field("drm_system_id", &self.drm_system_id)
            .field("state", &self.state())
            .finish()
    }
}

impl KeySession {
    pub fn new(
        session_id: impl Into<String>,
        drm_system_id: DrmSystemId,
        init_data: InitData,
        backend: Box<dyn SessionBackend>,
    ) -> Self {
        Self {
            session_id: session_id.into(),
            drm_system_id,
            init_data,
            inner: Mutex::new(Inner {
                state: KeySessionState::Uninitialized,
                backend,
                listeners: Vec::new(),
            }),
        }
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn drm_system_id(&self) -> DrmSystemId {
        self.drm_system_id
    }

    /// The init data this session was created for.
    pub fn init_data(&self) -> &InitData {
        &self.init_data
    }

    pub fn state(&self) -> KeySessionState {
        self.inner.lock().state
    }

    pub fn is_ready(&self) -> bool {
        self.state() == KeySessionState::KeyReady
    }

    pub fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.inner.lock().backend.key_statuses()
    }

    /// Produce the license request for `init_data`.
    pub fn generate_request(&self, init_data: &InitData) -> Result<LicenseRequest> {
        let mut inner = self.inner.lock();

        match inner.state {
            KeySessionState::Uninitialized => (),
            KeySessionState::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState("license request already generated")),
        }

        if *init_data != self.init_data {
            return Err(Error::Unsupported(format!(
                "session {} was created for different init data",
                self.session_id
            )));
        }

        let request = inner.backend.generate_request(init_data)?;
        inner.state = KeySessionState::KeyRequested;
        debug!(
            "session {} ({}) requested keys, {:?} of {} bytes",
            self.session_id,
            self.drm_system_id,
            request.message_type,
            request.payload.len()
        );
        Ok(request)
    }

    /// Feed a license response to the backend.
    ///
    /// A rejected response moves a pending session to `KeyError`. A rejected
    /// key rotation keeps the session `KeyReady` with its current keys.
    pub fn update(&self, response: &[u8]) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            KeySessionState::Closed => return Err(Error::Closed),
            KeySessionState::Uninitialized => {
                return Err(Error::InvalidState("update before generate_request"));
            }
            KeySessionState::KeyError if !inner.backend.allows_retry() => {
                return Err(Error::InvalidState("session failed and cannot be retried"));
            }
            _ => (),
        }

        let previous = inner.state;
        match inner.backend.update(response) {
            Ok(()) => {
                inner.state = KeySessionState::KeyReady;
                inner.listeners.retain(|x| x.strong_count() > 0);
                for wait in inner.listeners.iter().filter_map(Weak::upgrade) {
                    wait.key_received();
                }
                info!(
                    "session {} ({}) keys usable",
                    self.session_id, self.drm_system_id
                );
                Ok(())
            }
            Err(e) => {
                if previous == KeySessionState::KeyReady {
                    warn!(
                        "session {} rejected key rotation, keeping current keys: {}",
                        self.session_id, e
                    );
                } else {
                    inner.state = KeySessionState::KeyError;
                    warn!("session {} license rejected: {}", self.session_id, e);
                }
                Err(match e {
                    Error::License(x) => Error::License(x),
                    x => Error::License(x.to_string()),
                })
            }
        }
    }

    /// Decrypt `data` in place with this session's keys.
    ///
    /// `init_data` is what the caller resolved for this stream; a session never
    /// serves init data other than its own.
    pub fn decrypt(
        &self,
        init_data: &InitData,
        sample: &EncryptedSampleMetadata,
        data: &mut [u8],
    ) -> Result<()> {
        let mut inner = self.inner.lock();

        match inner.state {
            KeySessionState::KeyReady => (),
            KeySessionState::Closed => return Err(Error::Closed),
            _ => return Err(Error::InvalidState("no usable key in session")),
        }

        if *init_data != self.init_data {
            return Err(Error::Unsupported(format!(
                "session {} cannot serve init data it was not created for",
                self.session_id
            )));
        }

        inner.backend.decrypt(sample, data)
    }

    /// Wake `wait` whenever keys become usable, immediately if they already are.
    pub fn watch(&self, wait: &Arc<KeyWait>) {
        let mut inner = self.inner.lock();
        if inner.state == KeySessionState::KeyReady {
            wait.key_received();
        }

        if !inner
            .listeners
            .iter()
            .any(|x| std::ptr::eq(x.as_ptr(), Arc::as_ptr(wait)))
        {
            inner.listeners.push(Arc::downgrade(wait));
        }
    }

    pub fn unwatch(&self, wait: &Arc<KeyWait>) {
        self.inner
            .lock()
            .listeners
            .retain(|x| x.strong_count() > 0 && !std::ptr::eq(x.as_ptr(), Arc::as_ptr(wait)));
    }

    /// Release backend resources. Every later operation fails with `Closed`.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.state != KeySessionState::Closed {
            inner.backend.close();
            inner.state = KeySessionState::Closed;
            inner.listeners.clear();
            debug!("session {} closed", self.session_id);
        }
    }
}
