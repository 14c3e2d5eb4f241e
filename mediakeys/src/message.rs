//! Messages exchanged with the surrounding pipeline.
//!
//! Names in [`names`] are the wire names the pipeline matches on and must not
//! change.

use crate::{
    CandidateSystems, CdmInstance, DrmSystemId, InitData, InitDataType, ProtectionEvent, Result,
};
use std::sync::{Arc, Weak};

/// Wire names of messages, contexts and their fields.
pub mod names {
    pub const PROTECTION_EVENT: &str = "GstProtectionEvent";
    pub const PROTECTION_SYSTEM_ID: &str = "system_id";
    pub const PROTECTION_DATA: &str = "data";
    pub const PROTECTION_ORIGIN: &str = "origin";

    pub const PREFERRED_DECRYPTION_SYSTEM: &str = "drm-preferred-decryption-system-id";
    pub const DECRYPTION_SYSTEM_ID: &str = "decryption-system-id";

    pub const CDM_INSTANCE_CONTEXT: &str = "drm-cdm-instance";
    pub const CDM_INSTANCE: &str = "cdm-instance";

    pub const SESSION_EVENT: &str = "drm-session";
    pub const SESSION: &str = "session";

    pub const CIPHER_EVENT: &str = "drm-cipher";
    pub const KEY: &str = "key";

    pub const INIT_DATA_ENCOUNTERED: &str = "drm-initialization-data-encountered";
    pub const DRM_SYSTEM_UUID: &str = "drm-system-uuid";
    pub const INIT_DATA: &str = "init-data";

    pub const WAITING_FOR_KEY: &str = "drm-waiting-for-key";
    pub const KEY_RECEIVED: &str = "drm-key-received";
}

/// Protection event as it arrives from the demuxer, system id still a string.
#[derive(Clone, Debug, Default)]
pub struct ProtectionEventMessage {
    pub system_id: String,
    pub data: Vec<u8>,
    pub origin: Option<String>,
    pub init_data_type: InitDataType,
}

impl ProtectionEventMessage {
    pub fn new(system_id: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            system_id: system_id.into(),
            data,
            ..Default::default()
        }
    }

    pub fn into_event(self, sequence_id: u64) -> Result<ProtectionEvent> {
        let mut event = ProtectionEvent::new(
            sequence_id,
            DrmSystemId::parse(&self.system_id)?,
            InitData::new(self.init_data_type, self.data),
        );
        event.origin = self.origin;
        Ok(event)
    }
}

/// Out-of-band answer to a [`Notification::NeedsDecryptionSystem`] query.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct DecryptionSystemContext {
    pub decryption_system_id: DrmSystemId,
}

impl DecryptionSystemContext {
    pub const NAME: &'static str = names::PREFERRED_DECRYPTION_SYSTEM;

    pub fn new(decryption_system_id: DrmSystemId) -> Self {
        Self {
            decryption_system_id,
        }
    }

    /// Build from the string value of the `decryption-system-id` field.
    pub fn parse(value: &str) -> Result<Self> {
        Ok(Self::new(DrmSystemId::parse(value)?))
    }
}

/// Downward context pointing at the current CDM instance.
///
/// Never keeps the instance alive.
#[derive(Clone, Debug)]
pub struct CdmContext {
    pub(crate) instance: Weak<CdmInstance>,
    pub(crate) epoch: u64,
}

impl CdmContext {
    pub const NAME: &'static str = names::CDM_INSTANCE_CONTEXT;

    pub fn instance(&self) -> Option<Arc<CdmInstance>> {
        self.instance.upgrade()
    }

    /// Attach epoch the context was taken at.
    pub fn epoch(&self) -> u64 {
        self.epoch
    }
}

/// In-band control events travelling with the buffers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum CustomEvent {
    /// Bind to a session of the current instance.
    Session { session_id: String },
    /// Decrypt with this raw key instead of a session.
    CipherKey { key: Vec<u8> },
}

impl CustomEvent {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Session { .. } => names::SESSION_EVENT,
            Self::CipherKey { .. } => names::CIPHER_EVENT,
        }
    }
}

/// Events a decryptor handles between buffers.
#[derive(Clone, Debug)]
pub enum DownstreamEvent {
    Protection(ProtectionEvent),
    Custom(CustomEvent),
    FlushStart,
    FlushStop,
    StreamEnd,
}

/// Upward notifications for the application.
#[derive(Clone, Debug)]
pub enum Notification {
    /// Candidate systems are known, none was selected.
    NeedsDecryptionSystem(CandidateSystems),
    InitDataEncountered {
        drm_system_id: DrmSystemId,
        init_data: InitData,
    },
    WaitingForKey {
        stream: String,
    },
    KeyReceived {
        stream: String,
    },
}

impl Notification {
    pub fn name(&self) -> &'static str {
        match self {
            Self::NeedsDecryptionSystem(_) => names::PREFERRED_DECRYPTION_SYSTEM,
            Self::InitDataEncountered { .. } => names::INIT_DATA_ENCOUNTERED,
            Self::WaitingForKey { .. } => names::WAITING_FOR_KEY,
            Self::KeyReceived { .. } => names::KEY_RECEIVED,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protection_message_into_event() {
        let mut message = ProtectionEventMessage::new(
            "9a04f079-9840-4286-ab92-e65be0885f95",
            b"pssh".to_vec(),
        );
        message.origin = Some("dash/mpd".to_owned());

        let event = message.into_event(4).unwrap();
        assert_eq!(event.sequence_id, 4);
        assert_eq!(event.drm_system_id, DrmSystemId::PLAYREADY);
        assert_eq!(event.origin.as_deref(), Some("dash/mpd"));
        assert_eq!(event.init_data.as_bytes(), b"pssh");
    }

    #[test]
    fn bad_system_id() {
        assert!(
            ProtectionEventMessage::new("not-a-uuid", vec![])
                .into_event(1)
                .is_err()
        );
        assert!(DecryptionSystemContext::parse("edef8ba979d64acea3c827dcd51d21ed").is_ok());
    }

    #[test]
    fn wire_names() {
        assert_eq!(
            CustomEvent::Session {
                session_id: "1".to_owned()
            }
            .name(),
            "drm-session"
        );
        assert_eq!(
            CustomEvent::CipherKey { key: vec![] }.name(),
            "drm-cipher"
        );
        assert_eq!(
            Notification::KeyReceived {
                stream: "video".to_owned()
            }
            .name(),
            "drm-key-received"
        );
        assert_eq!(CdmContext::NAME, "drm-cdm-instance");
    }
}
