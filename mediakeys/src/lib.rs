//! Key exchange and sample decryption core for encrypted media playback.
//!
//! This crate sits between a real-time streaming thread, which has to decrypt
//! protected buffers with low latency, and a control thread, which negotiates
//! keys with one of several DRM backends. The streaming side never knows which
//! backend is active.
//!
//! # Components
//!
//! - [`ProtectionEventStore`]: deduplicates protection events carried on
//!   buffers and decides which init data is new.
//! - [`KeySession`]: license exchange state machine, backed by one of
//!   [`ClearKey`], [`PlayReady`] or [`OpenCdm`].
//! - [`CdmInstance`]: shared handle carrying the resolved DRM system and its
//!   sessions.
//! - [`Negotiator`]: answers "which DRM system" queries on the control thread
//!   and publishes the attached instance.
//! - [`Decryptor`]: per-buffer transform run on the streaming thread.
//!
//! # Quick Start
//!
//! ```no_run
//! use mediakeys::{
//!     Buffer, CdmInstance, ClearKey, Decryptor, DrmSystemId, EncryptedSampleMetadata,
//!     InitData, InitDataType, Negotiator, ProtectionEvent,
//! };
//! use std::sync::mpsc;
//!
//! let (sender, _notifications) = mpsc::channel();
//! let negotiator = Negotiator::builder().notifier(sender).build();
//! negotiator.attach_instance(CdmInstance::new(ClearKey::new()));
//!
//! let mut decryptor = Decryptor::builder().name("video").build(negotiator.clone());
//!
//! let kid = [0x11; 16];
//! let init_data = InitData::new(InitDataType::KeyIds, br#"{"kids":["EREREREREREREREREREREQ"]}"#.to_vec());
//! let mut buffer = Buffer::new(vec![0; 32])
//!     .with_protection(EncryptedSampleMetadata::new(kid.to_vec(), vec![0; 16]))
//!     .with_event(ProtectionEvent::new(1, DrmSystemId::CLEARKEY, init_data));
//!
//! // Blocks until the application delivers a license on the control thread.
//! let _flow = decryptor.transform(&mut buffer);
//! ```

mod cipher;
mod decrypter;
mod error;
mod instance;
mod message;
mod negotiator;
mod protection;
mod sample;
mod session;
mod sync;
mod system;
mod transform;

pub use cipher::{AesCipher, Cipher, CipherMode};
pub use decrypter::decrypt_sample;
pub use error::{Error, Result};
pub use instance::CdmInstance;
pub use message::{
    CdmContext, CustomEvent, DecryptionSystemContext, DownstreamEvent, Notification,
    ProtectionEventMessage, names,
};
pub use negotiator::{Negotiator, NegotiatorBuilder, QueryOutcome};
pub use protection::{
    CandidateSystems, InitData, InitDataType, ProtectionEvent, ProtectionEventStore, Resolution,
};
pub use sample::{Buffer, EncryptedSampleMetadata, KeyId, Pattern, Scheme, Subsample};
pub use session::{
    ClearKey, KeySession, KeySessionState, KeyStatus, KeySystem, LicenseRequest, MessageType,
    OpenCdm, PlatformCdm, PlatformChallenge, PlayReady, SessionBackend, jwk_set,
};
pub use sync::{DEFAULT_KEY_TIMEOUT, KeyWait, WaitOutcome, deadline_after};
pub use system::DrmSystemId;
pub use transform::{Decryptor, DecryptorBuilder, FlushHandle, Flow};
