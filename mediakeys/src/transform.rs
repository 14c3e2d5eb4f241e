//! Streaming thread side: per-buffer key wait and decryption.

use crate::{
    AesCipher, Buffer, CdmInstance, Cipher, CustomEvent, DEFAULT_KEY_TIMEOUT, DownstreamEvent,
    DrmSystemId, EncryptedSampleMetadata, Error, InitData, KeySession, KeySessionState, KeyWait,
    Negotiator, Notification, ProtectionEventStore, QueryOutcome, Resolution, Result, WaitOutcome,
    deadline_after, decrypt_sample,
};
use log::{debug, info, trace, warn};
use std::{
    collections::HashSet,
    sync::{Arc, Weak},
    time::{Duration, Instant},
};

/// What [`Decryptor::transform`] did with a buffer.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    Decrypted,
    PassedThrough,
    /// A flush started; the buffer is untouched and should be dropped.
    Flushing,
}

enum Binding {
    None,
    Session {
        session: Weak<KeySession>,
        init_data: InitData,
    },
    CipherKey([u8; 16]),
}

/// Signals flushes to a [`Decryptor`] from another thread.
#[derive(Clone, Debug)]
pub struct FlushHandle {
    wait: Arc<KeyWait>,
}

impl FlushHandle {
    /// Wake the decryptor; it returns [`Flow::Flushing`] until [`FlushHandle::stop`].
    pub fn start(&self) -> Result<()> {
        self.wait.flush_start()
    }

    pub fn stop(&self) {
        self.wait.flush_stop();
    }
}

/// Decryption transform for one stream.
///
/// Owns its protection event store and key wait. References the negotiator's
/// instance and sessions weakly, re-resolving them whenever the instance changes.
pub struct Decryptor {
    name: String,
    negotiator: Arc<Negotiator>,
    store: ProtectionEventStore,
    wait: Arc<KeyWait>,
    seen_epoch: u64,
    system: Option<DrmSystemId>,
    current: Option<InitData>,
    /// Init data already posted upward for `system`.
    announced: HashSet<InitData>,
    binding: Binding,
    cipher: Arc<dyn Cipher>,
    timeout: Duration,
}

impl Decryptor {
    pub fn builder() -> DecryptorBuilder {
        DecryptorBuilder::default()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// DRM system this stream resolved to.
    pub fn drm_system_id(&self) -> Option<DrmSystemId> {
        self.system
    }

    pub fn session(&self) -> Option<Arc<KeySession>> {
        match &self.binding {
            Binding::Session { session, .. } => session.upgrade(),
            _ => None,
        }
    }

    pub fn flush_handle(&self) -> FlushHandle {
        FlushHandle {
            wait: self.wait.clone(),
        }
    }

    /// Decrypt `buffer` in place.
    ///
    /// May block for up to the configured timeout waiting for a system to be
    /// selected or for a key to arrive. Clear buffers never block.
    pub fn transform(&mut self, buffer: &mut Buffer) -> Result<Flow> {
        for event in buffer.protection_events.drain(..) {
            if let (Some(map), Some(protection)) = (&event.subsample_map, &mut buffer.protection) {
                if protection.subsamples.is_empty() {
                    protection.subsamples = map.clone();
                }
            }
            self.store.record(event);
        }

        if self.wait.is_flushing() {
            return Ok(Flow::Flushing);
        }

        let deadline = deadline_after(self.timeout);
        let encrypted = buffer
            .protection
            .as_ref()
            .is_some_and(|x| !x.is_clear());

        if !self.resolve(deadline, encrypted)? {
            return Ok(Flow::Flushing);
        }

        let Some(protection) = buffer.protection.take() else {
            trace!("{}: {} bytes without protection", self.name, buffer.data.len());
            return Ok(Flow::PassedThrough);
        };

        if protection.is_clear() {
            trace!("{}: {} clear bytes", self.name, buffer.data.len());
            return Ok(Flow::PassedThrough);
        }

        // Malformed metadata stays dropped.
        protection.validate(buffer.data.len())?;

        loop {
            if !self.wait_for_key(deadline)? {
                buffer.protection = Some(protection);
                return Ok(Flow::Flushing);
            }

            match self.decrypt(&protection, &mut buffer.data) {
                Ok(()) => {
                    trace!(
                        "{}: decrypted {} bytes ({} subsamples)",
                        self.name,
                        buffer.data.len(),
                        protection.subsamples.len()
                    );
                    return Ok(Flow::Decrypted);
                }
                Err(Error::Closed) => {
                    debug!("{}: session closed during decrypt, re-resolving", self.name);
                    self.rebind(deadline)?;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Handle an event travelling between buffers.
    pub fn handle_event(&mut self, event: DownstreamEvent) -> Result<()> {
        match event {
            DownstreamEvent::Protection(event) => {
                self.store.record(event);
            }
            DownstreamEvent::Custom(CustomEvent::Session { session_id }) => {
                let instance = self
                    .instance()
                    .ok_or_else(|| Error::Unsupported("no CDM instance attached".to_owned()))?;
                let session = instance.session(&session_id).ok_or_else(|| {
                    Error::Unsupported(format!("unknown session {session_id}"))
                })?;

                debug!("{}: bound to session {} by event", self.name, session_id);
                self.system = Some(instance.drm_system_id());
                self.current = Some(session.init_data().clone());
                self.bind(&session);
            }
            DownstreamEvent::Custom(CustomEvent::CipherKey { key }) => {
                let key = <[u8; 16]>::try_from(key.as_slice()).map_err(|_| {
                    Error::Unsupported(format!("cipher key must be 16 bytes, got {}", key.len()))
                })?;

                debug!("{}: using raw cipher key", self.name);
                self.unbind();
                self.binding = Binding::CipherKey(key);
                self.wait.key_received();
            }
            DownstreamEvent::FlushStart => self.wait.flush_start()?,
            DownstreamEvent::FlushStop => self.wait.flush_stop(),
            DownstreamEvent::StreamEnd => {
                debug!("{}: stream ended", self.name);
                self.store.clear();
                self.unbind();
                self.system = None;
                self.current = None;
                self.announced.clear();
            }
        }

        Ok(())
    }

    fn instance(&self) -> Option<Arc<CdmInstance>> {
        self.negotiator.context().and_then(|x| x.instance())
    }

    /// Drain the store. Returns `false` when a flush interrupted a system query.
    fn resolve(&mut self, deadline: Instant, blocking: bool) -> Result<bool> {
        loop {
            match self.store.resolve(self.system) {
                Resolution::Nothing => return Ok(true),
                Resolution::InitData {
                    drm_system_id,
                    init_data,
                } => {
                    if self.announced.insert(init_data.clone()) {
                        debug!(
                            "{}: new init data for {} ({:?})",
                            self.name, drm_system_id, init_data
                        );
                        self.negotiator.post(Notification::InitDataEncountered {
                            drm_system_id,
                            init_data: init_data.clone(),
                        });
                    } else {
                        debug!("{}: switching back to known init data", self.name);
                    }
                    self.current = Some(init_data);
                    self.bind_current()?;
                }
                Resolution::NeedsSystemSelection(candidates) => {
                    let selected = if blocking {
                        match self
                            .negotiator
                            .query_until(&candidates, &self.wait, deadline)?
                        {
                            QueryOutcome::Resolved(x) => x,
                            QueryOutcome::Flushing => return Ok(false),
                        }
                    } else {
                        match self.negotiator.try_select(&candidates) {
                            Some(x) => x,
                            None => return Ok(true),
                        }
                    };

                    info!("{}: using {}", self.name, selected);
                    self.system = Some(selected);
                }
            }
        }
    }

    /// Block until the binding has a usable key. Returns `false` on flush.
    fn wait_for_key(&mut self, deadline: Instant) -> Result<bool> {
        let mut announced = false;

        loop {
            let seen = self.wait.epoch();
            if seen != self.seen_epoch {
                self.seen_epoch = seen;
                self.rebind(deadline)?;
            }

            if self.binding_ready()? {
                if announced {
                    info!("{}: key received", self.name);
                    self.negotiator.post(Notification::KeyReceived {
                        stream: self.name.clone(),
                    });
                }
                return Ok(true);
            }

            if !announced {
                debug!("{}: waiting for key", self.name);
                self.negotiator.post(Notification::WaitingForKey {
                    stream: self.name.clone(),
                });
                announced = true;
            }

            match self.wait.wait_for_key(deadline, seen) {
                WaitOutcome::KeyReceived => {
                    // Left over from a previous binding.
                    if !self.binding_ready()? {
                        self.wait.reset_key();
                    }
                }
                WaitOutcome::InstanceChanged => (),
                WaitOutcome::Flushing => return Ok(false),
                WaitOutcome::TimedOut => {
                    warn!("{}: no key received before timeout", self.name);
                    return Err(Error::Unsupported(format!(
                        "no key received within {:?}",
                        self.timeout
                    )));
                }
            }
        }
    }

    fn binding_ready(&mut self) -> Result<bool> {
        let state = match &self.binding {
            Binding::None => return Ok(false),
            Binding::CipherKey(_) => return Ok(true),
            Binding::Session { session, .. } => session.upgrade().map(|x| x.state()),
        };

        match state {
            Some(KeySessionState::KeyReady) => Ok(true),
            Some(KeySessionState::Closed) | None => {
                debug!("{}: bound session went away", self.name);
                self.unbind();
                self.bind_current()?;
                Ok(self.session().is_some_and(|x| x.is_ready()))
            }
            Some(_) => Ok(false),
        }
    }

    /// Follow an instance change.
    fn rebind(&mut self, deadline: Instant) -> Result<()> {
        if let Binding::CipherKey(_) = self.binding {
            return Ok(());
        }

        let Some(instance) = self.instance() else {
            debug!("{}: no CDM instance attached", self.name);
            self.unbind();
            return Ok(());
        };

        if self.system != Some(instance.drm_system_id()) {
            info!(
                "{}: switching to {} instance",
                self.name,
                instance.drm_system_id()
            );
            self.unbind();
            self.system = Some(instance.drm_system_id());
            self.current = None;
            self.announced.clear();
            self.resolve(deadline, false)?;
        }

        self.bind_current()
    }

    fn bind_current(&mut self) -> Result<()> {
        if let Binding::CipherKey(_) = self.binding {
            return Ok(());
        }

        let Some(init_data) = self.current.clone() else {
            return Ok(());
        };

        let Some(instance) = self.instance() else {
            self.unbind();
            return Ok(());
        };

        if Some(instance.drm_system_id()) != self.system {
            self.unbind();
            return Ok(());
        }

        match instance.session_for(&init_data) {
            Ok(session) => {
                self.bind(&session);
                Ok(())
            }
            // Detached between the lookup and here, the epoch change follows.
            Err(Error::Closed) => {
                self.unbind();
                Ok(())
            }
            Err(e) => Err(e),
        }
    }

    fn bind(&mut self, session: &Arc<KeySession>) {
        if let Some(current) = self.session() {
            if Arc::ptr_eq(&current, session) {
                return;
            }
        }

        self.unbind();
        trace!("{}: bound to session {}", self.name, session.session_id());
        session.watch(&self.wait);
        self.binding = Binding::Session {
            session: Arc::downgrade(session),
            init_data: session.init_data().clone(),
        };
    }

    fn unbind(&mut self) {
        if let Some(session) = self.session() {
            session.unwatch(&self.wait);
        }
        self.binding = Binding::None;
        self.wait.reset_key();
    }

    fn decrypt(&self, sample: &EncryptedSampleMetadata, data: &mut [u8]) -> Result<()> {
        match &self.binding {
            Binding::CipherKey(key) => decrypt_sample(self.cipher.as_ref(), key, sample, data),
            Binding::Session { session, init_data } => session
                .upgrade()
                .ok_or(Error::Closed)?
                .decrypt(init_data, sample, data),
            Binding::None => Err(Error::Closed),
        }
    }
}

impl Drop for Decryptor {
    fn drop(&mut self) {
        if let Some(session) = self.session() {
            session.unwatch(&self.wait);
        }
    }
}

pub struct DecryptorBuilder {
    name: String,
    timeout: Duration,
    cipher: Arc<dyn Cipher>,
}

impl Default for DecryptorBuilder {
    fn default() -> Self {
        Self {
            name: "decryptor".to_owned(),
            timeout: DEFAULT_KEY_TIMEOUT,
            cipher: Arc::new(AesCipher),
        }
    }
}

impl DecryptorBuilder {
    /// Name used in logs and notifications.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Upper bound for one buffer's waits. Defaults to [`DEFAULT_KEY_TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Cipher used with raw keys from [`CustomEvent::CipherKey`].
    pub fn cipher(mut self, cipher: Arc<dyn Cipher>) -> Self {
        self.cipher = cipher;
        self
    }

    pub fn build(self, negotiator: Arc<Negotiator>) -> Decryptor {
        let wait = Arc::new(KeyWait::new());
        negotiator.register(&wait);

        Decryptor {
            name: self.name,
            negotiator,
            store: ProtectionEventStore::new(),
            seen_epoch: wait.epoch(),
            wait,
            system: None,
            current: None,
            announced: HashSet::new(),
            binding: Binding::None,
            cipher: self.cipher,
            timeout: self.timeout,
        }
    }
}
