//! Control thread side of DRM system selection.

use crate::{
    CandidateSystems, CdmContext, CdmInstance, DEFAULT_KEY_TIMEOUT, DecryptionSystemContext,
    DrmSystemId, Error, KeyWait, Notification, Result, WaitOutcome, deadline_after,
};
use log::{debug, info, warn};
use parking_lot::Mutex;
use std::{
    sync::{Arc, Weak, mpsc::Sender},
    time::{Duration, Instant},
};

/// Result of [`Negotiator::on_system_query`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum QueryOutcome {
    Resolved(DrmSystemId),
    /// A flush interrupted the query.
    Flushing,
}

#[derive(Default)]
struct State {
    instance: Option<Arc<CdmInstance>>,
    preferred: Option<DrmSystemId>,
    epoch: u64,
    waits: Vec<Weak<KeyWait>>,
}

impl State {
    fn waits(&mut self) -> Vec<Arc<KeyWait>> {
        self.waits.retain(|x| x.strong_count() > 0);
        self.waits.iter().filter_map(Weak::upgrade).collect()
    }
}

/// Answers "which DRM system" and publishes the attached [`CdmInstance`].
///
/// At most one instance is attached at a time. Shared between the control
/// thread and every [`Decryptor`](crate::Decryptor) of a stream.
pub struct Negotiator {
    state: Mutex<State>,
    timeout: Duration,
    notifier: Option<Sender<Notification>>,
}

impl std::fmt::Debug for Negotiator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Negotiator")
            .field("instance", &state.instance)
            .field("preferred", &state.preferred)
            .field("epoch", &state.epoch)
            .field("timeout", &self.timeout)
            .finish()
    }
}

impl Negotiator {
    pub fn builder() -> NegotiatorBuilder {
        NegotiatorBuilder::default()
    }

    pub fn new() -> Arc<Self> {
        Self::builder().build()
    }

    /// Pick a system for `candidates`, blocking until one is available.
    ///
    /// Returns immediately when the attached instance's system (or an
    /// answered preference) is among the candidates. Otherwise posts
    /// [`Notification::NeedsDecryptionSystem`] once and waits for an attach,
    /// an answer, a flush or the timeout.
    pub fn on_system_query(
        &self,
        candidates: &CandidateSystems,
        wait: &Arc<KeyWait>,
    ) -> Result<QueryOutcome> {
        self.query_until(candidates, wait, deadline_after(self.timeout))
    }

    pub(crate) fn query_until(
        &self,
        candidates: &CandidateSystems,
        wait: &Arc<KeyWait>,
        deadline: Instant,
    ) -> Result<QueryOutcome> {
        self.register(wait);
        let mut posted = false;

        loop {
            // Epoch first so an attach racing with the check still wakes us.
            let seen = wait.epoch();

            if let Some(drm_system_id) = self.try_select(candidates) {
                debug!("system query resolved to {}", drm_system_id);
                return Ok(QueryOutcome::Resolved(drm_system_id));
            }

            if !posted {
                info!(
                    "no decryption system selected, candidates: {}",
                    candidates
                        .systems
                        .iter()
                        .map(|x| x.to_string())
                        .collect::<Vec<_>>()
                        .join(", ")
                );
                self.post(Notification::NeedsDecryptionSystem(candidates.clone()));
                posted = true;
            }

            match wait.wait_for_change(deadline, seen) {
                WaitOutcome::Flushing => return Ok(QueryOutcome::Flushing),
                WaitOutcome::TimedOut => {
                    warn!("no decryption system selected before timeout");
                    return Err(Error::Unsupported(
                        "no decryption system selected before timeout".to_owned(),
                    ));
                }
                WaitOutcome::InstanceChanged | WaitOutcome::KeyReceived => (),
            }
        }
    }

    /// Non blocking half of [`Negotiator::on_system_query`].
    pub fn try_select(&self, candidates: &CandidateSystems) -> Option<DrmSystemId> {
        let state = self.state.lock();

        if let Some(instance) = &state.instance {
            let drm_system_id = instance.drm_system_id();
            if candidates.is_empty() || candidates.contains(&drm_system_id) {
                return Some(drm_system_id);
            }
            debug!(
                "attached instance {} is not among the candidates",
                drm_system_id
            );
        }

        state
            .preferred
            .filter(|x| candidates.is_empty() || candidates.contains(x))
    }

    /// Answer a query without attaching an instance yet.
    pub fn answer(&self, context: DecryptionSystemContext) {
        let waits = {
            let mut state = self.state.lock();
            state.preferred = Some(context.decryption_system_id);
            state.waits()
        };

        info!(
            "preferred decryption system set to {}",
            context.decryption_system_id
        );
        for wait in waits {
            wait.instance_changed();
        }
    }

    /// Attach `instance`, closing the one it replaces.
    ///
    /// The replaced instance is closed before any waiter is woken, so no
    /// buffer is decrypted under both instances.
    pub fn attach_instance(&self, instance: Arc<CdmInstance>) {
        let (previous, waits) = {
            let mut state = self.state.lock();
            state.epoch += 1;
            state.preferred = Some(instance.drm_system_id());
            let previous = state.instance.replace(instance.clone());
            (previous, state.waits())
        };

        info!("attached {} instance", instance.drm_system_id());
        if let Some(previous) = previous {
            if !Arc::ptr_eq(&previous, &instance) {
                previous.close();
            }
        }

        for wait in waits {
            wait.instance_changed();
        }
    }

    /// Detach and close the current instance.
    pub fn detach_instance(&self) -> Option<Arc<CdmInstance>> {
        let (previous, waits) = {
            let mut state = self.state.lock();
            let previous = state.instance.take()?;
            state.epoch += 1;
            state.preferred = None;
            (previous, state.waits())
        };

        info!("detached {} instance", previous.drm_system_id());
        previous.close();

        for wait in waits {
            wait.instance_changed();
        }
        Some(previous)
    }

    /// Context handed down to decryptors, `None` until an instance is attached.
    pub fn context(&self) -> Option<CdmContext> {
        let state = self.state.lock();
        state.instance.as_ref().map(|x| CdmContext {
            instance: Arc::downgrade(x),
            epoch: state.epoch,
        })
    }

    pub fn instance(&self) -> Option<Arc<CdmInstance>> {
        self.state.lock().instance.clone()
    }

    pub fn preferred_system(&self) -> Option<DrmSystemId> {
        self.state.lock().preferred
    }

    /// Attach epoch, bumped on every attach and detach.
    pub fn epoch(&self) -> u64 {
        self.state.lock().epoch
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wake `wait` on every attach, detach and answer.
    pub fn register(&self, wait: &Arc<KeyWait>) {
        let mut state = self.state.lock();
        if !state
            .waits
            .iter()
            .any(|x| std::ptr::eq(x.as_ptr(), Arc::as_ptr(wait)))
        {
            state.waits.push(Arc::downgrade(wait));
        }
    }

    /// Send a notification to the application, dropped when nobody listens.
    pub fn post(&self, notification: Notification) {
        if let Some(notifier) = &self.notifier {
            let name = notification.name();
            if notifier.send(notification).is_err() {
                debug!("{} notification dropped, receiver is gone", name);
            }
        }
    }
}

#[derive(Default)]
pub struct NegotiatorBuilder {
    timeout: Option<Duration>,
    notifier: Option<Sender<Notification>>,
}

impl NegotiatorBuilder {
    /// How long a system query may block. Defaults to [`DEFAULT_KEY_TIMEOUT`].
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn notifier(mut self, notifier: Sender<Notification>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn build(self) -> Arc<Negotiator> {
        Arc::new(Negotiator {
            state: Mutex::new(State::default()),
            timeout: self.timeout.unwrap_or(DEFAULT_KEY_TIMEOUT),
            notifier: self.notifier,
        })
    }
}
