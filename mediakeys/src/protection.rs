//! Protection events and the per-transform store that deduplicates them.

use crate::{DrmSystemId, Error, Result, Subsample};
use log::{debug, trace};
use std::{
    collections::{HashMap, HashSet, VecDeque},
    fmt,
    hash::{Hash, Hasher},
    str::FromStr,
    sync::Arc,
};

/// EME init data type.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash)]
pub enum InitDataType {
    /// One or more `pssh` boxes, kept opaque.
    #[default]
    Cenc,
    /// ClearKey `{"kids":[...]}` JSON.
    KeyIds,
    /// WebM content encryption key id.
    WebM,
}

impl InitDataType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Cenc => "cenc",
            Self::KeyIds => "keyids",
            Self::WebM => "webm",
        }
    }
}

impl FromStr for InitDataType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cenc" => Ok(Self::Cenc),
            "keyids" => Ok(Self::KeyIds),
            "webm" => Ok(Self::WebM),
            x => Err(Error::Unsupported(format!("'{x}' init data type"))),
        }
    }
}

impl fmt::Display for InitDataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Opaque init data blob.
///
/// Equality and hashing compare content only, the type tag is ignored.
#[derive(Clone)]
pub struct InitData {
    kind: InitDataType,
    data: Arc<[u8]>,
}

impl InitData {
    pub fn new(kind: InitDataType, data: impl Into<Arc<[u8]>>) -> Self {
        Self {
            kind,
            data: data.into(),
        }
    }

    pub fn kind(&self) -> InitDataType {
        self.kind
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    fn concat<'a>(kind: InitDataType, blobs: impl IntoIterator<Item = &'a InitData>) -> Self {
        let mut data = Vec::new();
        for blob in blobs {
            data.extend_from_slice(blob.as_bytes());
        }
        Self::new(kind, data)
    }
}

impl From<Vec<u8>> for InitData {
    fn from(data: Vec<u8>) -> Self {
        Self::new(InitDataType::Cenc, data)
    }
}

impl From<&[u8]> for InitData {
    fn from(data: &[u8]) -> Self {
        Self::new(InitDataType::Cenc, data)
    }
}

impl PartialEq for InitData {
    fn eq(&self, other: &Self) -> bool {
        self.data == other.data
    }
}

impl Eq for InitData {}

impl Hash for InitData {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.data.hash(state);
    }
}

impl fmt::Debug for InitData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let head = &self.data[..self.data.len().min(8)];
        write!(
            f,
            "InitData({}, {} bytes, {}..)",
            self.kind,
            self.data.len(),
            hex::encode(head)
        )
    }
}

/// Protection metadata carried on a buffer or sent as a stream event.
#[derive(Clone, Debug)]
pub struct ProtectionEvent {
    pub sequence_id: u64,
    pub drm_system_id: DrmSystemId,
    pub init_data: InitData,
    /// Where the event came from, e.g. `isobmff/moov-pssh` or `dash/mpd`.
    pub origin: Option<String>,
    pub subsample_map: Option<Vec<Subsample>>,
}

impl ProtectionEvent {
    pub fn new(sequence_id: u64, drm_system_id: DrmSystemId, init_data: impl Into<InitData>) -> Self {
        Self {
            sequence_id,
            drm_system_id,
            init_data: init_data.into(),
            origin: None,
            subsample_map: None,
        }
    }

    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }
}

/// Systems seen on a stream before any of them was selected.
#[derive(Clone, Debug)]
pub struct CandidateSystems {
    /// In order of first arrival.
    pub systems: Vec<DrmSystemId>,
    /// Distinct init data per system, concatenated in arrival order.
    pub init_data: HashMap<DrmSystemId, InitData>,
    /// Every distinct init data blob, concatenated in arrival order.
    pub concatenated: InitData,
}

impl CandidateSystems {
    pub fn contains(&self, drm_system_id: &DrmSystemId) -> bool {
        self.systems.contains(drm_system_id)
    }

    pub fn init_data_for(&self, drm_system_id: &DrmSystemId) -> Option<&InitData> {
        self.init_data.get(drm_system_id)
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }
}

/// Outcome of [`ProtectionEventStore::resolve`].
#[derive(Clone, Debug)]
pub enum Resolution {
    /// Nothing new for the current system.
    Nothing,
    /// Genuinely new init data for the current system.
    InitData {
        drm_system_id: DrmSystemId,
        init_data: InitData,
    },
    /// No system resolved yet; these are the candidates.
    NeedsSystemSelection(CandidateSystems),
}

/// Accumulates protection events and decides which ones carry new information.
///
/// Owned by a single decryption transform, never shared.
#[derive(Debug, Default)]
pub struct ProtectionEventStore {
    pending: VecDeque<ProtectionEvent>,
    handled: HashSet<u64>,
    last_seen: HashMap<DrmSystemId, InitData>,
}

impl ProtectionEventStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an event unless it was already seen.
    ///
    /// An event repeating the latest init data of its system, queued or
    /// already resolved, is marked handled without queueing.
    pub fn record(&mut self, event: ProtectionEvent) -> bool {
        if self.handled.contains(&event.sequence_id)
            || self
                .pending
                .iter()
                .any(|x| x.sequence_id == event.sequence_id)
        {
            trace!("protection event #{} already seen", event.sequence_id);
            return false;
        }

        let latest = self
            .pending
            .iter()
            .rev()
            .find(|x| x.drm_system_id == event.drm_system_id)
            .map(|x| &x.init_data)
            .or_else(|| self.last_seen.get(&event.drm_system_id));

        if latest == Some(&event.init_data) {
            trace!(
                "protection event #{} repeats known init data for {}",
                event.sequence_id, event.drm_system_id
            );
            self.handled.insert(event.sequence_id);
            return false;
        }

        trace!(
            "recorded protection event #{} for {} ({:?})",
            event.sequence_id, event.drm_system_id, event.init_data
        );
        self.pending.push_back(event);
        true
    }

    /// Scan pending events against the currently resolved system.
    pub fn resolve(&mut self, current: Option<DrmSystemId>) -> Resolution {
        match current {
            Some(drm_system_id) => self.resolve_for(drm_system_id),
            None => self.candidates(),
        }
    }

    fn resolve_for(&mut self, drm_system_id: DrmSystemId) -> Resolution {
        let mut index = 0;

        while index < self.pending.len() {
            if self.pending[index].drm_system_id != drm_system_id {
                index += 1;
                continue;
            }

            let Some(event) = self.pending.remove(index) else {
                break;
            };
            self.handled.insert(event.sequence_id);

            if self.last_seen.get(&drm_system_id) == Some(&event.init_data) {
                debug!(
                    "protection event #{} repeats known init data for {}",
                    event.sequence_id, drm_system_id
                );
                continue;
            }

            self.last_seen
                .insert(drm_system_id, event.init_data.clone());
            return Resolution::InitData {
                drm_system_id,
                init_data: event.init_data,
            };
        }

        Resolution::Nothing
    }

    fn candidates(&self) -> Resolution {
        if self.pending.is_empty() {
            return Resolution::Nothing;
        }

        let mut systems = Vec::new();
        let mut per_system: HashMap<DrmSystemId, Vec<&InitData>> = HashMap::new();
        let mut distinct: Vec<&InitData> = Vec::new();

        for event in &self.pending {
            if !systems.contains(&event.drm_system_id) {
                systems.push(event.drm_system_id);
            }

            let blobs = per_system.entry(event.drm_system_id).or_default();
            if !blobs.contains(&&event.init_data) {
                blobs.push(&event.init_data);
            }

            if !distinct.contains(&&event.init_data) {
                distinct.push(&event.init_data);
            }
        }

        let kind = distinct
            .first()
            .map(|x| x.kind())
            .unwrap_or_default();

        Resolution::NeedsSystemSelection(CandidateSystems {
            init_data: per_system
                .into_iter()
                .map(|(id, blobs)| {
                    let kind = blobs.first().map(|x| x.kind()).unwrap_or_default();
                    (id, InitData::concat(kind, blobs))
                })
                .collect(),
            concatenated: InitData::concat(kind, distinct),
            systems,
        })
    }

    pub fn is_handled(&self, sequence_id: u64) -> bool {
        self.handled.contains(&sequence_id)
    }

    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    pub fn last_init_data(&self, drm_system_id: &DrmSystemId) -> Option<&InitData> {
        self.last_seen.get(drm_system_id)
    }

    /// Forget everything, used when the stream ends.
    pub fn clear(&mut self) {
        self.pending.clear();
        self.handled.clear();
        self.last_seen.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn event(seq: u64, id: DrmSystemId, data: &[u8]) -> ProtectionEvent {
        ProtectionEvent::new(seq, id, data)
    }

    #[test]
    fn duplicate_init_data_is_handled_silently() {
        let mut store = ProtectionEventStore::new();
        store.record(event(1, DrmSystemId::WIDEVINE, b"pssh-a"));
        store.record(event(2, DrmSystemId::WIDEVINE, b"pssh-a"));

        assert!(matches!(
            store.resolve(Some(DrmSystemId::WIDEVINE)),
            Resolution::InitData { .. }
        ));
        assert!(matches!(
            store.resolve(Some(DrmSystemId::WIDEVINE)),
            Resolution::Nothing
        ));
        assert!(store.is_handled(1));
        assert!(store.is_handled(2));
        assert_eq!(store.pending_len(), 0);
    }

    #[test]
    fn handled_sequence_ids_are_not_requeued() {
        let mut store = ProtectionEventStore::new();
        assert!(store.record(event(7, DrmSystemId::CLEARKEY, b"a")));
        assert!(!store.record(event(7, DrmSystemId::CLEARKEY, b"a")));
        store.resolve(Some(DrmSystemId::CLEARKEY));
        assert!(!store.record(event(7, DrmSystemId::CLEARKEY, b"b")));
    }

    #[test]
    fn other_systems_stay_pending() {
        let mut store = ProtectionEventStore::new();
        store.record(event(1, DrmSystemId::PLAYREADY, b"pr"));
        store.record(event(2, DrmSystemId::WIDEVINE, b"wv"));

        match store.resolve(Some(DrmSystemId::WIDEVINE)) {
            Resolution::InitData { init_data, .. } => assert_eq!(init_data.as_bytes(), b"wv"),
            x => panic!("unexpected resolution {x:?}"),
        }
        assert!(!store.is_handled(1));
        assert_eq!(store.pending_len(), 1);
    }

    #[test]
    fn new_init_data_is_returned_in_arrival_order() {
        let mut store = ProtectionEventStore::new();
        store.record(event(1, DrmSystemId::WIDEVINE, b"first"));
        store.record(event(2, DrmSystemId::WIDEVINE, b"second"));

        let mut seen = vec![];
        while let Resolution::InitData { init_data, .. } = store.resolve(Some(DrmSystemId::WIDEVINE))
        {
            seen.push(init_data.as_bytes().to_vec());
        }
        assert_eq!(seen, vec![b"first".to_vec(), b"second".to_vec()]);
        assert_eq!(
            store.last_init_data(&DrmSystemId::WIDEVINE).unwrap().as_bytes(),
            b"second"
        );
    }

    #[test]
    fn repeats_of_unselected_system_do_not_accumulate() {
        let mut store = ProtectionEventStore::new();
        store.record(event(1, DrmSystemId::WIDEVINE, b"wv"));
        assert!(matches!(
            store.resolve(Some(DrmSystemId::WIDEVINE)),
            Resolution::InitData { .. }
        ));

        for seq in 2..10_002 {
            store.record(event(seq, DrmSystemId::PLAYREADY, b"moof-pssh"));
            store.record(event(seq + 20_000, DrmSystemId::WIDEVINE, b"wv"));
        }
        assert_eq!(store.pending_len(), 1);
        assert!(store.is_handled(10_001));
        assert!(store.is_handled(20_002));
        assert!(!store.is_handled(2));

        store.record(event(50_000, DrmSystemId::PLAYREADY, b"other"));
        assert_eq!(store.pending_len(), 2);
    }

    #[test]
    fn unknown_system_surfaces_candidates() {
        let mut store = ProtectionEventStore::new();
        store.record(event(1, DrmSystemId::PLAYREADY, b"pr"));
        store.record(event(2, DrmSystemId::WIDEVINE, b"wv"));
        store.record(event(3, DrmSystemId::WIDEVINE, b"wv"));
        store.record(event(4, DrmSystemId::PLAYREADY, b"pr2"));

        let Resolution::NeedsSystemSelection(candidates) = store.resolve(None) else {
            panic!("expected candidates");
        };
        assert_eq!(
            candidates.systems,
            vec![DrmSystemId::PLAYREADY, DrmSystemId::WIDEVINE]
        );
        assert_eq!(
            candidates.init_data_for(&DrmSystemId::PLAYREADY).unwrap().as_bytes(),
            b"prpr2"
        );
        assert_eq!(
            candidates.init_data_for(&DrmSystemId::WIDEVINE).unwrap().as_bytes(),
            b"wv"
        );
        assert_eq!(candidates.concatenated.as_bytes(), b"prwvpr2");
        assert_eq!(store.pending_len(), 3);
        assert!(store.is_handled(3));
    }

    #[test]
    fn init_data_equality_ignores_type() {
        let a = InitData::new(InitDataType::Cenc, b"x".to_vec());
        let b = InitData::new(InitDataType::KeyIds, b"x".to_vec());
        assert_eq!(a, b);
    }

    proptest! {
        #[test]
        fn each_distinct_blob_resolves_once(blobs in prop::collection::vec(0u8..4, 1..32)) {
            let mut store = ProtectionEventStore::new();
            for (seq, blob) in blobs.iter().enumerate() {
                store.record(event(seq as u64, DrmSystemId::CLEARKEY, &[*blob]));
            }

            let mut resolved = vec![];
            while let Resolution::InitData { init_data, .. } = store.resolve(Some(DrmSystemId::CLEARKEY)) {
                resolved.push(init_data.as_bytes()[0]);
            }

            // Only consecutive repeats collapse, a blob may come back after another one.
            let mut expected = blobs.clone();
            expected.dedup();
            prop_assert_eq!(resolved, expected);
            prop_assert_eq!(store.pending_len(), 0);
        }
    }
}
