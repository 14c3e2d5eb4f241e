/*
    REFERENCES
    ----------

    1. https://www.w3.org/TR/encrypted-media/#clear-key
    2. https://www.w3.org/TR/eme-initdata-keyids
    3. https://www.w3.org/TR/eme-initdata-webm

*/

use super::{KeyStatus, KeySystem, LicenseRequest, MessageType, SessionBackend};
use crate::{
    AesCipher, Cipher, DrmSystemId, EncryptedSampleMetadata, Error, InitData, InitDataType, KeyId,
    Result, decrypt_sample,
};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use log::debug;
use serde::{Deserialize, Serialize};
use std::{collections::BTreeMap, sync::Arc};

#[derive(Deserialize, Serialize)]
struct KeyIds {
    kids: Vec<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    session_type: Option<String>,
}

#[derive(Deserialize, Serialize)]
struct JsonWebKey {
    kty: String,
    kid: String,
    k: String,
}

#[derive(Deserialize, Serialize)]
struct JsonWebKeySet {
    keys: Vec<JsonWebKey>,
}

/// W3C ClearKey, keys are delivered in the clear and held by this crate.
#[derive(Clone)]
pub struct ClearKey {
    cipher: Arc<dyn Cipher>,
}

impl Default for ClearKey {
    fn default() -> Self {
        Self::new()
    }
}

impl ClearKey {
    pub fn new() -> Self {
        Self::with_cipher(Arc::new(AesCipher))
    }

    /// Use another cipher capability, e.g. a hardware backed one.
    pub fn with_cipher(cipher: Arc<dyn Cipher>) -> Self {
        Self { cipher }
    }
}

impl KeySystem for ClearKey {
    fn drm_system_id(&self) -> DrmSystemId {
        DrmSystemId::CLEARKEY
    }

    fn create_session(&self, session_id: &str) -> Result<Box<dyn SessionBackend>> {
        Ok(Box::new(ClearKeySession {
            session_id: session_id.to_owned(),
            cipher: self.cipher.clone(),
            keys: BTreeMap::new(),
        }))
    }
}

struct ClearKeySession {
    session_id: String,
    cipher: Arc<dyn Cipher>,
    keys: BTreeMap<KeyId, [u8; 16]>,
}

impl SessionBackend for ClearKeySession {
    fn generate_request(&mut self, init_data: &InitData) -> Result<LicenseRequest> {
        let kids = match init_data.kind() {
            InitDataType::KeyIds => {
                let key_ids = serde_json::from_slice::<KeyIds>(init_data.as_bytes())?;
                key_ids
                    .kids
                    .iter()
                    .map(|x| decode_16(x, "kid"))
                    .collect::<Result<Vec<_>>>()?
            }
            InitDataType::WebM => vec![KeyId::try_from(init_data.as_bytes()).map_err(|_| {
                Error::Unsupported(format!(
                    "webm init data must be a 16 byte key id, got {} bytes",
                    init_data.len()
                ))
            })?],
            InitDataType::Cenc => Vec::new(),
        };

        debug!(
            "clearkey session {} requesting {} key id(s)",
            self.session_id,
            kids.len()
        );

        let payload = serde_json::to_vec(&KeyIds {
            kids: kids.iter().map(|x| URL_SAFE_NO_PAD.encode(x)).collect(),
            session_type: Some("temporary".to_owned()),
        })?;

        Ok(LicenseRequest {
            message_type: MessageType::LicenseRequest,
            payload,
            destination: None,
        })
    }

    fn update(&mut self, response: &[u8]) -> Result<()> {
        let set = serde_json::from_slice::<JsonWebKeySet>(response)?;

        if set.keys.is_empty() {
            return Err(Error::License("license carries no keys".to_owned()));
        }

        // Parse everything first so a bad entry leaves the current keys alone.
        let mut keys = Vec::with_capacity(set.keys.len());
        for key in &set.keys {
            if key.kty != "oct" {
                return Err(Error::License(format!(
                    "'{}' key type (expected oct)",
                    key.kty
                )));
            }
            keys.push((decode_16(&key.kid, "kid")?, decode_16(&key.k, "k")?));
        }

        for (kid, key) in keys {
            debug!(
                "clearkey session {} received key for {}",
                self.session_id,
                hex::encode(kid)
            );
            self.keys.insert(kid, key);
        }

        Ok(())
    }

    fn decrypt(&mut self, sample: &EncryptedSampleMetadata, data: &mut [u8]) -> Result<()> {
        let kid = sample.key_id()?;
        let key = self.keys.get(&kid).ok_or_else(|| {
            Error::Unsupported(format!("no key for kid {}", hex::encode(kid)))
        })?;
        decrypt_sample(self.cipher.as_ref(), key, sample, data)
    }

    fn close(&mut self) {
        self.keys.clear();
    }

    fn key_statuses(&self) -> Vec<(KeyId, KeyStatus)> {
        self.keys
            .keys()
            .map(|x| (*x, KeyStatus::Usable))
            .collect()
    }
}

fn decode_16(input: &str, field: &str) -> Result<[u8; 16]> {
    let bytes = URL_SAFE_NO_PAD.decode(input.trim_end_matches('='))?;
    bytes.as_slice().try_into().map_err(|_| {
        Error::Unsupported(format!(
            "'{field}' must decode to 16 bytes, got {} bytes",
            bytes.len()
        ))
    })
}

/// Build a ClearKey license response (JWK set) for the given keys.
pub fn jwk_set(keys: &[(KeyId, [u8; 16])]) -> Result<Vec<u8>> {
    Ok(serde_json::to_vec(&JsonWebKeySet {
        keys: keys
            .iter()
            .map(|(kid, key)| JsonWebKey {
                kty: "oct".to_owned(),
                kid: URL_SAFE_NO_PAD.encode(kid),
                k: URL_SAFE_NO_PAD.encode(key),
            })
            .collect(),
    })?)
}
