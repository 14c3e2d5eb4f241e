//! Per-buffer encryption metadata.
//!
//! Tracks the key id, IV and subsample map needed to decrypt one sample.

use crate::{Error, ProtectionEvent, Result};
use std::str::FromStr;

/// 128-bit content key id.
pub type KeyId = [u8; 16];

/// Entry describing a subsample's cleartext and encrypted portions.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Subsample {
    /// Number of cleartext bytes at the start of the subsample.
    pub clear: u32,
    /// Number of encrypted bytes following the cleartext.
    pub encrypted: u32,
}

impl Subsample {
    pub fn new(clear: u32, encrypted: u32) -> Self {
        Self { clear, encrypted }
    }

    /// Parse `count` packed entries (big-endian `u16` clear, `u32` encrypted).
    pub fn parse_packed(count: usize, data: &[u8]) -> Result<Vec<Self>> {
        if data.len() < count * 6 {
            return Err(Error::Unsupported(format!(
                "insufficient subsample data: need {} bytes, got {}",
                count * 6,
                data.len()
            )));
        }

        Ok(data
            .chunks_exact(6)
            .take(count)
            .map(|x| Self {
                clear: u16::from_be_bytes([x[0], x[1]]) as u32,
                encrypted: u32::from_be_bytes([x[2], x[3], x[4], x[5]]),
            })
            .collect())
    }

    /// Inverse of [`Subsample::parse_packed`].
    pub fn pack(subsamples: &[Self]) -> Result<Vec<u8>> {
        let mut data = Vec::with_capacity(subsamples.len() * 6);

        for subsample in subsamples {
            let clear = u16::try_from(subsample.clear).map_err(|_| {
                Error::Unsupported(format!(
                    "clear run of {} bytes does not fit a packed subsample",
                    subsample.clear
                ))
            })?;
            data.extend_from_slice(&clear.to_be_bytes());
            data.extend_from_slice(&subsample.encrypted.to_be_bytes());
        }

        Ok(data)
    }
}

/// Protection scheme of a sample.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum Scheme {
    /// AES-CTR, encrypted runs of a sample form one keystream.
    #[default]
    Cenc,
    /// AES-CBC with pattern encryption, IV restarts at every subsample.
    Cbcs,
}

impl Scheme {
    /// Map from the four character code of a `schm` box.
    pub fn from_fourcc(scheme_type: u32) -> Option<Self> {
        match scheme_type {
            0x63656E63 => Some(Self::Cenc),
            0x63626373 => Some(Self::Cbcs),
            _ => None,
        }
    }
}

impl FromStr for Scheme {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "cenc" => Ok(Self::Cenc),
            "cbcs" => Ok(Self::Cbcs),
            x => Err(Error::Unsupported(format!(
                "'{x}' protection scheme (supported: cenc, cbcs)"
            ))),
        }
    }
}

/// Number of encrypted and skipped 16-byte blocks in pattern encryption.
/// `0:0` means every block is encrypted.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Pattern {
    pub crypt_blocks: u8,
    pub skip_blocks: u8,
}

impl Pattern {
    pub fn new(crypt_blocks: u8, skip_blocks: u8) -> Self {
        Self {
            crypt_blocks,
            skip_blocks,
        }
    }

    pub fn is_full(&self) -> bool {
        self.crypt_blocks == 0 && self.skip_blocks == 0
    }
}

/// Encryption metadata attached to one buffer, consumed once.
#[derive(Clone, Debug, Default)]
pub struct EncryptedSampleMetadata {
    pub key_id: Vec<u8>,
    pub iv: Vec<u8>,
    pub encrypted: bool,
    pub subsamples: Vec<Subsample>,
    pub scheme: Scheme,
    pub pattern: Pattern,
}

impl EncryptedSampleMetadata {
    pub fn new(key_id: Vec<u8>, iv: Vec<u8>) -> Self {
        Self {
            key_id,
            iv,
            encrypted: true,
            ..Default::default()
        }
    }

    pub fn with_subsamples(mut self, subsamples: Vec<Subsample>) -> Self {
        self.subsamples = subsamples;
        self
    }

    pub fn with_scheme(mut self, scheme: Scheme, pattern: Pattern) -> Self {
        self.scheme = scheme;
        self.pattern = pattern;
        self
    }

    /// True when the buffer should pass through untouched.
    pub fn is_clear(&self) -> bool {
        !self.encrypted || self.iv.is_empty()
    }

    pub fn key_id(&self) -> Result<KeyId> {
        self.key_id.as_slice().try_into().map_err(|_| {
            Error::Unsupported(format!(
                "key id must be 16 bytes, got {} bytes",
                self.key_id.len()
            ))
        })
    }

    /// IV widened to a full block, 8-byte `cenc` IVs are zero padded.
    ///
    /// `cbcs` chains from the IV directly and needs all 16 bytes.
    pub fn iv(&self) -> Result<[u8; 16]> {
        if self.scheme == Scheme::Cbcs && self.iv.len() != 16 {
            return Err(Error::Unsupported(format!(
                "cbcs IV must be 16 bytes, got {} bytes",
                self.iv.len()
            )));
        }

        if self.iv.len() != 8 && self.iv.len() != 16 {
            return Err(Error::Unsupported(format!(
                "IV must be 8 or 16 bytes, got {} bytes",
                self.iv.len()
            )));
        }

        let mut iv = [0u8; 16];
        iv[..self.iv.len()].copy_from_slice(&self.iv);
        Ok(iv)
    }

    /// Check the metadata against the size of the buffer it describes.
    pub fn validate(&self, len: usize) -> Result<()> {
        self.key_id()?;
        self.iv()?;

        if self.subsamples.is_empty() {
            return Ok(());
        }

        let total = self
            .subsamples
            .iter()
            .map(|x| x.clear as usize + x.encrypted as usize)
            .sum::<usize>();

        if total != len {
            return Err(Error::Unsupported(format!(
                "subsamples describe {total} bytes but the buffer holds {len} bytes"
            )));
        }

        Ok(())
    }
}

/// Media buffer as seen by the decryption transform.
#[derive(Clone, Debug, Default)]
pub struct Buffer {
    pub data: Vec<u8>,
    pub protection: Option<EncryptedSampleMetadata>,
    pub protection_events: Vec<ProtectionEvent>,
}

impl Buffer {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            data,
            ..Default::default()
        }
    }

    pub fn with_protection(mut self, protection: EncryptedSampleMetadata) -> Self {
        self.protection = Some(protection);
        self
    }

    pub fn with_event(mut self, event: ProtectionEvent) -> Self {
        self.protection_events.push(event);
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn packed_subsamples() {
        // Subsample 1: 100 clear, 200 encrypted
        // Subsample 2: 50 clear, 150 encrypted
        let data = [
            0, 100, // cleartext 1
            0, 0, 0, 200, // encrypted 1
            0, 50, // cleartext 2
            0, 0, 0, 150, // encrypted 2
        ];
        let subsamples = Subsample::parse_packed(2, &data).unwrap();
        assert_eq!(
            subsamples,
            vec![Subsample::new(100, 200), Subsample::new(50, 150)]
        );
        assert_eq!(Subsample::pack(&subsamples).unwrap(), data);
    }

    #[test]
    fn short_packed_subsamples() {
        assert!(Subsample::parse_packed(2, &[0, 1, 0, 0, 0, 1]).is_err());
    }

    #[test]
    fn short_iv_is_padded() {
        let meta = EncryptedSampleMetadata::new(vec![0; 16], vec![1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(
            meta.iv().unwrap(),
            [1, 2, 3, 4, 5, 6, 7, 8, 0, 0, 0, 0, 0, 0, 0, 0]
        );
    }

    #[test]
    fn validation() {
        let meta = EncryptedSampleMetadata::new(vec![0; 16], vec![0; 16])
            .with_subsamples(vec![Subsample::new(4, 16), Subsample::new(2, 0)]);
        assert!(meta.validate(22).is_ok());
        assert!(matches!(meta.validate(23), Err(Error::Unsupported(_))));

        let missing_kid = EncryptedSampleMetadata::new(vec![], vec![0; 16]);
        assert!(matches!(missing_kid.validate(16), Err(Error::Unsupported(_))));

        let bad_iv = EncryptedSampleMetadata::new(vec![0; 16], vec![0; 12]);
        assert!(matches!(bad_iv.validate(16), Err(Error::Unsupported(_))));

        let short_cbcs_iv = EncryptedSampleMetadata::new(vec![0; 16], vec![0; 8])
            .with_scheme(Scheme::Cbcs, Pattern::new(1, 9));
        assert!(matches!(short_cbcs_iv.validate(16), Err(Error::Unsupported(_))));
        assert!(
            short_cbcs_iv
                .with_scheme(Scheme::Cenc, Pattern::default())
                .validate(16)
                .is_ok()
        );
    }

    #[test]
    fn clear_samples() {
        let mut meta = EncryptedSampleMetadata::new(vec![0; 16], vec![]);
        assert!(meta.is_clear());
        meta.iv = vec![0; 8];
        assert!(!meta.is_clear());
        meta.encrypted = false;
        assert!(meta.is_clear());
    }
}
