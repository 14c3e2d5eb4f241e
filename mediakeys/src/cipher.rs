use crate::{Error, Result};
use aes::Aes128;
use cbc::cipher::{BlockDecryptMut, KeyIvInit, StreamCipher, block_padding::NoPadding};

type Aes128Ctr = ctr::Ctr128BE<Aes128>;
type Aes128Cbc = cbc::Decryptor<Aes128>;

/// Block cipher mode used by [`Cipher::decrypt`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CipherMode {
    AesCtr,
    /// Only whole blocks are decrypted, a trailing partial block is left as is.
    AesCbc,
}

/// Symmetric cipher capability, `decrypt(bytes, key, iv)`.
///
/// Decrypts `data` in place. Implementations must not change the length.
pub trait Cipher: Send + Sync {
    fn decrypt(&self, mode: CipherMode, key: &[u8; 16], iv: &[u8; 16], data: &mut [u8])
    -> Result<()>;
}

/// AES-128 cipher backed by the RustCrypto crates.
#[derive(Clone, Copy, Debug, Default)]
pub struct AesCipher;

impl Cipher for AesCipher {
    fn decrypt(
        &self,
        mode: CipherMode,
        key: &[u8; 16],
        iv: &[u8; 16],
        data: &mut [u8],
    ) -> Result<()> {
        match mode {
            CipherMode::AesCtr => {
                Aes128Ctr::new(key.into(), iv.into()).apply_keystream(data);
            }
            CipherMode::AesCbc => {
                let blocks = (data.len() / 16) * 16;
                if blocks > 0 {
                    Aes128Cbc::new(key.into(), iv.into())
                        .decrypt_padded_mut::<NoPadding>(&mut data[..blocks])
                        .map_err(|x| Error::Cipher(x.to_string()))?;
                }
            }
        }

        Ok(())
    }
}
