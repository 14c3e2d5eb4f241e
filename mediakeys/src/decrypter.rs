use crate::{
    Error, Result,
    cipher::{Cipher, CipherMode},
    sample::{EncryptedSampleMetadata, Scheme},
};
use std::ops::Range;

/// Decrypt one sample in place according to its subsample layout.
///
/// Clear runs are left untouched and every encrypted run is replaced by
/// plaintext of identical length. For `cenc` all encrypted runs of the sample
/// form one continuous keystream. For `cbcs` every run restarts from the
/// sample IV and only the crypt blocks of the pattern are decrypted.
pub fn decrypt_sample(
    cipher: &dyn Cipher,
    key: &[u8; 16],
    sample: &EncryptedSampleMetadata,
    data: &mut [u8],
) -> Result<()> {
    sample.validate(data.len())?;
    let iv = sample.iv()?;

    let runs = if sample.subsamples.is_empty() {
        vec![0..data.len()]
    } else {
        let mut runs = Vec::with_capacity(sample.subsamples.len());
        let mut offset = 0usize;

        for subsample in &sample.subsamples {
            offset += subsample.clear as usize;
            let end = offset + subsample.encrypted as usize;
            if end > data.len() {
                return Err(Error::Unsupported(
                    "encrypted run extends past the end of the buffer".to_owned(),
                ));
            }
            runs.push(offset..end);
            offset = end;
        }

        runs
    };

    match sample.scheme {
        Scheme::Cenc => decrypt_ranges(cipher, CipherMode::AesCtr, key, &iv, data, &runs),
        Scheme::Cbcs => {
            for run in runs {
                let ranges = pattern_ranges(
                    run,
                    sample.pattern.crypt_blocks as usize * 16,
                    sample.pattern.skip_blocks as usize * 16,
                );
                decrypt_ranges(cipher, CipherMode::AesCbc, key, &iv, data, &ranges)?;
            }
            Ok(())
        }
    }
}

/// Decrypt `ranges` of `data` as if they were one contiguous buffer.
fn decrypt_ranges(
    cipher: &dyn Cipher,
    mode: CipherMode,
    key: &[u8; 16],
    iv: &[u8; 16],
    data: &mut [u8],
    ranges: &[Range<usize>],
) -> Result<()> {
    match ranges {
        [] => Ok(()),
        [range] => cipher.decrypt(mode, key, iv, &mut data[range.clone()]),
        _ => {
            let mut encrypted = Vec::with_capacity(ranges.iter().map(|x| x.len()).sum());
            for range in ranges {
                encrypted.extend_from_slice(&data[range.clone()]);
            }

            cipher.decrypt(mode, key, iv, &mut encrypted)?;

            let mut offset = 0;
            for range in ranges {
                data[range.clone()].copy_from_slice(&encrypted[offset..offset + range.len()]);
                offset += range.len();
            }
            Ok(())
        }
    }
}

/// Whole-block crypt ranges of a pattern-encrypted run.
fn pattern_ranges(run: Range<usize>, crypt_size: usize, skip_size: usize) -> Vec<Range<usize>> {
    if crypt_size == 0 && skip_size == 0 {
        let blocks = (run.len() / 16) * 16;
        return vec![run.start..run.start + blocks];
    }

    let mut ranges = Vec::new();
    let mut offset = run.start;

    while offset < run.end {
        let to_decrypt = (run.end - offset).min(crypt_size);
        let blocks = (to_decrypt / 16) * 16;
        if blocks > 0 {
            ranges.push(offset..offset + blocks);
        }
        offset += to_decrypt;

        if offset >= run.end {
            break;
        }

        offset += (run.end - offset).min(skip_size);
    }

    ranges
}
