use anyhow::{Result, anyhow, bail};
use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use clap::Args;
use colored::Colorize;
use log::{debug, info, warn};
use mediakeys::{
    Buffer, CdmInstance, ClearKey, Decryptor, DrmSystemId, EncryptedSampleMetadata, Flow,
    InitData, InitDataType, KeyId, Negotiator, Notification, Pattern, ProtectionEvent, Scheme,
    Subsample, jwk_set,
};
use std::{
    fs,
    path::PathBuf,
    sync::{Arc, mpsc},
    thread,
    time::Duration,
};

/// Decrypt one protected sample through a ClearKey license exchange.
#[derive(Args, Clone, Debug)]
pub struct Decrypt {
    /// Encrypted sample file.
    #[arg(required = true)]
    input: PathBuf,

    /// Where to write the decrypted sample.
    #[arg(short, long, required = true)]
    output: PathBuf,

    /// Content key used to answer the license request.
    ///
    /// This option can be used multiple times.
    #[arg(long = "key", required = true, value_name = "KID:KEY", value_parser = Self::parse_key)]
    keys: Vec<(KeyId, [u8; 16])>,

    /// Key id of the sample in hex. Defaults to the first --key.
    #[arg(long, value_name = "HEX")]
    kid: Option<String>,

    /// Sample IV in hex (8 or 16 bytes).
    #[arg(long, required = true, value_name = "HEX")]
    iv: String,

    /// Subsample layout, the sample is fully encrypted when omitted.
    #[arg(long, value_name = "CLEAR:ENC", value_delimiter = ',', value_parser = Self::parse_subsample)]
    subsamples: Vec<Subsample>,

    /// Protection scheme.
    #[arg(long, default_value = "cenc", value_name = "cenc|cbcs")]
    scheme: Scheme,

    /// Crypt and skip blocks for cbcs.
    #[arg(long, default_value = "0:0", value_name = "CRYPT:SKIP", value_parser = Self::parse_pattern)]
    pattern: Pattern,

    /// Seconds to wait for the license before giving up (at most a day).
    #[arg(long, default_value_t = 6, value_parser = clap::value_parser!(u64).range(1..=86_400))]
    timeout: u64,
}

impl Decrypt {
    fn parse_key(value: &str) -> Result<(KeyId, [u8; 16])> {
        let Some((kid, key)) = value.split_once(':') else {
            bail!("Expected 'KID:KEY' but found '{}'.", value);
        };

        Ok((hex_16(kid.trim())?, hex_16(key.trim())?))
    }

    fn parse_subsample(value: &str) -> Result<Subsample> {
        let Some((clear, encrypted)) = value.split_once(':') else {
            bail!("Expected 'CLEAR:ENC' but found '{}'.", value);
        };

        Ok(Subsample::new(clear.trim().parse()?, encrypted.trim().parse()?))
    }

    fn parse_pattern(value: &str) -> Result<Pattern> {
        let Some((crypt, skip)) = value.split_once(':') else {
            bail!("Expected 'CRYPT:SKIP' but found '{}'.", value);
        };

        Ok(Pattern::new(crypt.trim().parse()?, skip.trim().parse()?))
    }

    /// ClearKey `keyids` init data listing every key id.
    fn init_data(&self) -> InitData {
        let kids = self
            .keys
            .iter()
            .map(|(kid, _)| format!("\"{}\"", URL_SAFE_NO_PAD.encode(kid)))
            .collect::<Vec<_>>()
            .join(",");
        InitData::new(InitDataType::KeyIds, format!("{{\"kids\":[{}]}}", kids).into_bytes())
    }

    pub fn execute(self) -> Result<()> {
        let kid = match &self.kid {
            Some(x) => hex_16(x)?,
            None => self
                .keys
                .first()
                .map(|(kid, _)| *kid)
                .ok_or_else(|| anyhow!("at least one --key is required."))?,
        };
        let iv = hex::decode(self.iv.trim())?;
        let data = fs::read(&self.input)?;
        let timeout = Duration::from_secs(self.timeout);

        info!(
            "{} {} ({} bytes, {} subsamples)",
            "Decrypting".bold().green(),
            self.input.display(),
            data.len(),
            self.subsamples.len()
        );

        let (sender, receiver) = mpsc::channel();
        let negotiator = Negotiator::builder()
            .timeout(timeout)
            .notifier(sender)
            .build();

        let control = {
            let negotiator = negotiator.clone();
            let keys = self.keys.clone();
            thread::spawn(move || license_exchange(&negotiator, &receiver, &keys, timeout))
        };

        let mut decryptor = Decryptor::builder()
            .name(self.input.display().to_string())
            .timeout(timeout)
            .build(negotiator);

        let mut buffer = Buffer::new(data)
            .with_protection(
                EncryptedSampleMetadata::new(kid.to_vec(), iv)
                    .with_subsamples(self.subsamples.clone())
                    .with_scheme(self.scheme, self.pattern),
            )
            .with_event(
                ProtectionEvent::new(1, DrmSystemId::CLEARKEY, self.init_data())
                    .with_origin("mediakeys-cli"),
            );

        match decryptor.transform(&mut buffer)? {
            Flow::Decrypted => control
                .join()
                .map_err(|_| anyhow!("license exchange thread panicked."))??,
            Flow::PassedThrough => warn!("sample is not encrypted, copying as is"),
            Flow::Flushing => bail!("decryption was interrupted."),
        }

        fs::write(&self.output, &buffer.data)?;
        info!(
            "{} {}",
            "Saved".bold().green(),
            self.output.display()
        );
        Ok(())
    }
}

/// Answer notifications the way an application would, until the license is in.
fn license_exchange(
    negotiator: &Arc<Negotiator>,
    receiver: &mpsc::Receiver<Notification>,
    keys: &[(KeyId, [u8; 16])],
    timeout: Duration,
) -> Result<()> {
    loop {
        let notification = match receiver.recv_timeout(timeout) {
            Ok(x) => x,
            Err(mpsc::RecvTimeoutError::Timeout) => bail!("no license request within {:?}.", timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => return Ok(()),
        };
        debug!("notification {}", notification.name());

        match notification {
            Notification::NeedsDecryptionSystem(candidates) => {
                if !candidates.contains(&DrmSystemId::CLEARKEY) {
                    bail!("only ClearKey protected samples are supported.");
                }
                negotiator.attach_instance(CdmInstance::new(ClearKey::new()));
            }
            Notification::InitDataEncountered { init_data, .. } => {
                let instance = negotiator
                    .instance()
                    .ok_or_else(|| anyhow!("no CDM instance attached."))?;
                let session = instance.session_for(&init_data)?;
                let request = session.generate_request(&init_data)?;
                debug!(
                    "license request {}",
                    String::from_utf8_lossy(&request.payload)
                );
                session.update(&jwk_set(keys)?)?;
                return Ok(());
            }
            Notification::WaitingForKey { .. } | Notification::KeyReceived { .. } => (),
        }
    }
}

fn hex_16(value: &str) -> Result<[u8; 16]> {
    let bytes = hex::decode(value.trim_start_matches("0x"))?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| anyhow!("'{}' is not 16 bytes of hex.", value))
}
