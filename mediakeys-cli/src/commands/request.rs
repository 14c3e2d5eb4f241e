use anyhow::{Result, bail};
use base64::{Engine, engine::general_purpose::STANDARD};
use clap::Args;
use colored::Colorize;
use log::{debug, info};
use mediakeys::{CdmInstance, ClearKey, InitData, InitDataType};
use std::{fs, path::Path};

/// Open a ClearKey session and print its license request.
#[derive(Args, Clone, Debug)]
pub struct Request {
    /// Init data as a file path or base64 encoded bytes.
    #[arg(long, required = true, value_name = "PATH|BASE64")]
    init_data: String,

    /// Init data type.
    #[arg(long = "type", default_value = "cenc", value_name = "cenc|keyids|webm")]
    init_data_type: InitDataType,
}

impl Request {
    fn init_data(&self) -> Result<Vec<u8>> {
        let path = Path::new(&self.init_data);

        if path.exists() {
            debug!("reading init data from {}", path.display());
            return Ok(fs::read(path)?);
        }

        match STANDARD.decode(self.init_data.trim()) {
            Ok(x) if !x.is_empty() => Ok(x),
            Ok(_) => bail!("init data is empty."),
            Err(e) => bail!("init data is neither a file nor valid base64 ({}).", e),
        }
    }

    pub fn execute(self) -> Result<()> {
        let init_data = InitData::new(self.init_data_type, self.init_data()?);
        info!(
            "{} {} init data ({} bytes)",
            "Using".bold().green(),
            init_data.kind(),
            init_data.len()
        );

        let instance = CdmInstance::new(ClearKey::new());
        let session = instance.session_for(&init_data)?;
        let request = session.generate_request(&init_data)?;

        println!("{}", String::from_utf8_lossy(&request.payload));
        instance.close();
        Ok(())
    }
}
