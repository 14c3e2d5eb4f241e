/*
    REFERENCES
    ----------

    1. https://dashif.org/identifiers/content_protection
    2. https://www.w3.org/TR/eme-initdata-cenc/#common-system

*/

use crate::Result;
use std::{fmt, str::FromStr};
use uuid::Uuid;

/// Identifier of a content protection scheme.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DrmSystemId(Uuid);

impl DrmSystemId {
    /// W3C common system id, used by ClearKey.
    pub const CLEARKEY: Self = Self(Uuid::from_u128(0x1077efec_c0b2_4d02_ace3_3c1e52e2fb4b));
    pub const PLAYREADY: Self = Self(Uuid::from_u128(0x9a04f079_9840_4286_ab92_e65be0885f95));
    pub const WIDEVINE: Self = Self(Uuid::from_u128(0xedef8ba9_79d6_4ace_a3c8_27dcd51d21ed));

    pub fn new(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse a system id, hyphenated or not.
    pub fn parse(input: &str) -> Result<Self> {
        Ok(Self(Uuid::parse_str(input.trim())?))
    }

    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// EME key system name for well-known systems.
    pub fn key_system(&self) -> Option<&'static str> {
        if *self == Self::CLEARKEY {
            Some("org.w3.clearkey")
        } else if *self == Self::PLAYREADY {
            Some("com.microsoft.playready")
        } else if *self == Self::WIDEVINE {
            Some("com.widevine.alpha")
        } else {
            None
        }
    }

    pub fn from_key_system(name: &str) -> Option<Self> {
        match name {
            "org.w3.clearkey" => Some(Self::CLEARKEY),
            "com.microsoft.playready" | "com.microsoft.playready.recommendation" => {
                Some(Self::PLAYREADY)
            }
            "com.widevine.alpha" => Some(Self::WIDEVINE),
            _ => None,
        }
    }
}

impl fmt::Display for DrmSystemId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0.hyphenated())
    }
}

impl FromStr for DrmSystemId {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s)
    }
}
