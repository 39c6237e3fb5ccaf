use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("illegal codec type: {0}")]
    Unknown(String),
    #[error("json codec: {0}")]
    Json(#[from] serde_json::Error),
    #[error("postcard codec: {0}")]
    Postcard(#[from] postcard::Error),
}

/// Codec identifier selected by configuration and handed to the dispatch
/// layer. Frames and method bodies of one session share the same codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodecType {
    Json,
    Postcard,
}

impl CodecType {
    /// Map a configured codec name to its identifier. Matching ignores case
    /// and surrounding whitespace.
    pub fn from_name(name: &str) -> Option<Self> {
        match name.trim().to_ascii_lowercase().as_str() {
            "json" => Some(Self::Json),
            "postcard" => Some(Self::Postcard),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::Postcard => "postcard",
        }
    }

    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>, CodecError> {
        match self {
            Self::Json => Ok(serde_json::to_vec(value)?),
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
        }
    }

    pub fn decode<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T, CodecError> {
        match self {
            Self::Json => Ok(serde_json::from_slice(bytes)?),
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
        }
    }
}

impl FromStr for CodecType {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_name(s).ok_or_else(|| CodecError::Unknown(s.to_string()))
    }
}

impl fmt::Display for CodecType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
