//! Wire formats for calls, chunk results and accumulator contributions.
//!
//! A call records the [`Serializer`] its payload was written with, so a worker
//! decodes it, and encodes its contributions, in the same format.
//!
//! ```rust
//! use serde::{Deserialize, Serialize};
//! use tally::serializer::Serializer;
//!
//! #[derive(Serialize, Deserialize, PartialEq, Debug)]
//! struct Bounds {
//!     lo: i64,
//!     hi: i64,
//! }
//!
//! let bounds = Bounds { lo: 1, hi: 10 };
//! let bytes = Serializer::Cbor.to_bytes(&bounds).unwrap();
//! assert_eq!(Serializer::Cbor.from_bytes::<Bounds>(&bytes).unwrap(), bounds);
//! ```

use anyhow::Result;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use tracing::instrument;

use crate::config::{self, Config};

/// Values that can be shipped to a worker and moved between tasks.
pub trait Serializable: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}
impl<T> Serializable for T where T: Serialize + DeserializeOwned + Send + Sync + Unpin + 'static {}

/// The encoding used for everything sent between nodes.
#[derive(Clone, Copy, Serialize, Deserialize, Debug, Default, PartialEq, Eq)]
pub enum Serializer {
    #[default]
    Postcard,
    Cbor,
}

impl std::fmt::Display for Serializer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Postcard => write!(f, "postcard"),
            Self::Cbor => write!(f, "cbor"),
        }
    }
}

impl Serializer {
    /// Encode `value`.
    #[instrument(skip(value), level = "trace")]
    pub fn to_bytes<T: Serialize + ?Sized>(&self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Postcard => Ok(postcard::to_allocvec(value)?),
            Self::Cbor => {
                let mut bytes = Vec::new();
                ciborium::into_writer(value, &mut bytes)?;
                Ok(bytes)
            }
        }
    }

    /// Decode a `T` written by [`to_bytes`](Self::to_bytes) with the same
    /// format.
    #[instrument(skip(bytes), level = "trace")]
    pub fn from_bytes<T: DeserializeOwned>(&self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Postcard => Ok(postcard::from_bytes(bytes)?),
            Self::Cbor => Ok(ciborium::from_reader(bytes)?),
        }
    }
}

impl From<config::Serializer> for Serializer {
    fn from(serializer: config::Serializer) -> Self {
        match serializer {
            config::Serializer::Postcard => Self::Postcard,
            config::Serializer::Cbor => Self::Cbor,
        }
    }
}

impl From<&Config> for Serializer {
    fn from(config: &Config) -> Self {
        config.serializer.into()
    }
}
