//! Encode/decode hooks that let a context value cross a process boundary.
//!
//! The runtime never calls these itself. Collaborators that forward requests
//! (an RPC layer, a message bus binding) use [`Snapshot::encode`] on the
//! sending side and [`Snapshot::decode`] on the receiving side.
//!
//! [`Snapshot::encode`]: crate::Snapshot::encode
//! [`Snapshot::decode`]: crate::Snapshot::decode

use crate::error::{Error, ErrorKind, Result};

use serde::Serialize;
use serde::de::DeserializeOwned;

/// Value → wire and wire → value conversions for one local.
pub struct Codec<T> {
    pub(crate) encode: fn(&T) -> Result<String>,
    pub(crate) decode: fn(&str) -> Result<T>,
}

impl<T> Clone for Codec<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for Codec<T> {}

impl<T> Codec<T> {
    pub const fn new(encode: fn(&T) -> Result<String>, decode: fn(&str) -> Result<T>) -> Self {
        Self { encode, decode }
    }
}

impl<T: Serialize + DeserializeOwned> Codec<T> {
    /// JSON wire format.
    pub const fn json() -> Self {
        Self::new(json_encode::<T>, json_decode::<T>)
    }
}

fn json_encode<T: Serialize>(value: &T) -> Result<String> {
    serde_json::to_string(value).map_err(|e| Error::new(ErrorKind::Codec).with_source(e))
}

fn json_decode<T: DeserializeOwned>(wire: &str) -> Result<T> {
    serde_json::from_str(wire).map_err(|e| Error::new(ErrorKind::Codec).with_source(e))
}
