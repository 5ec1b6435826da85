//! Persisted record framing
//!
//! Every record written to a log or table is laid out as
//!
//! ```text
//! +----------------+--------+----------+------------------------+
//! | format version | family | revision | field list (JSON)      |
//! |      u8        |   u8   |    u8    |                        |
//! +----------------+--------+----------+------------------------+
//! ```
//!
//! The family tag identifies which record type follows. Fields are only ever
//! appended to a record type, each addition bumping its revision; new fields
//! carry `#[serde(default)]` so that older payloads keep decoding, and
//! unknown fields written by a newer revision are ignored.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::trace;

use crate::error::{RegistryError, Result};

/// Framing version understood by this build
pub const FORMAT_VERSION: u8 = 0;

/// A type persisted with the framing above
pub trait Record: Serialize + DeserializeOwned {
    /// Family tag written after the format byte
    const FAMILY: u8;
    /// Revision of the field list this build writes
    const REVISION: u8;
}

pub const FAMILY_LOG_RECORD: u8 = 1;
pub const FAMILY_INDEX_KEY: u8 = 2;
pub const FAMILY_INDEX_VALUE: u8 = 3;
pub const FAMILY_APP_KEY: u8 = 4;
pub const FAMILY_APP_VALUE: u8 = 5;

/// Serialize a record with its header
pub fn encode<R: Record>(record: &R) -> Result<Vec<u8>> {
    let payload = serde_json::to_vec(record)?;
    let mut out = Vec::with_capacity(payload.len() + 3);
    out.push(FORMAT_VERSION);
    out.push(R::FAMILY);
    out.push(R::REVISION);
    out.extend_from_slice(&payload);
    Ok(out)
}

/// Deserialize a record, checking its header
pub fn decode<R: Record>(bytes: &[u8]) -> Result<R> {
    let (format, family, revision, payload) = match bytes {
        [format, family, revision, payload @ ..] => (*format, *family, *revision, payload),
        _ => {
            return Err(RegistryError::Serialization(format!(
                "record too short: {} bytes",
                bytes.len()
            )))
        }
    };

    if format != FORMAT_VERSION {
        return Err(RegistryError::Serialization(format!(
            "unsupported format version {}",
            format
        )));
    }
    if family != R::FAMILY {
        return Err(RegistryError::Serialization(format!(
            "expected record family {}, found {}",
            R::FAMILY,
            family
        )));
    }
    if revision > R::REVISION {
        trace!(family, revision, known = R::REVISION, "decoding record from a newer revision");
    }

    Ok(serde_json::from_slice(payload)?)
}
