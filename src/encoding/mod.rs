//! Binary data encodings.
//!
//! - bincode: used for log entry payloads and the network protocols.
pub mod bincode;

use crate::error::Result;

use serde::{Deserialize, Serialize};

/// Adds automatic Bincode encode/decode methods to value types. These are
/// used throughout for log payloads and network messages.
pub trait Value: Serialize + for<'de> Deserialize<'de> {
    /// Encodes the value using Bincode.
    fn encode(&self) -> Result<Vec<u8>> {
        bincode::serialize(self)
    }

    /// Encodes the value into a writer.
    fn encode_into<W: std::io::Write>(&self, writer: W) -> Result<()> {
        bincode::serialize_into(writer, self)
    }

    /// Decodes the value from a byte slice.
    fn decode(bytes: &[u8]) -> Result<Self> {
        bincode::deserialize(bytes)
    }

    /// Decodes the value from a reader.
    fn decode_from<R: std::io::Read>(reader: R) -> Result<Self> {
        bincode::deserialize_from(reader)
    }

    /// Decodes the value from a reader, or returns None if the reader is
    /// closed.
    fn maybe_decode_from<R: std::io::Read>(reader: R) -> Result<Option<Self>> {
        bincode::maybe_deserialize_from(reader)
    }
}
