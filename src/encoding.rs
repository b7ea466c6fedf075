//! The write-set codec. A write-set payload is an optional read-view GTID
//! followed by a run of serialized operations with no count field; the
//! decoder simply reads values until the input runs out. Bincode with
//! variable-length integers keeps record indices and seqnos compact, so
//! the configured padding dominates an operation's footprint.
//!
//! The encoding is Rust-specific and depends on the data structures being
//! stable, which holds here: every member of a cluster speaks the same
//! write-set protocol version.

use crate::error::{Error, Result};

use bincode::Options as _;

/// The codec's bincode options. These intentionally differ from the ones
/// behind the top-level bincode entry points, which use fixed-length
/// integers.
fn options() -> bincode::DefaultOptions {
    bincode::DefaultOptions::new()
}

/// Decodes the next value from a reader. An exhausted or truncated reader
/// is an error; use maybe_deserialize_from() where end-of-input is
/// expected.
pub fn deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(reader: R) -> Result<T> {
    Ok(options().deserialize_from(reader)?)
}

/// Decodes the next value from a reader, or returns None once the input is
/// exhausted. This is how the operation run of a write-set terminates:
/// there is no count field, only end of input.
pub fn maybe_deserialize_from<R: std::io::Read, T: serde::de::DeserializeOwned>(
    reader: R,
) -> Result<Option<T>> {
    match options().deserialize_from(reader) {
        Ok(v) => Ok(Some(v)),
        Err(err) => match *err {
            bincode::ErrorKind::Io(err) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                Ok(None)
            }
            err => Err(Error::from(Box::new(err))),
        },
    }
}

/// Encodes a value to a byte vector.
pub fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
    Ok(options().serialize(value)?)
}

/// The encoded size of a value, without encoding it. Used to size
/// operation padding.
pub fn serialized_size<T: serde::Serialize>(value: &T) -> Result<usize> {
    Ok(options().serialized_size(value)? as usize)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_from_reader() -> Result<()> {
        let values = vec![(1u32, 7i64), (2, -1)];
        let mut buf = Vec::new();
        for v in &values {
            buf.extend(serialize(v)?);
        }
        let mut r = &buf[..];
        let mut out = Vec::new();
        while let Some(v) = maybe_deserialize_from::<_, (u32, i64)>(&mut r)? {
            out.push(v);
        }
        assert_eq!(out, values);
        Ok(())
    }

    #[test]
    fn size_matches() -> Result<()> {
        let v = (42u32, "padding".to_string());
        assert_eq!(serialized_size(&v)?, serialize(&v)?.len());
        Ok(())
    }
}
