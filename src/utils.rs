//! Shared encoding helpers.

use anyhow::{bail, Context, Result};
use bytes::{BufMut, Bytes, BytesMut};
use prost::Message;

/// Encode the given u32 as an array of big-endian bytes.
pub fn encode_u32(val: u32) -> [u8; 4] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u32.
pub fn decode_u32(val: &[u8]) -> Result<u32> {
    match val {
        [b0, b1, b2, b3] => Ok(u32::from_be_bytes([*b0, *b1, *b2, *b3])),
        _ => bail!("invalid byte array given to decode as u32, invalid len {} needed 4", val.len()),
    }
}

/// Encode the given u64 as an array of big-endian bytes.
pub fn encode_u64(val: u64) -> [u8; 8] {
    val.to_be_bytes()
}

/// Decode the given bytes as a u64.
pub fn decode_u64(val: &[u8]) -> Result<u64> {
    match val {
        [b0, b1, b2, b3, b4, b5, b6, b7] => Ok(u64::from_be_bytes([*b0, *b1, *b2, *b3, *b4, *b5, *b6, *b7])),
        _ => bail!("invalid byte array given to decode as u64, invalid len {} needed 8", val.len()),
    }
}

/// Encode the given model into a bytes vec.
pub fn encode_model<M: Message>(model: &M) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(model.encoded_len());
    model.encode(&mut buf).context("error serializing data model")?;
    Ok(buf)
}

/// Decode an object from the given buffer.
pub fn decode_model<M: Message + Default>(data: &[u8]) -> Result<M> {
    M::decode(data).context("error decoding object from storage")
}

/// Encode a sequence of records as one length-prefix framed buffer.
///
/// This is the serialized form in which a block's records travel to the block
/// store and the block WAL.
pub fn encode_records<'a, I: IntoIterator<Item = &'a Bytes>>(records: I) -> Bytes {
    let mut buf = BytesMut::new();
    for record in records {
        buf.put_slice(&encode_u32(record.len() as u32));
        buf.put_slice(record);
    }
    buf.freeze()
}

/// Decode a length-prefix framed buffer back into its records.
pub fn decode_records(mut data: &[u8]) -> Result<Vec<Bytes>> {
    let mut records = vec![];
    while !data.is_empty() {
        if data.len() < 4 {
            bail!("truncated record length prefix, {} bytes remaining", data.len());
        }
        let len = decode_u32(&data[..4])? as usize;
        data = &data[4..];
        if data.len() < len {
            bail!("truncated record body, needed {} bytes got {}", len, data.len());
        }
        records.push(Bytes::copy_from_slice(&data[..len]));
        data = &data[len..];
    }
    Ok(records)
}

/// The current wall-clock time as milliseconds since the unix epoch.
pub fn now_millis() -> i64 {
    (time::OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}
