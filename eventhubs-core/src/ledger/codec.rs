//! On-disk framing of a [CheckpointEntry]:
//!
//! ```text
//! | magic (4) | payload length, u64 LE (8) | JSON payload | SHA-256 of payload (32) |
//! ```
//!
//! Every field is checked on decode so a truncated or bit-flipped artifact is reported instead of
//! being parsed into a wrong progress value.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use sha2::{Digest, Sha256};

use crate::error::{Error, Result};
use crate::progress::CheckpointEntry;

const MAGIC: &[u8; 4] = b"EHCK";
const HEADER_LEN: usize = MAGIC.len() + 8;
const DIGEST_LEN: usize = 32;

pub(crate) fn encode(entry: &CheckpointEntry) -> Result<Bytes> {
    let payload = serde_json::to_vec(entry)
        .map_err(|e| Error::CheckpointWrite(format!("failed to serialize entry: {e}")))?;
    let digest = Sha256::digest(&payload);

    let mut buf = BytesMut::with_capacity(HEADER_LEN + payload.len() + DIGEST_LEN);
    buf.put_slice(MAGIC);
    buf.put_u64_le(payload.len() as u64);
    buf.put_slice(&payload);
    buf.put_slice(&digest);
    Ok(buf.freeze())
}

pub(crate) fn decode(artifact: &str, data: &[u8]) -> Result<CheckpointEntry> {
    let corrupt = |reason: String| Error::CorruptCheckpoint {
        artifact: artifact.to_string(),
        reason,
    };

    if data.len() < HEADER_LEN + DIGEST_LEN {
        return Err(corrupt(format!("artifact truncated to {} bytes", data.len())));
    }

    let mut buf = data;
    let mut magic = [0u8; 4];
    buf.copy_to_slice(&mut magic);
    if &magic != MAGIC {
        return Err(corrupt(format!("unexpected magic {magic:?}")));
    }

    let payload_len = usize::try_from(buf.get_u64_le())
        .map_err(|_| corrupt("payload length overflows usize".to_string()))?;
    if buf.remaining() != payload_len.saturating_add(DIGEST_LEN) {
        return Err(corrupt(format!(
            "expected {} payload bytes, found {}",
            payload_len,
            buf.remaining().saturating_sub(DIGEST_LEN)
        )));
    }

    let (payload, digest) = buf.split_at(payload_len);
    if Sha256::digest(payload).as_slice() != digest {
        return Err(corrupt("digest mismatch".to_string()));
    }

    serde_json::from_slice(payload).map_err(|e| corrupt(format!("invalid payload: {e}")))
}
