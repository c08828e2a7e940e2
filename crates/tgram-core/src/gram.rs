//! Gram framing: splits messages into bounded datagrams.
//!
//! Wire format of one gram: `[8-byte msgid][4-byte total][4-byte index][payload]`,
//! all integers big-endian. Every gram of a message carries the same `msgid`
//! and `total`; `index` runs from `0` to `total - 1`.

use crate::error::{TgramError, TgramResult};

/// Size of the fixed gram header in bytes.
pub const HEADER_LEN: usize = 16;

/// Largest fragment payload carried by a single gram.
///
/// Kept well below the 64 KiB UDP ceiling to leave headroom for the header
/// and any encapsulation on the path.
pub const MAX_FRAGMENT_PAYLOAD: usize = 64 * 1024 - 1024;

/// Largest number of fragments a single message may be split into.
pub const MAX_FRAGMENTS: u32 = 200;

/// Largest message that can be split into grams.
pub const MAX_MESSAGE_LEN: usize = MAX_FRAGMENTS as usize * MAX_FRAGMENT_PAYLOAD;

/// One fragment of a message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Gram {
    /// Message this fragment belongs to.
    pub msgid: u64,
    /// Number of fragments in the message.
    pub total: u32,
    /// Position of this fragment, `0..total`.
    pub index: u32,
    /// Fragment bytes.
    pub payload: Vec<u8>,
}

impl Gram {
    /// Encode into a datagram.
    pub fn encode(&self) -> Vec<u8> {
        let mut datagram = Vec::with_capacity(HEADER_LEN + self.payload.len());
        datagram.extend_from_slice(&self.msgid.to_be_bytes());
        datagram.extend_from_slice(&self.total.to_be_bytes());
        datagram.extend_from_slice(&self.index.to_be_bytes());
        datagram.extend_from_slice(&self.payload);
        datagram
    }

    /// Decode a received datagram.
    ///
    /// Only the header length is checked here; consistency of `total` and
    /// `index` is the reassembler's concern.
    pub fn decode(datagram: &[u8]) -> TgramResult<Self> {
        if datagram.len() < HEADER_LEN {
            return Err(TgramError::InvalidGram(format!(
                "datagram of {} bytes is shorter than the {HEADER_LEN}-byte header",
                datagram.len()
            )));
        }

        let mut msgid = [0u8; 8];
        msgid.copy_from_slice(&datagram[0..8]);
        let mut total = [0u8; 4];
        total.copy_from_slice(&datagram[8..12]);
        let mut index = [0u8; 4];
        index.copy_from_slice(&datagram[12..16]);

        Ok(Self {
            msgid: u64::from_be_bytes(msgid),
            total: u32::from_be_bytes(total),
            index: u32::from_be_bytes(index),
            payload: datagram[HEADER_LEN..].to_vec(),
        })
    }
}

/// Split `message` into grams of at most [`MAX_FRAGMENT_PAYLOAD`] bytes.
pub fn split(message: &[u8], msgid: u64) -> TgramResult<Vec<Gram>> {
    split_with(message, msgid, MAX_FRAGMENT_PAYLOAD)
}

/// Split `message` into grams of at most `max_payload` bytes each.
///
/// An empty message still yields exactly one (empty) gram.
pub fn split_with(message: &[u8], msgid: u64, max_payload: usize) -> TgramResult<Vec<Gram>> {
    if max_payload == 0 {
        return Err(TgramError::InvalidGram("fragment size must be non-zero".into()));
    }

    let count = message.len().div_ceil(max_payload).max(1);
    if count > MAX_FRAGMENTS as usize {
        return Err(TgramError::InvalidGram(format!(
            "message of {} bytes needs {count} fragments (max {MAX_FRAGMENTS})",
            message.len()
        )));
    }
    let total = count as u32;

    if message.is_empty() {
        return Ok(vec![Gram {
            msgid,
            total,
            index: 0,
            payload: Vec::new(),
        }]);
    }

    Ok(message
        .chunks(max_payload)
        .enumerate()
        .map(|(index, chunk)| Gram {
            msgid,
            total,
            index: index as u32,
            payload: chunk.to_vec(),
        })
        .collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_layout_is_big_endian() {
        let gram = Gram {
            msgid: 0x0102_0304_0506_0708,
            total: 3,
            index: 2,
            payload: b"abc".to_vec(),
        };
        let datagram = gram.encode();
        assert_eq!(datagram.len(), HEADER_LEN + 3);
        assert_eq!(&datagram[..8], &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(&datagram[8..12], &[0, 0, 0, 3]);
        assert_eq!(&datagram[12..16], &[0, 0, 0, 2]);
        assert_eq!(Gram::decode(&datagram).unwrap(), gram);
    }

    #[test]
    fn short_datagram_rejected() {
        assert!(Gram::decode(&[0u8; HEADER_LEN - 1]).is_err());
        let empty = Gram::decode(&[0u8; HEADER_LEN]).unwrap();
        assert!(empty.payload.is_empty());
    }

    #[test]
    fn empty_message_is_one_gram() {
        let grams = split(b"", 9).unwrap();
        assert_eq!(grams.len(), 1);
        assert_eq!(grams[0].total, 1);
        assert_eq!(grams[0].index, 0);
        assert!(grams[0].payload.is_empty());
    }

    #[test]
    fn oversized_message_spans_grams() {
        let message: Vec<u8> = (0..MAX_FRAGMENT_PAYLOAD * 2 + 17)
            .map(|i| (i % 251) as u8)
            .collect();
        let grams = split(&message, 4).unwrap();
        assert_eq!(grams.len(), 3);
        for (i, gram) in grams.iter().enumerate() {
            assert_eq!(gram.msgid, 4);
            assert_eq!(gram.total, 3);
            assert_eq!(gram.index, i as u32);
            assert!(gram.payload.len() <= MAX_FRAGMENT_PAYLOAD);
        }
        assert_eq!(grams[2].payload.len(), 17);
        let joined: Vec<u8> = grams.into_iter().flat_map(|g| g.payload).collect();
        assert_eq!(joined, message);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_gram() {
        let grams = split_with(&[7u8; 30], 1, 10).unwrap();
        assert_eq!(grams.len(), 3);
        assert!(grams.iter().all(|g| g.payload.len() == 10));
    }

    #[test]
    fn too_many_fragments_rejected() {
        let message = vec![0u8; MAX_FRAGMENTS as usize + 1];
        assert!(split_with(&message, 1, 1).is_err());
        assert!(split_with(&message[..MAX_FRAGMENTS as usize], 1, 1).is_ok());
        assert!(split_with(b"x", 1, 0).is_err());
    }
}
