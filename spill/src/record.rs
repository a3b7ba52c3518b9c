/*
The on-disk record format.

Each record is self-delimiting:

```text
[len: u32 LE][seq: u64 LE][crc32(seq ++ payload): u32 LE][payload: len bytes]
```
*/

use std::{fmt, io};

pub(crate) const HEADER_LEN: usize = 4 + 8 + 4;

// Anything claiming to be larger than this is garbage
pub(crate) const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

pub(crate) fn encode(seq: u64, payload: &[u8]) -> Result<Vec<u8>, io::Error> {
    if payload.len() > MAX_PAYLOAD_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "record payload is too large",
        ));
    }

    let mut buf = Vec::with_capacity(HEADER_LEN + payload.len());

    buf.extend_from_slice(&(payload.len() as u32).to_le_bytes());
    buf.extend_from_slice(&seq.to_le_bytes());
    buf.extend_from_slice(&checksum(seq, payload).to_le_bytes());
    buf.extend_from_slice(payload);

    Ok(buf)
}

pub(crate) struct Decoded<'a> {
    pub(crate) seq: u64,
    pub(crate) payload: &'a [u8],
    pub(crate) len: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Corrupt {
    Truncated,
    Length,
    Checksum,
}

impl fmt::Display for Corrupt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Corrupt::Truncated => f.write_str("the record is truncated"),
            Corrupt::Length => f.write_str("the record length is invalid"),
            Corrupt::Checksum => f.write_str("the record checksum doesn't match its contents"),
        }
    }
}

impl std::error::Error for Corrupt {}

pub(crate) fn decode(buf: &[u8]) -> Result<Decoded<'_>, Corrupt> {
    if buf.len() < HEADER_LEN {
        return Err(Corrupt::Truncated);
    }

    let (header, rest) = buf.split_at(HEADER_LEN);

    let payload_len = u32::from_le_bytes([header[0], header[1], header[2], header[3]]) as usize;
    let seq = u64::from_le_bytes([
        header[4], header[5], header[6], header[7], header[8], header[9], header[10], header[11],
    ]);
    let expected = u32::from_le_bytes([header[12], header[13], header[14], header[15]]);

    if payload_len > MAX_PAYLOAD_LEN {
        return Err(Corrupt::Length);
    }

    if rest.len() < payload_len {
        return Err(Corrupt::Truncated);
    }

    let payload = &rest[..payload_len];

    if checksum(seq, payload) != expected {
        return Err(Corrupt::Checksum);
    }

    Ok(Decoded {
        seq,
        payload,
        len: HEADER_LEN + payload_len,
    })
}

fn checksum(seq: u64, payload: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&seq.to_le_bytes());
    hasher.update(payload);
    hasher.finalize()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_reads_one_record() {
        let mut buf = encode(7, b"{\"a\":1}").unwrap();
        buf.extend(encode(8, b"{}").unwrap());

        let first = decode(&buf).unwrap();

        assert_eq!(7, first.seq);
        assert_eq!(b"{\"a\":1}", first.payload);

        let second = decode(&buf[first.len..]).unwrap();

        assert_eq!(8, second.seq);
        assert_eq!(buf.len(), first.len + second.len);
    }

    #[test]
    fn decode_detects_truncation() {
        let buf = encode(1, b"hello world").unwrap();

        for cut in [0, 3, HEADER_LEN, buf.len() - 1] {
            assert_eq!(Some(Corrupt::Truncated), decode(&buf[..cut]).err());
        }
    }

    #[test]
    fn decode_detects_bit_flips() {
        let mut buf = encode(1, b"hello world").unwrap();

        let last = buf.len() - 1;
        buf[last] ^= 0xff;

        assert_eq!(Some(Corrupt::Checksum), decode(&buf).err());
    }

    #[test]
    fn decode_rejects_absurd_lengths() {
        let mut buf = encode(1, b"x").unwrap();

        buf[..4].copy_from_slice(&u32::MAX.to_le_bytes());

        assert_eq!(Some(Corrupt::Length), decode(&buf).err());
    }
}
