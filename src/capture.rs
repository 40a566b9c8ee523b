//! Classic pcap encoding for capture buffers.

use std::time::Duration;

use bytes::{Buf, BufMut, BytesMut};
use thiserror::Error;

const PCAP_MAGIC: u32 = 0xa1b2_c3d4;
const LINKTYPE_ETHERNET: u32 = 1;
const SNAPLEN: u32 = 65_535;
const GLOBAL_HEADER_LEN: usize = 24;
const RECORD_HEADER_LEN: usize = 16;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum CaptureError {
    #[error("capture buffer truncated at offset {0}")]
    Truncated(usize),

    #[error("not a little-endian pcap buffer (magic {0:#010x})")]
    BadMagic(u32),
}

/// One captured frame and its timestamp since the Unix epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureRecord {
    pub timestamp: Duration,
    pub data: Vec<u8>,
}

/// Encode records as a pcap file image.
pub fn encode(records: &[CaptureRecord]) -> Vec<u8> {
    let body: usize = records
        .iter()
        .map(|r| RECORD_HEADER_LEN + r.data.len())
        .sum();
    let mut out = BytesMut::with_capacity(GLOBAL_HEADER_LEN + body);
    out.put_u32_le(PCAP_MAGIC);
    out.put_u16_le(2);
    out.put_u16_le(4);
    out.put_i32_le(0);
    out.put_u32_le(0);
    out.put_u32_le(SNAPLEN);
    out.put_u32_le(LINKTYPE_ETHERNET);
    for record in records {
        let len = record.data.len() as u32;
        out.put_u32_le(record.timestamp.as_secs() as u32);
        out.put_u32_le(record.timestamp.subsec_micros());
        out.put_u32_le(len);
        out.put_u32_le(len);
        out.put_slice(&record.data);
    }
    out.to_vec()
}

/// Decode a pcap file image produced by [`encode`] (or any little-endian,
/// microsecond-resolution pcap).
pub fn decode(buf: &[u8]) -> Result<Vec<CaptureRecord>, CaptureError> {
    let total = buf.len();
    let mut cur = buf;
    if cur.remaining() < GLOBAL_HEADER_LEN {
        return Err(CaptureError::Truncated(0));
    }
    let magic = cur.get_u32_le();
    if magic != PCAP_MAGIC {
        return Err(CaptureError::BadMagic(magic));
    }
    cur.advance(GLOBAL_HEADER_LEN - 4);

    let mut records = Vec::new();
    while cur.has_remaining() {
        let at = total - cur.remaining();
        if cur.remaining() < RECORD_HEADER_LEN {
            return Err(CaptureError::Truncated(at));
        }
        let secs = cur.get_u32_le();
        let micros = cur.get_u32_le();
        let incl_len = cur.get_u32_le() as usize;
        let _orig_len = cur.get_u32_le();
        if cur.remaining() < incl_len {
            return Err(CaptureError::Truncated(at));
        }
        records.push(CaptureRecord {
            timestamp: Duration::from_secs(u64::from(secs)) + Duration::from_micros(u64::from(micros)),
            data: cur[..incl_len].to_vec(),
        });
        cur.advance(incl_len);
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_capture_is_header_only() {
        let image = encode(&[]);
        assert_eq!(image.len(), 24);
        assert_eq!(&image[0..4], &[0xd4, 0xc3, 0xb2, 0xa1]);
        assert_eq!(decode(&image).unwrap(), vec![]);
    }

    #[test]
    fn test_records_survive_encoding() {
        let records = vec![
            CaptureRecord {
                timestamp: Duration::from_micros(1_700_000_000_250_000),
                data: vec![0xff; 124],
            },
            CaptureRecord {
                timestamp: Duration::from_secs(1_700_000_001),
                data: vec![1, 2, 3],
            },
        ];
        let image = encode(&records);
        assert_eq!(image.len(), 24 + 16 + 124 + 16 + 3);
        assert_eq!(decode(&image).unwrap(), records);
    }

    #[test]
    fn test_truncated_record_reported() {
        let mut image = encode(&[CaptureRecord {
            timestamp: Duration::ZERO,
            data: vec![0; 10],
        }]);
        image.truncate(image.len() - 1);
        assert_eq!(decode(&image), Err(CaptureError::Truncated(24)));
    }

    #[test]
    fn test_wrong_magic_rejected() {
        let mut image = encode(&[]);
        image[0] = 0;
        assert!(matches!(decode(&image), Err(CaptureError::BadMagic(_))));
    }
}
