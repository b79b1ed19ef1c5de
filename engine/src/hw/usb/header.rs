//! Header prefixed to every isochronous packet.
//!
//! ```text
//! 0      1          2            4
//! +------+----------+------------+-----------------------------+
//! | 0xA5 | sequence | frames LE  | frames * frame_bytes payload |
//! +------+----------+------------+-----------------------------+
//! ```

use crate::error::{BridgeError, Result};
use byteorder::{ByteOrder, LittleEndian};

pub const HEADER_LEN: usize = 4;
pub const SYNC_MARKER: u8 = 0xA5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    pub sequence: u8,
    pub frames: usize,
    pub payload_offset: usize,
}

/// Packet geometry for one direction. Pure; safe to use from the worker
/// thread without synchronisation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderCodec {
    frame_bytes: usize,
    nominal_frames: usize,
}

impl HeaderCodec {
    pub fn new(frame_bytes: usize, nominal_frames: usize) -> Self {
        Self {
            frame_bytes,
            nominal_frames,
        }
    }

    pub fn frame_bytes(&self) -> usize {
        self.frame_bytes
    }

    pub fn nominal_frames(&self) -> usize {
        self.nominal_frames
    }

    /// Size of a packet carrying the nominal number of frames.
    pub fn packet_bytes(&self) -> usize {
        HEADER_LEN + self.nominal_frames * self.frame_bytes
    }

    pub fn decode(&self, packet: &[u8]) -> Result<Decoded> {
        if packet.len() < HEADER_LEN {
            return Err(BridgeError::MalformedHeader("packet shorter than header"));
        }
        if packet[0] != SYNC_MARKER {
            return Err(BridgeError::MalformedHeader("bad sync marker"));
        }
        let frames = LittleEndian::read_u16(&packet[2..4]) as usize;
        let capacity = if self.frame_bytes == 0 {
            0
        } else {
            (packet.len() - HEADER_LEN) / self.frame_bytes
        };
        if frames > capacity {
            return Err(BridgeError::MalformedHeader(
                "frame count exceeds packet capacity",
            ));
        }
        Ok(Decoded {
            sequence: packet[1],
            frames,
            payload_offset: HEADER_LEN,
        })
    }

    /// Writes a header describing exactly `frames` valid frames and returns
    /// the total packet length (header + payload).
    pub fn encode(&self, out: &mut [u8], sequence: u8, frames: usize) -> Result<usize> {
        if frames > self.nominal_frames || frames > u16::MAX as usize {
            return Err(BridgeError::MalformedHeader(
                "frame count exceeds nominal packet size",
            ));
        }
        let len = HEADER_LEN + frames * self.frame_bytes;
        if out.len() < len {
            return Err(BridgeError::MalformedHeader("output span too small"));
        }
        out[0] = SYNC_MARKER;
        out[1] = sequence;
        LittleEndian::write_u16(&mut out[2..4], frames as u16);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn codec() -> HeaderCodec {
        HeaderCodec::new(6, 16)
    }

    #[test]
    fn decode_recovers_every_encodable_count() {
        let codec = codec();
        let mut packet = vec![0_u8; codec.packet_bytes()];
        for n in 0..=codec.nominal_frames() {
            let len = codec.encode(&mut packet, n as u8, n).unwrap();
            assert_eq!(len, HEADER_LEN + n * 6);
            let decoded = codec.decode(&packet).unwrap();
            assert_eq!(decoded.frames, n);
            assert_eq!(decoded.sequence, n as u8);
            assert_eq!(decoded.payload_offset, HEADER_LEN);
        }
    }

    #[test]
    fn decode_rejects_count_beyond_capacity() {
        let codec = codec();
        let mut packet = vec![0_u8; codec.packet_bytes()];
        codec.encode(&mut packet, 0, 16).unwrap();
        LittleEndian::write_u16(&mut packet[2..4], 17);
        assert!(matches!(
            codec.decode(&packet),
            Err(BridgeError::MalformedHeader(_))
        ));

        // A truncated packet cannot carry what its header claims.
        codec.encode(&mut packet, 0, 16).unwrap();
        assert!(matches!(
            codec.decode(&packet[..HEADER_LEN + 6 * 15]),
            Err(BridgeError::MalformedHeader(_))
        ));
    }

    #[test]
    fn decode_rejects_short_or_unsynced_packets() {
        let codec = codec();
        assert!(codec.decode(&[SYNC_MARKER, 0, 0]).is_err());
        assert!(codec.decode(&[0x00, 0, 0, 0]).is_err());
        assert_eq!(codec.decode(&[SYNC_MARKER, 7, 0, 0]).unwrap().frames, 0);
    }

    #[test]
    fn encode_rejects_oversized_counts() {
        let codec = codec();
        let mut packet = vec![0_u8; codec.packet_bytes()];
        assert!(codec.encode(&mut packet, 0, 17).is_err());
        assert!(codec.encode(&mut packet[..10], 0, 2).is_err());
    }
}
