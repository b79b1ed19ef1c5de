//! Packed signed 24-bit little-endian samples, the device's native format.
//!
//! Every copy site goes through these helpers so the byte layout and the
//! bounds of a span are checked in one place.

use byteorder::{ByteOrder, LittleEndian};

pub const SAMPLE_BYTES: usize = 3;
pub const SAMPLE_MAX: i32 = (1 << 23) - 1;
pub const SAMPLE_MIN: i32 = -(1 << 23);

pub fn frame_bytes(channels: usize) -> usize {
    channels * SAMPLE_BYTES
}

pub fn unpack(span: &[u8]) -> i32 {
    LittleEndian::read_i24(&span[..SAMPLE_BYTES])
}

pub fn pack(value: i32, span: &mut [u8]) {
    LittleEndian::write_i24(&mut span[..SAMPLE_BYTES], value.clamp(SAMPLE_MIN, SAMPLE_MAX));
}

/// A channel laid out inside a byte buffer: first sample at `offset`,
/// `stride` bytes between consecutive frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Layout {
    pub offset: usize,
    pub stride: usize,
}

impl Layout {
    pub fn planar(channel: usize, frames: usize) -> Self {
        Self {
            offset: channel * frames * SAMPLE_BYTES,
            stride: SAMPLE_BYTES,
        }
    }

    pub fn interleaved(channel: usize, channels: usize) -> Self {
        Self {
            offset: channel * SAMPLE_BYTES,
            stride: frame_bytes(channels),
        }
    }

    pub fn at(&self, frame: usize) -> usize {
        self.offset + frame * self.stride
    }

    /// Bytes a buffer needs to hold `frames` frames in this layout.
    pub fn required_len(&self, frames: usize) -> usize {
        if frames == 0 {
            0
        } else {
            self.at(frames - 1) + SAMPLE_BYTES
        }
    }
}

/// Copies `frames` samples between two strided channels. Returns the number
/// of frames actually copied, bounded by both spans.
pub fn copy_channel(
    src: &[u8],
    src_layout: Layout,
    dst: &mut [u8],
    dst_layout: Layout,
    frames: usize,
) -> usize {
    let frames = frames
        .min(fitting_frames(src.len(), src_layout))
        .min(fitting_frames(dst.len(), dst_layout));
    if src_layout.stride == SAMPLE_BYTES && dst_layout.stride == SAMPLE_BYTES {
        let bytes = frames * SAMPLE_BYTES;
        dst[dst_layout.offset..dst_layout.offset + bytes]
            .copy_from_slice(&src[src_layout.offset..src_layout.offset + bytes]);
        return frames;
    }
    for frame in 0..frames {
        let s = src_layout.at(frame);
        let d = dst_layout.at(frame);
        dst[d..d + SAMPLE_BYTES].copy_from_slice(&src[s..s + SAMPLE_BYTES]);
    }
    frames
}

pub fn silence_channel(dst: &mut [u8], layout: Layout, frames: usize) {
    let frames = frames.min(fitting_frames(dst.len(), layout));
    for frame in 0..frames {
        let d = layout.at(frame);
        dst[d..d + SAMPLE_BYTES].fill(0);
    }
}

fn fitting_frames(len: usize, layout: Layout) -> usize {
    if len < layout.offset + SAMPLE_BYTES || layout.stride == 0 {
        return 0;
    }
    (len - layout.offset - SAMPLE_BYTES) / layout.stride + 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pack_is_little_endian_and_sign_extends() {
        let mut buf = [0_u8; 3];
        pack(-2, &mut buf);
        assert_eq!(buf, [0xFE, 0xFF, 0xFF]);
        assert_eq!(unpack(&buf), -2);

        pack(0x123456, &mut buf);
        assert_eq!(buf, [0x56, 0x34, 0x12]);
        assert_eq!(unpack(&buf), 0x123456);
    }

    #[test]
    fn pack_clamps_to_24_bits() {
        let mut buf = [0_u8; 3];
        pack(i32::MAX, &mut buf);
        assert_eq!(unpack(&buf), SAMPLE_MAX);
        pack(i32::MIN, &mut buf);
        assert_eq!(unpack(&buf), SAMPLE_MIN);
    }

    #[test]
    fn copy_between_interleaved_and_planar() {
        let channels = 2;
        let frames = 4;
        let mut interleaved = vec![0_u8; frames * frame_bytes(channels)];
        for frame in 0..frames {
            for ch in 0..channels {
                let at = Layout::interleaved(ch, channels).at(frame);
                pack((frame * 10 + ch) as i32, &mut interleaved[at..]);
            }
        }

        let mut planar = vec![0_u8; frames * frame_bytes(channels)];
        for ch in 0..channels {
            let copied = copy_channel(
                &interleaved,
                Layout::interleaved(ch, channels),
                &mut planar,
                Layout::planar(ch, frames),
                frames,
            );
            assert_eq!(copied, frames);
        }
        for ch in 0..channels {
            for frame in 0..frames {
                let at = Layout::planar(ch, frames).at(frame);
                assert_eq!(unpack(&planar[at..]), (frame * 10 + ch) as i32);
            }
        }
    }

    #[test]
    fn copy_is_bounded_by_short_spans() {
        let src = vec![1_u8; 3 * 8];
        let mut dst = vec![0_u8; 3 * 2 + 1];
        let copied = copy_channel(
            &src,
            Layout::planar(0, 8),
            &mut dst,
            Layout::planar(0, 8),
            8,
        );
        assert_eq!(copied, 2);
        assert_eq!(dst[6], 0);
    }
}
