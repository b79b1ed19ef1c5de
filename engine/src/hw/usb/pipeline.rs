//! The three stage buffer pipeline between the USB worker and the host.
//!
//! Input flows fill -> exchange -> host, output flows host -> exchange ->
//! drain. Fill and drain belong to the worker thread alone; the exchange
//! region is the only state shared with the host thread and sits behind a
//! mutex that both sides only ever `try_lock`. Data moves between stages by
//! swapping whole regions, never by writing into a region another actor
//! currently owns.

use super::sample::{self, Layout, SAMPLE_BYTES};
use crate::error::{BridgeError, Result};
use std::sync::{Arc, Mutex, MutexGuard, TryLockError};

/// What to put in the part of a period the hardware never delivered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PadPolicy {
    #[default]
    Silence,
    RepeatLast,
}

/// One period of planar samples, `frames * 3` bytes per channel.
#[derive(Debug, Clone)]
pub struct Region {
    data: Vec<u8>,
    channels: usize,
    frames: usize,
}

impl Region {
    pub fn new(channels: usize, frames: usize) -> Self {
        Self {
            data: vec![0_u8; channels * frames * SAMPLE_BYTES],
            channels,
            frames,
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn frames(&self) -> usize {
        self.frames
    }

    pub fn layout(&self, channel: usize) -> Layout {
        Layout::planar(channel, self.frames)
    }

    pub fn channel(&self, channel: usize) -> &[u8] {
        let len = self.frames * SAMPLE_BYTES;
        let start = channel * len;
        &self.data[start..start + len]
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn as_bytes_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn clear(&mut self) {
        self.data.fill(0);
    }
}

/// The client-facing stage. Input side is read by the host, output side is
/// written by the host.
#[derive(Debug)]
pub struct ExchangeRegion {
    input: Region,
    output: Region,
    input_fresh: bool,
    output_fresh: bool,
}

impl ExchangeRegion {
    pub fn new(input_channels: usize, output_channels: usize, frames: usize) -> Self {
        Self {
            input: Region::new(input_channels, frames),
            output: Region::new(output_channels, frames),
            input_fresh: false,
            output_fresh: false,
        }
    }

    pub fn input(&self) -> &Region {
        &self.input
    }

    pub fn output_mut(&mut self) -> &mut Region {
        &mut self.output
    }

    /// True when the worker rotated in a period the host has not read yet.
    pub fn input_fresh(&self) -> bool {
        self.input_fresh
    }

    pub fn output_fresh(&self) -> bool {
        self.output_fresh
    }

    pub fn consume_input(&mut self) {
        self.input_fresh = false;
    }

    /// Marks the output side as holding a new period. Returns true when an
    /// earlier period had not been drained yet and is being replaced.
    pub fn publish_output(&mut self) -> bool {
        std::mem::replace(&mut self.output_fresh, true)
    }

    pub fn reset(&mut self) {
        self.input.clear();
        self.output.clear();
        self.input_fresh = false;
        self.output_fresh = false;
    }
}

pub type SharedExchange = Arc<Mutex<ExchangeRegion>>;

fn try_guard(exchange: &SharedExchange) -> Option<MutexGuard<'_, ExchangeRegion>> {
    match exchange.try_lock() {
        Ok(guard) => Some(guard),
        Err(TryLockError::WouldBlock) => None,
        Err(TryLockError::Poisoned(p)) => Some(p.into_inner()),
    }
}

/// Worker-side view of the pipeline.
#[derive(Debug)]
pub struct StagePipeline {
    frames: usize,
    fill: Region,
    fill_pos: usize,
    last_frame: Vec<u8>,
    drain: Region,
    drain_pos: usize,
    drain_loaded: bool,
    exchange: SharedExchange,
    pad: PadPolicy,
}

impl StagePipeline {
    pub fn new(
        input_channels: usize,
        output_channels: usize,
        frames: usize,
        pad: PadPolicy,
    ) -> Self {
        Self {
            frames,
            fill: Region::new(input_channels, frames),
            fill_pos: 0,
            last_frame: vec![0_u8; input_channels * SAMPLE_BYTES],
            drain: Region::new(output_channels, frames),
            drain_pos: 0,
            drain_loaded: false,
            exchange: Arc::new(Mutex::new(ExchangeRegion::new(
                input_channels,
                output_channels,
                frames,
            ))),
            pad,
        }
    }

    pub fn exchange(&self) -> SharedExchange {
        self.exchange.clone()
    }

    pub fn period_frames(&self) -> usize {
        self.frames
    }

    pub fn input_channels(&self) -> usize {
        self.fill.channels()
    }

    pub fn output_channels(&self) -> usize {
        self.drain.channels()
    }

    pub fn fill_frames(&self) -> usize {
        self.fill_pos
    }

    pub fn fill_full(&self) -> bool {
        self.fill_pos >= self.frames
    }

    pub fn drain_remaining(&self) -> usize {
        if self.drain_loaded {
            self.frames - self.drain_pos
        } else {
            0
        }
    }

    /// Appends interleaved device frames to the fill region. Returns how many
    /// frames fit; frames past the end of the period are the caller's to
    /// retry after a rotation.
    pub fn write_fill_chunk(&mut self, payload: &[u8], frames: usize) -> Result<usize> {
        if self.fill_full() {
            return Err(BridgeError::Overrun);
        }
        let channels = self.fill.channels();
        let frame_bytes = sample::frame_bytes(channels);
        if frame_bytes == 0 {
            return Ok(0);
        }
        let n = frames
            .min(self.frames - self.fill_pos)
            .min(payload.len() / frame_bytes);
        if n == 0 {
            return Ok(0);
        }
        for ch in 0..channels {
            let mut dst = self.fill.layout(ch);
            dst.offset += self.fill_pos * SAMPLE_BYTES;
            sample::copy_channel(
                payload,
                Layout::interleaved(ch, channels),
                self.fill.as_bytes_mut(),
                dst,
                n,
            );
        }
        let last = (n - 1) * frame_bytes;
        self.last_frame
            .copy_from_slice(&payload[last..last + frame_bytes]);
        self.fill_pos += n;
        Ok(n)
    }

    /// Completes a partial period according to the pad policy. Returns the
    /// number of frames synthesised.
    pub fn pad_fill(&mut self) -> usize {
        let missing = self.frames - self.fill_pos;
        if missing == 0 {
            return 0;
        }
        let channels = self.fill.channels();
        for ch in 0..channels {
            let mut dst = self.fill.layout(ch);
            dst.offset += self.fill_pos * SAMPLE_BYTES;
            match self.pad {
                PadPolicy::Silence => {
                    sample::silence_channel(self.fill.as_bytes_mut(), dst, missing);
                }
                PadPolicy::RepeatLast => {
                    let src = &self.last_frame[ch * SAMPLE_BYTES..(ch + 1) * SAMPLE_BYTES];
                    let bytes = self.fill.as_bytes_mut();
                    for frame in 0..missing {
                        let at = dst.at(frame);
                        bytes[at..at + SAMPLE_BYTES].copy_from_slice(src);
                    }
                }
            }
        }
        self.fill_pos = self.frames;
        missing
    }

    /// Hands a full fill region to the host side. A no-op unless the fill
    /// region is full; delayed (returns false) while the guard is busy or the
    /// host has not read the previous period yet.
    pub fn rotate_fill_to_exchange(&mut self) -> bool {
        if !self.fill_full() {
            return false;
        }
        let Some(mut ex) = try_guard(&self.exchange) else {
            return false;
        };
        if ex.input_fresh {
            return false;
        }
        std::mem::swap(&mut ex.input, &mut self.fill);
        ex.input_fresh = true;
        drop(ex);
        self.fill_pos = 0;
        true
    }

    /// Takes the host's latest output period for transmission. A no-op while
    /// the drain region still holds frames or no new output exists.
    pub fn rotate_exchange_to_drain(&mut self) -> bool {
        if self.drain_remaining() > 0 {
            return false;
        }
        let Some(mut ex) = try_guard(&self.exchange) else {
            return false;
        };
        if !ex.output_fresh {
            return false;
        }
        std::mem::swap(&mut ex.output, &mut self.drain);
        ex.output_fresh = false;
        drop(ex);
        self.drain_pos = 0;
        self.drain_loaded = true;
        true
    }

    /// Interleaves up to `frames` drain frames into `out`. Returns the number
    /// of frames produced, or `Underrun` when the drain region is dry.
    pub fn read_drain_chunk(&mut self, out: &mut [u8], frames: usize) -> Result<usize> {
        if self.drain_remaining() == 0 {
            return Err(BridgeError::Underrun);
        }
        let channels = self.drain.channels();
        let frame_bytes = sample::frame_bytes(channels);
        if frame_bytes == 0 {
            return Ok(0);
        }
        let n = frames
            .min(self.drain_remaining())
            .min(out.len() / frame_bytes);
        for ch in 0..channels {
            let mut src = self.drain.layout(ch);
            src.offset += self.drain_pos * SAMPLE_BYTES;
            sample::copy_channel(
                self.drain.as_bytes(),
                src,
                out,
                Layout::interleaved(ch, channels),
                n,
            );
        }
        self.drain_pos += n;
        if self.drain_pos >= self.frames {
            self.drain_loaded = false;
        }
        Ok(n)
    }

    /// Zeroes every stage. Only called while the worker is not running; may
    /// block on the exchange guard.
    pub fn reset(&mut self) {
        self.fill.clear();
        self.fill_pos = 0;
        self.last_frame.fill(0);
        self.drain.clear();
        self.drain_pos = 0;
        self.drain_loaded = false;
        let mut ex = match self.exchange.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        ex.reset();
    }
}
