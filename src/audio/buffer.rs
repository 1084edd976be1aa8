//! # Client Audio Buffer
//!
//! Each client in a room gets one of these. Binary WebSocket frames from the
//! browser do not have to line up with 16-bit sample boundaries or with the
//! frame size the backend likes, so audio is collected here first and handed
//! on once enough of it has built up.
//!
//! ## Key Features:
//! - **Sample alignment**: an odd trailing byte is carried over to the next frame
//! - **Minimum frame**: audio is released once `min_frame_ms` worth is queued
//! - **Bounded**: past `max_buffer_ms` the oldest samples are discarded, like a
//!   circular buffer, so a stalled backend cannot grow memory without limit

use crate::config::AudioConfig;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::VecDeque;

#[derive(Debug)]
pub struct ClientAudioBuffer {
    /// Queued samples, oldest first
    samples: VecDeque<i16>,

    /// Low byte of a sample whose high byte has not arrived yet
    carry: Option<u8>,

    min_samples: usize,
    max_samples: usize,

    /// Samples thrown away because the buffer was full
    dropped_samples: u64,
}

impl ClientAudioBuffer {
    /// Limits derived from the client sample rate.
    pub fn new(config: &AudioConfig) -> Self {
        let rate = config.client_sample_rate as usize;
        Self::with_limits(
            rate * config.min_frame_ms as usize / 1000,
            rate * config.max_buffer_ms as usize / 1000,
        )
    }

    pub fn with_limits(min_samples: usize, max_samples: usize) -> Self {
        let max_samples = max_samples.max(min_samples).max(1);
        Self {
            samples: VecDeque::with_capacity(min_samples.max(1)),
            carry: None,
            min_samples,
            max_samples,
            dropped_samples: 0,
        }
    }

    /// Queue a frame of PCM bytes. Returns the buffered audio as one frame
    /// once the minimum size is reached.
    pub fn push(&mut self, data: &[u8]) -> Option<Vec<u8>> {
        let mut bytes = Vec::with_capacity(data.len() + 1);
        if let Some(low) = self.carry.take() {
            bytes.push(low);
        }
        bytes.extend_from_slice(data);

        let mut pairs = bytes.chunks_exact(2);
        for pair in &mut pairs {
            self.samples.push_back(LittleEndian::read_i16(pair));
            if self.samples.len() > self.max_samples {
                self.samples.pop_front();
                self.dropped_samples += 1;
            }
        }
        self.carry = pairs.remainder().first().copied();

        if self.samples.is_empty() || self.samples.len() < self.min_samples {
            return None;
        }

        let mut frame = vec![0u8; self.samples.len() * 2];
        for (sample, slot) in self.samples.drain(..).zip(frame.chunks_exact_mut(2)) {
            LittleEndian::write_i16(slot, sample);
        }
        Some(frame)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty() && self.carry.is_none()
    }

    pub fn dropped_samples(&self) -> u64 {
        self.dropped_samples
    }

    pub fn clear(&mut self) {
        self.samples.clear();
        self.carry = None;
    }
}
