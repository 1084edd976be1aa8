//! # Fixed-Ratio PCM Resampler
//!
//! Converts 16-bit little-endian mono PCM from one sample rate to another with
//! rubato's FFT resampler. Input arrives in frames of arbitrary size, so
//! samples are queued until a full resampler chunk is available and the
//! remainder waits for the next frame.
//!
//! ## Format rules:
//! - An odd trailing byte cannot form a sample and is dropped
//! - Float samples are clamped to [-1.0, 1.0] before being scaled back to i16
//! - Equal input and output rates pass the (even-length) bytes through untouched
//!
//! The rubato state is built on first use and lives behind a mutex: backend
//! audio frames can arrive while a teardown is resetting the converter.

use crate::error::AudioError;
use byteorder::{ByteOrder, LittleEndian};
use parking_lot::Mutex;
use rubato::{FftFixedIn, Resampler as _};
use tracing::trace;

pub struct Resampler {
    from_rate: u32,
    to_rate: u32,
    chunk: usize,
    state: Mutex<Option<ResamplerState>>,
}

struct ResamplerState {
    engine: FftFixedIn<f32>,
    pending: Vec<f32>,
}

impl Resampler {
    /// `chunk` is the number of input frames rubato processes at once.
    pub fn new(from_rate: u32, to_rate: u32, chunk: usize) -> Self {
        Self {
            from_rate,
            to_rate,
            chunk,
            state: Mutex::new(None),
        }
    }

    pub fn is_passthrough(&self) -> bool {
        self.from_rate == self.to_rate
    }

    /// Resample one frame of PCM bytes. May return fewer (or no) bytes while
    /// the converter fills its first chunk.
    pub fn process(&self, pcm: &[u8]) -> Result<Vec<u8>, AudioError> {
        let even = &pcm[..pcm.len() & !1];
        if self.is_passthrough() {
            return Ok(even.to_vec());
        }

        let mut guard = self.state.lock();
        if guard.is_none() {
            let engine = FftFixedIn::<f32>::new(
                self.from_rate as usize,
                self.to_rate as usize,
                self.chunk,
                2,
                1,
            )?;
            *guard = Some(ResamplerState {
                engine,
                pending: Vec::with_capacity(self.chunk * 2),
            });
        }
        let Some(state) = guard.as_mut() else {
            return Ok(Vec::new());
        };

        state.pending.extend(pcm_to_samples(even));

        let mut output = Vec::new();
        loop {
            let needed = state.engine.input_frames_next();
            if state.pending.len() < needed {
                break;
            }
            let chunk: Vec<f32> = state.pending.drain(..needed).collect();
            let resampled = state.engine.process(&[chunk], None)?;
            output.extend_from_slice(&resampled[0]);
        }

        trace!(
            from = self.from_rate,
            to = self.to_rate,
            "resampled {} bytes into {} samples",
            pcm.len(),
            output.len()
        );
        Ok(samples_to_pcm(&output))
    }

    /// Drop queued samples and filter history.
    pub fn reset(&self) {
        if let Some(state) = self.state.lock().as_mut() {
            state.pending.clear();
            state.engine.reset();
        }
    }
}

/// Decode 16-bit LE samples to floats in [-1.0, 1.0). A trailing odd byte is ignored.
pub fn pcm_to_samples(bytes: &[u8]) -> Vec<f32> {
    bytes
        .chunks_exact(2)
        .map(|pair| LittleEndian::read_i16(pair) as f32 / 32768.0)
        .collect()
}

/// Encode floats as 16-bit LE samples, clamping out-of-range values.
pub fn samples_to_pcm(samples: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 2];
    for (sample, slot) in samples.iter().zip(bytes.chunks_exact_mut(2)) {
        let clamped = sample.clamp(-1.0, 1.0);
        LittleEndian::write_i16(slot, (clamped * 32767.0) as i16);
    }
    bytes
}
