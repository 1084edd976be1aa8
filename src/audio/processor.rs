//! # Room Audio Processing
//!
//! The two audio paths of a room:
//!
//! - **Inbound** (client → backend): client PCM is converted from the client
//!   recording rate to the rate the backend expects.
//! - **Outbound** (backend → clients): backend audio frames carry a fixed-size
//!   header. It is stripped and the remaining PCM is converted to the playback
//!   rate. Frames no longer than the header carry no audio and are skipped.

use crate::audio::resampler::Resampler;
use crate::config::AudioConfig;
use crate::error::AudioError;

pub struct AudioProcessor {
    inbound: Resampler,
    outbound: Resampler,
    header_bytes: usize,
}

impl AudioProcessor {
    pub fn new(config: &AudioConfig) -> Self {
        Self {
            inbound: Resampler::new(
                config.client_sample_rate,
                config.backend_sample_rate,
                config.resampler_chunk,
            ),
            outbound: Resampler::new(
                config.backend_audio_rate,
                config.playback_sample_rate,
                config.resampler_chunk,
            ),
            header_bytes: config.backend_audio_header_bytes,
        }
    }

    /// Client audio ready to be written to the backend socket.
    pub fn to_backend(&self, pcm: &[u8]) -> Result<Vec<u8>, AudioError> {
        self.inbound.process(pcm)
    }

    /// Playback audio for clients, or `None` when the frame is header-only.
    pub fn from_backend(&self, frame: &[u8]) -> Result<Option<Vec<u8>>, AudioError> {
        if frame.len() <= self.header_bytes {
            return Ok(None);
        }
        let pcm = self.outbound.process(&frame[self.header_bytes..])?;
        Ok(Some(pcm))
    }

    pub fn reset(&self) {
        self.inbound.reset();
        self.outbound.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;

    #[test]
    fn test_short_backend_frames_are_skipped() {
        let processor = AudioProcessor::new(&AppConfig::default().audio);
        assert!(processor.from_backend(&[0u8; 20]).unwrap().is_none());
        assert!(processor.from_backend(&[0u8; 3]).unwrap().is_none());
    }

    #[test]
    fn test_header_is_stripped() {
        let mut config = AppConfig::default().audio;
        config.backend_audio_rate = 48000;
        let processor = AudioProcessor::new(&config);

        let mut frame = vec![0xFFu8; 20];
        frame.extend_from_slice(&[1, 0, 2, 0]);
        assert_eq!(processor.from_backend(&frame).unwrap(), Some(vec![1, 0, 2, 0]));
    }

    #[test]
    fn test_backend_audio_is_upsampled() {
        let processor = AudioProcessor::new(&AppConfig::default().audio);
        let frame = vec![0u8; 20 + 480 * 2];
        let out = processor.from_backend(&frame).unwrap().unwrap();
        assert_eq!(out.len(), 960 * 2);
    }

    #[test]
    fn test_inbound_passthrough_at_equal_rates() {
        let processor = AudioProcessor::new(&AppConfig::default().audio);
        assert_eq!(processor.to_backend(&[5, 0, 6]).unwrap(), vec![5, 0]);
    }
}
