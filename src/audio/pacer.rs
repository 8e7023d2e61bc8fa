//! Jitter-buffered outbound frame pacer
//!
//! Streaming TTS delivers PCM in bursts; the carrier expects a steady
//! 160-byte mu-law frame every 20 ms. The pacer holds two buffers: raw
//! 24 kHz PCM awaiting conversion and converted mu-law awaiting
//! transmission. Transmission does not start until 100 ms of mu-law has
//! accumulated; the threshold is re-armed per utterance, not per call.
//!
//! The pacer owns no clock. The session engine drives it from a 20 ms
//! `tokio::time::interval`, which keeps this type synchronous and directly
//! testable.

use super::codec::{downsample_24k_to_8k, pcm_to_mulaw};
use super::{FRAME_BYTES, JITTER_BUFFER_BYTES};

/// Buffering state machine between a PCM producer and the frame clock
#[derive(Debug, Default)]
pub struct FramePacer {
    pending_pcm: Vec<u8>,
    pending_mulaw: Vec<u8>,
    transmitting: bool,
}

impl FramePacer {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept a burst of 24 kHz 16-bit LE PCM from the TTS stream.
    ///
    /// Converts in multiples of 6 input bytes (one output sample's worth);
    /// the remainder stays buffered for the next burst.
    pub fn push_pcm(&mut self, chunk: &[u8]) {
        self.pending_pcm.extend_from_slice(chunk);

        let usable = self.pending_pcm.len() - self.pending_pcm.len() % 6;
        if usable == 0 {
            return;
        }

        let ready: Vec<u8> = self.pending_pcm.drain(..usable).collect();
        let downsampled = downsample_24k_to_8k(&ready);
        self.pending_mulaw.extend(pcm_to_mulaw(&downsampled));

        if !self.transmitting && self.pending_mulaw.len() >= JITTER_BUFFER_BYTES {
            self.transmitting = true;
        }
    }

    /// Take the next full frame if the jitter buffer has opened.
    ///
    /// Returns `None` while filling or when fewer than 160 bytes remain;
    /// call once per 20 ms tick.
    pub fn next_frame(&mut self) -> Option<Vec<u8>> {
        if !self.transmitting || self.pending_mulaw.len() < FRAME_BYTES {
            return None;
        }
        Some(self.pending_mulaw.drain(..FRAME_BYTES).collect())
    }

    /// Drain everything at end of stream.
    ///
    /// Converts any leftover whole samples and returns the remaining frames;
    /// the final frame may be undersized. The jitter threshold no longer
    /// applies once the stream is finished.
    pub fn finish(&mut self) -> Vec<Vec<u8>> {
        let usable = self.pending_pcm.len() - self.pending_pcm.len() % 6;
        if usable > 0 {
            let ready: Vec<u8> = self.pending_pcm.drain(..usable).collect();
            let downsampled = downsample_24k_to_8k(&ready);
            self.pending_mulaw.extend(pcm_to_mulaw(&downsampled));
        }
        self.pending_pcm.clear();

        let mut frames = Vec::new();
        while self.pending_mulaw.len() >= FRAME_BYTES {
            frames.push(self.pending_mulaw.drain(..FRAME_BYTES).collect());
        }
        if !self.pending_mulaw.is_empty() {
            frames.push(std::mem::take(&mut self.pending_mulaw));
        }
        self.transmitting = false;
        frames
    }

    /// Mu-law bytes currently buffered (filling + transmitting)
    pub fn buffered(&self) -> usize {
        self.pending_mulaw.len()
    }

    /// Whether the jitter buffer has opened for this utterance
    pub fn is_transmitting(&self) -> bool {
        self.transmitting
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// PCM bytes for `ms` milliseconds of 24 kHz silence
    fn pcm_ms(ms: usize) -> Vec<u8> {
        vec![0u8; 24 * 2 * ms]
    }

    #[test]
    fn test_holds_frames_until_jitter_buffer_full() {
        let mut pacer = FramePacer::new();

        // 80 ms of source audio -> 640 mu-law bytes, below the 800 threshold
        pacer.push_pcm(&pcm_ms(80));
        assert_eq!(pacer.buffered(), 640);
        assert!(!pacer.is_transmitting());
        assert!(pacer.next_frame().is_none());

        // 20 ms more crosses 100 ms; frames flow
        pacer.push_pcm(&pcm_ms(20));
        assert!(pacer.is_transmitting());
        let frame = pacer.next_frame().expect("frame after threshold");
        assert_eq!(frame.len(), FRAME_BYTES);
    }

    #[test]
    fn test_keeps_transmitting_after_threshold() {
        let mut pacer = FramePacer::new();
        pacer.push_pcm(&pcm_ms(120));
        assert!(pacer.next_frame().is_some());

        // Buffer drains below 800 but transmission continues
        while pacer.next_frame().is_some() {}
        assert!(pacer.is_transmitting());

        pacer.push_pcm(&pcm_ms(20));
        assert!(pacer.next_frame().is_some());
    }

    #[test]
    fn test_partial_input_sample_carries_over() {
        let mut pacer = FramePacer::new();

        // 5 bytes is less than one 6-byte input group; nothing converts
        pacer.push_pcm(&[0, 0, 0, 0, 0]);
        assert_eq!(pacer.buffered(), 0);

        // One more byte completes the group
        pacer.push_pcm(&[0]);
        assert_eq!(pacer.buffered(), 1);
    }

    #[test]
    fn test_finish_flushes_undersized_tail() {
        let mut pacer = FramePacer::new();
        // 50 ms -> 400 mu-law bytes: never reaches the threshold
        pacer.push_pcm(&pcm_ms(50));
        assert!(pacer.next_frame().is_none());

        let frames = pacer.finish();
        assert_eq!(frames.len(), 3);
        assert_eq!(frames[0].len(), FRAME_BYTES);
        assert_eq!(frames[1].len(), FRAME_BYTES);
        assert_eq!(frames[2].len(), 80);
        assert_eq!(pacer.buffered(), 0);
    }

    #[test]
    fn test_finish_converts_leftover_pcm() {
        let mut pacer = FramePacer::new();
        pacer.push_pcm(&pcm_ms(1)); // 48 bytes -> 8 mu-law bytes
        let frames = pacer.finish();
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].len(), 8);
    }

    #[test]
    fn test_finish_rearms_jitter_buffer() {
        let mut pacer = FramePacer::new();
        pacer.push_pcm(&pcm_ms(120));
        assert!(pacer.is_transmitting());
        pacer.finish();

        // Next utterance buffers again before transmitting
        pacer.push_pcm(&pcm_ms(80));
        assert!(!pacer.is_transmitting());
        assert!(pacer.next_frame().is_none());
    }

    #[test]
    fn test_empty_finish() {
        let mut pacer = FramePacer::new();
        assert!(pacer.finish().is_empty());
    }
}
