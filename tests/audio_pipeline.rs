//! Audio-path integration tests:
//! - downsampler length and averaging contracts
//! - mu-law round-trip error bound over representative signals
//! - the jitter-buffered pacer as one pipeline from PCM to wire frames

use phone_agent::audio::{
    downsample_24k_to_8k, mulaw_to_pcm, pcm_to_mulaw, FramePacer, FRAME_BYTES, JITTER_BUFFER_BYTES,
};

fn pcm_bytes(samples: &[i16]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

/// A 440 Hz-ish test tone at 24 kHz
fn tone(samples: usize, amplitude: f64) -> Vec<i16> {
    (0..samples)
        .map(|i| {
            let phase = (i as f64) * 2.0 * std::f64::consts::PI * 440.0 / 24_000.0;
            (phase.sin() * amplitude) as i16
        })
        .collect()
}

#[test]
fn downsample_length_is_floor_sixth_times_two() {
    for n in [0usize, 1, 5, 6, 7, 59, 60, 61, 479, 480, 4801] {
        let out = downsample_24k_to_8k(&vec![0u8; n]);
        assert_eq!(out.len(), (n / 6) * 2, "input of {n} bytes");
    }
}

#[test]
fn downsample_preserves_dc_level() {
    // A constant signal must survive averaging untouched
    let input = pcm_bytes(&vec![1234i16; 300]);
    let out = downsample_24k_to_8k(&input);
    for pair in out.chunks_exact(2) {
        assert_eq!(i16::from_le_bytes([pair[0], pair[1]]), 1234);
    }
}

#[test]
fn mulaw_round_trip_bound_on_tone() {
    for &amplitude in &[100.0, 3000.0, 20000.0, 32000.0] {
        for &sample in tone(2400, amplitude).iter() {
            let decoded = mulaw_to_pcm(pcm_to_mulaw(&pcm_bytes(&[sample]))[0]) as i64;
            let x = sample as i64;
            let bound = 0.15 * (x.abs() as f64) + 100.0;
            assert!(
                ((decoded - x).abs() as f64) <= bound,
                "amplitude {amplitude}, sample {x}, decoded {decoded}"
            );
        }
    }
}

#[test]
fn pacer_pipeline_produces_exact_wire_frames() {
    // One second of tone pushed in uneven bursts must come out as
    // 160-byte frames with nothing lost.
    let pcm = pcm_bytes(&tone(24_000, 10000.0));
    let expected_mulaw = pcm.len() / 6;

    let mut pacer = FramePacer::new();
    let mut produced = 0usize;
    for burst in pcm.chunks(977) {
        pacer.push_pcm(burst);
        while let Some(frame) = pacer.next_frame() {
            assert_eq!(frame.len(), FRAME_BYTES);
            produced += frame.len();
        }
    }
    for frame in pacer.finish() {
        produced += frame.len();
    }

    assert_eq!(produced, expected_mulaw);
}

#[test]
fn pacer_never_transmits_before_preroll() {
    let mut pacer = FramePacer::new();
    let mut pushed_mulaw = 0usize;

    // Feed 10 ms at a time; the first frame may only appear once the
    // 100 ms pre-roll is in the buffer.
    for _ in 0..20 {
        pacer.push_pcm(&pcm_bytes(&tone(240, 8000.0)));
        pushed_mulaw += 80;
        let frame = pacer.next_frame();
        if pushed_mulaw < JITTER_BUFFER_BYTES {
            assert!(frame.is_none(), "frame leaked at {pushed_mulaw} buffered bytes");
        }
    }
    assert!(pacer.is_transmitting());
}
