//! Telephony audio utilities.
//!
//! Everything on the carrier side of this system is μ-law, 8 kHz, mono.
//! These helpers never resample or re-encode existing μ-law audio; the only
//! conversion offered is linear-PCM → μ-law for TTS backends that cannot
//! produce companded output natively.

use base64::{engine::general_purpose, Engine as _};
use std::time::Duration;

/// Bytes per media frame: 20 ms of μ-law at 8 kHz.
pub const FRAME_BYTES: usize = 160;

/// Real-time playout interval between frames.
pub const FRAME_INTERVAL: Duration = Duration::from_millis(20);

/// μ-law sample rate. Fixed for the whole system.
pub const SAMPLE_RATE: u32 = 8_000;

/// Split a byte buffer into playout frames.
///
/// Lazy; the final frame may be shorter than `frame_size` but is never
/// dropped. `frame_size` must be positive.
pub fn chunk(bytes: &[u8], frame_size: usize) -> impl Iterator<Item = &[u8]> {
    assert!(frame_size > 0, "frame size must be positive");
    bytes.chunks(frame_size)
}

/// Base64 encoding used for framed-JSON media payloads.
pub fn encode_payload(bytes: &[u8]) -> String {
    general_purpose::STANDARD.encode(bytes)
}

/// Decode a framed-JSON media payload. `None` on invalid base64.
pub fn decode_payload(payload: &str) -> Option<Vec<u8>> {
    general_purpose::STANDARD.decode(payload).ok()
}

const MULAW_BIAS: i32 = 0x84;
const MULAW_CLIP: i32 = 32_635;

/// Compand one 16-bit linear sample to 8-bit μ-law (G.711).
pub fn linear_to_mulaw(sample: i16) -> u8 {
    let sign: u8 = if sample < 0 { 0x80 } else { 0 };
    let mut magnitude = (sample as i32).abs().min(MULAW_CLIP) + MULAW_BIAS;

    let mut exponent: u8 = 7;
    let mut mask = 0x4000;
    while exponent > 0 && magnitude & mask == 0 {
        exponent -= 1;
        mask >>= 1;
    }

    let mantissa = ((magnitude >> (exponent + 3)) & 0x0F) as u8;
    !(sign | (exponent << 4) | mantissa)
}

/// Convert interleaved 16-bit little-endian PCM at `src_rate` into μ-law
/// at 8 kHz by decimation. `src_rate` must be a whole multiple of 8 kHz.
pub fn pcm16le_to_mulaw_8k(pcm: &[u8], src_rate: u32) -> Vec<u8> {
    let step = (src_rate / SAMPLE_RATE).max(1) as usize;
    let mut out = Vec::with_capacity(pcm.len() / (2 * step));
    let mut i = 0;
    while i + 1 < pcm.len() {
        let sample = i16::from_le_bytes([pcm[i], pcm[i + 1]]);
        out.push(linear_to_mulaw(sample));
        i += 2 * step;
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_exact_frames() {
        let data = vec![0u8; FRAME_BYTES * 3];
        let frames: Vec<&[u8]> = chunk(&data, FRAME_BYTES).collect();
        assert_eq!(frames.len(), 3);
        assert!(frames.iter().all(|f| f.len() == FRAME_BYTES));
    }

    #[test]
    fn chunk_keeps_short_tail() {
        let data = vec![0u8; FRAME_BYTES + 40];
        let frames: Vec<&[u8]> = chunk(&data, FRAME_BYTES).collect();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[1].len(), 40);
    }

    #[test]
    fn chunk_empty_input() {
        let frames: Vec<&[u8]> = chunk(&[], FRAME_BYTES).collect();
        assert!(frames.is_empty());
    }

    #[test]
    fn payload_round_trip() {
        let bytes: Vec<u8> = (0..=255).collect();
        let encoded = encode_payload(&bytes);
        assert_eq!(decode_payload(&encoded).unwrap(), bytes);
        assert!(decode_payload("not//valid!base64").is_none());
    }

    #[test]
    fn mulaw_silence_and_extremes() {
        // G.711: zero companded, sign bit preserved for extremes.
        assert_eq!(linear_to_mulaw(0), 0xFF);
        assert_eq!(linear_to_mulaw(i16::MAX), 0x80);
        assert_eq!(linear_to_mulaw(i16::MIN + 1), 0x00);
    }

    #[test]
    fn pcm_decimation_ratio() {
        // 24 kHz stereo-less PCM decimated 3:1 down to 8 kHz.
        let pcm = vec![0u8; 2 * 240];
        let mulaw = pcm16le_to_mulaw_8k(&pcm, 24_000);
        assert_eq!(mulaw.len(), 80);
    }
}
