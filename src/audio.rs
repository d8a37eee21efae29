use base64::Engine;

/// One telephony frame: 160 bytes of mu-law at 8 kHz is 20 ms of audio.
pub const FRAME_SIZE: usize = 160;

/// Real-time playout interval per frame.
pub const FRAME_INTERVAL_MS: u64 = 20;

/// Split mu-law bytes into playout frames.
///
/// The last frame may be shorter than `frame_size` but is never dropped.
/// All telephony audio in and out of this system is mu-law / 8 kHz / mono;
/// there is no re-encoding or resampling anywhere.
pub fn chunk(bytes: &[u8], frame_size: usize) -> impl Iterator<Item = &[u8]> {
    debug_assert!(frame_size > 0, "frame size must be positive");
    bytes.chunks(frame_size.max(1))
}

/// Base64 framing for carrier JSON envelopes.
pub fn encode_frame(frame: &[u8]) -> String {
    base64::engine::general_purpose::STANDARD.encode(frame)
}

/// Decode a base64 media payload from a carrier envelope.
pub fn decode_frame(payload: &str) -> Result<Vec<u8>, base64::DecodeError> {
    base64::engine::general_purpose::STANDARD.decode(payload)
}
