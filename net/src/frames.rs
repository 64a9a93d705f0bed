/*
Reserved frames are recognized by comparing the raw bytes of a received frame
before any deserialization happens. Heart beat frames are liveness probes
only, they carry no payload. A node that wants proof of life sends the start
frame and the other end answers with the reply frame. Frames that don't match
a reserved sequence are passed through to the cluster message decoder
unchanged.
*/

/// Asks the other end of a link to prove that it is alive
pub const HEART_BEAT_START_FRAME: &[u8] = b"HEART BEAT START";

/// The answer to a heart beat start
pub const HEART_BEAT_FRAME: &[u8] = b"HEART BEAT";

pub fn is_heart_beat_start(frame: &[u8]) -> bool {
    frame == HEART_BEAT_START_FRAME
}

pub fn is_heart_beat(frame: &[u8]) -> bool {
    frame == HEART_BEAT_FRAME
}
