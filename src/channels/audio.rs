//! Audio forwarding.
//!
//! Speaker and microphone streams carry opaque codec bytes plus a
//! monotonic timestamp the receiving side feeds into its jitter buffer.
//! There is no retransmit: a lost or out-of-order chunk is simply
//! dropped and plays as silence.

use bytes::Bytes;
use log::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AudioDirection {
    /// Server → client (speaker forwarding).
    Speaker,
    /// Client → server (microphone forwarding).
    Microphone,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
enum StreamState {
    #[default]
    Stopped,
    Running,
}

#[derive(Debug, Default)]
pub struct AudioChannel {
    state: StreamState,
    codec: Option<String>,
    last_timestamp_ms: u64,
    chunks: u64,
    dropped: u64,
}

/// A chunk ready to forward, or nothing if it was dropped.
#[derive(Debug, PartialEq)]
pub struct AudioChunk {
    pub codec: String,
    pub data: Bytes,
    pub timestamp_ms: u64,
}

impl AudioChannel {
    pub fn new() -> AudioChannel {
        AudioChannel::default()
    }

    pub fn is_running(&self) -> bool {
        self.state == StreamState::Running
    }

    pub fn codec(&self) -> Option<&str> {
        self.codec.as_deref()
    }

    pub fn stats(&self) -> (u64, u64) {
        (self.chunks, self.dropped)
    }

    /// First chunk of a stream (re)starts it and pins the codec.
    pub fn chunk(
        &mut self,
        codec: &str,
        data: Bytes,
        timestamp_ms: u64,
        end_of_stream: bool,
    ) -> Option<AudioChunk> {
        if end_of_stream {
            debug!("audio stream `{codec}` ended after {} chunks", self.chunks);
            self.stop();
            return None;
        }
        match self.state {
            StreamState::Stopped => {
                debug!("audio stream `{codec}` started");
                self.state = StreamState::Running;
                self.codec = Some(codec.to_owned());
                self.last_timestamp_ms = timestamp_ms;
            }
            StreamState::Running => {
                if self.codec.as_deref() != Some(codec) {
                    warn!(
                        "audio codec changed mid-stream ({:?} -> {codec}), restarting",
                        self.codec
                    );
                    self.codec = Some(codec.to_owned());
                    self.last_timestamp_ms = timestamp_ms;
                } else if timestamp_ms < self.last_timestamp_ms {
                    // Late chunk: the jitter buffer has moved on.
                    self.dropped += 1;
                    return None;
                } else {
                    self.last_timestamp_ms = timestamp_ms;
                }
            }
        }
        self.chunks += 1;
        Some(AudioChunk {
            codec: codec.to_owned(),
            data,
            timestamp_ms,
        })
    }

    pub fn stop(&mut self) {
        self.state = StreamState::Stopped;
        self.codec = None;
        self.last_timestamp_ms = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_stream_lifecycle() {
        let mut audio = AudioChannel::new();
        assert!(!audio.is_running());

        let chunk = audio.chunk("opus", Bytes::from_static(b"aa"), 100, false);
        assert!(chunk.is_some());
        assert!(audio.is_running());
        assert_eq!(audio.codec(), Some("opus"));

        assert!(audio.chunk("opus", Bytes::from_static(b"bb"), 120, false).is_some());
        assert!(audio.chunk("opus", Bytes::new(), 140, true).is_none());
        assert!(!audio.is_running());
    }

    #[test]
    fn test_late_chunk_dropped() {
        let mut audio = AudioChannel::new();
        audio.chunk("opus", Bytes::from_static(b"aa"), 100, false);
        audio.chunk("opus", Bytes::from_static(b"bb"), 200, false);
        // Timestamp went backwards: dropped, producing silence.
        assert!(audio.chunk("opus", Bytes::from_static(b"cc"), 150, false).is_none());
        let (chunks, dropped) = audio.stats();
        assert_eq!((chunks, dropped), (2, 1));
    }

    #[test]
    fn test_codec_change_restarts() {
        let mut audio = AudioChannel::new();
        audio.chunk("opus", Bytes::from_static(b"aa"), 100, false);
        let chunk = audio.chunk("vorbis", Bytes::from_static(b"bb"), 50, false);
        assert!(chunk.is_some());
        assert_eq!(audio.codec(), Some("vorbis"));
    }
}
