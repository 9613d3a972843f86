//! Subchannels multiplexed over the session connection. Each one is a
//! small independent state machine owned by the client it serves; they
//! share nothing with each other.

pub mod audio;
pub mod clipboard;
pub mod file;
pub mod notify;

pub use audio::{AudioChannel, AudioChunk};
pub use clipboard::{ClipboardAction, ClipboardChannel, TokenState};
pub use file::{FileChannel, ReceivedFile, DEFAULT_MAX_FILE_SIZE};
pub use notify::NotificationChannel;
