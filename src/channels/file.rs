//! File transfer.
//!
//! Files travel as a `send-file` announcement followed by acked chunks;
//! payloads ride auxiliary frames. The receiver enforces a size cap up
//! front and verifies the announced digest once the last chunk lands.

use std::collections::HashMap;
use std::time::Duration;

use bytes::{BufMut, Bytes, BytesMut};
use log::{debug, warn};
use sha2::{Digest, Sha256};
use tokio::time::Instant;

use crate::error::{Error, Result};

/// Default per-file cap.
pub const DEFAULT_MAX_FILE_SIZE: u64 = 100 * 1024 * 1024;
/// A transfer with no traffic for this long is abandoned.
pub const TRANSFER_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Debug)]
struct IncomingFile {
    filename: String,
    mimetype: String,
    size: u64,
    digest: Option<String>,
    received: BytesMut,
    last_activity: Instant,
}

/// A fully received file, ready to hand to the platform side.
#[derive(Debug, PartialEq, Eq)]
pub struct ReceivedFile {
    pub filename: String,
    pub mimetype: String,
    pub data: Bytes,
}

#[derive(Debug)]
pub struct FileChannel {
    max_file_size: u64,
    incoming: HashMap<u64, IncomingFile>,
    next_id: u64,
}

impl FileChannel {
    pub fn new(max_file_size: u64) -> FileChannel {
        FileChannel {
            max_file_size,
            incoming: HashMap::new(),
            next_id: 1,
        }
    }

    pub fn active_transfers(&self) -> usize {
        self.incoming.len()
    }

    /// `send-file` announcement; allocates the chunk id the sender must
    /// use, or refuses the transfer.
    pub fn offer(
        &mut self,
        filename: &str,
        mimetype: &str,
        size: u64,
        digest: Option<String>,
        now: Instant,
    ) -> Result<u64> {
        if size > self.max_file_size {
            return Err(Error::ErrFileRejected(format!(
                "{size} bytes exceeds the {} byte limit",
                self.max_file_size
            )));
        }
        if filename.contains("..") || filename.contains('/') || filename.contains('\\') {
            return Err(Error::ErrFileRejected(format!(
                "unsafe filename `{filename}`"
            )));
        }
        let id = self.next_id;
        self.next_id += 1;
        debug!("accepting file `{filename}` ({size} bytes) as transfer {id}");
        self.incoming.insert(
            id,
            IncomingFile {
                filename: filename.to_owned(),
                mimetype: mimetype.to_owned(),
                size,
                digest,
                received: BytesMut::new(),
                last_activity: now,
            },
        );
        Ok(id)
    }

    /// One chunk of payload. Returns the completed file with the last
    /// chunk, `None` while the transfer is still going.
    pub fn chunk(
        &mut self,
        id: u64,
        data: &[u8],
        last: bool,
        now: Instant,
    ) -> Result<Option<ReceivedFile>> {
        let file = self.incoming.get_mut(&id).ok_or_else(|| {
            Error::ErrFileRejected(format!("unknown transfer {id}"))
        })?;
        if file.received.len() as u64 + data.len() as u64 > file.size {
            let filename = file.filename.clone();
            self.incoming.remove(&id);
            return Err(Error::ErrFileRejected(format!(
                "`{filename}` grew past its announced size"
            )));
        }
        file.received.put_slice(data);
        file.last_activity = now;
        if !last {
            return Ok(None);
        }

        let file = self.incoming.remove(&id).expect("transfer present");
        if (file.received.len() as u64) < file.size {
            return Err(Error::ErrFileRejected(format!(
                "`{}` ended {} bytes short",
                file.filename,
                file.size - file.received.len() as u64
            )));
        }
        if let Some(expected) = &file.digest {
            let actual = hex_digest(&file.received);
            if &actual != expected {
                return Err(Error::ErrFileRejected(format!(
                    "`{}` digest mismatch",
                    file.filename
                )));
            }
        }
        debug!("transfer {id} complete: `{}`", file.filename);
        Ok(Some(ReceivedFile {
            filename: file.filename,
            mimetype: file.mimetype,
            data: file.received.freeze(),
        }))
    }

    /// Abandons transfers that stalled; returns their ids.
    pub fn expire(&mut self, now: Instant) -> Vec<u64> {
        let stale: Vec<u64> = self
            .incoming
            .iter()
            .filter(|(_, f)| now.saturating_duration_since(f.last_activity) > TRANSFER_TIMEOUT)
            .map(|(id, _)| *id)
            .collect();
        for id in &stale {
            if let Some(f) = self.incoming.remove(id) {
                warn!("file transfer {id} (`{}`) timed out", f.filename);
            }
        }
        stale
    }
}

pub fn hex_digest(data: &[u8]) -> String {
    let digest = Sha256::digest(data);
    let mut out = String::with_capacity(64);
    for b in digest {
        out.push_str(&format!("{b:02x}"));
    }
    out
}
