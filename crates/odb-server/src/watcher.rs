//! Transaction watchers
//!
//! The authority reports every transaction it finishes, committed or
//! rejected, to an optional [`TransactionWatcher`]. Internal commits
//! (connection records) are reported too, with no guid.
//!
//! [`LoggingTransactionWatcher`] appends each event as one length-prefixed
//! frame to `transactions_<micros>` under a log directory, so a run can be
//! replayed later with [`LoggingTransactionWatcher::replay`].

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::{Bytes, BytesMut};

use odb_core::{
    BadKey, Guid, IndexId, ObjectFieldId, ObjectId, OdbError, OdbResult, SetDeltas, Tid, Writes,
};
use odb_wire::{encode_frame, from_bytes, to_bytes, FrameDecoder, Wire};

const LOG_PREFIX: &str = "transactions_";

/// One finished transaction
#[derive(Clone, Debug, Default, PartialEq)]
pub struct TransactionEvent {
    /// Connection record of the committer; `None` for internal commits
    pub connection: Option<ObjectId>,
    pub transaction_guid: Option<Guid>,
    pub as_of: Option<Tid>,
    /// Commit tid; `None` when rejected
    pub transaction_id: Option<Tid>,
    pub writes: Writes,
    pub set_adds: SetDeltas,
    pub set_removes: SetDeltas,
    pub key_versions: Vec<ObjectFieldId>,
    pub index_versions: Vec<IndexId>,
    pub bad_key: Option<BadKey>,
    /// Connections the commit was delivered to
    pub sent_to: Vec<ObjectId>,
}

impl TransactionEvent {
    pub fn succeeded(&self) -> bool {
        self.transaction_id.is_some()
    }
}

impl Wire for TransactionEvent {
    fn encode(&self, buf: &mut BytesMut) {
        self.connection.encode(buf);
        self.transaction_guid.encode(buf);
        self.as_of.encode(buf);
        self.transaction_id.encode(buf);
        self.writes.encode(buf);
        self.set_adds.encode(buf);
        self.set_removes.encode(buf);
        self.key_versions.encode(buf);
        self.index_versions.encode(buf);
        self.bad_key.encode(buf);
        self.sent_to.encode(buf);
    }

    fn decode(buf: &mut Bytes) -> OdbResult<Self> {
        Ok(TransactionEvent {
            connection: Option::decode(buf)?,
            transaction_guid: Option::decode(buf)?,
            as_of: Option::decode(buf)?,
            transaction_id: Option::decode(buf)?,
            writes: Writes::decode(buf)?,
            set_adds: SetDeltas::decode(buf)?,
            set_removes: SetDeltas::decode(buf)?,
            key_versions: Vec::decode(buf)?,
            index_versions: Vec::decode(buf)?,
            bad_key: Option::decode(buf)?,
            sent_to: Vec::decode(buf)?,
        })
    }
}

/// Observer of the authority's commit stream; runs on the actor thread
pub trait TransactionWatcher: Send {
    fn on_transaction(&mut self, event: &TransactionEvent);

    /// Called periodically and on shutdown
    fn flush(&mut self) {}
}

pub struct LoggingTransactionWatcher {
    path: PathBuf,
    file: BufWriter<File>,
    events: u64,
}

fn io_error(path: &Path, e: std::io::Error) -> OdbError {
    OdbError::Store(format!("{}: {}", path.display(), e))
}

impl LoggingTransactionWatcher {
    /// Start a new log file under `dir`, creating the directory if needed
    pub fn create(dir: &Path) -> OdbResult<Self> {
        fs::create_dir_all(dir).map_err(|e| io_error(dir, e))?;
        let micros = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_micros())
            .unwrap_or_default();
        let path = dir.join(format!("{}{}", LOG_PREFIX, micros));
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| io_error(&path, e))?;
        tracing::info!("logging transactions to {}", path.display());
        Ok(LoggingTransactionWatcher {
            path,
            file: BufWriter::new(file),
            events: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn events_logged(&self) -> u64 {
        self.events
    }

    /// Feed every event logged under `dir` to `on_event`, oldest file
    /// first. A truncated final frame ends its file. Returns the count.
    pub fn replay(dir: &Path, mut on_event: impl FnMut(TransactionEvent)) -> OdbResult<usize> {
        let mut logs: Vec<(u128, PathBuf)> = Vec::new();
        for entry in fs::read_dir(dir).map_err(|e| io_error(dir, e))? {
            let path = entry.map_err(|e| io_error(dir, e))?.path();
            let stamp = path
                .file_name()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix(LOG_PREFIX))
                .and_then(|s| s.parse().ok());
            if let Some(stamp) = stamp {
                logs.push((stamp, path));
            }
        }
        logs.sort();

        let mut count = 0;
        for (_, path) in logs {
            let mut decoder = FrameDecoder::new(false);
            decoder.push(&fs::read(&path).map_err(|e| io_error(&path, e))?);
            while let Some(frame) = decoder.next_frame()? {
                on_event(from_bytes(frame)?);
                count += 1;
            }
            if decoder.buffered() > 0 {
                tracing::warn!("{} ends in a partial record", path.display());
            }
        }
        Ok(count)
    }
}

impl TransactionWatcher for LoggingTransactionWatcher {
    fn on_transaction(&mut self, event: &TransactionEvent) {
        match event.transaction_id {
            Some(tid) => tracing::debug!(
                "tid {}: {} writes from {:?}, sent to {} connections",
                tid,
                event.writes.len(),
                event.connection,
                event.sent_to.len()
            ),
            None => tracing::debug!(
                "transaction {:?} from {:?} rejected: {:?}",
                event.transaction_guid,
                event.connection,
                event.bad_key
            ),
        }

        let frame = encode_frame(&to_bytes(event), false);
        if let Err(e) = self.file.write_all(&frame) {
            tracing::error!("failed to log transaction to {}: {}", self.path.display(), e);
            return;
        }
        self.events += 1;
    }

    fn flush(&mut self) {
        if let Err(e) = self.file.flush() {
            tracing::error!("failed to flush {}: {}", self.path.display(), e);
        }
    }
}

impl Drop for LoggingTransactionWatcher {
    fn drop(&mut self) {
        TransactionWatcher::flush(self);
    }
}
