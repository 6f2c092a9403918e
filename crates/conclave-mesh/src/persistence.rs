//! Line-delimited JSON log backing a persistent queue
//!
//! One file per queue, `<dir>/<encoded queue_name>.jsonl`, one message per
//! line. The queue name is percent-encoded, so separators and `..` in a name
//! can never leave `dir`.
//! Every accepted message is appended as it is enqueued; when the queue stops
//! the file is replaced with the queue's remaining contents through a
//! temporary file and a rename.
//!
//! Appends are not fsynced. A crash can lose the tail of the log or leave
//! messages in it that were already consumed.

use std::fs::{self, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, ErrorKind, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::{MeshError, MeshResult};
use crate::message::Message;

/// Append-only message log of one queue
#[derive(Debug, Clone)]
pub struct QueueLog {
    path: PathBuf,
}

impl QueueLog {
    /// Open the log of `queue_name` inside `dir`, creating `dir` if needed
    pub fn open(dir: &Path, queue_name: &str) -> MeshResult<Self> {
        if queue_name.is_empty() {
            return Err(MeshError::Persistence(
                "queue name cannot be empty".to_string(),
            ));
        }
        fs::create_dir_all(dir).map_err(|e| {
            MeshError::Persistence(format!("Failed to create {}: {}", dir.display(), e))
        })?;
        Ok(Self {
            path: dir.join(format!("{}.jsonl", urlencoding::encode(queue_name))),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read every well-formed message in the log
    ///
    /// A missing file yields no messages. Lines that fail to parse are
    /// skipped with a warning.
    pub fn load(&self) -> MeshResult<Vec<Message>> {
        let file = match fs::File::open(&self.path) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = ?self.path, "Queue log not found, starting empty");
                return Ok(Vec::new());
            }
            Err(e) => return Err(e.into()),
        };

        let mut messages = Vec::new();
        for (index, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            match Message::from_json(line) {
                Ok(message) => messages.push(message),
                Err(e) => warn!(
                    path = ?self.path,
                    line = index + 1,
                    error = %e,
                    "Failed to load persisted message"
                ),
            }
        }
        Ok(messages)
    }

    /// Append one message as a single line
    pub fn append(&self, message: &Message) -> MeshResult<()> {
        let mut line = message.to_json()?;
        line.push('\n');

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    /// Replace the log with exactly `messages`
    pub fn rewrite<'a>(&self, messages: impl IntoIterator<Item = &'a Message>) -> MeshResult<()> {
        let tmp_path = self.path.with_extension("jsonl.tmp");

        let mut written = 0usize;
        {
            let mut writer = BufWriter::new(fs::File::create(&tmp_path)?);
            for message in messages {
                writer.write_all(message.to_json()?.as_bytes())?;
                writer.write_all(b"\n")?;
                written += 1;
            }
            writer.flush()?;
        }

        fs::rename(&tmp_path, &self.path).map_err(|e| {
            MeshError::Persistence(format!(
                "Failed to rename {} to {}: {}",
                tmp_path.display(),
                self.path.display(),
                e
            ))
        })?;

        debug!(path = ?self.path, messages = written, "Rewrote queue log");
        Ok(())
    }
}
