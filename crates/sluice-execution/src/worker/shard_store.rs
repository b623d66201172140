use std::collections::HashMap;
use std::io::SeekFrom;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};

use bytes::Bytes;
use log::debug;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Notify;

use crate::error::{ExecutionError, ExecutionResult};

/// The receiver side of the shard exchange protocol. A peer `WRITE`
/// buffers a transient shard in memory or spills it to disk; `READ`s
/// tail-follow the producer and may start before it has finished.
///
/// Transient shards are reference-counted by the declared reader count
/// and dropped once the last expected reader finishes. On-disk shards
/// survive until an explicit delete or worker shutdown.
pub struct ShardStore {
    data_dir: PathBuf,
    shards: Mutex<HashMap<String, Arc<ShardEntry>>>,
    created: Notify,
}

struct ShardEntry {
    name: String,
    on_disk: bool,
    path: Option<PathBuf>,
    state: Mutex<ShardState>,
    appended: Notify,
}

#[derive(Default)]
struct ShardState {
    /// Frame payloads for transient shards.
    chunks: Vec<Bytes>,
    /// Frame extents within the spill file for on-disk shards.
    extents: Vec<(u64, usize)>,
    closed: bool,
    failed: Option<String>,
    remaining_readers: usize,
}

impl ShardStore {
    pub fn new(data_dir: impl Into<PathBuf>) -> Self {
        Self {
            data_dir: data_dir.into(),
            shards: Mutex::new(HashMap::new()),
            created: Notify::new(),
        }
    }

    /// Open a shard for writing. An existing shard with the same name is
    /// replaced, since a restarted producer re-publishes the same names.
    pub async fn create(
        self: &Arc<Self>,
        name: &str,
        reader_count: usize,
        on_disk: bool,
    ) -> ExecutionResult<ShardWriter> {
        let path = if on_disk {
            Some(self.data_dir.join(name))
        } else {
            None
        };
        let file = match &path {
            Some(path) => {
                tokio::fs::create_dir_all(&self.data_dir).await?;
                Some(
                    OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(path)
                        .await?,
                )
            }
            None => None,
        };
        let entry = Arc::new(ShardEntry {
            name: name.to_string(),
            on_disk,
            path,
            state: Mutex::new(ShardState {
                remaining_readers: reader_count,
                ..Default::default()
            }),
            appended: Notify::new(),
        });
        {
            let mut shards = self.shards.lock().unwrap();
            if shards.insert(name.to_string(), entry.clone()).is_some() {
                debug!("replacing shard {name}");
            }
        }
        self.created.notify_waiters();
        Ok(ShardWriter {
            entry,
            file,
            offset: 0,
            finished: false,
        })
    }

    /// Open a shard for reading. An unknown shard is awaited rather than
    /// rejected: its producer may still be dialing in.
    pub async fn read(self: &Arc<Self>, name: &str) -> ShardReader {
        let entry = loop {
            let created = self.created.notified();
            {
                let shards = self.shards.lock().unwrap();
                if let Some(entry) = shards.get(name) {
                    break entry.clone();
                }
            }
            created.await;
        };
        ShardReader {
            store: self.clone(),
            entry,
            position: 0,
            file: None,
            finished: false,
        }
    }

    /// Purge a shard. Unknown names are a no-op so that releases are
    /// idempotent.
    pub async fn delete(&self, name: &str) -> ExecutionResult<()> {
        let entry = {
            let mut shards = self.shards.lock().unwrap();
            shards.remove(name)
        };
        if let Some(entry) = entry {
            if let Some(path) = &entry.path {
                match tokio::fs::remove_file(path).await {
                    Ok(()) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(e.into()),
                }
            }
            debug!("deleted shard {name}");
        } else {
            debug!("shard {name} is not present; nothing to delete");
        }
        Ok(())
    }

    fn finish_reader(&self, entry: &ShardEntry) {
        if entry.on_disk {
            // On-disk shards are durable until an explicit delete.
            return;
        }
        let drained = {
            let mut state = entry.state.lock().unwrap();
            state.remaining_readers = state.remaining_readers.saturating_sub(1);
            state.remaining_readers == 0
        };
        if drained {
            let mut shards = self.shards.lock().unwrap();
            // Only drop the entry if it has not been replaced meanwhile.
            if shards
                .get(&entry.name)
                .is_some_and(|x| std::ptr::eq(x.as_ref(), entry))
            {
                shards.remove(&entry.name);
                debug!("released transient shard {} after last reader", entry.name);
            }
        }
    }
}

pub struct ShardWriter {
    entry: Arc<ShardEntry>,
    file: Option<File>,
    offset: u64,
    finished: bool,
}

impl ShardWriter {
    pub async fn write(&mut self, chunk: Bytes) -> ExecutionResult<()> {
        if let Some(file) = &mut self.file {
            file.write_all(&chunk).await?;
            let extent = (self.offset, chunk.len());
            self.offset += chunk.len() as u64;
            let mut state = self.entry.state.lock().unwrap();
            state.extents.push(extent);
        } else {
            let mut state = self.entry.state.lock().unwrap();
            state.chunks.push(chunk);
        }
        self.entry.appended.notify_waiters();
        Ok(())
    }

    pub async fn close(mut self) -> ExecutionResult<()> {
        if let Some(file) = &mut self.file {
            file.flush().await?;
        }
        self.finished = true;
        let mut state = self.entry.state.lock().unwrap();
        state.closed = true;
        self.entry.appended.notify_waiters();
        Ok(())
    }
}

impl Drop for ShardWriter {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        // The producer went away mid-stream; fail waiting readers instead
        // of presenting a truncated shard as complete.
        let mut state = self.entry.state.lock().unwrap();
        state.closed = true;
        state.failed = Some(format!("producer of shard {} disconnected", self.entry.name));
        self.entry.appended.notify_waiters();
    }
}

pub struct ShardReader {
    store: Arc<ShardStore>,
    entry: Arc<ShardEntry>,
    position: usize,
    file: Option<File>,
    finished: bool,
}

impl ShardReader {
    /// The next frame, or `None` at end of stream.
    pub async fn next(&mut self) -> ExecutionResult<Option<Bytes>> {
        loop {
            let entry = self.entry.clone();
            let appended = entry.appended.notified();
            enum Step {
                Transient(Bytes),
                Extent(u64, usize),
                Done,
                Failed(String),
                Wait,
            }
            let step = {
                let state = self.entry.state.lock().unwrap();
                if self.entry.on_disk {
                    if self.position < state.extents.len() {
                        let (offset, len) = state.extents[self.position];
                        Step::Extent(offset, len)
                    } else if let Some(failure) = &state.failed {
                        Step::Failed(failure.clone())
                    } else if state.closed {
                        Step::Done
                    } else {
                        Step::Wait
                    }
                } else if self.position < state.chunks.len() {
                    Step::Transient(state.chunks[self.position].clone())
                } else if let Some(failure) = &state.failed {
                    Step::Failed(failure.clone())
                } else if state.closed {
                    Step::Done
                } else {
                    Step::Wait
                }
            };
            match step {
                Step::Transient(chunk) => {
                    self.position += 1;
                    return Ok(Some(chunk));
                }
                Step::Extent(offset, len) => {
                    let chunk = self.read_extent(offset, len).await?;
                    self.position += 1;
                    return Ok(Some(chunk));
                }
                Step::Done => {
                    if !self.finished {
                        self.finished = true;
                        self.store.finish_reader(&self.entry);
                    }
                    return Ok(None);
                }
                Step::Failed(failure) => {
                    return Err(ExecutionError::InternalError(failure));
                }
                Step::Wait => appended.await,
            }
        }
    }

    async fn read_extent(&mut self, offset: u64, len: usize) -> ExecutionResult<Bytes> {
        if self.file.is_none() {
            let path = self.entry.path.as_ref().ok_or_else(|| {
                ExecutionError::InternalError("on-disk shard has no spill file".to_string())
            })?;
            self.file = Some(File::open(path).await?);
        }
        let file = self.file.as_mut().ok_or(ExecutionError::PipeClosed)?;
        file.seek(SeekFrom::Start(offset)).await?;
        let mut buffer = vec![0u8; len];
        file.read_exact(&mut buffer).await?;
        Ok(buffer.into())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn store() -> Arc<ShardStore> {
        let dir = std::env::temp_dir().join(format!("sluice-test-{}", std::process::id()));
        Arc::new(ShardStore::new(dir))
    }

    #[tokio::test]
    async fn test_transient_shard_is_dropped_after_last_reader() {
        let store = store();
        let mut writer = store.create("f1-d0-s0", 2, false).await.unwrap();
        writer.write(Bytes::from_static(b"a")).await.unwrap();
        writer.close().await.unwrap();

        for _ in 0..2 {
            let mut reader = store.read("f1-d0-s0").await;
            assert_eq!(reader.next().await.unwrap(), Some(Bytes::from_static(b"a")));
            assert_eq!(reader.next().await.unwrap(), None);
        }
        assert!(store.shards.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reader_tails_concurrent_writer() {
        let store = store();
        let mut writer = store.create("f1-d0-s1", 1, false).await.unwrap();
        let reading = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut reader = store.read("f1-d0-s1").await;
                let mut frames = Vec::new();
                while let Some(frame) = reader.next().await.unwrap() {
                    frames.push(frame);
                }
                frames
            })
        };
        writer.write(Bytes::from_static(b"x")).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        writer.write(Bytes::from_static(b"y")).await.unwrap();
        writer.close().await.unwrap();
        let frames = reading.await.unwrap();
        assert_eq!(frames, vec![Bytes::from_static(b"x"), Bytes::from_static(b"y")]);
    }

    #[tokio::test]
    async fn test_read_blocks_until_shard_created() {
        let store = store();
        let reading = {
            let store = store.clone();
            tokio::spawn(async move {
                let mut reader = store.read("f1-d0-s2").await;
                reader.next().await.unwrap()
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
        assert!(!reading.is_finished());
        let mut writer = store.create("f1-d0-s2", 1, false).await.unwrap();
        writer.write(Bytes::from_static(b"late")).await.unwrap();
        writer.close().await.unwrap();
        assert_eq!(reading.await.unwrap(), Some(Bytes::from_static(b"late")));
    }

    #[tokio::test]
    async fn test_on_disk_shard_survives_readers_until_delete() {
        let store = store();
        let name = "f1-d1-s0";
        let mut writer = store.create(name, 1, true).await.unwrap();
        writer.write(Bytes::from_static(b"spilled")).await.unwrap();
        writer.close().await.unwrap();

        for _ in 0..3 {
            let mut reader = store.read(name).await;
            assert_eq!(
                reader.next().await.unwrap(),
                Some(Bytes::from_static(b"spilled"))
            );
            assert_eq!(reader.next().await.unwrap(), None);
        }
        store.delete(name).await.unwrap();
        assert!(store.shards.lock().unwrap().is_empty());
        store.delete(name).await.unwrap();
    }

    #[tokio::test]
    async fn test_aborted_writer_fails_reader() {
        let store = store();
        let mut writer = store.create("f1-d0-s3", 1, false).await.unwrap();
        writer.write(Bytes::from_static(b"partial")).await.unwrap();
        drop(writer);
        let mut reader = store.read("f1-d0-s3").await;
        assert_eq!(
            reader.next().await.unwrap(),
            Some(Bytes::from_static(b"partial"))
        );
        assert!(reader.next().await.is_err());
    }
}
