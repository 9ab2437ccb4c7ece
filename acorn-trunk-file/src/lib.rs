//! Append-only document-log trunk.
//!
//! One log file per tree under a per-type directory. Each line is a JSON
//! record `{Action, Id, Shell, Timestamp}`; the full state is rebuilt by
//! sequential replay on open. Blank lines are tolerated; a partial record at
//! the tail is truncated away, so every write completed before a crash is
//! recovered.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use parking_lot::{Mutex, RwLock};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use time::OffsetDateTime;
use tracing::{debug, warn};

use acorn_core::{AcornResult, Nut, Trunk, TrunkCapabilities};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
enum LogAction {
    Save,
    Delete,
}

#[derive(Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
#[serde(bound(serialize = "T: Serialize", deserialize = "T: DeserializeOwned"))]
struct LogRecord<T> {
    action: LogAction,
    id: String,
    #[serde(default)]
    shell: Option<Nut<T>>,
    #[serde(default = "OffsetDateTime::now_utc", with = "time::serde::rfc3339")]
    timestamp: OffsetDateTime,
}

struct LogState<T> {
    current: HashMap<String, Nut<T>>,
    history: HashMap<String, Vec<Nut<T>>>,
}

/// History-preserving durable trunk backed by a JSON-lines log.
pub struct DocumentLogTrunk<T> {
    path: PathBuf,
    writer: Mutex<BufWriter<File>>,
    state: RwLock<LogState<T>>,
}

impl<T> DocumentLogTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    /// Open (or create) the log for `tree_name` under `dir`, replaying any
    /// existing records.
    pub fn open(dir: impl AsRef<Path>, tree_name: &str) -> AcornResult<Self> {
        std::fs::create_dir_all(dir.as_ref())?;
        let path = dir.as_ref().join(format!("{tree_name}.log"));

        let mut state = LogState {
            current: HashMap::new(),
            history: HashMap::new(),
        };
        let valid_len = Self::replay(&path, &mut state)?;

        let mut file = OpenOptions::new().create(true).read(true).write(true).open(&path)?;
        if file.metadata()?.len() > valid_len {
            warn!(path = %path.display(), valid_len, "truncating partial record at log tail");
            file.set_len(valid_len)?;
        }
        file.seek(SeekFrom::End(0))?;

        Ok(DocumentLogTrunk {
            path,
            writer: Mutex::new(BufWriter::new(file)),
            state: RwLock::new(state),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Replay the log into `state`, returning the byte length of the valid
    /// prefix. Replay stops at the first unparsable or unterminated line.
    fn replay(path: &Path, state: &mut LogState<T>) -> AcornResult<u64> {
        let mut text = String::new();
        match File::open(path) {
            Ok(mut file) => {
                file.read_to_string(&mut text)?;
            }
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(0),
            Err(err) => return Err(err.into()),
        }

        let mut valid_len = 0u64;
        let mut records = 0usize;
        for segment in text.split_inclusive('\n') {
            let line = segment.trim_end_matches(['\n', '\r']);
            if !segment.ends_with('\n') {
                // Unterminated tail; the write never completed.
                break;
            }
            if line.trim().is_empty() {
                valid_len += segment.len() as u64;
                continue;
            }
            match serde_json::from_str::<LogRecord<T>>(line) {
                Ok(record) => {
                    Self::apply(state, record);
                    records += 1;
                    valid_len += segment.len() as u64;
                }
                Err(err) => {
                    warn!(path = %path.display(), %err, "stopping replay at corrupt record");
                    break;
                }
            }
        }
        debug!(path = %path.display(), records, "log replay complete");
        Ok(valid_len)
    }

    fn apply(state: &mut LogState<T>, record: LogRecord<T>) {
        match record.action {
            LogAction::Save => {
                let Some(shell) = record.shell else {
                    warn!(id = %record.id, "save record without shell skipped");
                    return;
                };
                if let Some(prior) = state.current.remove(&record.id) {
                    state.history.entry(record.id.clone()).or_default().push(prior);
                }
                state.current.insert(record.id, shell);
            }
            LogAction::Delete => {
                if let Some(prior) = state.current.remove(&record.id) {
                    state.history.entry(record.id.clone()).or_default().push(prior);
                }
                if let Some(tombstone) = record.shell {
                    state.history.entry(record.id).or_default().push(tombstone);
                }
            }
        }
    }

    fn append(&self, record: &LogRecord<T>) -> AcornResult<()> {
        let mut writer = self.writer.lock();
        let line = serde_json::to_string(record)?;
        writeln!(writer, "{line}")?;
        writer.flush()?;
        writer.get_ref().sync_data()?;
        Ok(())
    }
}

impl<T> Trunk<T> for DocumentLogTrunk<T>
where
    T: Serialize + DeserializeOwned + Clone + Send + Sync + 'static,
{
    fn stash(&self, id: &str, nut: Nut<T>) -> AcornResult<()> {
        self.append(&LogRecord {
            action: LogAction::Save,
            id: id.to_string(),
            shell: Some(nut.clone()),
            timestamp: OffsetDateTime::now_utc(),
        })?;
        let mut state = self.state.write();
        if let Some(prior) = state.current.remove(id) {
            state.history.entry(id.to_string()).or_default().push(prior);
        }
        state.current.insert(id.to_string(), nut);
        Ok(())
    }

    fn crack(&self, id: &str) -> AcornResult<Option<Nut<T>>> {
        Ok(self.state.read().current.get(id).cloned())
    }

    fn toss(&self, id: &str) -> AcornResult<()> {
        let version = self.state.read().current.get(id).map(|n| n.version).unwrap_or(0);
        let tombstone: Nut<T> = Nut::tombstone(id, version + 1, "");
        self.append(&LogRecord {
            action: LogAction::Delete,
            id: id.to_string(),
            shell: Some(tombstone.clone()),
            timestamp: OffsetDateTime::now_utc(),
        })?;
        let mut state = self.state.write();
        if let Some(prior) = state.current.remove(id) {
            state.history.entry(id.to_string()).or_default().push(prior);
        }
        state.history.entry(id.to_string()).or_default().push(tombstone);
        Ok(())
    }

    fn crack_all(&self) -> AcornResult<Vec<Nut<T>>> {
        Ok(self.state.read().current.values().cloned().collect())
    }

    fn history(&self, id: &str) -> AcornResult<Vec<Nut<T>>> {
        Ok(self.state.read().history.get(id).cloned().unwrap_or_default())
    }

    fn capabilities(&self) -> TrunkCapabilities {
        TrunkCapabilities {
            history: true,
            sync: true,
            durable: true,
            async_io: false,
        }
    }

    fn flush(&self) -> AcornResult<()> {
        let mut writer = self.writer.lock();
        writer.flush()?;
        writer.get_ref().sync_all()?;
        Ok(())
    }
}
