use std::{
    fs::{self, File, OpenOptions},
    io::{self, BufReader, BufWriter, Write},
    path::{Path, PathBuf},
    sync::{Arc, Mutex},
    time::{Duration, SystemTime},
};

use anyhow::Context as _;
use chrono::{Local, SecondsFormat};
use flate2::{Compression, write::GzEncoder};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub const EVENT_LOG_FILE_NAME: &str = "events.log";

const DEFAULT_MAX_SIZE_BYTES: u64 = 1024 * 1024;
const DEFAULT_MAX_BACKUPS: usize = 20;
const DEFAULT_MAX_AGE: Duration = Duration::from_secs(28 * 24 * 60 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RotationPolicy {
    pub max_size_bytes: u64,
    pub max_backups: usize,
    pub max_age: Duration,
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self {
            max_size_bytes: DEFAULT_MAX_SIZE_BYTES,
            max_backups: DEFAULT_MAX_BACKUPS,
            max_age: DEFAULT_MAX_AGE,
        }
    }
}

/// Append-only file that rolls over into gzip-compressed numbered backups
/// (`events.log.1.gz` is the newest).
#[derive(Debug)]
pub struct RotatingFile {
    path: PathBuf,
    policy: RotationPolicy,
    file: Option<File>,
    size: u64,
}

impl RotatingFile {
    pub fn open(path: impl Into<PathBuf>, policy: RotationPolicy) -> io::Result<Self> {
        let path = path.into();
        let file = open_append(&path)?;
        let size = file.metadata()?.len();
        Ok(Self {
            path,
            policy,
            file: Some(file),
            size,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Writes `data`, rotating first if it would push the file past the size cap.
    pub fn write_all(&mut self, data: &[u8]) -> io::Result<()> {
        if self.size > 0 && self.size.saturating_add(data.len() as u64) > self.policy.max_size_bytes {
            self.rotate()?;
        }

        let file = match self.file.take() {
            Some(file) => file,
            None => open_append(&self.path)?,
        };
        let file = self.file.insert(file);
        file.write_all(data)?;
        file.flush()?;
        self.size = self.size.saturating_add(data.len() as u64);
        Ok(())
    }

    pub fn rotate(&mut self) -> io::Result<()> {
        self.file = None;

        let max_backups = self.policy.max_backups;
        if max_backups == 0 {
            fs::remove_file(&self.path).or_else(ignore_not_found)?;
        } else {
            fs::remove_file(self.backup_path(max_backups)).or_else(ignore_not_found)?;
            for index in (1..max_backups).rev() {
                let from = self.backup_path(index);
                if from.exists() {
                    fs::rename(&from, self.backup_path(index + 1))?;
                }
            }
            let plain_backup = self.plain_backup_path();
            fs::rename(&self.path, &plain_backup)?;
            compress_file(&plain_backup, &self.backup_path(1))?;
            fs::remove_file(&plain_backup)?;
            self.remove_expired_backups()?;
        }

        self.file = Some(open_append(&self.path)?);
        self.size = 0;
        Ok(())
    }

    pub fn backup_path(&self, index: usize) -> PathBuf {
        append_to_path(&self.path, &format!(".{index}.gz"))
    }

    fn plain_backup_path(&self) -> PathBuf {
        append_to_path(&self.path, ".1")
    }

    fn remove_expired_backups(&self) -> io::Result<()> {
        let now = SystemTime::now();
        for index in 1..=self.policy.max_backups {
            let backup = self.backup_path(index);
            let Ok(metadata) = fs::metadata(&backup) else {
                continue;
            };
            let expired = metadata
                .modified()
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .is_some_and(|age| age > self.policy.max_age);
            if expired {
                fs::remove_file(&backup).or_else(ignore_not_found)?;
            }
        }
        Ok(())
    }
}

fn open_append(path: &Path) -> io::Result<File> {
    OpenOptions::new().create(true).append(true).open(path)
}

fn append_to_path(path: &Path, suffix: &str) -> PathBuf {
    let mut raw = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

fn ignore_not_found(err: io::Error) -> io::Result<()> {
    if err.kind() == io::ErrorKind::NotFound {
        Ok(())
    } else {
        Err(err)
    }
}

fn compress_file(source: &Path, destination: &Path) -> io::Result<()> {
    let mut reader = BufReader::new(File::open(source)?);
    let writer = BufWriter::new(File::create(destination)?);
    let mut encoder = GzEncoder::new(writer, Compression::default());
    io::copy(&mut reader, &mut encoder)?;
    encoder.finish()?.flush()
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    /// RFC 3339 local time, second precision.
    pub time: String,
    pub level: String,
    pub msg: String,
    pub data: EventData,
}

/// Body of `POST /log`, kept verbatim under `data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventData {
    #[serde(rename = "Type", alias = "type")]
    pub event_type: String,
    #[serde(rename = "Params", alias = "params", default)]
    pub params: Value,
}

/// JSON-lines sink for structured client events.
#[derive(Debug, Clone)]
pub struct EventLog {
    file: Arc<Mutex<RotatingFile>>,
}

impl EventLog {
    pub fn open(logs_dir: &Path) -> anyhow::Result<Self> {
        Self::open_with_policy(logs_dir, RotationPolicy::default())
    }

    pub fn open_with_policy(logs_dir: &Path, policy: RotationPolicy) -> anyhow::Result<Self> {
        let path = logs_dir.join(EVENT_LOG_FILE_NAME);
        let file = RotatingFile::open(&path, policy)
            .with_context(|| format!("open event log {}", path.display()))?;
        Ok(Self {
            file: Arc::new(Mutex::new(file)),
        })
    }

    pub async fn append(&self, data: EventData) -> anyhow::Result<()> {
        let record = EventRecord {
            time: Local::now().to_rfc3339_opts(SecondsFormat::Secs, true),
            level: "info".to_owned(),
            msg: data.event_type.clone(),
            data,
        };
        let mut line = serde_json::to_vec(&record).context("serialize event record")?;
        line.push(b'\n');

        let file = Arc::clone(&self.file);
        tokio::task::spawn_blocking(move || {
            let mut file = file.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            file.write_all(&line)
                .with_context(|| format!("write event log {}", file.path().display()))
        })
        .await
        .map_err(|err| anyhow::anyhow!("join event log write task: {err}"))?
    }
}

#[cfg(test)]
mod tests {
    use std::{
        fs,
        io::Read as _,
        time::{Duration, SystemTime},
    };

    use flate2::read::GzDecoder;
    use serde_json::json;
    use tempfile::tempdir;

    use super::{EVENT_LOG_FILE_NAME, EventData, EventLog, EventRecord, RotatingFile, RotationPolicy};

    fn small_policy(max_backups: usize) -> RotationPolicy {
        RotationPolicy {
            max_size_bytes: 16,
            max_backups,
            max_age: Duration::from_secs(60 * 60),
        }
    }

    fn gunzip(path: &std::path::Path) -> String {
        let mut decoder = GzDecoder::new(fs::File::open(path).unwrap());
        let mut out = String::new();
        decoder.read_to_string(&mut out).unwrap();
        out
    }

    #[tokio::test]
    async fn append_writes_one_json_line_per_event() {
        let temp_dir = tempdir().unwrap();
        let log = EventLog::open(temp_dir.path()).unwrap();

        log.append(EventData {
            event_type: "click".to_owned(),
            params: json!({"x": 1}),
        })
        .await
        .unwrap();
        log.append(EventData {
            event_type: "scroll".to_owned(),
            params: json!(null),
        })
        .await
        .unwrap();

        let contents = fs::read_to_string(temp_dir.path().join(EVENT_LOG_FILE_NAME)).unwrap();
        let records: Vec<EventRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].level, "info");
        assert_eq!(records[0].msg, "click");
        assert_eq!(records[0].data.params, json!({"x": 1}));
        assert!(
            chrono::DateTime::parse_from_rfc3339(&records[0].time).is_ok(),
            "time: {}",
            records[0].time
        );

        let raw: serde_json::Value = serde_json::from_str(contents.lines().next().unwrap()).unwrap();
        assert_eq!(raw["data"]["Type"], "click");
        assert_eq!(raw["data"]["Params"]["x"], 1);
    }

    #[test]
    fn rotation_compresses_previous_file() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("events.log");
        let mut file = RotatingFile::open(&path, small_policy(3)).unwrap();

        file.write_all(b"first-line-0001\n").unwrap();
        file.write_all(b"second\n").unwrap();

        assert_eq!(fs::read_to_string(&path).unwrap(), "second\n");
        assert_eq!(gunzip(&file.backup_path(1)), "first-line-0001\n");
        assert!(!temp_dir.path().join("events.log.1").exists());
    }

    #[test]
    fn rotation_keeps_at_most_max_backups_newest_first() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("events.log");
        let mut file = RotatingFile::open(&path, small_policy(2)).unwrap();

        for line in ["aaaaaaaaaaaaaaa\n", "bbbbbbbbbbbbbbb\n", "ccccccccccccccc\n", "d\n"] {
            file.write_all(line.as_bytes()).unwrap();
        }

        assert_eq!(fs::read_to_string(&path).unwrap(), "d\n");
        assert_eq!(gunzip(&file.backup_path(1)), "ccccccccccccccc\n");
        assert_eq!(gunzip(&file.backup_path(2)), "bbbbbbbbbbbbbbb\n");
        assert!(!file.backup_path(3).exists());
    }

    #[test]
    fn oversized_single_record_is_still_written() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("events.log");
        let mut file = RotatingFile::open(&path, small_policy(1)).unwrap();

        file.write_all(b"this record is longer than the cap\n").unwrap();
        assert!(!file.backup_path(1).exists());
        assert_eq!(
            fs::read_to_string(&path).unwrap(),
            "this record is longer than the cap\n"
        );
    }

    #[test]
    fn reopen_continues_existing_file_size() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("events.log");
        fs::write(&path, b"0123456789abcd\n").unwrap();

        let mut file = RotatingFile::open(&path, small_policy(1)).unwrap();
        file.write_all(b"next\n").unwrap();
        assert_eq!(gunzip(&file.backup_path(1)), "0123456789abcd\n");
    }

    #[test]
    fn expired_backups_are_removed_at_rotation() {
        let temp_dir = tempdir().unwrap();
        let path = temp_dir.path().join("events.log");
        let mut file = RotatingFile::open(&path, small_policy(5)).unwrap();

        let stale = fs::File::create(file.backup_path(1)).unwrap();
        stale
            .set_modified(SystemTime::now() - Duration::from_secs(2 * 60 * 60))
            .unwrap();
        drop(stale);

        file.write_all(b"aaaaaaaaaaaaaaa\n").unwrap();
        file.write_all(b"bbbbbbbbbbbbbbb\n").unwrap();

        assert_eq!(gunzip(&file.backup_path(1)), "aaaaaaaaaaaaaaa\n");
        assert!(!file.backup_path(2).exists(), "stale backup should be pruned");
    }
}
