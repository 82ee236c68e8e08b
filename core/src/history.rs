use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc};
use std::thread::JoinHandle;
use tracing::{debug, error, warn};

use crate::batch::BatchId;
use crate::error::Result;
use crate::job::{Job, JobId, JobState};

/// Terminal outcome of one job, as kept across runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryRecord {
    pub job_id: JobId,
    pub batch_id: BatchId,
    pub url: String,
    pub title: Option<String>,
    pub output_path: Option<PathBuf>,
    pub state: JobState,
    pub finished_at: DateTime<Utc>,
    pub file_size: Option<u64>,
    pub error: Option<String>,
}

impl HistoryRecord {
    /// Snapshot of a terminal job. Touches no files; the size of the output
    /// is filled in when the record is written.
    pub fn from_job(job: &Job) -> Self {
        Self {
            job_id: job.id,
            batch_id: job.batch_id,
            url: job.url.clone(),
            title: job.title.clone(),
            output_path: job.output_path.clone(),
            state: job.state,
            finished_at: job.finished_at.unwrap_or_else(Utc::now),
            file_size: None,
            error: job.error.as_ref().map(|e| e.message.clone()),
        }
    }

    fn measure(&mut self) {
        if self.file_size.is_none() {
            self.file_size = self
                .output_path
                .as_deref()
                .and_then(|p| fs::metadata(p).ok())
                .map(|m| m.len());
        }
    }
}

/// One CSV export row.
#[derive(Serialize)]
struct CsvRow<'a> {
    timestamp: String,
    title: &'a str,
    url: &'a str,
    filepath: String,
    filesize: Option<u64>,
    state: String,
}

enum Command {
    Append(HistoryRecord),
    Clear(mpsc::Sender<io::Result<()>>),
    Sync(mpsc::Sender<()>),
}

/// Append-only JSON-lines log of terminal jobs.
///
/// Disk writes happen on a dedicated thread in submission order, so
/// `append` never blocks on the filesystem.
#[derive(Debug)]
pub struct HistoryStore {
    path: Option<PathBuf>,
    records: Arc<Mutex<Vec<HistoryRecord>>>,
    writer: Mutex<Option<mpsc::Sender<Command>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl HistoryStore {
    /// History kept in memory only.
    pub fn in_memory() -> Self {
        Self {
            path: None,
            records: Arc::new(Mutex::new(Vec::new())),
            writer: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    /// Load existing records. Lines that do not parse are skipped.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let records = if path.exists() {
            let reader = BufReader::new(File::open(&path)?);
            let mut records = Vec::new();
            for (number, line) in reader.lines().enumerate() {
                let line = line?;
                if line.trim().is_empty() {
                    continue;
                }
                match serde_json::from_str::<HistoryRecord>(&line) {
                    Ok(record) => records.push(record),
                    Err(e) => warn!("Skipping history line {} in {:?}: {}", number + 1, path, e),
                }
            }
            records
        } else {
            Vec::new()
        };
        debug!("Loaded {} history records from {:?}", records.len(), path);

        let records = Arc::new(Mutex::new(records));
        let (tx, rx) = mpsc::channel();
        let thread = {
            let path = path.clone();
            let records = records.clone();
            std::thread::Builder::new()
                .name("ytgrab-history".into())
                .spawn(move || run_writer(&path, &records, rx))?
        };

        Ok(Self {
            path: Some(path),
            records,
            writer: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    /// Record a terminal job. The in-memory record is visible at once; write
    /// failures are logged by the writer thread.
    pub fn append(&self, record: HistoryRecord) {
        let writer = self.writer.lock();
        match writer.as_ref() {
            Some(tx) => {
                self.records.lock().push(record.clone());
                if tx.send(Command::Append(record)).is_err() {
                    error!("History writer for {:?} is gone; record kept in memory only", self.path);
                }
            }
            None => {
                let mut record = record;
                record.measure();
                self.records.lock().push(record);
            }
        }
    }

    /// Wait until every appended record reached the file.
    pub fn sync(&self) {
        let (tx, rx) = mpsc::channel();
        let sent = self
            .writer
            .lock()
            .as_ref()
            .is_some_and(|writer| writer.send(Command::Sync(tx)).is_ok());
        if sent {
            let _ = rx.recv();
        }
    }

    pub fn records(&self) -> Vec<HistoryRecord> {
        self.sync();
        self.records.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Forget every record, on disk too.
    pub fn clear(&self) -> Result<()> {
        let (tx, rx) = mpsc::channel();
        let sent = self
            .writer
            .lock()
            .as_ref()
            .is_some_and(|writer| writer.send(Command::Clear(tx)).is_ok());
        if sent {
            rx.recv()
                .map_err(|_| io::Error::new(io::ErrorKind::BrokenPipe, "history writer stopped"))??;
        } else {
            self.records.lock().clear();
        }
        Ok(())
    }

    /// Write the history to `dest`: CSV when the extension is `.csv`, JSON lines otherwise.
    pub fn export(&self, dest: &Path) -> Result<usize> {
        let records = self.records();
        let is_csv = dest
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("csv"));

        if is_csv {
            let mut out = csv::Writer::from_path(dest).map_err(io::Error::from)?;
            for r in &records {
                out.serialize(CsvRow {
                    timestamp: r.finished_at.to_rfc3339(),
                    title: r.title.as_deref().unwrap_or(""),
                    url: &r.url,
                    filepath: r
                        .output_path
                        .as_ref()
                        .map(|p| p.display().to_string())
                        .unwrap_or_default(),
                    filesize: r.file_size,
                    state: r.state.to_string(),
                })
                .map_err(io::Error::from)?;
            }
            out.flush()?;
        } else {
            let mut out = BufWriter::new(File::create(dest)?);
            for r in &records {
                serde_json::to_writer(&mut out, r)?;
                out.write_all(b"\n")?;
            }
            out.flush()?;
        }
        Ok(records.len())
    }
}

impl Drop for HistoryStore {
    fn drop(&mut self) {
        // closing the channel ends the writer once its backlog is written
        self.writer.get_mut().take();
        if let Some(thread) = self.thread.get_mut().take() {
            if thread.join().is_err() {
                error!("History writer for {:?} panicked", self.path);
            }
        }
    }
}

fn run_writer(path: &Path, records: &Mutex<Vec<HistoryRecord>>, rx: mpsc::Receiver<Command>) {
    for command in rx {
        match command {
            Command::Append(mut record) => {
                record.measure();
                if let Some(kept) = records.lock().iter_mut().find(|r| r.job_id == record.job_id) {
                    kept.file_size = record.file_size;
                }
                if let Err(e) = append_line(path, &record) {
                    error!("Failed to write history record to {:?}: {}", path, e);
                }
            }
            Command::Clear(reply) => {
                let result = match fs::remove_file(path) {
                    Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
                    _ => Ok(()),
                };
                if result.is_ok() {
                    records.lock().clear();
                }
                let _ = reply.send(result);
            }
            Command::Sync(reply) => {
                let _ = reply.send(());
            }
        }
    }
}

fn append_line(path: &Path, record: &HistoryRecord) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    let mut line = serde_json::to_vec(record)?;
    line.push(b'\n');
    file.write_all(&line)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(url: &str, state: JobState) -> HistoryRecord {
        HistoryRecord {
            job_id: JobId::new(),
            batch_id: BatchId::new(),
            url: url.to_string(),
            title: Some("A, \"quoted\" title".to_string()),
            output_path: Some(PathBuf::from("/music/a.mp3")),
            state,
            finished_at: Utc::now(),
            file_size: Some(42),
            error: None,
        }
    }

    #[test]
    fn records_survive_reopen_in_order() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("history.jsonl");

        let store = HistoryStore::open(&path).unwrap();
        store.append(record("https://a.example/1", JobState::Completed));
        store.append(record("https://a.example/2", JobState::Failed));
        store.sync();

        let reopened = HistoryStore::open(&path).unwrap();
        let urls: Vec<_> = reopened.records().into_iter().map(|r| r.url).collect();
        assert_eq!(urls, vec!["https://a.example/1", "https://a.example/2"]);
    }

    #[test]
    fn corrupt_lines_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let good = serde_json::to_string(&record("https://a.example/1", JobState::Completed)).unwrap();
        fs::write(&path, format!("{good}\nnot json\n\n")).unwrap();

        let store = HistoryStore::open(&path).unwrap();
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn clear_removes_file_and_records() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = HistoryStore::open(&path).unwrap();
        store.append(record("https://a.example/1", JobState::Cancelled));
        store.sync();
        assert!(path.exists());

        store.clear().unwrap();
        assert!(store.is_empty());
        assert!(!path.exists());
    }

    #[test]
    fn export_csv_quotes_fields() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::in_memory();
        store.append(record("https://a.example/1", JobState::Completed));

        let dest = dir.path().join("export.csv");
        assert_eq!(store.export(&dest).unwrap(), 1);
        let text = fs::read_to_string(&dest).unwrap();
        let mut lines = text.lines();
        assert_eq!(lines.next(), Some("timestamp,title,url,filepath,filesize,state"));
        let row = lines.next().unwrap();
        assert!(row.contains("\"A, \"\"quoted\"\" title\""));
        assert!(row.ends_with(",42,Completed"));
    }

    #[test]
    fn written_records_carry_the_output_size() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("a.mp3");
        fs::write(&output, vec![0u8; 1234]).unwrap();
        let path = dir.path().join("history.jsonl");

        let store = HistoryStore::open(&path).unwrap();
        let mut rec = record("https://a.example/1", JobState::Completed);
        rec.output_path = Some(output);
        rec.file_size = None;
        store.append(rec);
        drop(store);

        let reopened = HistoryStore::open(&path).unwrap();
        assert_eq!(reopened.records()[0].file_size, Some(1234));
    }

    #[test]
    fn appends_from_many_threads_all_reach_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("history.jsonl");
        let store = Arc::new(HistoryStore::open(&path).unwrap());

        let writers: Vec<_> = (0..4)
            .map(|t| {
                let store = store.clone();
                std::thread::spawn(move || {
                    for i in 0..25 {
                        store.append(record(&format!("https://a.example/{t}/{i}"), JobState::Completed));
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().unwrap();
        }
        store.sync();

        assert_eq!(store.len(), 100);
        assert_eq!(fs::read_to_string(&path).unwrap().lines().count(), 100);
    }

    #[test]
    fn export_jsonl_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let store = HistoryStore::in_memory();
        store.append(record("https://a.example/1", JobState::Completed));

        let dest = dir.path().join("export.jsonl");
        store.export(&dest).unwrap();
        let reloaded = HistoryStore::open(&dest).unwrap();
        assert_eq!(reloaded.records(), store.records());
    }
}
