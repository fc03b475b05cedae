//! CSV-backed work queue. The input dataset carries one subject per row in
//! a named column plus arbitrary passthrough columns; the output dataset
//! uses the same schema and accumulates confirmed rows. Identifiers already
//! present in the output are excluded at load, so interrupted runs resume
//! without repeating work.

use std::{
    collections::{HashSet, VecDeque},
    fs, io,
    path::{Path, PathBuf},
    sync::Mutex,
};

use tracing::{info, warn};

use crate::phone::normalize_phone;

#[derive(Debug)]
pub enum QueueError {
    Io(io::Error),
    Csv(csv::Error),
    MissingSubjectColumn(String),
}

impl std::fmt::Display for QueueError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            QueueError::Io(e) => write!(f, "dataset io error: {e}"),
            QueueError::Csv(e) => write!(f, "dataset parse error: {e}"),
            QueueError::MissingSubjectColumn(name) => {
                write!(f, "dataset has no column named {name:?}")
            }
        }
    }
}

impl std::error::Error for QueueError {}

impl From<io::Error> for QueueError {
    fn from(e: io::Error) -> Self {
        QueueError::Io(e)
    }
}

impl From<csv::Error> for QueueError {
    fn from(e: csv::Error) -> Self {
        QueueError::Csv(e)
    }
}

/// One unit of work: the normalized subject plus the full row it came from
/// (subject column already rewritten to the normalized form).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub subject: String,
    pub fields: Vec<String>,
}

struct Inner {
    pending: VecDeque<WorkItem>,
    recorded: HashSet<String>,
}

pub struct WorkQueue {
    output_path: PathBuf,
    headers: Vec<String>,
    subject_index: usize,
    inner: Mutex<Inner>,
}

impl WorkQueue {
    /// Loads the input dataset, normalizing subjects, dropping invalid rows,
    /// and excluding anything already recorded in the output dataset. The
    /// output file is created with the input's header when absent.
    pub fn load(
        input_path: &Path,
        output_path: &Path,
        subject_column: &str,
    ) -> Result<Self, QueueError> {
        let mut reader = csv::Reader::from_path(input_path)?;
        let headers: Vec<String> = reader.headers()?.iter().map(str::to_string).collect();
        let subject_index = headers
            .iter()
            .position(|h| h == subject_column)
            .ok_or_else(|| QueueError::MissingSubjectColumn(subject_column.to_string()))?;

        let recorded = read_recorded(output_path, subject_column)?;
        if !output_path.exists() {
            write_rows(output_path, &headers, &[])?;
        }

        let mut pending = VecDeque::new();
        let mut total = 0usize;
        let mut invalid = 0usize;
        let mut already_done = 0usize;
        for record in reader.records() {
            let record = record?;
            total += 1;
            let raw = record.get(subject_index).unwrap_or("");
            let subject = match normalize_phone(raw) {
                Some(s) => s,
                None => {
                    warn!("dropping row with invalid subject {raw:?}");
                    invalid += 1;
                    continue;
                }
            };
            if recorded.contains(&subject) {
                already_done += 1;
                continue;
            }
            let mut fields: Vec<String> = record.iter().map(str::to_string).collect();
            fields[subject_index] = subject.clone();
            pending.push_back(WorkItem { subject, fields });
        }

        info!(
            "loaded {} rows: {} pending, {} already recorded, {} invalid",
            total,
            pending.len(),
            already_done,
            invalid
        );

        Ok(WorkQueue {
            output_path: output_path.to_path_buf(),
            headers,
            subject_index,
            inner: Mutex::new(Inner {
                pending,
                recorded,
            }),
        })
    }

    /// Pops the next item. Each item is delivered to exactly one caller.
    pub fn next(&self) -> Option<WorkItem> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.pop_front()
    }

    pub fn pending_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.pending.len()
    }

    pub fn recorded_count(&self) -> usize {
        let inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner.recorded.len()
    }

    /// Appends a confirmed row to the output dataset. The file is re-read
    /// under the lock first so a subject recorded by any path since startup
    /// is skipped silently rather than duplicated.
    pub fn record(&self, item: &WorkItem) -> Result<(), QueueError> {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());

        let mut rows = read_rows(&self.output_path)?;
        if rows
            .iter()
            .any(|row| row.get(self.subject_index).map(String::as_str) == Some(&item.subject))
        {
            inner.recorded.insert(item.subject.clone());
            return Ok(());
        }

        rows.push(item.fields.clone());
        write_rows(&self.output_path, &self.headers, &rows)?;
        inner.recorded.insert(item.subject.clone());
        info!("recorded {}", item.subject);
        Ok(())
    }
}

fn read_recorded(path: &Path, subject_column: &str) -> Result<HashSet<String>, QueueError> {
    if !path.exists() {
        return Ok(HashSet::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let index = reader
        .headers()?
        .iter()
        .position(|h| h == subject_column);
    let Some(index) = index else {
        warn!(
            "output dataset {} has no {subject_column:?} column; nothing excluded",
            path.display()
        );
        return Ok(HashSet::new());
    };
    let mut recorded = HashSet::new();
    for record in reader.records() {
        let record = record?;
        if let Some(value) = record.get(index) {
            recorded.insert(value.to_string());
        }
    }
    Ok(recorded)
}

fn read_rows(path: &Path) -> Result<Vec<Vec<String>>, QueueError> {
    if !path.exists() {
        return Ok(Vec::new());
    }
    let mut reader = csv::Reader::from_path(path)?;
    let mut rows = Vec::new();
    for record in reader.records() {
        let record = record?;
        rows.push(record.iter().map(str::to_string).collect());
    }
    Ok(rows)
}

/// Full rewrite through a sibling temp file and rename, so a crash
/// mid-write never truncates the dataset.
fn write_rows(path: &Path, headers: &[String], rows: &[Vec<String>]) -> Result<(), QueueError> {
    let tmp = path.with_extension("csv.tmp");
    {
        let mut writer = csv::Writer::from_path(&tmp)?;
        writer.write_record(headers)?;
        for row in rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    fn write_input(dir: &Path, body: &str) -> PathBuf {
        let path = dir.join("input.csv");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn load_normalizes_and_drops_invalid_rows() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            "name,phone\nAlice,8 (916) 123-45-67\nBob,12345\nCarol,79161234568\n",
        );
        let output = dir.path().join("output.csv");
        let queue = WorkQueue::load(&input, &output, "phone").unwrap();

        assert_eq!(queue.pending_count(), 2);
        let first = queue.next().unwrap();
        assert_eq!(first.subject, "+79161234567");
        assert_eq!(first.fields, vec!["Alice".to_string(), "+79161234567".to_string()]);
    }

    #[test]
    fn load_rejects_missing_subject_column() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "name,number\nAlice,79161234567\n");
        let output = dir.path().join("output.csv");
        let err = WorkQueue::load(&input, &output, "phone").err().unwrap();
        assert!(matches!(err, QueueError::MissingSubjectColumn(_)));
    }

    #[test]
    fn load_excludes_already_recorded_subjects() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(
            dir.path(),
            "name,phone\nAlice,79161234567\nBob,79161234568\n",
        );
        let output = dir.path().join("output.csv");
        fs::write(&output, "name,phone\nAlice,+79161234567\n").unwrap();

        let queue = WorkQueue::load(&input, &output, "phone").unwrap();
        assert_eq!(queue.pending_count(), 1);
        assert_eq!(queue.next().unwrap().subject, "+79161234568");
    }

    #[test]
    fn load_creates_output_with_input_header() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "name,phone\nAlice,79161234567\n");
        let output = dir.path().join("output.csv");
        let _queue = WorkQueue::load(&input, &output, "phone").unwrap();

        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.trim(), "name,phone");
    }

    #[test]
    fn record_appends_and_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "name,phone\nAlice,79161234567\n");
        let output = dir.path().join("output.csv");
        let queue = WorkQueue::load(&input, &output, "phone").unwrap();

        let item = queue.next().unwrap();
        queue.record(&item).unwrap();
        queue.record(&item).unwrap();

        let text = fs::read_to_string(&output).unwrap();
        let rows: Vec<&str> = text.lines().collect();
        assert_eq!(rows, vec!["name,phone", "Alice,+79161234567"]);
        assert_eq!(queue.recorded_count(), 1);
    }

    #[test]
    fn record_skips_subjects_written_by_another_path() {
        let dir = tempfile::tempdir().unwrap();
        let input = write_input(dir.path(), "name,phone\nAlice,79161234567\n");
        let output = dir.path().join("output.csv");
        let queue = WorkQueue::load(&input, &output, "phone").unwrap();
        let item = queue.next().unwrap();

        // Another process appends the same subject between load and record.
        fs::write(&output, "name,phone\nAlice,+79161234567\n").unwrap();
        queue.record(&item).unwrap();

        let text = fs::read_to_string(&output).unwrap();
        assert_eq!(text.lines().count(), 2);
    }

    #[test]
    fn next_delivers_each_item_exactly_once() {
        let dir = tempfile::tempdir().unwrap();
        let mut body = String::from("name,phone\n");
        for i in 0..100 {
            body.push_str(&format!("p{i},+7916123{i:04}\n"));
        }
        let input = write_input(dir.path(), &body);
        let output = dir.path().join("output.csv");
        let queue = Arc::new(WorkQueue::load(&input, &output, "phone").unwrap());

        let mut handles = Vec::new();
        for _ in 0..4 {
            let queue = Arc::clone(&queue);
            handles.push(std::thread::spawn(move || {
                let mut seen = Vec::new();
                while let Some(item) = queue.next() {
                    seen.push(item.subject);
                }
                seen
            }));
        }
        let mut all: Vec<String> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort();
        all.dedup();
        assert_eq!(all.len(), 100);
        assert_eq!(queue.pending_count(), 0);
    }
}
