//! Append-only report file (`report.jsonl`)
//!
//! One finalized job per line. Appends happen under the store lock. A line
//! left incomplete by a crash is skipped by readers and fenced off by the
//! next writer, which terminates the fragment before appending.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use tracing::warn;

use crate::job::Job;

/// Append `job` as one line. Caller holds the store lock.
pub(crate) fn append(path: &Path, job: &Job) -> Result<(), super::StoreError> {
    let mut line = serde_json::to_string(job)?;
    line.push('\n');

    let mut file = OpenOptions::new()
        .create(true)
        .read(true)
        .append(true)
        .open(path)?;
    if !ends_with_newline(&mut file)? {
        warn!(path = %path.display(), "terminating torn trailing report line");
        line.insert(0, '\n');
    }

    file.write_all(line.as_bytes())?;
    file.sync_data()?;
    Ok(())
}

fn ends_with_newline(file: &mut File) -> io::Result<bool> {
    let len = file.metadata()?.len();
    if len == 0 {
        return Ok(true);
    }
    file.seek(SeekFrom::Start(len - 1))?;
    let mut last = [0u8; 1];
    file.read_exact(&mut last)?;
    Ok(last[0] == b'\n')
}

/// All readable records, in recording order. A missing file is empty.
pub(crate) fn read_all(path: &Path) -> Result<Vec<Job>, super::StoreError> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut records = Vec::new();
    for (index, line) in content.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<Job>(line) {
            Ok(job) => records.push(job),
            Err(e) => {
                warn!(path = %path.display(), line = index + 1, error = %e, "skipping unreadable report line")
            }
        }
    }
    Ok(records)
}
