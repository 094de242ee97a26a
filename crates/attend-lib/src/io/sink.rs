use crate::error::SinkError;
use crate::sample::Sample;
use anyhow::{Context, Result};
use log::warn;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Append-only JSON Lines log for one stream of one session.
///
/// Every `append` is flushed to the file before it returns, so a record that
/// was acknowledged survives `close()` (and a crash, up to the OS cache).
/// One line per record makes the file self-delimiting: `read_sink` recovers
/// all complete records of a truncated file.
pub struct SignalSink {
    path: PathBuf,
    writer: Option<BufWriter<File>>,
    records: u64,
}

impl SignalSink {
    pub fn create(path: &Path) -> Result<Self, SinkError> {
        let file = File::create(path).map_err(|source| SinkError::Create {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self {
            path: path.to_path_buf(),
            writer: Some(BufWriter::new(file)),
            records: 0,
        })
    }

    pub fn append(&mut self, sample: &Sample) -> Result<(), SinkError> {
        let writer = self
            .writer
            .as_mut()
            .ok_or_else(|| SinkError::Closed(self.path.clone()))?;
        serde_json::to_writer(&mut *writer, sample).map_err(|source| SinkError::Encode {
            path: self.path.clone(),
            source,
        })?;
        writer
            .write_all(b"\n")
            .and_then(|_| writer.flush())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })?;
        self.records += 1;
        Ok(())
    }

    /// Flushes and syncs the file. Calling it again is a no-op.
    pub fn close(&mut self) -> Result<(), SinkError> {
        let Some(mut writer) = self.writer.take() else {
            return Ok(());
        };
        writer
            .flush()
            .and_then(|_| writer.get_ref().sync_all())
            .map_err(|source| SinkError::Write {
                path: self.path.clone(),
                source,
            })
    }

    pub fn is_closed(&self) -> bool {
        self.writer.is_none()
    }

    pub fn records(&self) -> u64 {
        self.records
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for SignalSink {
    fn drop(&mut self) {
        if let Err(err) = self.close() {
            warn!("closing {} on drop failed: {err}", self.path.display());
        }
    }
}

/// Read every complete record of a sink file, in append order.
pub fn read_sink(path: &Path) -> Result<Vec<Sample>> {
    let file = File::open(path).with_context(|| format!("opening {}", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut samples = Vec::new();
    let mut line = Vec::new();
    let mut line_no = 0usize;
    loop {
        line.clear();
        let read = reader
            .read_until(b'\n', &mut line)
            .with_context(|| format!("reading {}", path.display()))?;
        if read == 0 {
            break;
        }
        line_no += 1;
        if line.last() != Some(&b'\n') {
            warn!(
                "{}: ignoring truncated record at line {} ({} bytes)",
                path.display(),
                line_no,
                line.len()
            );
            break;
        }
        let body = &line[..line.len() - 1];
        if body.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        let sample = serde_json::from_slice::<Sample>(body)
            .with_context(|| format!("parsing {} line {}", path.display(), line_no))?;
        samples.push(sample);
    }
    Ok(samples)
}
