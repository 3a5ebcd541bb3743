//! JSONL writer for bar records - date-partitioned, append-only files
//!
//! Each record lands in `{prefix}_{YYYYMMDD}.jsonl`, keyed by the UTC date of the
//! bar's open time. Lines are buffered in memory and appended in one write per
//! file on flush; previously written lines are never touched.

use super::record::BarRecord;
use super::writer_backend::{RecordWriterBackend, WriterError};
use chrono::NaiveDate;
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub struct BufferedJsonlWriter {
    output_dir: PathBuf,
    file_prefix: String,
    buffer_size: usize,
    pending: Vec<(NaiveDate, String)>,
    lines_written: u64,
}

impl BufferedJsonlWriter {
    pub fn new(
        output_dir: impl AsRef<Path>,
        file_prefix: impl Into<String>,
        buffer_size: usize,
    ) -> Result<Self, WriterError> {
        let output_dir = output_dir.as_ref().to_path_buf();
        fs::create_dir_all(&output_dir)?;

        let file_prefix = file_prefix.into();
        log::info!(
            "📝 Writing bar records to: {}/{}_YYYYMMDD.jsonl (buffer: {})",
            output_dir.display(),
            file_prefix,
            buffer_size
        );

        Ok(Self {
            output_dir,
            file_prefix,
            buffer_size: buffer_size.max(1),
            pending: Vec::new(),
            lines_written: 0,
        })
    }

    pub fn file_path_for(&self, date: NaiveDate) -> PathBuf {
        self.output_dir
            .join(format!("{}_{}.jsonl", self.file_prefix, date.format("%Y%m%d")))
    }

    pub fn lines_written(&self) -> u64 {
        self.lines_written
    }

    /// Group pending lines by date, keeping first-seen date order and line order
    fn take_groups(&mut self) -> Vec<(NaiveDate, Vec<String>)> {
        let mut groups: Vec<(NaiveDate, Vec<String>)> = Vec::new();
        for (date, line) in self.pending.drain(..) {
            match groups.iter_mut().find(|(d, _)| *d == date) {
                Some((_, lines)) => lines.push(line),
                None => groups.push((date, vec![line])),
            }
        }
        groups
    }

    fn append_lines(&self, date: NaiveDate, lines: &[String]) -> io::Result<()> {
        let mut payload = String::with_capacity(lines.iter().map(|l| l.len() + 1).sum());
        for line in lines {
            payload.push_str(line);
            payload.push('\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.file_path_for(date))?;
        let start = file.metadata()?.len();
        write_all_or_truncate(&mut file, start, payload.as_bytes())
    }
}

/// Append target that can be cut back to an earlier length
trait Truncate: Write {
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl Truncate for File {
    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write the whole payload or leave the target at `start` bytes, so a retried
/// flush never follows a torn line
fn write_all_or_truncate<T: Truncate>(out: &mut T, start: u64, payload: &[u8]) -> io::Result<()> {
    if let Err(e) = out.write_all(payload).and_then(|()| out.flush()) {
        if let Err(rollback) = out.truncate_to(start) {
            log::error!("❌ Could not roll back partial append: {}", rollback);
        }
        return Err(e);
    }
    Ok(())
}

impl RecordWriterBackend for BufferedJsonlWriter {
    fn append(&mut self, record: &BarRecord) -> Result<(), WriterError> {
        let line = record.to_jsonl()?;
        self.pending.push((record.open_date(), line));
        Ok(())
    }

    fn should_flush(&self) -> bool {
        self.pending.len() >= self.buffer_size
    }

    fn flush(&mut self) -> Result<usize, WriterError> {
        if self.pending.is_empty() {
            return Ok(0);
        }

        let mut groups = self.take_groups().into_iter();
        let mut written = 0;

        while let Some((date, lines)) = groups.next() {
            if let Err(e) = self.append_lines(date, &lines) {
                // Put back the failed group and everything after it, in order
                self.pending
                    .extend(lines.into_iter().map(|line| (date, line)));
                for (date, lines) in groups.by_ref() {
                    self.pending.extend(lines.into_iter().map(|line| (date, line)));
                }
                self.lines_written += written as u64;
                return Err(e.into());
            }
            written += lines.len();
        }

        self.lines_written += written as u64;
        log::debug!("💾 Flushed {} bar records", written);
        Ok(written)
    }

    fn pending(&self) -> usize {
        self.pending.len()
    }

    fn backend_type(&self) -> &'static str {
        "JSONL"
    }
}

impl Drop for BufferedJsonlWriter {
    fn drop(&mut self) {
        if let Err(e) = self.flush() {
            log::error!("❌ Dropping {} unwritten bar records: {}", self.pending.len(), e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::export_core::record::{
        EnergyCluster, Header, MifCompliance, Signatures, TradeFlow, SCHEMA_VERSION,
        WINDOW_CONVENTION,
    };
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;

    fn record(day: u32, minute: u32, bar_index: usize) -> BarRecord {
        let open_time = Utc.with_ymd_and_hms(2024, 1, day, 23, minute, 0).unwrap();
        BarRecord {
            header: Header {
                symbol: "BTCUSDT".to_string(),
                timeframe: "1m".to_string(),
                open_time,
                close_time: open_time + chrono::Duration::minutes(1),
                schema_version: SCHEMA_VERSION.to_string(),
                exporter_id: "core".to_string(),
                window_convention: WINDOW_CONVENTION.to_string(),
                bar_index,
            },
            cluster_stats: EnergyCluster::new(0, 0, vec![1.0], vec![1.0]),
            trades: TradeFlow::new(1.0, 1.0),
            urgency_metrics: None,
            liquidity_metrics: None,
            validation_metrics: None,
            ohlcv: None,
            cluster: None,
            signatures: Signatures {
                energy_conservation_ok: true,
                levels_sorted_ok: true,
                mif_compliance: MifCompliance::Full,
            },
        }
    }

    fn read_lines(path: &Path) -> Vec<String> {
        fs::read_to_string(path)
            .unwrap()
            .lines()
            .map(str::to_string)
            .collect()
    }

    #[test]
    fn test_buffers_until_threshold() {
        let dir = TempDir::new().unwrap();
        let mut writer = BufferedJsonlWriter::new(dir.path(), "bars", 3).unwrap();

        writer.append(&record(1, 0, 0)).unwrap();
        writer.append(&record(1, 1, 1)).unwrap();
        assert!(!writer.should_flush());
        assert_eq!(writer.pending(), 2);
        assert!(!writer.file_path_for(NaiveDate::from_ymd_opt(2024, 1, 1).unwrap()).exists());

        writer.append(&record(1, 2, 2)).unwrap();
        assert!(writer.should_flush());
        assert_eq!(writer.flush().unwrap(), 3);
        assert_eq!(writer.pending(), 0);
    }

    #[test]
    fn test_partitions_by_open_date() {
        let dir = TempDir::new().unwrap();
        let mut writer = BufferedJsonlWriter::new(dir.path(), "bars", 100).unwrap();

        writer.append(&record(1, 58, 0)).unwrap();
        writer.append(&record(2, 0, 1)).unwrap();
        writer.append(&record(1, 59, 2)).unwrap();
        writer.flush().unwrap();

        let day1 = read_lines(&dir.path().join("bars_20240101.jsonl"));
        let day2 = read_lines(&dir.path().join("bars_20240102.jsonl"));
        assert_eq!(day1.len(), 2);
        assert_eq!(day2.len(), 1);
        assert!(day1[0].contains("\"bar_index\":0"));
        assert!(day1[1].contains("\"bar_index\":2"));
    }

    #[test]
    fn test_flush_appends_never_rewrites() {
        let dir = TempDir::new().unwrap();
        let mut writer = BufferedJsonlWriter::new(dir.path(), "bars", 100).unwrap();

        writer.append(&record(1, 0, 0)).unwrap();
        writer.flush().unwrap();
        writer.append(&record(1, 1, 1)).unwrap();
        writer.flush().unwrap();

        let lines = read_lines(&dir.path().join("bars_20240101.jsonl"));
        assert_eq!(lines.len(), 2);
        assert_eq!(writer.lines_written(), 2);
    }

    #[test]
    fn test_failed_flush_retains_buffer() {
        let dir = TempDir::new().unwrap();
        let mut writer = BufferedJsonlWriter::new(dir.path(), "bars", 100).unwrap();
        writer.append(&record(1, 0, 0)).unwrap();
        writer.append(&record(1, 1, 1)).unwrap();

        // A directory squatting on the target file name makes the open fail
        fs::create_dir(dir.path().join("bars_20240101.jsonl")).unwrap();
        assert!(writer.flush().is_err());
        assert_eq!(writer.pending(), 2);

        fs::remove_dir(dir.path().join("bars_20240101.jsonl")).unwrap();
        assert_eq!(writer.flush().unwrap(), 2);
        assert_eq!(read_lines(&dir.path().join("bars_20240101.jsonl")).len(), 2);
    }

    /// Accepts `budget` bytes, then fails every write
    struct ShortWrite {
        data: Vec<u8>,
        budget: usize,
    }

    impl Write for ShortWrite {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = buf.len().min(self.budget);
            self.data.extend_from_slice(&buf[..n]);
            self.budget -= n;
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl Truncate for ShortWrite {
        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_torn_append_is_rolled_back() {
        let mut out = ShortWrite {
            data: b"{\"bar_index\":0}\n".to_vec(),
            budget: 5,
        };
        let start = out.data.len() as u64;

        let result = write_all_or_truncate(&mut out, start, b"{\"bar_index\":1}\n{\"bar_index\":2}\n");
        assert!(result.is_err());
        assert_eq!(out.data, b"{\"bar_index\":0}\n".to_vec());

        out.budget = usize::MAX;
        write_all_or_truncate(&mut out, start, b"{\"bar_index\":1}\n").unwrap();
        assert_eq!(out.data, b"{\"bar_index\":0}\n{\"bar_index\":1}\n".to_vec());
    }

    #[test]
    fn test_drop_flushes_partial_buffer() {
        let dir = TempDir::new().unwrap();
        {
            let mut writer = BufferedJsonlWriter::new(dir.path(), "audit", 100).unwrap();
            writer.append(&record(3, 0, 0)).unwrap();
        }
        assert_eq!(read_lines(&dir.path().join("audit_20240103.jsonl")).len(), 1);
    }
}
