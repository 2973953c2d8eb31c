use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;

use thiserror::Error;
use tracing::info;

use crate::feature::FlowFeature;

/// Enumeration of errors returned by a `SinkWriter`. All of them are fatal to the pipeline.
#[derive(Error, Debug)]
pub enum SinkError {
    #[error("failed to write to output: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to write csv row: {0}")]
    Csv(#[from] csv::Error),
    #[error("header row was already written")]
    HeaderAlreadyWritten,
    #[error("a record was written before the header row")]
    HeaderMissing,
    #[error("record has {actual} fields but the header has {expected} columns")]
    ColumnMismatch { expected: usize, actual: usize },
}

/// Append-only destination for decoded flow features.
///
/// `write_header` is called exactly once, before any record. Every record is
/// expected to be flushed before the next one is written.
pub trait SinkWriter: Send {
    fn write_header(&mut self, columns: &[&str]) -> Result<(), SinkError>;
    fn write_record(&mut self, record: &FlowFeature) -> Result<(), SinkError>;
    fn flush(&mut self) -> Result<(), SinkError>;
}

/// CSV sink over any `Write`. Rows have exactly as many fields as the header.
pub struct CsvSink<W: Write> {
    writer: csv::Writer<W>,
    header_columns: Option<usize>,
    header_present: bool,
    records_written: u64,
}

impl CsvSink<File> {
    /// Open `path` for appending, creating it if needed. A file that already has
    /// content is assumed to start with a header row, which is not repeated.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, SinkError> {
        let path = path.as_ref();
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let header_present = file.metadata()?.len() > 0;

        info!(
            path = %path.display(),
            header_present,
            "opened csv output"
        );

        let mut sink = Self::new(file);
        sink.header_present = header_present;
        Ok(sink)
    }
}

impl<W: Write> CsvSink<W> {
    pub fn new(inner: W) -> Self {
        let writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(inner);

        Self {
            writer,
            header_columns: None,
            header_present: false,
            records_written: 0,
        }
    }

    pub fn records_written(&self) -> u64 {
        self.records_written
    }

    /// Flush and return the underlying writer.
    pub fn into_inner(self) -> Result<W, SinkError> {
        self.writer
            .into_inner()
            .map_err(|e| SinkError::Io(std::io::Error::new(e.error().kind(), e.to_string())))
    }
}

impl<W: Write + Send> SinkWriter for CsvSink<W> {
    fn write_header(&mut self, columns: &[&str]) -> Result<(), SinkError> {
        if self.header_columns.is_some() {
            return Err(SinkError::HeaderAlreadyWritten);
        }
        if !self.header_present {
            self.writer.write_record(columns)?;
            self.writer.flush()?;
        }
        self.header_columns = Some(columns.len());
        Ok(())
    }

    fn write_record(&mut self, record: &FlowFeature) -> Result<(), SinkError> {
        let Some(expected) = self.header_columns else {
            return Err(SinkError::HeaderMissing);
        };

        let row = record.to_row();
        if row.len() != expected {
            return Err(SinkError::ColumnMismatch {
                expected,
                actual: row.len(),
            });
        }

        self.writer.write_record(&row)?;
        self.records_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), SinkError> {
        Ok(self.writer.flush()?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::feature::tests::sample_message;
    use crate::feature::FeatureMessage;

    fn sample_feature(server_name: &str) -> FlowFeature {
        let payload = serde_json::to_vec(&sample_message(server_name)).unwrap();
        FeatureMessage::decode(&payload).unwrap().feature
    }

    fn lines(bytes: Vec<u8>) -> Vec<String> {
        String::from_utf8(bytes)
            .unwrap()
            .lines()
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn header_is_written_once_before_rows() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write_header(&FlowFeature::COLUMNS).unwrap();
        sink.write_record(&sample_feature("one.example")).unwrap();
        sink.write_record(&sample_feature("two.example")).unwrap();
        sink.flush().unwrap();
        assert_eq!(sink.records_written(), 2);

        let lines = lines(sink.into_inner().unwrap());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], FlowFeature::COLUMNS.join(","));
        assert!(lines[1].ends_with(",one.example"));
        assert!(lines[2].ends_with(",two.example"));
        for line in &lines {
            assert_eq!(line.split(',').count(), FlowFeature::COLUMNS.len());
        }
    }

    #[test]
    fn second_header_is_rejected() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write_header(&FlowFeature::COLUMNS).unwrap();
        assert!(matches!(
            sink.write_header(&FlowFeature::COLUMNS),
            Err(SinkError::HeaderAlreadyWritten)
        ));
    }

    #[test]
    fn record_before_header_is_rejected() {
        let mut sink = CsvSink::new(Vec::new());
        assert!(matches!(
            sink.write_record(&sample_feature("x")),
            Err(SinkError::HeaderMissing)
        ));
        assert!(sink.into_inner().unwrap().is_empty());
    }

    #[test]
    fn header_must_match_record_width() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write_header(&FlowFeature::COLUMNS[..40]).unwrap();
        assert!(matches!(
            sink.write_record(&sample_feature("x")),
            Err(SinkError::ColumnMismatch {
                expected: 40,
                actual: 41
            })
        ));
    }

    #[test]
    fn server_names_with_separators_are_quoted() {
        let mut sink = CsvSink::new(Vec::new());
        sink.write_header(&FlowFeature::COLUMNS).unwrap();
        sink.write_record(&sample_feature("a,b")).unwrap();

        let output = String::from_utf8(sink.into_inner().unwrap()).unwrap();
        assert!(output.lines().nth(1).unwrap().ends_with(",\"a,b\""));
    }

    #[test]
    fn reopened_file_keeps_a_single_header() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("feature.csv");

        for name in ["first.example", "second.example"] {
            let mut sink = CsvSink::open(&path).unwrap();
            sink.write_header(&FlowFeature::COLUMNS).unwrap();
            sink.write_record(&sample_feature(name)).unwrap();
            sink.flush().unwrap();
        }

        let lines = lines(std::fs::read(&path).unwrap());
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0], FlowFeature::COLUMNS.join(","));
        assert!(lines[1].ends_with(",first.example"));
        assert!(lines[2].ends_with(",second.example"));
    }
}
