//! Sample log
//!
//! Plain CSV, one header line then one line per sample, CRLF-terminated:
//!
//! ```text
//! ins,l_cycle,ref_cycle,event1,event2,event3,event4
//! 50003,120388,96220,9012,41,310,77
//! ```
//!
//! Rows are formatted into fixed buffers and handed to an [`OutputSink`]
//! in chunks, so exporting a full table needs no allocation.

use core::fmt::{self, Write};

use super::sample::{Sample, SampleBuffer};
use crate::rtl::LineBuffer;

/// Column header, first line of every log
pub const HEADER: &str = "ins,l_cycle,ref_cycle,event1,event2,event3,event4\r\n";

/// Longest possible row: seven 20-digit values, six commas, CRLF
pub const ROW_CAPACITY: usize = 7 * 20 + 6 + 2;

/// Bytes collected before each sink write
pub const CHUNK_CAPACITY: usize = 1024;

/// One formatted row
pub type Row = LineBuffer<ROW_CAPACITY>;

/// Output errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputError {
    /// File I/O attempted above PASSIVE_LEVEL
    NotPassiveLevel(u8),
    /// The output file could not be created (NTSTATUS)
    Create(i32),
    /// A write failed (NTSTATUS)
    Write(i32),
    /// The sink accepted fewer bytes than it was given
    ShortWrite { expected: usize, written: usize },
}

impl fmt::Display for OutputError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OutputError::NotPassiveLevel(irql) => {
                write!(f, "file output needs PASSIVE_LEVEL, running at {}", irql)
            }
            OutputError::Create(status) => write!(f, "create failed: {:#010x}", *status as u32),
            OutputError::Write(status) => write!(f, "write failed: {:#010x}", *status as u32),
            OutputError::ShortWrite { expected, written } => {
                write!(f, "short write: {} of {} bytes", written, expected)
            }
        }
    }
}

/// Destination for the sample log
pub trait OutputSink {
    /// Append bytes to the log
    fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError>;
}

/// Format a sample as one CSV row
pub fn format_row(sample: &Sample, row: &mut Row) {
    row.clear();
    for (i, value) in sample.values().iter().enumerate() {
        if i > 0 {
            let _ = row.write_char(',');
        }
        let _ = write!(row, "{}", value);
    }
    let _ = row.write_str("\r\n");
}

/// Chunked writer over a sink
struct ChunkWriter<'a, S: OutputSink> {
    sink: &'a mut S,
    chunk: LineBuffer<CHUNK_CAPACITY>,
}

impl<'a, S: OutputSink> ChunkWriter<'a, S> {
    fn new(sink: &'a mut S) -> Self {
        Self {
            sink,
            chunk: LineBuffer::new(),
        }
    }

    fn push(&mut self, text: &str) -> Result<(), OutputError> {
        if self.chunk.len() + text.len() > CHUNK_CAPACITY {
            self.flush()?;
        }
        // Rows and the header always fit in an empty chunk
        let _ = self.chunk.write_str(text);
        Ok(())
    }

    fn flush(&mut self) -> Result<(), OutputError> {
        if !self.chunk.is_empty() {
            self.sink.write_all(self.chunk.as_bytes())?;
            self.chunk.clear();
        }
        Ok(())
    }
}

/// Write the header and every stored sample, returning the row count
pub fn export_samples<S: OutputSink>(sink: &mut S, samples: &SampleBuffer) -> Result<usize, OutputError> {
    let mut writer = ChunkWriter::new(sink);
    writer.push(HEADER)?;

    let mut row = Row::new();
    for sample in samples.iter() {
        format_row(sample, &mut row);
        writer.push(row.as_str())?;
    }

    writer.flush()?;
    Ok(samples.len())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::perf::counters::BANK_SIZE;

    struct MemorySink {
        data: Vec<u8>,
        writes: usize,
    }

    impl OutputSink for MemorySink {
        fn write_all(&mut self, bytes: &[u8]) -> Result<(), OutputError> {
            self.data.extend_from_slice(bytes);
            self.writes += 1;
            Ok(())
        }
    }

    struct FailingSink;

    impl OutputSink for FailingSink {
        fn write_all(&mut self, _bytes: &[u8]) -> Result<(), OutputError> {
            Err(OutputError::Write(0xC000_007Fu32 as i32))
        }
    }

    fn sink() -> MemorySink {
        MemorySink {
            data: Vec::new(),
            writes: 0,
        }
    }

    #[test]
    fn test_row_format() {
        let mut row = Row::new();
        format_row(&Sample([50_003, 1, 2, 3, 4, 5, 6]), &mut row);
        assert_eq!(row.as_str(), "50003,1,2,3,4,5,6\r\n");

        format_row(&Sample([u64::MAX; BANK_SIZE]), &mut row);
        assert!(!row.overflowed());
    }

    #[test]
    fn test_export_empty_log_has_header() {
        let samples = SampleBuffer::with_capacity(4).unwrap();
        let mut out = sink();
        assert_eq!(export_samples(&mut out, &samples), Ok(0));
        assert_eq!(out.data, HEADER.as_bytes());
    }

    #[test]
    fn test_export_rows() {
        let mut samples = SampleBuffer::with_capacity(4).unwrap();
        samples.push(Sample([50_003, 1000, 900, 10, 2, 30, 4]));
        samples.push(Sample([0; BANK_SIZE]));

        let mut out = sink();
        assert_eq!(export_samples(&mut out, &samples), Ok(2));
        assert_eq!(
            core::str::from_utf8(&out.data).unwrap(),
            "ins,l_cycle,ref_cycle,event1,event2,event3,event4\r\n\
             50003,1000,900,10,2,30,4\r\n\
             0,0,0,0,0,0,0\r\n"
        );
    }

    #[test]
    fn test_export_is_chunked() {
        let mut samples = SampleBuffer::with_capacity(1000).unwrap();
        for i in 0..1000 {
            samples.push(Sample([i; BANK_SIZE]));
        }

        let mut out = sink();
        export_samples(&mut out, &samples).unwrap();
        assert!(out.writes > 1);

        let text = core::str::from_utf8(&out.data).unwrap();
        assert_eq!(text.lines().count(), 1001);
        assert!(text.ends_with("999,999,999,999,999,999,999\r\n"));
    }

    #[test]
    fn test_sink_error_propagates() {
        let mut samples = SampleBuffer::with_capacity(1).unwrap();
        samples.push(Sample([1; BANK_SIZE]));
        assert!(matches!(
            export_samples(&mut FailingSink, &samples),
            Err(OutputError::Write(_))
        ));
    }
}
