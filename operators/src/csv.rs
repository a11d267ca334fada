//! Morsel-parallel CSV loading into a [`ParallelChunkedStorage`].
//!
//! The file is divided into fixed-size morsels claimed from an atomic
//! offset. Every worker reads its morsel plus one page of overlap with
//! positioned reads, skips through the first newline (which also skips the
//! header line in the first morsel), and parses through the first newline
//! past the morsel end, so every line is parsed by exactly one worker.
//!
//! Malformed fields are substituted with sentinels rather than reported:
//! integers become `u64::MAX`, floats become NaN. Operators decide whether
//! to filter such rows.

use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use udo_storage::ParallelChunkedStorage;

use crate::kmeans::PointTuple;
use crate::regression::SampleTuple;

const PAGE_SIZE: usize = 4096;
const MORSEL_SIZE: usize = PAGE_SIZE * 16;

/// A tuple type that can be parsed from one CSV line.
pub trait CsvRecord: Sized {
    /// Parses one line, without the terminating newline.
    fn parse_line(line: &str) -> Self;
}

/// Parses an unsigned integer field, substituting `u64::MAX` on failure.
pub fn parse_u64_field(field: &str) -> u64 {
    field.parse().unwrap_or(u64::MAX)
}

/// Parses a float field, substituting NaN on failure.
pub fn parse_f64_field(field: &str) -> f64 {
    field.parse().unwrap_or(f64::NAN)
}

impl CsvRecord for PointTuple {
    fn parse_line(line: &str) -> Self {
        let mut fields = line.split(',');
        let x = parse_f64_field(fields.next().unwrap_or(""));
        let y = parse_f64_field(fields.next().unwrap_or(""));
        let payload = parse_u64_field(fields.next().unwrap_or(""));
        Self { x, y, payload }
    }
}

impl CsvRecord for SampleTuple {
    fn parse_line(line: &str) -> Self {
        let mut fields = line.split(',');
        let x = parse_f64_field(fields.next().unwrap_or(""));
        let y = parse_f64_field(fields.next().unwrap_or(""));
        Self { x, y }
    }
}

/// The byte offset just past the next newline at or after `from`, or the end
/// of the data.
fn next_line_start(data: &[u8], from: usize) -> usize {
    match data[from..].iter().position(|&b| b == b'\n') {
        Some(i) => from + i + 1,
        None => data.len(),
    }
}

/// Loads a CSV file with a header line into a per-worker chunked storage,
/// using `num_threads` parallel readers.
pub fn load_csv<R: CsvRecord + Send>(
    path: &Path,
    num_threads: usize,
) -> io::Result<ParallelChunkedStorage<R>> {
    let file = File::open(path)?;
    let metadata = file.metadata()?;
    if !metadata.is_file() {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("{} is not a regular file", path.display()),
        ));
    }
    let file_size = metadata.len();

    let num_threads = num_threads.max(1);
    let cursor = AtomicU64::new(0);
    let storage = ParallelChunkedStorage::new();

    std::thread::scope(|scope| -> io::Result<()> {
        let mut workers = Vec::new();
        for thread_id in 0..num_threads as u32 {
            let file = &file;
            let cursor = &cursor;
            let storage = &storage;
            workers.push(scope.spawn(move || -> io::Result<()> {
                let mut local = storage.create_local_storage(thread_id);
                let mut buffer = vec![0u8; MORSEL_SIZE + PAGE_SIZE];

                loop {
                    let offset = cursor.fetch_add(MORSEL_SIZE as u64, Ordering::Relaxed);
                    if offset >= file_size {
                        break;
                    }
                    let remaining = (file_size - offset) as usize;
                    let to_read = remaining.min(MORSEL_SIZE + PAGE_SIZE);
                    file.read_exact_at(&mut buffer[..to_read], offset)?;
                    let data = &buffer[..to_read];

                    // Skipping through the first newline drops the header in
                    // the first morsel and the partial line every later
                    // morsel starts in.
                    let begin = next_line_start(data, 0);
                    let end = if remaining < MORSEL_SIZE {
                        to_read
                    } else {
                        next_line_start(data, MORSEL_SIZE)
                    };
                    if begin >= end {
                        continue;
                    }

                    let mut segment = &data[begin..end];
                    while !segment.is_empty() {
                        let line_end = segment
                            .iter()
                            .position(|&b| b == b'\n')
                            .unwrap_or(segment.len());
                        let line = std::str::from_utf8(&segment[..line_end]).unwrap_or("");
                        local.push(R::parse_line(line));
                        segment = &segment[(line_end + 1).min(segment.len())..];
                    }
                }
                Ok(())
            }));
        }
        for worker in workers {
            worker.join().expect("csv loader thread panicked")?;
        }
        Ok(())
    })?;

    Ok(storage)
}
