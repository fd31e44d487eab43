//! Splits the ordered source list into fixed-size, zero-padded partitions.
//!
//! The source is streamed twice: once to count records (so the id width is
//! known up front and lexicographic order matches numeric order) and once to
//! write the partition files. Nothing is held in memory beyond one record.

use crate::error::RunError;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

const MIN_ID_WIDTH: usize = 2;

/// One contiguous slice of the source, persisted as its own file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Partition {
    /// Zero-padded sequence number, e.g. `"07"`.
    pub id: String,
    pub path: PathBuf,
    pub item_count: u64,
}

#[cfg(test)]
impl Partition {
    /// Items in original order. Reads the partition file.
    pub fn items(&self) -> std::io::Result<Vec<String>> {
        let file = File::open(&self.path)?;
        BufReader::new(file).lines().collect()
    }
}

pub fn file_name(id: &str) -> String {
    format!("chunk_{id}.txt")
}

/// Width such that every id in `0..partitions` has the same number of digits.
pub fn id_width(partitions: usize) -> usize {
    let last = partitions.saturating_sub(1);
    last.to_string().len().max(MIN_ID_WIDTH)
}

pub fn format_id(index: usize, width: usize) -> String {
    format!("{index:0width$}")
}

/// Split `source` into partitions of at most `chunk_size` records under `target_dir`.
///
/// `target_dir` is created if missing and must otherwise be empty.
pub fn partition_source(
    source: &Path,
    chunk_size: usize,
    target_dir: &Path,
) -> Result<Vec<Partition>, RunError> {
    if chunk_size == 0 {
        return Err(RunError::Partition(
            "partition size must be greater than zero".into(),
        ));
    }

    let total = count_records(source)?;
    if total == 0 {
        return Err(RunError::Partition(format!(
            "source {} is empty",
            source.display()
        )));
    }

    prepare_target(target_dir)?;

    let chunk = chunk_size as u64;
    let partitions = total.div_ceil(chunk) as usize;
    let width = id_width(partitions);
    debug!(total, partitions, width, "partitioning source");

    let mut reader = open_source(source)?;
    let mut out = Vec::with_capacity(partitions);
    let mut buf = Vec::with_capacity(256);
    let mut written = 0u64;

    for index in 0..partitions {
        let id = format_id(index, width);
        let path = target_dir.join(file_name(&id));
        let file = File::create(&path).map_err(|e| write_error(&path, e))?;
        let mut w = BufWriter::new(file);
        let mut count = 0u64;

        while count < chunk {
            buf.clear();
            let n = reader
                .read_until(b'\n', &mut buf)
                .map_err(|e| read_error(source, e))?;
            if n == 0 {
                break;
            }
            if buf.last() != Some(&b'\n') {
                buf.push(b'\n');
            }
            w.write_all(&buf).map_err(|e| write_error(&path, e))?;
            count += 1;
        }
        w.flush().map_err(|e| write_error(&path, e))?;

        if count == 0 {
            // Source shrank between the two passes.
            let _ = fs::remove_file(&path);
            break;
        }
        written += count;
        out.push(Partition {
            id,
            path,
            item_count: count,
        });
    }

    if written != total {
        return Err(RunError::Partition(format!(
            "source {} changed while partitioning ({} records counted, {} written)",
            source.display(),
            total,
            written
        )));
    }

    info!(
        partitions = out.len(),
        items = total,
        chunk_size,
        "source partitioned"
    );
    Ok(out)
}

fn open_source(source: &Path) -> Result<BufReader<File>, RunError> {
    File::open(source)
        .map(BufReader::new)
        .map_err(|e| read_error(source, e))
}

fn count_records(source: &Path) -> Result<u64, RunError> {
    let mut reader = open_source(source)?;
    let mut buf = Vec::with_capacity(256);
    let mut count = 0u64;
    loop {
        buf.clear();
        let n = reader
            .read_until(b'\n', &mut buf)
            .map_err(|e| read_error(source, e))?;
        if n == 0 {
            return Ok(count);
        }
        count += 1;
    }
}

fn prepare_target(dir: &Path) -> Result<(), RunError> {
    fs::create_dir_all(dir).map_err(|e| write_error(dir, e))?;
    let mut entries = fs::read_dir(dir).map_err(|e| read_error(dir, e))?;
    if entries.next().is_some() {
        return Err(RunError::Partition(format!(
            "partition directory {} is not empty",
            dir.display()
        )));
    }
    Ok(())
}

fn read_error(path: &Path, e: std::io::Error) -> RunError {
    RunError::Partition(format!("cannot read {}: {e}", path.display()))
}

fn write_error(path: &Path, e: std::io::Error) -> RunError {
    RunError::Partition(format!("cannot write {}: {e}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_source(dir: &Path, lines: &[String]) -> PathBuf {
        let path = dir.join("source.txt");
        let mut body = lines.join("\n");
        body.push('\n');
        fs::write(&path, body).unwrap();
        path
    }

    fn domains(n: usize) -> Vec<String> {
        (0..n).map(|i| format!("host{i}.example.com")).collect()
    }

    #[test]
    fn twenty_five_items_in_chunks_of_ten() {
        let tmp = tempfile::tempdir().unwrap();
        let input = domains(25);
        let source = write_source(tmp.path(), &input);

        let parts = partition_source(&source, 10, &tmp.path().join("parts")).unwrap();

        let ids: Vec<_> = parts.iter().map(|p| p.id.as_str()).collect();
        assert_eq!(ids, ["00", "01", "02"]);
        let sizes: Vec<_> = parts.iter().map(|p| p.item_count).collect();
        assert_eq!(sizes, [10, 10, 5]);

        let rebuilt: Vec<String> = parts.iter().flat_map(|p| p.items().unwrap()).collect();
        assert_eq!(rebuilt, input);
    }

    #[test]
    fn exact_multiple_has_no_trailing_empty_partition() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), &domains(20));
        let parts = partition_source(&source, 10, &tmp.path().join("parts")).unwrap();
        assert_eq!(parts.len(), 2);
    }

    #[test]
    fn missing_final_newline_keeps_last_record() {
        let tmp = tempfile::tempdir().unwrap();
        let source = tmp.path().join("source.txt");
        fs::write(&source, "a\n\nb\nc").unwrap();

        let parts = partition_source(&source, 2, &tmp.path().join("parts")).unwrap();
        let items: Vec<String> = parts.iter().flat_map(|p| p.items().unwrap()).collect();
        assert_eq!(items, ["a", "", "b", "c"]);
    }

    #[test]
    fn repeat_runs_are_byte_identical() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), &domains(33));
        let a = partition_source(&source, 7, &tmp.path().join("a")).unwrap();
        let b = partition_source(&source, 7, &tmp.path().join("b")).unwrap();
        assert_eq!(a.len(), b.len());
        for (pa, pb) in a.iter().zip(&b) {
            assert_eq!(pa.id, pb.id);
            assert_eq!(fs::read(&pa.path).unwrap(), fs::read(&pb.path).unwrap());
        }
    }

    #[test]
    fn ids_widen_past_two_digits() {
        assert_eq!(id_width(1), 2);
        assert_eq!(id_width(100), 2);
        assert_eq!(id_width(101), 3);

        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), &domains(101));
        let parts = partition_source(&source, 1, &tmp.path().join("parts")).unwrap();
        assert_eq!(parts.first().unwrap().id, "000");
        assert_eq!(parts.last().unwrap().id, "100");
        let mut sorted: Vec<_> = parts.iter().map(|p| p.id.clone()).collect();
        sorted.sort();
        assert_eq!(sorted, parts.iter().map(|p| p.id.clone()).collect::<Vec<_>>());
    }

    #[test]
    fn rejects_bad_input() {
        let tmp = tempfile::tempdir().unwrap();
        let empty = tmp.path().join("empty.txt");
        fs::write(&empty, "").unwrap();
        assert!(matches!(
            partition_source(&empty, 10, &tmp.path().join("p1")),
            Err(RunError::Partition(_))
        ));

        let source = write_source(tmp.path(), &domains(3));
        assert!(matches!(
            partition_source(&source, 0, &tmp.path().join("p2")),
            Err(RunError::Partition(_))
        ));

        assert!(matches!(
            partition_source(&tmp.path().join("missing.txt"), 10, &tmp.path().join("p3")),
            Err(RunError::Partition(_))
        ));
    }

    #[test]
    fn refuses_non_empty_target() {
        let tmp = tempfile::tempdir().unwrap();
        let source = write_source(tmp.path(), &domains(3));
        let target = tmp.path().join("parts");
        fs::create_dir_all(&target).unwrap();
        fs::write(target.join("stale.txt"), "x").unwrap();
        assert!(partition_source(&source, 10, &target).is_err());
    }
}
