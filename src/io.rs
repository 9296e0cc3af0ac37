use anyhow::{Context, Result};
use flate2::read::MultiGzDecoder;
use std::fs::File;
use std::io::{BufRead, BufReader, Write};
use std::path::Path;

/// A raw FASTQ record as it appears on disk. The header keeps its leading
/// `@` so records can be rewritten byte-for-byte later in the pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub header: String,
    pub seq: String,
    pub qual: String,
}

/// Open a FASTQ file for reading. If the filename ends with `.gz` the
/// stream is transparently decompressed.
pub fn open_fastq_reader(path: &Path) -> Result<Box<dyn BufRead>> {
    let file = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    if path.extension().map_or(false, |e| e == "gz") {
        Ok(Box::new(BufReader::new(MultiGzDecoder::new(file))))
    } else {
        Ok(Box::new(BufReader::new(file)))
    }
}

/// Write a single 4-line FASTQ record. `header` is expected to carry its
/// leading `@`; the separator line is always a bare `+`.
pub fn write_fastq_record<W: Write>(w: &mut W, header: &str, seq: &str, qual: &str) -> Result<()> {
    writeln!(w, "{}", header)?;
    writeln!(w, "{}", seq)?;
    w.write_all(b"+\n")?;
    writeln!(w, "{}", qual)?;
    Ok(())
}

/// Iterator over the fixed 4-line groups of a FASTQ stream.
///
/// Reading is strictly positional: header, sequence, separator, quality. A
/// trailing group with fewer than 4 lines is silently dropped.
pub struct FastqRecords<R> {
    reader: R,
}

impl<R: BufRead> FastqRecords<R> {
    pub fn new(reader: R) -> Self {
        FastqRecords { reader }
    }

    fn read_line(&mut self) -> Result<Option<String>> {
        let mut line = String::new();
        match self.reader.read_line(&mut line) {
            Ok(0) => Ok(None),
            Ok(_) => Ok(Some(line.trim().to_string())),
            Err(e) => Err(e.into()),
        }
    }
}

impl<R: BufRead> Iterator for FastqRecords<R> {
    type Item = Result<RawRecord>;

    fn next(&mut self) -> Option<Self::Item> {
        let header = match self.read_line() {
            Ok(Some(line)) => line,
            Ok(None) => return None,
            Err(e) => return Some(Err(e)),
        };
        let mut rest = [String::new(), String::new(), String::new()];
        for slot in rest.iter_mut() {
            match self.read_line() {
                Ok(Some(line)) => *slot = line,
                // Partial final record: drop it without complaint.
                Ok(None) => return None,
                Err(e) => return Some(Err(e)),
            }
        }
        let [seq, _separator, qual] = rest;
        Some(Ok(RawRecord { header, seq, qual }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::write::GzEncoder;
    use flate2::Compression;
    use std::io::Cursor;

    #[test]
    fn test_fastq_records_groups_of_four() {
        let data = "@r1\nACGT\n+\nIIII\n@r2\nTTTT\n+\nJJJJ\n";
        let records: Vec<_> = FastqRecords::new(Cursor::new(data))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].header, "@r1");
        assert_eq!(records[0].seq, "ACGT");
        assert_eq!(records[0].qual, "IIII");
        assert_eq!(records[1].header, "@r2");
    }

    #[test]
    fn test_partial_final_record_is_dropped() {
        let data = "@r1\nACGT\n+\nIIII\n@r2\nTTTT\n";
        let records: Vec<_> = FastqRecords::new(Cursor::new(data))
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].header, "@r1");
    }

    #[test]
    fn test_gzip_input_detected_by_suffix() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reads.fastq.gz");
        let mut enc = GzEncoder::new(File::create(&path).unwrap(), Compression::default());
        enc.write_all(b"@r1\nACGT\n+\nIIII\n").unwrap();
        enc.finish().unwrap();

        let records: Vec<_> = FastqRecords::new(open_fastq_reader(&path).unwrap())
            .collect::<Result<Vec<_>>>()
            .unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].seq, "ACGT");
    }

    #[test]
    fn test_write_fastq_record_format() {
        let mut buf = Vec::new();
        write_fastq_record(&mut buf, "@r1 1:AAAA", "ACGT", "IIII").unwrap();
        assert_eq!(buf, b"@r1 1:AAAA\nACGT\n+\nIIII\n");
    }
}
