use anyhow::{Context, Result};
use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

/// Renumber the contig headers of a FASTA file in place.
///
/// Several contigs may share an id after assembly (every contig of a cluster
/// is tagged with the cluster's output id). This pass rewrites each header
/// to `<barcode_part>_<n>`, where `barcode_part` is the id substring before
/// the first `_` (the whole id when there is none) and `n` counts up from 1
/// per barcode part, in file order. Sequence lines pass through unchanged.
///
/// The rewrite goes to a sibling `.tmp` file that replaces the original on
/// success; on any failure the temp file is removed and the original is
/// left as it was.
pub fn renumber_contigs(path: &Path) -> Result<()> {
    let tmp = tmp_path(path);
    let outcome = rewrite(path, &tmp).and_then(|_| {
        fs::rename(&tmp, path)
            .with_context(|| format!("Failed to replace {}", path.display()))
    });
    if let Err(e) = outcome {
        let _ = fs::remove_file(&tmp);
        return Err(e);
    }
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".tmp");
    PathBuf::from(os)
}

fn rewrite(src: &Path, dst: &Path) -> Result<()> {
    let reader =
        BufReader::new(File::open(src).with_context(|| format!("Failed to open {}", src.display()))?);
    let mut writer = BufWriter::new(
        File::create(dst).with_context(|| format!("Failed to create {}", dst.display()))?,
    );
    let mut counters: HashMap<String, u64> = HashMap::new();

    for line in reader.lines() {
        let line = line?;
        if let Some(id) = line.strip_prefix('>') {
            let id = id.trim();
            let barcode_part = id.split('_').next().unwrap_or(id);
            let n = counters.entry(barcode_part.to_string()).or_insert(0);
            *n += 1;
            writeln!(writer, ">{}_{}", barcode_part, n)?;
        } else {
            writeln!(writer, "{}", line)?;
        }
    }
    writer.flush()?;
    Ok(())
}
