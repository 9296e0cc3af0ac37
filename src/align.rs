use anyhow::{bail, Context, Result};
use log::info;
use std::ffi::OsString;
use std::fs::{self, File};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

/// Suffixes of a complete aligner index.
const INDEX_SUFFIXES: [&str; 5] = [".bwt", ".pac", ".ann", ".amb", ".sa"];

fn with_suffix(prefix: &Path, suffix: &str) -> PathBuf {
    let mut os: OsString = prefix.as_os_str().to_os_string();
    os.push(suffix);
    PathBuf::from(os)
}

/// Make sure an aligner index for `reference` exists under `index_dir`,
/// building one when any of the expected index files is missing. A failed
/// index build is fatal to the run.
pub fn ensure_index(reference: &Path, index_dir: &Path) -> Result<PathBuf> {
    fs::create_dir_all(index_dir)
        .with_context(|| format!("Failed to create {}", index_dir.display()))?;
    let name = reference
        .file_name()
        .with_context(|| format!("Reference path {} has no file name", reference.display()))?;
    let prefix = index_dir.join(name);

    if INDEX_SUFFIXES
        .iter()
        .all(|suffix| with_suffix(&prefix, suffix).exists())
    {
        info!("Index already present, alignment begins");
        return Ok(prefix);
    }

    info!("Building aligner index for {}", reference.display());
    let status = Command::new("bwa")
        .arg("index")
        .arg("-p")
        .arg(&prefix)
        .arg(reference)
        .status()
        .context("Failed to launch bwa index")?;
    if !status.success() {
        bail!("Index generation failed with {}", status);
    }
    info!("Index generation successful");
    Ok(prefix)
}

/// Align reads with `bwa mem`, keeping only mapped records, and write the
/// result to `output_sam`. Alignment failure is fatal to the run.
pub fn run_aligner(
    index_prefix: &Path,
    fq1: &Path,
    fq2: Option<&Path>,
    output_sam: &Path,
    threads: usize,
) -> Result<PathBuf> {
    let mut bwa = Command::new("bwa");
    bwa.arg("mem")
        .arg("-t")
        .arg(threads.to_string())
        .arg("-M")
        .arg(index_prefix)
        .arg(fq1);
    if let Some(fq2) = fq2 {
        bwa.arg(fq2);
    }
    let mut bwa = bwa
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        .spawn()
        .context("Failed to launch bwa mem")?;
    let bwa_out = bwa
        .stdout
        .take()
        .context("bwa mem produced no stdout handle")?;

    // unmapped records (flag 0x4) are dropped here, the header kept
    let view_status = Command::new("samtools")
        .args(["view", "-F", "4", "-h", "-o"])
        .arg(output_sam)
        .arg("-")
        .stdin(Stdio::from(bwa_out))
        .status()
        .context("Failed to launch samtools view")?;
    let bwa_status = bwa.wait().context("Failed to wait for bwa mem")?;

    if !bwa_status.success() {
        bail!("Alignment failed with {}", bwa_status);
    }
    if !view_status.success() {
        bail!("samtools view failed with {}", view_status);
    }
    Ok(output_sam.to_path_buf())
}

/// Convert the mapped records of `input_sam` back to FASTQ via samtools.
/// Paired mode drops pairs where either mate is unmapped (flag 0xC);
/// single-end mode drops unmapped reads (flag 0x4).
pub fn extract_mapped_fastq(
    input_sam: &Path,
    out_fq1: &Path,
    out_fq2: Option<&Path>,
) -> Result<()> {
    if !input_sam.exists() {
        bail!("Input file {} does not exist", input_sam.display());
    }

    let flag = if out_fq2.is_some() { "12" } else { "4" };
    let mut view = Command::new("samtools")
        .args(["view", "-h", "-F", flag])
        .arg(input_sam)
        .stdout(Stdio::piped())
        .spawn()
        .context("Failed to launch samtools view")?;
    let view_out = view
        .stdout
        .take()
        .context("samtools view produced no stdout handle")?;

    let mut fastq = Command::new("samtools");
    fastq.arg("fastq").arg("-");
    match out_fq2 {
        Some(out_fq2) => {
            fastq.arg("-1").arg(out_fq1).arg("-2").arg(out_fq2);
        }
        None => {
            let out = File::create(out_fq1)
                .with_context(|| format!("Failed to create {}", out_fq1.display()))?;
            fastq.stdout(Stdio::from(out));
        }
    }
    let fastq_status = fastq
        .stdin(Stdio::from(view_out))
        .status()
        .context("Failed to launch samtools fastq")?;
    let view_status = view.wait().context("Failed to wait for samtools view")?;

    if !view_status.success() || !fastq_status.success() {
        bail!(
            "Mapped-read extraction from {} failed",
            input_sam.display()
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_with_suffix_appends_to_full_name() {
        let prefix = Path::new("/idx/ref.fa");
        assert_eq!(with_suffix(prefix, ".bwt"), Path::new("/idx/ref.fa.bwt"));
    }

    #[test]
    fn test_extract_requires_existing_sam() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("absent.sam");
        let out = dir.path().join("out.fastq");
        assert!(extract_mapped_fastq(&missing, &out, None).is_err());
    }
}
