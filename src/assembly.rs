use anyhow::{Context, Result};
use indicatif::ProgressBar;
use log::{error, info, warn};
use needletail::parse_fastx_file;
use rayon::prelude::*;
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Mutex, PoisonError};
use sysinfo::System;
use walkdir::WalkDir;

use crate::cluster::ClusterKey;
use crate::header::tagged_fields;
use crate::io::{open_fastq_reader, write_fastq_record, FastqRecords};

/// Contig file the assembler leaves in its output directory.
const ASSEMBLER_OUTPUT: &str = "Trinity.fasta";
/// Fixed resource parameters handed to every assembler invocation.
const ASSEMBLER_MEMORY: &str = "100G";
const ASSEMBLER_CPUS: &str = "6";

/// Drives per-cluster contig assembly over demultiplexed FASTQ input.
///
/// For every cluster key, the matching reads are staged into a private
/// working directory and handed to the external assembler; its contigs are
/// appended to one shared output FASTA under the driver's lock. Clusters
/// with a single read skip assembly entirely. A failing cluster only loses
/// its own contribution.
pub struct AssemblyDriver {
    r1: PathBuf,
    r2: Option<PathBuf>,
    output_dir: PathBuf,
    output_fa: PathBuf,
    threads: usize,
    output_lock: Mutex<()>,
}

impl AssemblyDriver {
    pub fn new(
        r1: PathBuf,
        r2: Option<PathBuf>,
        output_dir: PathBuf,
        output_fa: PathBuf,
        threads: usize,
    ) -> Self {
        AssemblyDriver {
            r1,
            r2,
            output_dir,
            output_fa,
            threads: threads.max(1),
            output_lock: Mutex::new(()),
        }
    }

    pub fn output_fasta(&self) -> &Path {
        &self.output_fa
    }

    fn mode(&self) -> &'static str {
        if self.r2.is_some() {
            "paired-end"
        } else {
            "single-end"
        }
    }

    /// Scan the demultiplexed mate-1 FASTQ and return every distinct
    /// (barcode[, umi]) key, in first-seen order.
    pub fn collect_cluster_keys(&self, has_umi: bool) -> Result<Vec<ClusterKey>> {
        let mut seen = HashSet::new();
        let mut keys = Vec::new();
        for record in FastqRecords::new(open_fastq_reader(&self.r1)?) {
            let record = record?;
            match tagged_fields(&record.header, has_umi) {
                Some((barcode, umi)) => {
                    let key = ClusterKey::new(barcode, umi);
                    if seen.insert(key.clone()) {
                        keys.push(key);
                    }
                }
                None => warn!("header carries no barcode tag: {}", record.header),
            }
        }
        Ok(keys)
    }

    /// Assemble every cluster, fanning the keys out across a fixed-size
    /// worker pool.
    ///
    /// Keys are chunked into batches no larger than the pool; one batch
    /// fully completes before the next starts, bounding peak memory and
    /// open file descriptors. Within a batch, keys are round-robin-sharded
    /// into disjoint per-worker subsets.
    pub fn assemble_all(&self, keys: &[ClusterKey]) -> Result<()> {
        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("Failed to create {}", self.output_dir.display()))?;
        File::create(&self.output_fa)
            .with_context(|| format!("Failed to create {}", self.output_fa.display()))?;

        if keys.is_empty() {
            error!("no barcode information found in {}", self.r1.display());
            return Ok(());
        }

        let has_umi = keys.iter().any(|key| key.umi.is_some());
        info!(
            "Found {} barcode{} combinations",
            keys.len(),
            if has_umi { " and UMI" } else { "" }
        );

        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .build()
            .context("Failed to build assembly worker pool")?;
        let progress = ProgressBar::new(keys.len() as u64);

        let batches: Vec<&[ClusterKey]> = keys.chunks(self.threads).collect();
        for (batch_index, batch) in batches.iter().enumerate() {
            info!(
                "Processing {} batch {}/{}",
                self.mode(),
                batch_index + 1,
                batches.len()
            );
            monitor_memory();

            let subsets: Vec<Vec<&ClusterKey>> = (0..self.threads)
                .map(|offset| batch.iter().skip(offset).step_by(self.threads).collect())
                .filter(|subset: &Vec<&ClusterKey>| !subset.is_empty())
                .collect();
            // par_iter joins before returning, so the next batch starts
            // only once every worker in this one is done.
            pool.install(|| {
                subsets.par_iter().for_each(|subset| {
                    for key in subset {
                        self.assemble_one(key);
                        progress.inc(1);
                    }
                });
            });
        }
        progress.finish();
        Ok(())
    }

    /// Bulk mode: one assembler run over the whole input, its contig file
    /// copied to the shared output. Returns whether contigs were produced.
    pub fn assemble_bulk(&self) -> Result<bool> {
        info!("Processing {} bulk data", self.mode());
        let bulk_dir = self.output_dir.join("trinity_output");
        fs::create_dir_all(&bulk_dir)
            .with_context(|| format!("Failed to create {}", bulk_dir.display()))?;

        info!("Starting assembly for bulk data");
        if !run_assembler(&self.r1, self.r2.as_deref(), &bulk_dir) {
            error!("assembler failed to run for bulk data");
            return Ok(false);
        }
        match find_assembler_output(&bulk_dir) {
            Some(contigs) => {
                fs::copy(&contigs, &self.output_fa)
                    .with_context(|| format!("Failed to copy {}", contigs.display()))?;
                info!("Bulk assembly completed successfully");
                Ok(true)
            }
            None => {
                error!("could not find assembler output file");
                Ok(false)
            }
        }
    }

    /// Process one cluster end to end. Every failure is logged and confined
    /// to this cluster; the working directory is removed no matter what.
    fn assemble_one(&self, key: &ClusterKey) {
        let output_id = key.to_string();
        let work_dir = self.output_dir.join(&output_id);
        let assembler_dir = work_dir.join("trinity");
        if let Err(e) = fs::create_dir_all(&assembler_dir) {
            error!("failed to create working directory for {}: {}", output_id, e);
            return;
        }
        let temp_r1 = work_dir.join("temp_r1.fq");
        let temp_r2 = self.r2.as_ref().map(|_| work_dir.join("temp_r2.fq"));

        let count = match self.stage_cluster_reads(key, &temp_r1, temp_r2.as_deref()) {
            Ok(count) => count,
            Err(e) => {
                error!("error staging reads for {}: {}", output_id, e);
                self.remove_work_dir(&work_dir, &output_id);
                return;
            }
        };

        if count == 1 {
            if let Err(e) = self.append_single_read(&temp_r1, &output_id) {
                error!("error writing single-read cluster {}: {}", output_id, e);
            }
            self.remove_work_dir(&work_dir, &output_id);
            return;
        }

        if run_assembler(&temp_r1, temp_r2.as_deref(), &assembler_dir) {
            match find_assembler_output(&assembler_dir) {
                Some(contigs) => {
                    if let Err(e) = self.append_contigs(&contigs, &output_id) {
                        error!("error appending contigs for {}: {}", output_id, e);
                    }
                }
                None => error!("no assembler output found for {}", output_id),
            }
        }
        self.remove_work_dir(&work_dir, &output_id);
    }

    /// Copy the reads matching `key` from the demultiplexed source(s) into
    /// per-cluster staging FASTQ file(s), returning how many matched. In
    /// paired mode both mates advance in lockstep and the mate-1 header
    /// decides the match for the pair.
    fn stage_cluster_reads(
        &self,
        key: &ClusterKey,
        temp_r1: &Path,
        temp_r2: Option<&Path>,
    ) -> Result<usize> {
        let has_umi = key.umi.is_some();
        let mut out1 = BufWriter::new(
            File::create(temp_r1).with_context(|| format!("Failed to create {}", temp_r1.display()))?,
        );
        let mut count = 0usize;

        match (self.r2.as_deref(), temp_r2) {
            (Some(r2), Some(temp_r2)) => {
                let mut out2 = BufWriter::new(
                    File::create(temp_r2)
                        .with_context(|| format!("Failed to create {}", temp_r2.display()))?,
                );
                let mut fwd = FastqRecords::new(open_fastq_reader(&self.r1)?);
                let mut rev = FastqRecords::new(open_fastq_reader(r2)?);
                loop {
                    let (rec1, rec2) = match (fwd.next(), rev.next()) {
                        (Some(rec1), Some(rec2)) => (rec1?, rec2?),
                        _ => break,
                    };
                    if matches_key(&rec1.header, key, has_umi) {
                        write_fastq_record(&mut out1, &rec1.header, &rec1.seq, &rec1.qual)?;
                        write_fastq_record(&mut out2, &rec2.header, &rec2.seq, &rec2.qual)?;
                        count += 1;
                    }
                }
                out2.flush()?;
            }
            _ => {
                for record in FastqRecords::new(open_fastq_reader(&self.r1)?) {
                    let record = record?;
                    if matches_key(&record.header, key, has_umi) {
                        write_fastq_record(&mut out1, &record.header, &record.seq, &record.qual)?;
                        count += 1;
                    }
                }
            }
        }
        out1.flush()?;
        Ok(count)
    }

    /// Single-read clusters skip assembly: the staged record's first
    /// sequence line becomes the contig.
    fn append_single_read(&self, temp_r1: &Path, output_id: &str) -> Result<()> {
        let _guard = self.output_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = self.open_shared_output()?;
        let reader = BufReader::new(
            File::open(temp_r1).with_context(|| format!("Failed to open {}", temp_r1.display()))?,
        );
        for line in reader.lines() {
            let line = line?;
            if line.starts_with('@') {
                writeln!(out, ">{}", output_id)?;
            } else if !line.starts_with('+') && !line.starts_with('!') {
                writeln!(out, "{}", line)?;
                break;
            }
        }
        out.flush()?;
        Ok(())
    }

    /// Copy every contig from the assembler's output into the shared FASTA,
    /// rewriting each header to this cluster's output id. The lock is held
    /// for the whole copy so records from different workers never
    /// interleave.
    fn append_contigs(&self, contigs: &Path, output_id: &str) -> Result<()> {
        let _guard = self.output_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut out = self.open_shared_output()?;
        let mut reader =
            parse_fastx_file(contigs).context("Failed to parse assembler output")?;
        while let Some(record) = reader.next() {
            let record = record?;
            out.write_all(b">")?;
            out.write_all(output_id.as_bytes())?;
            out.write_all(b"\n")?;
            out.write_all(&record.seq())?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        Ok(())
    }

    fn open_shared_output(&self) -> Result<BufWriter<File>> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.output_fa)
            .with_context(|| format!("Failed to open {}", self.output_fa.display()))?;
        Ok(BufWriter::new(file))
    }

    fn remove_work_dir(&self, dir: &Path, output_id: &str) {
        if let Err(e) = fs::remove_dir_all(dir) {
            warn!("failed to remove temporary directory for {}: {}", output_id, e);
        }
    }
}

fn matches_key(header: &str, key: &ClusterKey, has_umi: bool) -> bool {
    match tagged_fields(header, has_umi) {
        Some((barcode, umi)) => barcode == key.barcode && (!has_umi || umi == key.umi),
        None => false,
    }
}

/// Launch the external assembler on one set of staged reads. Returns
/// whether it exited successfully; failures are logged, never propagated.
fn run_assembler(r1: &Path, r2: Option<&Path>, output_dir: &Path) -> bool {
    let mut cmd = Command::new("Trinity");
    cmd.args(["--seqType", "fq"])
        .args(["--max_memory", ASSEMBLER_MEMORY])
        .args(["--CPU", ASSEMBLER_CPUS])
        .arg("--output")
        .arg(output_dir)
        .arg("--no_version_check");
    match r2 {
        Some(r2) => {
            cmd.arg("--left").arg(r1).arg("--right").arg(r2);
        }
        None => {
            cmd.arg("--single").arg(r1);
        }
    }
    match cmd.output() {
        Ok(output) if output.status.success() => true,
        Ok(output) => {
            error!(
                "assembler exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
            false
        }
        Err(e) => {
            error!("failed to launch assembler: {}", e);
            false
        }
    }
}

/// Locate the assembler's contig file: the standard name first, then a
/// recursive search of the working directory.
fn find_assembler_output(dir: &Path) -> Option<PathBuf> {
    let standard = dir.join(ASSEMBLER_OUTPUT);
    if standard.exists() {
        return Some(standard);
    }
    WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .find(|entry| entry.file_name() == ASSEMBLER_OUTPUT)
        .map(|entry| entry.into_path())
}

/// Log-only memory pressure check, run once per batch.
fn monitor_memory() {
    let mut sys = System::new();
    sys.refresh_memory();
    let total = sys.total_memory();
    if total == 0 {
        return;
    }
    let percent = sys.used_memory() as f64 / total as f64 * 100.0;
    if percent > 90.0 {
        warn!("High memory usage detected: {:.1}%", percent);
    }
}
