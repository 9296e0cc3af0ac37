use anyhow::Result;
use clap::Parser;
use log::{error, info, warn};
use std::fs;
use std::path::{Path, PathBuf};

use tcrasm::assembly::AssemblyDriver;
use tcrasm::{align, annotate, cluster, index, rename};

#[derive(Parser, Debug)]
#[command(
    author,
    version,
    about = "TCR repertoire pipeline - align, demultiplex, assemble and annotate V(D)J reads"
)]
struct Args {
    /// Reference genome FASTA
    #[arg(short = 'r', long)]
    reference: PathBuf,

    /// Mate-1 FASTQ file (optionally gzip-compressed)
    #[arg(long)]
    r1: PathBuf,

    /// Mate-2 FASTQ file; enables paired-end mode
    #[arg(long)]
    r2: Option<PathBuf>,

    /// Output directory
    #[arg(short, long)]
    output: PathBuf,

    /// Directory holding the aligner index files
    #[arg(short, long)]
    index_dir: PathBuf,

    /// Number of assembly workers
    #[arg(short, long, default_value_t = 4)]
    threads: usize,

    /// Cell barcode length in bases; enables demultiplexing
    #[arg(short, long)]
    barcode_len: Option<usize>,

    /// UMI length in bases, read directly after the barcode
    #[arg(short, long)]
    umi_len: Option<usize>,

    /// V(D)J gene reference for annotation; annotation is skipped when absent
    #[arg(long)]
    vdj_reference: Option<PathBuf>,

    /// Clonotype report script run on the annotator's CDR3 output
    #[arg(long, default_value = "trust-simplerep.pl")]
    report_script: PathBuf,
}

fn remove_intermediate(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => info!("Removed intermediate file: {}", path.display()),
        Err(e) => warn!("failed to remove {}: {}", path.display(), e),
    }
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    if args.umi_len.is_some() && args.barcode_len.is_none() {
        anyhow::bail!("--umi-len requires --barcode-len");
    }

    let start = std::time::Instant::now();
    fs::create_dir_all(&args.output)?;

    let index_prefix = align::ensure_index(&args.reference, &args.index_dir)?;

    let sam_path = args.output.join("output.sam");
    info!("Saving alignment result to {}", sam_path.display());
    let sam_path = align::run_aligner(
        &index_prefix,
        &args.r1,
        args.r2.as_deref(),
        &sam_path,
        args.threads,
    )?;
    info!("Alignment completed, filtering and clustering begin...");

    let clustered1 = args.output.join("clustered1.fastq");
    let clustered2 = args.r2.as_ref().map(|_| args.output.join("clustered2.fastq"));
    let output_fa = args.output.join("assembled_contigs.fa");
    let driver = AssemblyDriver::new(
        clustered1.clone(),
        clustered2.clone(),
        args.output.clone(),
        output_fa.clone(),
        args.threads,
    );

    if let Some(barcode_len) = args.barcode_len {
        let mapped1 = args.output.join("mapped_1.fastq");
        let mapped2 = args.r2.as_ref().map(|_| args.output.join("mapped_2.fastq"));
        align::extract_mapped_fastq(&sam_path, &mapped1, mapped2.as_deref())?;
        info!("Filtering complete! ID rebuilding and clustering...");

        let clustered = match mapped2.as_deref() {
            Some(mapped2) => {
                let (forward, reverse) =
                    index::parse_paired(&mapped1, mapped2, barcode_len, args.umi_len)?;
                cluster::cluster(forward, Some(reverse), args.umi_len)
            }
            None => {
                let forward = index::parse_single(&mapped1, barcode_len, args.umi_len)?;
                cluster::cluster(forward, None, args.umi_len)
            }
        };
        info!("Clustering done! Fastqs are written...");
        cluster::write_clustered(&clustered, &clustered1, clustered2.as_deref())?;
        info!("Fastq files created successfully! Assembly will be initiated...");

        remove_intermediate(&mapped1);
        if let Some(mapped2) = mapped2.as_deref() {
            remove_intermediate(mapped2);
        }

        let keys = driver.collect_cluster_keys(args.umi_len.is_some())?;
        driver.assemble_all(&keys)?;
        if !keys.is_empty() {
            if let Err(e) = rename::renumber_contigs(&output_fa) {
                error!("error renaming contig ids: {}", e);
            }
        }
    } else {
        // bulk data: the mapped reads go straight to the assembler input
        align::extract_mapped_fastq(&sam_path, &clustered1, clustered2.as_deref())?;
        info!("Bulk data detected, skipping clustering and directly calling assembly...");
        if driver.assemble_bulk()? {
            if let Err(e) = rename::renumber_contigs(&output_fa) {
                error!("error renaming contig ids: {}", e);
            }
        }
    }

    remove_intermediate(&sam_path);

    if let Some(vdj_reference) = args.vdj_reference.as_deref() {
        if output_fa.exists() {
            annotate::annotate(
                vdj_reference,
                &output_fa,
                &args.output,
                args.threads,
                &args.report_script,
            )?;
        } else {
            error!("contig FASTA not found, skipping annotation");
        }
    }

    info!(
        "Total execution time: {:.2} seconds",
        start.elapsed().as_secs_f64()
    );
    Ok(())
}
