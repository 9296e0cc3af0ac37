use anyhow::{Context, Result};
use log::warn;
use std::collections::HashMap;
use std::fmt;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::header::decode_key;
use crate::index::IndexedReadSet;
use crate::io::write_fastq_record;

/// The (barcode, optional UMI) identity of one molecule cluster.
///
/// Renders as `barcode_umi`, or the bare barcode when no UMI is configured;
/// this rendering is the `output_id` used for contig naming downstream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ClusterKey {
    pub barcode: String,
    pub umi: Option<String>,
}

impl ClusterKey {
    pub fn new(barcode: String, umi: Option<String>) -> Self {
        ClusterKey { barcode, umi }
    }
}

impl fmt::Display for ClusterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.umi {
            Some(umi) => write!(f, "{}_{}", self.barcode, umi),
            None => write!(f, "{}", self.barcode),
        }
    }
}

/// Which mate stream a cluster entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Reverse,
}

/// One indexed read group inside a cluster: the tagged header it came from,
/// its mate stream, and its `(sequence, quality)` payloads in read order.
#[derive(Debug)]
pub struct ClusterEntry {
    pub header: String,
    pub direction: Direction,
    pub reads: Vec<(String, String)>,
}

pub type Cluster = HashMap<ClusterKey, Vec<ClusterEntry>>;

fn extend_cluster(
    clustered: &mut Cluster,
    set: IndexedReadSet,
    direction: Direction,
    has_umi: bool,
) {
    for (header, reads) in set {
        let (barcode, umi) = decode_key(&header, has_umi);
        clustered
            .entry(ClusterKey::new(barcode, umi))
            .or_default()
            .push(ClusterEntry {
                header,
                direction,
                reads,
            });
    }
}

/// Group indexed reads by their (barcode[, umi]) key.
///
/// Forward entries are inserted before reverse entries within each key.
pub fn cluster(
    forward: IndexedReadSet,
    reverse: Option<IndexedReadSet>,
    umi_len: Option<usize>,
) -> Cluster {
    let has_umi = umi_len.is_some();
    let mut clustered = Cluster::new();
    extend_cluster(&mut clustered, forward, Direction::Forward, has_umi);
    if let Some(reverse) = reverse {
        extend_cluster(&mut clustered, reverse, Direction::Reverse, has_umi);
    }
    clustered
}

fn create_output(path: &Path) -> Result<BufWriter<File>> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }
    }
    let file = File::create(path).with_context(|| format!("Failed to create {}", path.display()))?;
    Ok(BufWriter::new(file))
}

/// Stream a cluster map back out as demultiplexed FASTQ file(s).
///
/// Every `(sequence, quality)` pair becomes one 4-line record under its
/// entry's tagged header, routed to the stream matching its direction.
/// Parent directories are created as needed. Writing is a single sequential
/// pass; nothing beyond one record is buffered.
pub fn write_clustered(
    clustered: &Cluster,
    out_forward: &Path,
    out_reverse: Option<&Path>,
) -> Result<()> {
    let mut fq1 = create_output(out_forward)?;
    let mut fq2 = match out_reverse {
        Some(path) => Some(create_output(path)?),
        None => None,
    };

    for entries in clustered.values() {
        for entry in entries {
            let sink = match (entry.direction, fq2.as_mut()) {
                (Direction::Forward, _) => &mut fq1,
                (Direction::Reverse, Some(writer)) => writer,
                (Direction::Reverse, None) => {
                    warn!("no reverse output configured, dropping {}", entry.header);
                    continue;
                }
            };
            for (seq, qual) in &entry.reads {
                write_fastq_record(sink, &entry.header, seq, qual)?;
            }
        }
    }

    fq1.flush()?;
    if let Some(writer) = fq2.as_mut() {
        writer.flush()?;
    }
    Ok(())
}
