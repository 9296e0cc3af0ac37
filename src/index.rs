use anyhow::Result;
use log::warn;
use std::collections::HashMap;
use std::path::Path;

use crate::header::{tag_header, Mate};
use crate::io::{open_fastq_reader, FastqRecords};

/// Reads grouped by tagged header. Each value keeps the `(sequence, quality)`
/// payloads in read order; technical duplicate headers accumulate in the
/// same list.
pub type IndexedReadSet = HashMap<String, Vec<(String, String)>>;

/// Barcode/UMI assignments recorded per original mate-1 header, used to tag
/// the matching mate-2 records.
type TagMap = HashMap<String, (String, Option<String>)>;

fn split_tag(seq: &str, barcode_len: usize, umi_len: Option<usize>) -> (String, Option<String>) {
    let bc_end = barcode_len.min(seq.len());
    let barcode = seq[..bc_end].to_string();
    let umi = umi_len.map(|umi_len| {
        let end = (bc_end + umi_len).min(seq.len());
        seq[bc_end..end].to_string()
    });
    (barcode, umi)
}

fn index_forward(
    path: &Path,
    barcode_len: usize,
    umi_len: Option<usize>,
    mut tags: Option<&mut TagMap>,
) -> Result<IndexedReadSet> {
    let prefix_len = barcode_len + umi_len.unwrap_or(0);
    let mut forward: IndexedReadSet = HashMap::new();

    for record in FastqRecords::new(open_fastq_reader(path)?) {
        let record = record?;
        let (barcode, umi) = split_tag(&record.seq, barcode_len, umi_len);
        let tagged = tag_header(&record.header, Mate::R1, &barcode, umi.as_deref());
        if let Some(tags) = tags.as_deref_mut() {
            tags.insert(record.header.clone(), (barcode, umi));
        }
        let seq_at = prefix_len.min(record.seq.len());
        let qual_at = prefix_len.min(record.qual.len());
        forward.entry(tagged).or_default().push((
            record.seq[seq_at..].to_string(),
            record.qual[qual_at..].to_string(),
        ));
    }
    Ok(forward)
}

/// Index a single-end FASTQ file: tag each header with the barcode (and
/// UMI) sliced from the start of its sequence, and strip that prefix from
/// the stored sequence/quality payload.
pub fn parse_single(
    path: &Path,
    barcode_len: usize,
    umi_len: Option<usize>,
) -> Result<IndexedReadSet> {
    index_forward(path, barcode_len, umi_len, None)
}

/// Index a paired-end FASTQ file pair.
///
/// Barcode and UMI come from the mate-1 sequence only; a mate-2 record is
/// tagged with the assignment recorded for its (identical) original header
/// and its payload is kept untrimmed. A mate-2 header with no mate-1
/// counterpart is skipped with a diagnostic.
pub fn parse_paired(
    path1: &Path,
    path2: &Path,
    barcode_len: usize,
    umi_len: Option<usize>,
) -> Result<(IndexedReadSet, IndexedReadSet)> {
    let mut tags = TagMap::new();
    let forward = index_forward(path1, barcode_len, umi_len, Some(&mut tags))?;

    let mut reverse: IndexedReadSet = HashMap::new();
    for record in FastqRecords::new(open_fastq_reader(path2)?) {
        let record = record?;
        match tags.get(&record.header) {
            Some((barcode, umi)) => {
                let tagged = tag_header(&record.header, Mate::R2, barcode, umi.as_deref());
                reverse
                    .entry(tagged)
                    .or_default()
                    .push((record.seq, record.qual));
            }
            None => warn!("{} not found in mate-1 input, skipping", record.header),
        }
    }
    Ok((forward, reverse))
}
