use std::fs;
use std::path::Path;
use tempfile::tempdir;

use tcrasm::assembly::AssemblyDriver;
use tcrasm::cluster::{self, ClusterKey};
use tcrasm::header::{tag_header, Mate};
use tcrasm::{index, rename};

const BARCODE_A: &str = "AAAAAAAAAAAAAAAA";
const BARCODE_C: &str = "CCCCCCCCCCCCCCCC";

fn write_fastq(path: &Path, records: &[(&str, &str, &str)]) {
    let mut data = String::new();
    for (header, seq, qual) in records {
        data.push_str(&format!("{}\n{}\n+\n{}\n", header, seq, qual));
    }
    fs::write(path, data).unwrap();
}

/// Demultiplex -> cluster -> write -> assemble -> rename, single-end with a
/// 16-base barcode and no UMI. Three reads share one barcode and one read
/// carries another: two keys, the singleton short-circuits straight to
/// FASTA, and the 3-read cluster hands off to the (absent) assembler
/// without taking down the batch.
#[test]
fn test_single_end_pipeline_singleton_shortcut() {
    let tmp = tempdir().unwrap();
    let mapped = tmp.path().join("mapped_1.fastq");
    let seq_a = format!("{}CGTACGTACGTA", BARCODE_A);
    let seq_a2 = format!("{}CGTACGTTCGTA", BARCODE_A);
    let seq_c = format!("{}GGGGTTTTGGGG", BARCODE_C);
    let qual = "IIIIIIIIIIIIIIIIJJJJJJJJJJJJ";
    write_fastq(
        &mapped,
        &[
            ("@r1", seq_a.as_str(), qual),
            ("@r2", seq_a.as_str(), qual),
            ("@r3", seq_a2.as_str(), qual),
            ("@r4", seq_c.as_str(), qual),
        ],
    );

    let forward = index::parse_single(&mapped, 16, None).unwrap();
    let clustered = cluster::cluster(forward, None, None);
    assert_eq!(clustered.len(), 2);

    let clustered1 = tmp.path().join("clustered1.fastq");
    cluster::write_clustered(&clustered, &clustered1, None).unwrap();

    let work = tmp.path().join("work");
    let output_fa = work.join("assembled_contigs.fa");
    let driver = AssemblyDriver::new(clustered1, None, work.clone(), output_fa.clone(), 2);

    let keys = driver.collect_cluster_keys(false).unwrap();
    assert_eq!(keys.len(), 2);
    assert!(keys.contains(&ClusterKey::new(BARCODE_A.to_string(), None)));
    assert!(keys.contains(&ClusterKey::new(BARCODE_C.to_string(), None)));

    driver.assemble_all(&keys).unwrap();

    // only the singleton cluster contributed: the 3-read cluster needs the
    // external assembler, which is not installed here
    let fasta = fs::read_to_string(&output_fa).unwrap();
    assert_eq!(fasta, format!(">{}\nGGGGTTTTGGGG\n", BARCODE_C));

    rename::renumber_contigs(&output_fa).unwrap();
    let fasta = fs::read_to_string(&output_fa).unwrap();
    assert_eq!(fasta, format!(">{}_1\nGGGGTTTTGGGG\n", BARCODE_C));
}

/// Paired-end demultiplexing with a UMI: both mates end up tagged with the
/// same (barcode, umi) suffix, differing only in the mate marker.
#[test]
fn test_paired_end_mates_share_tag() {
    let tmp = tempdir().unwrap();
    let r1 = tmp.path().join("mapped_1.fastq");
    let r2 = tmp.path().join("mapped_2.fastq");
    write_fastq(&r1, &[("@frag", "ACGTACGTTTGGCCAA", "IIIIIIIIIIIIIIII")]);
    write_fastq(&r2, &[("@frag", "GGCCGGCCGGCCGGCC", "JJJJJJJJJJJJJJJJ")]);

    let (forward, reverse) = index::parse_paired(&r1, &r2, 8, Some(2)).unwrap();
    let fwd_header = forward.keys().next().unwrap();
    let rev_header = reverse.keys().next().unwrap();
    assert_eq!(fwd_header, "@frag 1:ACGTACGT:TT");
    assert_eq!(rev_header, "@frag 2:ACGTACGT:TT");
    assert_eq!(fwd_header.replacen(" 1:", " 2:", 1), *rev_header);

    let clustered = cluster::cluster(forward, Some(reverse), Some(2));
    assert_eq!(clustered.len(), 1);
    let key = ClusterKey::new("ACGTACGT".to_string(), Some("TT".to_string()));
    assert_eq!(clustered.get(&key).unwrap().len(), 2);
}

/// A reverse read with no forward counterpart is dropped without failing
/// the parse, and never reaches the clustered output.
#[test]
fn test_orphan_reverse_read_excluded_from_output() {
    let tmp = tempdir().unwrap();
    let r1 = tmp.path().join("mapped_1.fastq");
    let r2 = tmp.path().join("mapped_2.fastq");
    write_fastq(&r1, &[("@kept", "AAAACCCCGGGG", "IIIIIIIIIIII")]);
    write_fastq(
        &r2,
        &[
            ("@kept", "TTTTTTTTTTTT", "JJJJJJJJJJJJ"),
            ("@orphan", "GGGGGGGGGGGG", "KKKKKKKKKKKK"),
        ],
    );

    let (forward, reverse) = index::parse_paired(&r1, &r2, 4, None).unwrap();
    let clustered = cluster::cluster(forward, Some(reverse), None);

    let out1 = tmp.path().join("clustered1.fastq");
    let out2 = tmp.path().join("clustered2.fastq");
    cluster::write_clustered(&clustered, &out1, Some(&out2)).unwrap();

    let fq2 = fs::read_to_string(&out2).unwrap();
    assert!(fq2.contains("@kept 2:AAAA"));
    assert!(!fq2.contains("@orphan"));
}

/// The tagging rule is shared between mates: encoding the same header as
/// mate 1 and mate 2 differs only in the literal marker.
#[test]
fn test_tagging_rule_is_mate_symmetric() {
    for header in ["@x:300:4:1:0:999", "@plain", "@a 1:N:0:ATCACGTT"] {
        let fwd = tag_header(header, Mate::R1, "ACGTACGTACGTACGT", Some("TTTTGGGG"));
        let rev = tag_header(header, Mate::R2, "ACGTACGTACGTACGT", Some("TTTTGGGG"));
        assert_eq!(fwd.replacen(" 1:", " 2:", 1), rev);
    }
}

#[test]
fn test_cli_help_describes_pipeline() {
    use assert_cmd::assert::OutputAssertExt;
    use assert_cmd::cargo;
    use predicates::prelude::*;
    use std::process::Command;

    let mut cmd = Command::new(cargo::cargo_bin!(env!("CARGO_PKG_NAME")));
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("TCR repertoire pipeline"));
}

#[test]
fn test_cli_fails_cleanly_without_aligner_inputs() {
    use assert_cmd::assert::OutputAssertExt;
    use assert_cmd::cargo;
    use std::process::Command;

    let tmp = tempdir().unwrap();
    let mut cmd = Command::new(cargo::cargo_bin!(env!("CARGO_PKG_NAME")));
    cmd.arg("-r")
        .arg(tmp.path().join("absent_ref.fa"))
        .arg("--r1")
        .arg(tmp.path().join("absent_reads.fastq"))
        .arg("-o")
        .arg(tmp.path().join("out"))
        .arg("-i")
        .arg(tmp.path().join("idx"));
    // no aligner available and no inputs: the run must abort with an error
    cmd.assert().failure();
}
