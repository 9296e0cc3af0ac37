use anyhow::{Context, Result};
use log::{error, info};
use std::fs::File;
use std::path::Path;
use std::process::Command;

/// Run the external V(D)J annotator on the assembled contigs, then reduce
/// its CDR3 calls to a clonotype abundance report.
///
/// Produces `annot.txt`, `_cdr3.out` (written by the annotator itself) and
/// `clone.csv` under `output_dir`. Tool failures are logged and leave the
/// outputs produced so far in place; they never abort the pipeline.
pub fn annotate(
    vdj_reference: &Path,
    contigs: &Path,
    output_dir: &Path,
    threads: usize,
    report_script: &Path,
) -> Result<()> {
    let annot = output_dir.join("annot.txt");
    let cdr3 = output_dir.join("_cdr3.out");
    let abundance = output_dir.join("clone.csv");

    info!("Running annotator...");
    let annot_file =
        File::create(&annot).with_context(|| format!("Failed to create {}", annot.display()))?;
    let annotator = Command::new("annotator")
        .arg("-f")
        .arg(vdj_reference)
        .arg("-a")
        .arg(contigs)
        .arg("--fasta")
        .arg("-t")
        .arg(threads.to_string())
        .arg("--needReverseComplement")
        .arg("--noImpute")
        .arg("--outputCDR3File")
        .arg("-o")
        .arg(output_dir)
        .stdout(annot_file)
        .output();
    match annotator {
        Ok(output) if output.status.success() => {
            info!("Annotation completed, results saved to {}", annot.display());
        }
        Ok(output) => {
            error!(
                "annotator exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
            return Ok(());
        }
        Err(e) => {
            error!("failed to launch annotator: {}", e);
            return Ok(());
        }
    }

    if !cdr3.exists() {
        error!("expected CDR3 output file {} not found", cdr3.display());
        return Ok(());
    }

    info!("Generating clonotype abundance report...");
    let abundance_file = File::create(&abundance)
        .with_context(|| format!("Failed to create {}", abundance.display()))?;
    let report = Command::new("perl")
        .arg(report_script)
        .arg(&cdr3)
        .stdout(abundance_file)
        .output();
    match report {
        Ok(output) if output.status.success() => {
            info!("Report generation completed, saved to {}", abundance.display());
        }
        Ok(output) => {
            error!(
                "report script exited with {}: {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim_end()
            );
        }
        Err(e) => error!("failed to launch report script: {}", e),
    }
    Ok(())
}
