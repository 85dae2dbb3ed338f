//! Timestamp-ordered merge of per-CPU temp files
//!
//! Each drained record carries a 4-byte global sequence stamp. The merge
//! repeatedly emits the stream with the smallest non-zero stamp, which
//! re-establishes a total order while preserving each CPU's own order
//! (ties go to the lower CPU index). Gaps in the stamp sequence are
//! counted as drops.

use crate::error::RelayError;
use log::{info, warn};
use probescope_common::TraceRecord;
use std::fs::File;
use std::io::{BufReader, Read, Write};
use std::path::Path;

/// Default merged-output name when none was requested.
pub const DEFAULT_OUTFILE_NAME: &str = "probe.out";

/// Merges already-framed streams, handing each payload in global order to
/// `write_payload`. Returns the number of sequence gaps observed.
pub fn merge_streams<R: Read>(
    inputs: &mut [R],
    mut write_payload: impl FnMut(&[u8]) -> std::io::Result<()>,
) -> std::io::Result<u32> {
    let mut heads: Vec<Option<TraceRecord>> = Vec::with_capacity(inputs.len());
    for input in inputs.iter_mut() {
        heads.push(TraceRecord::read_from(input)?);
    }

    let mut count: u32 = 0;
    let mut dropped: u32 = 0;

    loop {
        // Smallest non-zero leading timestamp; strict comparison keeps
        // ties on the lowest CPU index.
        let mut min = 0u32;
        let mut j = 0usize;
        for (i, head) in heads.iter().enumerate() {
            if let Some(rec) = head {
                if min == 0 || (rec.timestamp != 0 && rec.timestamp < min) {
                    min = rec.timestamp;
                    j = i;
                }
            }
        }
        if min == 0 {
            break;
        }

        if let Some(rec) = heads[j].take() {
            write_payload(&rec.payload)?;
            count = count.wrapping_add(1);
            if count != min {
                count = min;
                dropped += 1;
            }
        }
        heads[j] = TraceRecord::read_from(&mut inputs[j])?;
    }

    Ok(dropped)
}

/// Merges the per-CPU temp files into the final output, echoing to stdout
/// unless quieted and writing the file unless print-only. The output file
/// ends with a single newline.
pub fn merge_output(
    tmp_paths: &[std::path::PathBuf],
    outfile: &Path,
    quiet: bool,
    print_only: bool,
) -> Result<u32, RelayError> {
    let mut inputs = Vec::with_capacity(tmp_paths.len());
    for path in tmp_paths {
        let file = File::open(path).map_err(|source| RelayError::OpenOutput {
            path: path.display().to_string(),
            source,
        })?;
        inputs.push(BufReader::new(file));
    }

    let mut ofp: Option<File> = if print_only {
        None
    } else {
        Some(File::create(outfile).map_err(|source| RelayError::OpenOutput {
            path: outfile.display().to_string(),
            source,
        })?)
    };

    let stdout = std::io::stdout();
    let mut echo = stdout.lock();

    let dropped = merge_streams(&mut inputs, |payload| {
        if !quiet {
            echo.write_all(payload)?;
        }
        if let Some(f) = ofp.as_mut() {
            f.write_all(payload)?;
        }
        Ok(())
    })?;

    if let Some(f) = ofp.as_mut() {
        f.write_all(b"\n")?;
    }

    if dropped > 0 {
        warn!("sequence had {dropped} drops");
    } else {
        info!("merged {} per-cpu files", tmp_paths.len());
    }
    Ok(dropped)
}

/// Removes the per-CPU temp files once their content is merged.
pub fn delete_percpu_files(tmp_paths: &[std::path::PathBuf]) {
    for path in tmp_paths {
        if let Err(e) = std::fs::remove_file(path) {
            warn!("couldn't unlink percpu file {}: {e}", path.display());
        }
    }
}
