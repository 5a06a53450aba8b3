//! Local driver for the multipart upload flow.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

use anyhow::{bail, Context, Result};
use indicatif::{ProgressBar, ProgressStyle};
use spacebox_cas::fingerprint_reader;
use spacebox_multipart::Part;
use spacebox_service::{CreateUploadRequest, CreateUploadResponse, FileRecord, UploadService};

/// Gaps of `[0, size)` not covered by `uploaded`, split into `part_size`
/// pieces.
pub fn pending_parts(size: u64, part_size: u64, uploaded: &[Part]) -> Vec<Part> {
    let mut covered = uploaded.to_vec();
    covered.sort_by_key(|p| p.start);

    let mut gaps = Vec::new();
    let mut cursor = 0;
    for p in covered {
        if p.start > cursor {
            gaps.push(Part::new(cursor, p.start));
        }
        cursor = cursor.max(p.end);
    }
    if cursor < size {
        gaps.push(Part::new(cursor, size));
    }

    let mut pending = Vec::new();
    for gap in gaps {
        let mut start = gap.start;
        while start < gap.end {
            let end = (start + part_size).min(gap.end);
            pending.push(Part::new(start, end));
            start = end;
        }
    }
    pending
}

pub fn run(service: &UploadService, file: &Path, folder: &str, part_size: u64) -> Result<FileRecord> {
    if part_size == 0 {
        bail!("part size must be positive");
    }
    let name = file
        .file_name()
        .and_then(|n| n.to_str())
        .context("File name is not valid UTF-8")?;
    let size = file.metadata()?.len();
    let fingerprint = fingerprint_reader(File::open(file)?, size)
        .with_context(|| format!("Failed to fingerprint {}", file.display()))?;

    let request = CreateUploadRequest::new(name, size, fingerprint.to_hex()).in_folder(folder);
    let (upload_id, uploaded) = match service.create_upload(0, request)? {
        CreateUploadResponse::Complete(record) => {
            eprintln!("✨ Content already stored, upload skipped");
            return Ok(record);
        }
        CreateUploadResponse::Started { upload_id, .. } => (upload_id, Vec::new()),
        CreateUploadResponse::Conflict(status) => {
            eprintln!(
                "↻ Resuming upload {} ({} parts already stored)",
                status.upload_id,
                status.uploaded_parts.len()
            );
            (status.upload_id, status.uploaded_parts)
        }
    };

    let pending = pending_parts(size, part_size, &uploaded);
    let bar = ProgressBar::new(pending.iter().map(Part::len).sum());
    bar.set_style(
        ProgressStyle::with_template("  {bar:40} {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar()),
    );

    let mut source = File::open(file)?;
    for p in pending {
        source.seek(SeekFrom::Start(p.start))?;
        service
            .upload_part(&upload_id, p.start, p.end, (&mut source).take(p.len()), None)
            .with_context(|| format!("Failed to upload part {}", p))?;
        bar.inc(p.len());
    }
    bar.finish_and_clear();

    let record = service
        .complete_upload(&upload_id)
        .with_context(|| format!("Failed to complete upload {}", upload_id))?;
    Ok(record)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pending_parts_skips_uploaded() {
        let uploaded = vec![Part::new(0, 4), Part::new(8, 10)];
        assert_eq!(
            pending_parts(10, 4, &uploaded),
            vec![Part::new(4, 8)]
        );
        assert_eq!(
            pending_parts(10, 4, &[]),
            vec![Part::new(0, 4), Part::new(4, 8), Part::new(8, 10)]
        );
    }

    #[test]
    fn test_pending_parts_fills_unaligned_gaps() {
        let uploaded = vec![Part::new(0, 2)];
        assert_eq!(
            pending_parts(7, 4, &uploaded),
            vec![Part::new(2, 6), Part::new(6, 7)]
        );
    }
}
