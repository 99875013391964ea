//! Placeholder patching of prebuilt plugin binaries.
//!
//! The prebuilt plugin templates carry two placeholders: the 4-byte plugin
//! ID `YROR` and the 16-byte name field `CabbageEffectNam`. Exporting
//! overwrites them in place. The scan is a plain byte search, not aware of
//! the binary format, so a placeholder that also occurs by accident in
//! code or data would be overwritten too. A structured artifact format
//! (e.g. a resource section read by the plugin at load time) would remove
//! this class of bug; until then the scan rules below are kept exactly.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

/// Plugin ID placeholder.
pub const ID_PLACEHOLDER: &[u8; 4] = b"YROR";

/// Plugin name placeholder.
pub const NAME_PLACEHOLDER: &[u8; NAME_LEN] = b"CabbageEffectNam";

/// Width of the name field.
pub const NAME_LEN: usize = 16;

/// Occurrences of the ID placeholder patched at most.
pub const ID_PASSES: usize = 10;

/// Occurrences of the name placeholder patched at most.
pub const NAME_PASSES: usize = 5;

/// Offset of the first occurrence of `pattern` in `buffer`.
///
/// Candidate offsets are `0..len - pattern_len - 1`, so an occurrence that
/// ends on the last or second-to-last byte is not found.
pub fn find_pattern(buffer: &[u8], pattern: &[u8]) -> Option<usize> {
    if pattern.is_empty() {
        return None;
    }
    let end = buffer.len().saturating_sub(pattern.len() + 1);
    (0..end).find(|&i| &buffer[i..i + pattern.len()] == pattern)
}

/// Where a placeholder was overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchReport {
    pub offsets: Vec<usize>,
}

impl PatchReport {
    /// False when the placeholder was not found on the first pass.
    pub fn found(&self) -> bool {
        !self.offsets.is_empty()
    }

    pub fn count(&self) -> usize {
        self.offsets.len()
    }
}

/// The 16-byte name field for `name`: truncated, or padded with spaces.
pub fn name_field(name: &str) -> [u8; NAME_LEN] {
    let mut end = name.len().min(NAME_LEN);
    while !name.is_char_boundary(end) {
        end -= 1;
    }
    let mut field = [b' '; NAME_LEN];
    field[..end].copy_from_slice(&name.as_bytes()[..end]);
    field
}

/// Overwrite up to `passes` occurrences of `pattern` in `buffer`.
pub fn patch_buffer(
    buffer: &mut [u8],
    pattern: &[u8],
    replacement: &[u8],
    passes: usize,
) -> PatchReport {
    let mut report = PatchReport::default();
    for _ in 0..passes {
        let Some(offset) = find_pattern(buffer, pattern) else {
            break;
        };
        let len = replacement.len().min(buffer.len() - offset);
        buffer[offset..offset + len].copy_from_slice(&replacement[..len]);
        report.offsets.push(offset);
    }
    warn_if_missing(&report, pattern, "buffer");
    report
}

pub fn patch_id_in(buffer: &mut [u8], id: [u8; 4]) -> PatchReport {
    patch_buffer(buffer, ID_PLACEHOLDER, &id, ID_PASSES)
}

pub fn patch_name_in(buffer: &mut [u8], name: &str) -> PatchReport {
    patch_buffer(buffer, NAME_PLACEHOLDER, &name_field(name), NAME_PASSES)
}

/// Write the plugin ID into the artifact at `path`.
pub fn patch_id(path: &Path, id: [u8; 4]) -> std::io::Result<PatchReport> {
    patch_file(path, ID_PLACEHOLDER, &id, ID_PASSES)
}

/// Write the plugin name into the artifact at `path`.
pub fn patch_name(path: &Path, name: &str) -> std::io::Result<PatchReport> {
    patch_file(path, NAME_PLACEHOLDER, &name_field(name), NAME_PASSES)
}

/// Overwrite up to `passes` occurrences of `pattern` in the file at `path`.
///
/// Every pass re-reads the whole file and patches the first occurrence.
pub fn patch_file(
    path: &Path,
    pattern: &[u8],
    replacement: &[u8],
    passes: usize,
) -> std::io::Result<PatchReport> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    let mut buffer = Vec::new();
    let mut report = PatchReport::default();
    for _ in 0..passes {
        buffer.clear();
        file.seek(SeekFrom::Start(0))?;
        file.read_to_end(&mut buffer)?;
        let Some(offset) = find_pattern(&buffer, pattern) else {
            break;
        };
        file.seek(SeekFrom::Start(offset as u64))?;
        file.write_all(replacement)?;
        report.offsets.push(offset);
    }
    file.flush()?;
    warn_if_missing(&report, pattern, &path.display().to_string());
    Ok(report)
}

/// Whether the artifact at `path` still contains `pattern`.
pub fn contains_pattern(path: &Path, pattern: &[u8]) -> std::io::Result<bool> {
    let mut buffer = Vec::new();
    File::open(path)?.read_to_end(&mut buffer)?;
    Ok(find_pattern(&buffer, pattern).is_some())
}

fn warn_if_missing(report: &PatchReport, pattern: &[u8], target: &str) {
    if !report.found() {
        log::warn!(
            "placeholder '{}' not found in {}",
            String::from_utf8_lossy(pattern),
            target
        );
    }
}
