//! In-place rewriting of the embedded iPXE script region.
//!
//! Every patchable iPXE image is built with [`MARKER`] inside its embedded
//! script. Serving a patched image replaces that region with a deployment's
//! own script, padded with spaces so the image length never changes.

use bytes::Bytes;

use crate::error::{FirnError, Result};

/// Placeholder compiled into the embedded script of each iPXE binary.
pub const MARKER: &[u8] = b"#a8b7e61f1075c37a793f2f92cee89f7bba00c4a8d7842ce3d40b5889032d8881
#ddd16a4fc4926ecefdfb6941e33c44ed3647133638f5e84021ea44d3152e7f97";

/// Byte written over the unused tail of the marker region.
pub const PADDING: u8 = b' ';

/// Offset of the first marker occurrence in `content`.
pub fn find_marker(content: &[u8]) -> Option<usize> {
    content
        .windows(MARKER.len())
        .position(|window| window == MARKER)
}

/// Number of marker occurrences in `content`.
pub fn count_markers(content: &[u8]) -> usize {
    let mut count = 0;
    let mut rest = content;
    while let Some(i) = find_marker(rest) {
        count += 1;
        rest = &rest[i + MARKER.len()..];
    }
    count
}

/// Replace the marker in `content` with `patch`.
///
/// Returns `content` untouched when `patch` is empty or when no marker is
/// present. Fails with [`FirnError::PatchTooLong`] when `patch` does not fit.
/// The input is never modified; a patched image is a fresh buffer.
pub fn patch(content: &Bytes, patch: &[u8]) -> Result<Bytes> {
    if patch.is_empty() {
        return Ok(content.clone());
    }

    let Some(offset) = find_marker(content) else {
        return Ok(content.clone());
    };

    if patch.len() > MARKER.len() {
        return Err(FirnError::PatchTooLong {
            len: patch.len(),
            capacity: MARKER.len(),
        });
    }

    let mut patched = content.to_vec();
    let region = &mut patched[offset..offset + MARKER.len()];
    region.fill(PADDING);
    region[..patch.len()].copy_from_slice(patch);

    Ok(Bytes::from(patched))
}
