//! The fixed set of iPXE images served to booting machines.

use std::collections::HashMap;
use std::path::Path;

use bytes::Bytes;
use tracing::{debug, warn};

use crate::error::{FirnError, Result};
use crate::patch;

/// UEFI iPXE binary for x86 machines.
pub const IPXE_EFI: &str = "ipxe.efi";
/// Legacy BIOS chainloader. Built without an embedded script, so it can't be patched.
pub const UNDIONLY_KPXE: &str = "undionly.kpxe";
/// UEFI iPXE binary for ARM machines.
pub const SNP_EFI: &str = "snp.efi";
/// Bootable iPXE ISO image.
pub const IPXE_ISO: &str = "ipxe.iso";

/// Every filename the catalog can hold.
pub const KNOWN_FILES: [&str; 4] = [IPXE_EFI, UNDIONLY_KPXE, SNP_EFI, IPXE_ISO];

/// Immutable filename to image mapping, shared read-only by all requests.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    files: HashMap<String, Bytes>,
}

impl Catalog {
    /// Build a catalog from in-memory images.
    ///
    /// Every image except [`UNDIONLY_KPXE`] must carry the patch marker
    /// exactly once.
    pub fn from_entries<I, K>(entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, Bytes)>,
        K: Into<String>,
    {
        let mut files = HashMap::new();
        for (name, content) in entries {
            let name = name.into();
            validate_marker(&name, &content)?;
            files.insert(name, content);
        }
        Ok(Self { files })
    }

    /// Load the known images from `dir`.
    ///
    /// Missing images are skipped. A directory holding none of them is an error.
    pub fn load_dir(dir: &Path) -> Result<Self> {
        let mut entries = Vec::new();
        for name in KNOWN_FILES {
            let path = dir.join(name);
            match std::fs::read(&path) {
                Ok(content) => {
                    debug!(file = name, size = content.len(), "loaded iPXE binary");
                    entries.push((name, Bytes::from(content)));
                }
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    warn!(file = name, dir = %dir.display(), "iPXE binary not found, it will not be served");
                }
                Err(e) => return Err(FirnError::Io(e)),
            }
        }

        if entries.is_empty() {
            return Err(FirnError::Catalog(format!(
                "no iPXE binaries found in {}",
                dir.display()
            )));
        }

        Self::from_entries(entries)
    }

    /// Exact-match lookup by basename.
    pub fn get(&self, name: &str) -> Option<&Bytes> {
        self.files.get(name)
    }

    pub fn len(&self) -> usize {
        self.files.len()
    }

    pub fn is_empty(&self) -> bool {
        self.files.is_empty()
    }

    /// Filenames held, sorted.
    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.files.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }
}

fn validate_marker(name: &str, content: &[u8]) -> Result<()> {
    if name == UNDIONLY_KPXE {
        return Ok(());
    }
    match patch::count_markers(content) {
        1 => Ok(()),
        0 => Err(FirnError::Catalog(format!(
            "{name} binary does not contain the patch marker"
        ))),
        _ => Err(FirnError::Catalog(format!(
            "{name} binary contains the patch marker more than once"
        ))),
    }
}
