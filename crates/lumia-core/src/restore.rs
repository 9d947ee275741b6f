//! Restore partitions from raw image files through a custom flash.

use std::fs::File;
use std::io::{self, BufReader};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::ffu::FlashPart;
use crate::flash::FlashError;
use crate::gpt::Gpt;
use crate::protocol::constants::{PARTITION_DATA, PARTITION_EFIESP, PARTITION_MAINOS};

/// Image files to restore. Partitions without a file are left untouched.
#[derive(Debug, Clone, Default)]
pub struct RestoreSources {
    pub efiesp: Option<PathBuf>,
    pub main_os: Option<PathBuf>,
    pub data: Option<PathBuf>,
}

impl RestoreSources {
    fn entries(&self) -> [(&'static str, Option<&Path>); 3] {
        [
            (PARTITION_EFIESP, self.efiesp.as_deref()),
            (PARTITION_MAINOS, self.main_os.as_deref()),
            (PARTITION_DATA, self.data.as_deref()),
        ]
    }

    pub fn is_empty(&self) -> bool {
        self.entries().iter().all(|(_, path)| path.is_none())
    }
}

/// Turn restore sources into flash parts placed by the device GPT.
///
/// EFIESP and MainOS must exist on the device; Data is only looked up when
/// a Data image is given.
pub fn restore_parts(gpt: &Gpt, sources: &RestoreSources) -> Result<Vec<FlashPart>, FlashError> {
    for required in [PARTITION_EFIESP, PARTITION_MAINOS] {
        if !gpt.has_partition(required) {
            return Err(FlashError::MissingPartition(required.into()));
        }
    }

    let mut parts = Vec::new();
    for (name, path) in sources.entries() {
        let Some(path) = path else { continue };
        let partition = gpt
            .get_partition(name)
            .ok_or_else(|| FlashError::MissingPartition(name.into()))?;

        let file = open_source(path)?;
        let size = file.metadata()?.len();
        let available = partition.size_in_bytes();
        if size > available {
            return Err(FlashError::PartitionTooSmall {
                name: name.into(),
                size,
                available,
            });
        }

        debug!(partition = name, path = %path.display(), size, start = partition.first_sector, "Restore source");
        parts.push(FlashPart::new(BufReader::new(file), partition.first_sector, name));
    }

    info!(parts = parts.len(), "Restore parts prepared");
    Ok(parts)
}

fn open_source(path: &Path) -> Result<File, FlashError> {
    File::open(path).map_err(|source| match source.kind() {
        io::ErrorKind::PermissionDenied => FlashError::PrivilegeFailure {
            path: path.to_path_buf(),
            source,
        },
        _ => FlashError::Io(source),
    })
}
