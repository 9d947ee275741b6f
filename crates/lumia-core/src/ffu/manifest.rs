//! Manifest text carried in the first header region.
//!
//! The device parses this textually: keys are padded to a common width
//! per section and lines end in CRLF.

use serde::{Deserialize, Serialize};

use crate::protocol::constants::SECTOR_SIZE;

/// User-controlled manifest values.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ManifestOptions {
    pub anti_theft_version: String,
    pub os_version: String,
    /// Free text. Kept fixed so that identical inputs build identical images.
    pub description: String,
}

impl Default for ManifestOptions {
    fn default() -> Self {
        Self {
            anti_theft_version: "1.1".to_string(),
            os_version: "10.0.11111.0".to_string(),
            description: "Custom flash image".to_string(),
        }
    }
}

const FULL_FLASH_VERSION: &str = "2.0";

fn write_section(out: &mut String, name: &str, entries: &[(&str, String)]) {
    let width = entries.iter().map(|(k, _)| k.len()).max().unwrap_or(0);
    out.push('[');
    out.push_str(name);
    out.push_str("]\r\n");
    for (key, value) in entries {
        out.push_str(&format!("{key:<width$} = {value}\r\n"));
    }
    out.push_str("\r\n");
}

/// Render the manifest for a device.
pub fn render(options: &ManifestOptions, platform_id: &str, min_sector_count: u64) -> String {
    let mut out = String::new();
    write_section(
        &mut out,
        "FullFlash",
        &[
            ("AntiTheftVersion", options.anti_theft_version.clone()),
            ("OSVersion", options.os_version.clone()),
            ("Description", options.description.clone()),
            ("Version", FULL_FLASH_VERSION.to_string()),
            ("DevicePlatformId0", platform_id.to_string()),
        ],
    );
    write_section(
        &mut out,
        "Store",
        &[
            ("SectorSize", SECTOR_SIZE.to_string()),
            ("MinSectorCount", min_sector_count.to_string()),
        ],
    );
    out
}
