//! Header image assembly.
//!
//! Wire order: security header, catalog and hash table (one region padded
//! to the chunk size), then the image header with manifest (padded), then
//! the store header with write descriptors (padded).

use std::ops::Range;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument};

use super::catalog::Catalog;
use super::header::{ImageHeader, SecurityHeader, StoreHeader, WriteDescriptor};
use super::manifest::{self, ManifestOptions};
use super::planner::Payload;
use super::ImageError;
use crate::gpt::Gpt;
use crate::protocol::constants::{CHUNK_SIZE, PARTITION_PLAT, SECTOR_SIZE};

pub struct BuildParams<'a> {
    pub platform_id: &'a str,
    pub emmc_sector_count: u64,
    pub gpt: &'a Gpt,
    pub manifest: &'a ManifestOptions,
}

/// Serialized header image, ready for the send-FFU-header command.
#[derive(Debug, Clone)]
pub struct FlashImage {
    pub data: Vec<u8>,
    pub store: StoreHeader,
    /// Chunks covered by the two header regions.
    pub header_chunk_count: usize,
    hash_table: Range<usize>,
    headers: Range<usize>,
}

impl FlashImage {
    pub fn hash_table(&self) -> &[u8] {
        &self.data[self.hash_table.clone()]
    }

    /// Image header region followed by the store header region.
    pub fn header_regions(&self) -> &[u8] {
        &self.data[self.headers.clone()]
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

fn pad_to_chunk(buf: &mut Vec<u8>) {
    let rem = buf.len() % CHUNK_SIZE;
    if rem != 0 {
        buf.resize(buf.len() + CHUNK_SIZE - rem, 0);
    }
}

/// Number of leading payloads that end inside PLAT; 0 without PLAT.
pub fn flash_only_table_index(payloads: &[Payload], gpt: &Gpt) -> u32 {
    let Some(plat) = gpt.get_partition(PARTITION_PLAT) else {
        return 0;
    };
    let end_chunk = (plat.last_sector + 1) * SECTOR_SIZE / CHUNK_SIZE as u64;
    payloads
        .iter()
        .filter(|p| u64::from(p.first_location()) < end_chunk)
        .count() as u32
}

#[instrument(skip_all, fields(payloads = payloads.len(), platform = params.platform_id))]
pub fn build_image(payloads: &[Payload], params: &BuildParams<'_>) -> Result<FlashImage, ImageError> {
    if payloads.is_empty() {
        return Err(ImageError::Empty);
    }

    let manifest = manifest::render(params.manifest, params.platform_id, params.emmc_sector_count);
    let mut region1 = ImageHeader::new(manifest.len() as u32).to_bytes().to_vec();
    region1.extend_from_slice(manifest.as_bytes());
    pad_to_chunk(&mut region1);

    let descriptors: Vec<WriteDescriptor> = payloads
        .iter()
        .map(|p| WriteDescriptor {
            chunk_count: 1,
            locations: p.locations.clone(),
        })
        .collect();
    let descriptor_len: usize = descriptors.iter().map(WriteDescriptor::encoded_len).sum();
    let store = StoreHeader::new(
        params.platform_id,
        descriptors.len() as u32,
        descriptor_len as u32,
        flash_only_table_index(payloads, params.gpt),
    );
    let mut region2 = store.to_bytes().to_vec();
    for descriptor in &descriptors {
        descriptor.write_to(&mut region2);
    }
    pad_to_chunk(&mut region2);

    let mut headers = region1;
    headers.extend_from_slice(&region2);
    let header_chunk_count = headers.len() / CHUNK_SIZE;

    let mut hash_table = Vec::with_capacity((header_chunk_count + payloads.len()) * 32);
    for chunk in headers.chunks(CHUNK_SIZE) {
        hash_table.extend_from_slice(&Sha256::digest(chunk));
    }
    for payload in payloads {
        hash_table.extend_from_slice(&payload.first_hash());
    }

    let catalog = Catalog::for_hash_table(&hash_table);
    let security = SecurityHeader::new(catalog.bytes.len() as u32, hash_table.len() as u32);

    let mut data = security.to_bytes().to_vec();
    data.extend_from_slice(&catalog.bytes);
    let table_start = data.len();
    data.extend_from_slice(&hash_table);
    let table_end = data.len();
    pad_to_chunk(&mut data);
    let headers_start = data.len();
    data.extend_from_slice(&headers);

    debug!(
        header_chunks = header_chunk_count,
        flash_only_index = store.flash_only_table_index,
        "Header regions built"
    );
    info!(bytes = data.len(), descriptors = store.write_descriptor_count, "Image built");

    Ok(FlashImage {
        header_chunk_count,
        hash_table: table_start..table_end,
        headers: headers_start..data.len(),
        data,
        store,
    })
}
