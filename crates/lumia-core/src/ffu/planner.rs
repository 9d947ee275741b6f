//! Payload planning.
//!
//! Flash parts are cut into fixed-size chunks, hashed with SHA-256 and
//! grouped by content: one payload is written once and fanned out by the
//! device to every target chunk that carries the same bytes.

use std::collections::HashMap;
use std::fmt;
use std::io::{Read, Seek, SeekFrom};
use std::ops::Range;

use sha2::{Digest, Sha256};
use tracing::{debug, info, instrument, warn};

use super::ImageError;
use crate::progress::ProgressUpdater;
use crate::protocol::constants::{CHUNK_SIZE, SECTOR_SIZE};

/// Readable, seekable partition content.
pub trait PartStream: Read + Seek + Send {}

impl<T: Read + Seek + Send> PartStream for T {}

/// One region of the disk to rewrite.
pub struct FlashPart {
    pub stream: Box<dyn PartStream>,
    pub start_sector: u64,
    pub progress_label: String,
}

impl FlashPart {
    pub fn new(stream: impl PartStream + 'static, start_sector: u64, label: impl Into<String>) -> Self {
        Self {
            stream: Box::new(stream),
            start_sector,
            progress_label: label.into(),
        }
    }
}

impl fmt::Debug for FlashPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FlashPart")
            .field("start_sector", &self.start_sector)
            .field("progress_label", &self.progress_label)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct PlanOptions {
    pub chunk_size: usize,
    /// Require chunk-aligned stream lengths. Start sectors are always checked.
    pub check_alignment: bool,
}

impl Default for PlanOptions {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            check_alignment: true,
        }
    }
}

/// Where a chunk's bytes come from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkSource {
    pub part_index: usize,
    pub offset: u64,
}

/// Identical chunk content destined for one or more disk chunks.
///
/// `locations`, `sources` and `hashes` are index-aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload {
    pub locations: Vec<u32>,
    pub sources: Vec<ChunkSource>,
    pub hashes: Vec<[u8; 32]>,
}

impl Payload {
    fn new(location: u32, source: ChunkSource, hash: [u8; 32]) -> Self {
        Self {
            locations: vec![location],
            sources: vec![source],
            hashes: vec![hash],
        }
    }

    pub fn first_hash(&self) -> [u8; 32] {
        self.hashes[0]
    }

    pub fn first_location(&self) -> u32 {
        self.locations[0]
    }

    pub fn is_single_location(&self) -> bool {
        self.locations.len() == 1
    }
}

/// Check alignment of every part before any content is read.
pub fn validate_parts(parts: &mut [FlashPart], options: &PlanOptions) -> Result<Vec<u64>, ImageError> {
    let chunk = options.chunk_size as u64;
    let mut lengths = Vec::with_capacity(parts.len());

    for part in parts.iter_mut() {
        let byte_offset = part.start_sector * SECTOR_SIZE;
        if byte_offset % chunk != 0 {
            return Err(ImageError::AlignmentViolation {
                label: part.progress_label.clone(),
                reason: format!(
                    "start sector {} (byte offset 0x{:X}) is not a multiple of the chunk size",
                    part.start_sector, byte_offset
                ),
            });
        }

        let len = part
            .stream
            .seek(SeekFrom::End(0))
            .and_then(|len| part.stream.seek(SeekFrom::Start(0)).map(|_| len))
            .map_err(|e| ImageError::NotSeekable {
                label: part.progress_label.clone(),
                message: e.to_string(),
            })?;

        if len % chunk != 0 {
            if options.check_alignment {
                return Err(ImageError::AlignmentViolation {
                    label: part.progress_label.clone(),
                    reason: format!("length {len} is not a multiple of the chunk size"),
                });
            }
            warn!(label = %part.progress_label, len, "Unaligned length, last chunk is zero-padded");
        }
        lengths.push(len);
    }
    Ok(lengths)
}

/// Read one chunk, zero-padding a short tail.
pub fn read_chunk(
    parts: &mut [FlashPart],
    source: ChunkSource,
    chunk_size: usize,
    buf: &mut [u8],
) -> Result<(), ImageError> {
    let buf = &mut buf[..chunk_size];
    let stream = &mut parts[source.part_index].stream;
    stream.seek(SeekFrom::Start(source.offset))?;

    let mut filled = 0;
    while filled < chunk_size {
        let n = stream.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    buf[filled..].fill(0);
    Ok(())
}

/// Split, hash and group flash parts into payloads.
///
/// The result is stable-sorted by ascending location count: the device
/// rejects a multi-location payload that precedes a single-location one.
#[instrument(skip_all, fields(parts = parts.len()))]
pub fn plan_payloads(
    parts: &mut [FlashPart],
    options: &PlanOptions,
    progress: Option<&ProgressUpdater>,
) -> Result<Vec<Payload>, ImageError> {
    let lengths = validate_parts(parts, options)?;
    let chunk = options.chunk_size as u64;

    let total_chunks: u64 = lengths.iter().map(|len| len.div_ceil(chunk)).sum();
    if let Some(progress) = progress {
        progress.reset(total_chunks);
    }

    let mut payloads: Vec<Payload> = Vec::new();
    let mut by_hash: HashMap<[u8; 32], usize> = HashMap::new();
    let mut buf = vec![0u8; options.chunk_size];

    for part_index in 0..parts.len() {
        let first_chunk = parts[part_index].start_sector * SECTOR_SIZE / chunk;
        let chunk_count = lengths[part_index].div_ceil(chunk);
        debug!(
            label = %parts[part_index].progress_label,
            first_chunk,
            chunk_count,
            "Hashing part"
        );

        for i in 0..chunk_count {
            let source = ChunkSource {
                part_index,
                offset: i * chunk,
            };
            read_chunk(parts, source, options.chunk_size, &mut buf)?;
            let hash: [u8; 32] = Sha256::digest(&buf).into();
            let location = u32::try_from(first_chunk + i)
                .map_err(|_| ImageError::LocationOutOfRange(first_chunk + i))?;

            match by_hash.get(&hash) {
                Some(&index) => {
                    let payload = &mut payloads[index];
                    payload.locations.push(location);
                    payload.sources.push(source);
                    payload.hashes.push(hash);
                }
                None => {
                    by_hash.insert(hash, payloads.len());
                    payloads.push(Payload::new(location, source, hash));
                }
            }

            if let Some(progress) = progress {
                progress.increase_progress(1);
            }
        }
    }

    payloads.sort_by_key(|p| p.locations.len());

    info!(
        chunks = total_chunks,
        payloads = payloads.len(),
        "Payload plan ready"
    );
    Ok(payloads)
}

/// Group payload indices into transfers for the V2 payload command.
///
/// Consecutive single-location payloads share a burst of at most
/// `max_chunks` chunks; every multi-location payload travels alone.
pub fn bursts(payloads: &[Payload], max_chunks: usize) -> Vec<Range<usize>> {
    let max_chunks = max_chunks.max(1);
    let mut out = Vec::new();
    let mut start = 0;

    while start < payloads.len() {
        let mut end = start + 1;
        if payloads[start].is_single_location() {
            while end < payloads.len()
                && end - start < max_chunks
                && payloads[end].is_single_location()
            {
                end += 1;
            }
        }
        out.push(start..end);
        start = end;
    }
    out
}


#[cfg(test)]
mod tests {
    use std::io::{self, Cursor};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::testing::part_with_chunks;
    use super::*;

    const CHUNK_SECTORS: u64 = (CHUNK_SIZE as u64) / SECTOR_SIZE;

    #[test]
    fn test_locations_cover_every_chunk_and_sorted() {
        let mut parts = vec![
            part_with_chunks(0, &[1, 2, 0, 0, 3], CHUNK_SIZE),
            part_with_chunks(CHUNK_SECTORS * 16, &[0, 4, 2], CHUNK_SIZE),
            part_with_chunks(CHUNK_SECTORS * 40, &[5], CHUNK_SIZE),
        ];
        let payloads = plan_payloads(&mut parts, &PlanOptions::default(), None).unwrap();

        let total: usize = payloads.iter().map(|p| p.locations.len()).sum();
        assert_eq!(total, 9);
        assert!(payloads.windows(2).all(|w| w[0].locations.len() <= w[1].locations.len()));

        for p in &payloads {
            assert_eq!(p.locations.len(), p.sources.len());
            assert_eq!(p.locations.len(), p.hashes.len());
            assert!(p.hashes.iter().all(|h| *h == p.first_hash()));
        }

        let zeros = payloads.last().unwrap();
        assert_eq!(zeros.locations, vec![2, 3, 16]);
        let twos = payloads.iter().find(|p| p.locations == vec![1, 18]).unwrap();
        assert_eq!(twos.sources[1], ChunkSource { part_index: 1, offset: 2 * CHUNK_SIZE as u64 });
    }

    #[test]
    fn test_two_distinct_parts_give_two_payloads() {
        // Small chunk size so four sectors are exactly one chunk.
        let options = PlanOptions {
            chunk_size: 2048,
            check_alignment: true,
        };
        let mut parts = vec![
            FlashPart::new(Cursor::new(vec![0xEE; 2048]), 100, "EFIESP"),
            FlashPart::new(Cursor::new(vec![0x55; 2048]), 2000, "MainOS"),
        ];
        let payloads = plan_payloads(&mut parts, &options, None).unwrap();
        assert_eq!(payloads.len(), 2);
        assert!(payloads.iter().all(Payload::is_single_location));
        let mut locations: Vec<u32> = payloads.iter().map(Payload::first_location).collect();
        locations.sort();
        assert_eq!(locations, vec![25, 500]);
    }

    struct CountingReader {
        inner: Cursor<Vec<u8>>,
        reads: Arc<AtomicUsize>,
    }

    impl Read for CountingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.reads.fetch_add(1, Ordering::SeqCst);
            self.inner.read(buf)
        }
    }

    impl Seek for CountingReader {
        fn seek(&mut self, pos: SeekFrom) -> io::Result<u64> {
            self.inner.seek(pos)
        }
    }

    #[test]
    fn test_misaligned_start_rejected_before_hashing() {
        let reads = Arc::new(AtomicUsize::new(0));
        let good = CountingReader {
            inner: Cursor::new(vec![1; CHUNK_SIZE]),
            reads: reads.clone(),
        };
        let mut parts = vec![
            FlashPart::new(good, 0, "first"),
            part_with_chunks(100, &[7], CHUNK_SIZE),
        ];
        let err = plan_payloads(&mut parts, &PlanOptions::default(), None).unwrap_err();
        assert!(matches!(err, ImageError::AlignmentViolation { ref label, .. } if label == "part@100"));
        assert_eq!(reads.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_unaligned_length() {
        let mut parts = vec![FlashPart::new(Cursor::new(vec![9u8; CHUNK_SIZE + 10]), 0, "tail")];
        assert!(matches!(
            plan_payloads(&mut parts, &PlanOptions::default(), None),
            Err(ImageError::AlignmentViolation { .. })
        ));

        let relaxed = PlanOptions {
            check_alignment: false,
            ..Default::default()
        };
        let payloads = plan_payloads(&mut parts, &relaxed, None).unwrap();
        assert_eq!(payloads.iter().map(|p| p.locations.len()).sum::<usize>(), 2);

        let mut buf = vec![0xFF; CHUNK_SIZE];
        let tail = ChunkSource { part_index: 0, offset: CHUNK_SIZE as u64 };
        read_chunk(&mut parts, tail, CHUNK_SIZE, &mut buf).unwrap();
        assert_eq!(&buf[..10], &[9u8; 10]);
        assert!(buf[10..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_progress_counts_chunks() {
        let progress = ProgressUpdater::silent(0);
        let mut parts = vec![part_with_chunks(0, &[1, 2, 3], CHUNK_SIZE)];
        plan_payloads(&mut parts, &PlanOptions::default(), Some(&progress)).unwrap();
        let report = progress.report();
        assert_eq!((report.completed, report.total), (3, 3));
    }

    #[test]
    fn test_bursts_batch_single_locations_only() {
        let single = |l| Payload::new(l, ChunkSource { part_index: 0, offset: 0 }, [l as u8; 32]);
        let mut multi = single(90);
        multi.locations.push(91);
        multi.sources.push(ChunkSource { part_index: 0, offset: 0 });
        multi.hashes.push([90; 32]);

        let payloads = vec![single(0), single(1), single(2), single(3), single(4), multi.clone(), multi];
        assert_eq!(bursts(&payloads, 2), vec![0..2, 2..4, 4..5, 5..6, 6..7]);
        assert_eq!(bursts(&payloads, 0), (0..7).map(|i| i..i + 1).collect::<Vec<_>>());
        assert!(bursts(&[], 4).is_empty());
    }
}
