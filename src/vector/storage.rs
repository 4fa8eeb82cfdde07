//! On-disk store for per-subreddit indexes.
//!
//! Each subreddit owns a directory under the index root. Every save writes a
//! complete generation into its own directory, named after the index digest,
//! and then publishes it by atomically replacing the `CURRENT` pointer file:
//!
//! ```text
//! <root>/<subreddit>/CURRENT                      # name of the live generation
//! <root>/<subreddit>/<digest>/<subreddit>.ivf     # binary IVF-Flat index
//! <root>/<subreddit>/<digest>/<subreddit>_ids.json
//! ```
//!
//! A save that fails or is interrupted before the pointer switch leaves the
//! previous generation live. The generation published before the current one
//! is kept so that readers that resolved it just before a switch can finish.
//!
//! # Index Format
//!
//! - Header (52 bytes): magic `MSIV`, version, dimension, nlist, vector
//!   count (all `u32` LE), then a SHA-256 digest over those four fields and
//!   the payload
//! - Payload: `nlist * dimension` centroid values, then for each list its
//!   length, its positions and its vectors (`u32` / `f32` LE)
//!
//! The id table file repeats the digest. Loading fails closed when either
//! file is missing or the two disagree.

use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use memmap2::Mmap;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::error::{IndexError, IndexResult};
use crate::vector::ivf::{InvertedList, IvfFlatIndex};
use crate::vector::types::{IdTable, VectorDimension, validate_subreddit};

/// Current index format version.
const FORMAT_VERSION: u32 = 1;

/// Magic bytes to identify index files.
const MAGIC_BYTES: &[u8; 4] = b"MSIV";

const DIGEST_SIZE: usize = 32;

/// Header bytes covered by the digest: version, dimension, nlist, count.
const HEADER_FIELDS: std::ops::Range<usize> = 4..20;

/// Size of the index header in bytes.
const HEADER_SIZE: usize = HEADER_FIELDS.end + DIGEST_SIZE;

const INDEX_EXTENSION: &str = "ivf";
const IDS_SUFFIX: &str = "_ids.json";
const CURRENT_FILE: &str = "CURRENT";
const STAGING_PREFIX: &str = ".staging-";

/// Content digest of a saved index, used as its version stamp.
///
/// Two loads with equal stamps read the same index bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IndexStamp([u8; DIGEST_SIZE]);

impl IndexStamp {
    fn of(header_fields: &[u8], payload: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(header_fields);
        hasher.update(payload);
        Self(hasher.finalize().into())
    }

    pub fn to_hex(&self) -> String {
        self.0.iter().map(|b| format!("{b:02x}")).collect()
    }
}

impl std::fmt::Display for IndexStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.to_hex())
    }
}

/// Fixed-size header of an index file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndexHeader {
    pub version: u32,
    pub dimension: VectorDimension,
    pub nlist: usize,
    pub vector_count: usize,
    pub stamp: IndexStamp,
}

/// JSON companion of an index file.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct IdTableFile {
    subreddit: String,
    index_digest: String,
    built_at: DateTime<Utc>,
    document_ids: IdTable,
}

/// An index read back from disk with its metadata.
#[derive(Debug, Clone)]
pub struct StoredIndex {
    pub index: IvfFlatIndex,
    pub ids: IdTable,
    pub stamp: IndexStamp,
    pub built_at: DateTime<Utc>,
}

/// Durable per-subreddit index storage rooted at one directory.
#[derive(Debug, Clone)]
pub struct IndexStore {
    root: PathBuf,
}

impl IndexStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding every generation of `subreddit`.
    pub fn subreddit_dir(&self, subreddit: &str) -> PathBuf {
        self.root.join(subreddit)
    }

    /// Index file of the generation written with `stamp`.
    pub fn index_path_for(&self, subreddit: &str, stamp: &IndexStamp) -> PathBuf {
        self.subreddit_dir(subreddit)
            .join(stamp.to_hex())
            .join(index_file_name(subreddit))
    }

    /// Index file of the live generation.
    pub fn index_path(&self, subreddit: &str) -> IndexResult<PathBuf> {
        Ok(self.generation_dir(subreddit)?.join(index_file_name(subreddit)))
    }

    /// Id table file of the live generation.
    pub fn ids_path(&self, subreddit: &str) -> IndexResult<PathBuf> {
        Ok(self.generation_dir(subreddit)?.join(ids_file_name(subreddit)))
    }

    /// True when the live generation of `subreddit` has both artifacts.
    pub fn exists(&self, subreddit: &str) -> bool {
        validate_subreddit(subreddit).is_ok()
            && self.generation_dir(subreddit).is_ok_and(|dir| {
                dir.join(index_file_name(subreddit)).is_file()
                    && dir.join(ids_file_name(subreddit)).is_file()
            })
    }

    /// Persists an index and its id table as a new generation and makes it
    /// the live one.
    ///
    /// Returns the stamp of the written index. On error the previously live
    /// generation, if any, stays live.
    pub fn save(
        &self,
        subreddit: &str,
        index: &IvfFlatIndex,
        ids: &IdTable,
    ) -> IndexResult<IndexStamp> {
        validate_subreddit(subreddit)?;
        if ids.len() != index.vector_count() {
            return Err(IndexError::InvalidInput {
                reason: format!(
                    "id table has {} entries but the index holds {} vectors",
                    ids.len(),
                    index.vector_count()
                ),
            });
        }

        let sub_dir = self.subreddit_dir(subreddit);
        fs::create_dir_all(&sub_dir).map_err(|e| IndexError::io(&sub_dir, e))?;

        let payload = encode_payload(index);
        let mut blob = Vec::with_capacity(HEADER_SIZE + payload.len());
        write_header_fields(&mut blob, index);
        let stamp = IndexStamp::of(&blob[HEADER_FIELDS], &payload);
        blob.extend_from_slice(&stamp.0);
        blob.extend_from_slice(&payload);

        let ids_file = IdTableFile {
            subreddit: subreddit.to_string(),
            index_digest: stamp.to_hex(),
            built_at: Utc::now(),
            document_ids: ids.clone(),
        };
        let ids_json = serde_json::to_vec_pretty(&ids_file).map_err(|e| IndexError::InvalidInput {
            reason: format!("failed to serialize id table: {e}"),
        })?;

        let generation = stamp.to_hex();
        let generation_dir = sub_dir.join(&generation);
        if generation_dir.is_dir() {
            debug!(subreddit, %stamp, "generation already on disk, republishing it");
        } else {
            self.stage_generation(subreddit, &generation_dir, &blob, &ids_json)?;
        }

        let previous = self.read_current(subreddit).ok();
        let mut pointer =
            NamedTempFile::new_in(&sub_dir).map_err(|e| IndexError::io(&sub_dir, e))?;
        pointer
            .write_all(generation.as_bytes())
            .and_then(|()| pointer.as_file().sync_all())
            .map_err(|e| IndexError::io(pointer.path(), e))?;
        let current_path = sub_dir.join(CURRENT_FILE);
        pointer
            .persist(&current_path)
            .map_err(|e| IndexError::io(&current_path, e.error))?;

        self.prune(subreddit, &generation, previous.as_deref());

        info!(
            subreddit,
            path = %generation_dir.display(),
            vectors = index.vector_count(),
            bytes = blob.len(),
            stamp = %stamp,
            "saved index"
        );
        Ok(stamp)
    }

    /// Loads the live generation of a subreddit's index and id table.
    ///
    /// # Errors
    /// - `NotFound` when no generation is live or either artifact is missing
    /// - `Corrupted` when the header, digest or id table do not agree
    pub fn load(&self, subreddit: &str) -> IndexResult<StoredIndex> {
        validate_subreddit(subreddit)?;
        let dir = self.generation_dir(subreddit)?;
        let index_path = self.require(subreddit, dir.join(index_file_name(subreddit)))?;
        let ids_path = self.require(subreddit, dir.join(ids_file_name(subreddit)))?;

        let file = File::open(&index_path).map_err(|e| IndexError::io(&index_path, e))?;
        let len = file
            .metadata()
            .map_err(|e| IndexError::io(&index_path, e))?
            .len();
        if len < HEADER_SIZE as u64 {
            return Err(IndexError::corrupted(&index_path, "file too small to contain header"));
        }
        // Generation files are written once and never modified in place.
        let mmap = unsafe { Mmap::map(&file) }.map_err(|e| IndexError::io(&index_path, e))?;

        let header = parse_header(&mmap[..HEADER_SIZE], &index_path)?;
        let payload = &mmap[HEADER_SIZE..];
        if IndexStamp::of(&mmap[HEADER_FIELDS], payload) != header.stamp {
            return Err(IndexError::corrupted(&index_path, "digest mismatch"));
        }
        let index = decode_payload(payload, &header, &index_path)?;

        let ids_bytes = fs::read(&ids_path).map_err(|e| IndexError::io(&ids_path, e))?;
        let ids_file: IdTableFile = serde_json::from_slice(&ids_bytes)
            .map_err(|e| IndexError::corrupted(&ids_path, e.to_string()))?;

        if ids_file.index_digest != header.stamp.to_hex() {
            return Err(IndexError::corrupted(
                &ids_path,
                "id table belongs to a different index build",
            ));
        }
        if ids_file.document_ids.len() != index.vector_count() {
            return Err(IndexError::corrupted(
                &ids_path,
                format!(
                    "{} ids for {} vectors",
                    ids_file.document_ids.len(),
                    index.vector_count()
                ),
            ));
        }

        debug!(
            subreddit,
            path = %index_path.display(),
            vectors = index.vector_count(),
            nlist = index.nlist(),
            "loaded index"
        );

        Ok(StoredIndex {
            index,
            ids: ids_file.document_ids,
            stamp: header.stamp,
            built_at: ids_file.built_at,
        })
    }

    /// Reads only the header of a subreddit's live index.
    pub fn header(&self, subreddit: &str) -> IndexResult<IndexHeader> {
        validate_subreddit(subreddit)?;
        let dir = self.generation_dir(subreddit)?;
        let index_path = self.require(subreddit, dir.join(index_file_name(subreddit)))?;
        self.require(subreddit, dir.join(ids_file_name(subreddit)))?;

        let mut file = File::open(&index_path).map_err(|e| IndexError::io(&index_path, e))?;
        let mut buf = [0u8; HEADER_SIZE];
        file.read_exact(&mut buf).map_err(|e| match e.kind() {
            std::io::ErrorKind::UnexpectedEof => {
                IndexError::corrupted(&index_path, "file too small to contain header")
            }
            _ => IndexError::io(&index_path, e),
        })?;
        parse_header(&buf, &index_path)
    }

    /// Current version stamp of a subreddit's index, without loading it.
    pub fn stamp(&self, subreddit: &str) -> IndexResult<IndexStamp> {
        self.header(subreddit).map(|h| h.stamp)
    }

    /// Subreddits with a live, complete generation, sorted by name.
    pub fn list(&self) -> IndexResult<Vec<String>> {
        let entries = match fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(IndexError::io(&self.root, e)),
        };

        let mut subreddits = Vec::new();
        for entry in entries {
            let path = entry.map_err(|e| IndexError::io(&self.root, e))?.path();
            if !path.is_dir() {
                continue;
            }
            let Some(name) = path.file_name().and_then(|s| s.to_str()) else {
                continue;
            };
            if self.exists(name) {
                subreddits.push(name.to_string());
            }
        }
        subreddits.sort();
        Ok(subreddits)
    }

    fn read_current(&self, subreddit: &str) -> IndexResult<String> {
        let path = self.subreddit_dir(subreddit).join(CURRENT_FILE);
        let generation = match fs::read_to_string(&path) {
            Ok(text) => text.trim().to_string(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(IndexError::NotFound {
                    subreddit: subreddit.to_string(),
                    path,
                });
            }
            Err(e) => return Err(IndexError::io(&path, e)),
        };
        if !is_generation_name(&generation) {
            return Err(IndexError::corrupted(&path, "pointer does not name a generation"));
        }
        Ok(generation)
    }

    fn generation_dir(&self, subreddit: &str) -> IndexResult<PathBuf> {
        let generation = self.read_current(subreddit)?;
        Ok(self.subreddit_dir(subreddit).join(generation))
    }

    /// Writes both artifacts into a staging directory, then renames it to
    /// `generation_dir`. A failure removes the staging directory.
    fn stage_generation(
        &self,
        subreddit: &str,
        generation_dir: &Path,
        blob: &[u8],
        ids_json: &[u8],
    ) -> IndexResult<()> {
        let sub_dir = self.subreddit_dir(subreddit);
        let staging = tempfile::Builder::new()
            .prefix(STAGING_PREFIX)
            .tempdir_in(&sub_dir)
            .map_err(|e| IndexError::io(&sub_dir, e))?;

        write_synced(&staging.path().join(index_file_name(subreddit)), blob)?;
        write_synced(&staging.path().join(ids_file_name(subreddit)), ids_json)?;

        // Dropping `staging` after a successful rename finds nothing to remove
        match fs::rename(staging.path(), generation_dir) {
            Ok(()) => Ok(()),
            // A concurrent save of the same build got there first
            Err(_) if generation_dir.is_dir() => Ok(()),
            Err(e) => Err(IndexError::io(generation_dir, e)),
        }
    }

    /// Removes generations other than `current` and `previous`. Failures are
    /// logged, never returned: the new generation is already live.
    fn prune(&self, subreddit: &str, current: &str, previous: Option<&str>) {
        let sub_dir = self.subreddit_dir(subreddit);
        let entries = match fs::read_dir(&sub_dir) {
            Ok(entries) => entries,
            Err(e) => {
                warn!(subreddit, error = %e, "could not scan old generations");
                return;
            }
        };

        for entry in entries.flatten() {
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            if !is_generation_name(name) || name == current || Some(name) == previous {
                continue;
            }
            match fs::remove_dir_all(entry.path()) {
                Ok(()) => debug!(subreddit, generation = name, "pruned old generation"),
                Err(e) => warn!(subreddit, generation = name, error = %e, "could not prune old generation"),
            }
        }
    }

    fn require(&self, subreddit: &str, path: PathBuf) -> IndexResult<PathBuf> {
        if path.is_file() {
            Ok(path)
        } else {
            Err(IndexError::NotFound {
                subreddit: subreddit.to_string(),
                path,
            })
        }
    }
}

fn index_file_name(subreddit: &str) -> String {
    format!("{subreddit}.{INDEX_EXTENSION}")
}

fn ids_file_name(subreddit: &str) -> String {
    format!("{subreddit}{IDS_SUFFIX}")
}

/// Generation directories are named by the lowercase hex digest.
fn is_generation_name(name: &str) -> bool {
    name.len() == DIGEST_SIZE * 2
        && name
            .bytes()
            .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b))
}

fn write_synced(path: &Path, bytes: &[u8]) -> IndexResult<()> {
    let mut file = File::create(path).map_err(|e| IndexError::io(path, e))?;
    file.write_all(bytes)
        .and_then(|()| file.sync_all())
        .map_err(|e| IndexError::io(path, e))
}

fn write_header_fields(out: &mut Vec<u8>, index: &IvfFlatIndex) {
    out.extend_from_slice(MAGIC_BYTES);
    out.extend_from_slice(&FORMAT_VERSION.to_le_bytes());
    out.extend_from_slice(&(index.dimension().get() as u32).to_le_bytes());
    out.extend_from_slice(&(index.nlist() as u32).to_le_bytes());
    out.extend_from_slice(&(index.vector_count() as u32).to_le_bytes());
}

fn encode_payload(index: &IvfFlatIndex) -> Vec<u8> {
    let dim = index.dimension().get();
    let mut out = Vec::with_capacity(
        4 * (index.nlist() * (dim + 1) + index.vector_count() * (dim + 1)),
    );
    for centroid in index.centroids() {
        for value in centroid {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    for list in index.lists() {
        out.extend_from_slice(&(list.len() as u32).to_le_bytes());
        for position in list.positions() {
            out.extend_from_slice(&position.to_le_bytes());
        }
        for value in list.vectors() {
            out.extend_from_slice(&value.to_le_bytes());
        }
    }
    out
}

fn parse_header(buf: &[u8], path: &Path) -> IndexResult<IndexHeader> {
    if &buf[0..4] != MAGIC_BYTES {
        return Err(IndexError::corrupted(path, "invalid magic bytes"));
    }
    let mut reader = ByteReader::new(&buf[HEADER_FIELDS.start..HEADER_SIZE], path);
    let version = reader.u32()?;
    if version != FORMAT_VERSION {
        return Err(IndexError::corrupted(
            path,
            format!("unsupported format version {version}, expected {FORMAT_VERSION}"),
        ));
    }
    let dimension = VectorDimension::new(reader.u32()? as usize)
        .map_err(|_| IndexError::corrupted(path, "zero dimension in header"))?;
    let nlist = reader.u32()? as usize;
    let vector_count = reader.u32()? as usize;
    let mut digest = [0u8; DIGEST_SIZE];
    digest.copy_from_slice(reader.bytes(DIGEST_SIZE)?);

    Ok(IndexHeader {
        version,
        dimension,
        nlist,
        vector_count,
        stamp: IndexStamp(digest),
    })
}

fn decode_payload(payload: &[u8], header: &IndexHeader, path: &Path) -> IndexResult<IvfFlatIndex> {
    let dim = header.dimension.get();

    // Every list needs its centroid and a length word; every vector its
    // position and values. Reject headers the payload cannot hold before
    // sizing anything from them.
    let required = dim
        .checked_add(1)
        .and_then(|row| row.checked_mul(4))
        .and_then(|row| {
            row.checked_mul(header.nlist)?
                .checked_add(row.checked_mul(header.vector_count)?)
        });
    if required.is_none_or(|bytes| bytes > payload.len()) {
        return Err(IndexError::corrupted(
            path,
            format!(
                "header declares {} lists and {} vectors of dimension {dim}, payload holds {} bytes",
                header.nlist,
                header.vector_count,
                payload.len()
            ),
        ));
    }

    let mut reader = ByteReader::new(payload, path);
    let mut centroids = Vec::with_capacity(header.nlist);
    for _ in 0..header.nlist {
        centroids.push(reader.f32s(dim)?);
    }

    let mut lists = Vec::with_capacity(header.nlist);
    for _ in 0..header.nlist {
        let len = reader.u32()? as usize;
        let positions = reader.u32s(len)?;
        let vectors = reader.f32s(len.saturating_mul(dim))?;
        lists.push(InvertedList::from_parts(positions, vectors));
    }
    if !reader.is_empty() {
        return Err(IndexError::corrupted(path, "trailing bytes after inverted lists"));
    }

    let index = IvfFlatIndex::from_parts(header.dimension, centroids, lists)
        .map_err(|reason| IndexError::corrupted(path, reason))?;
    if index.vector_count() != header.vector_count {
        return Err(IndexError::corrupted(
            path,
            format!(
                "header declares {} vectors, lists hold {}",
                header.vector_count,
                index.vector_count()
            ),
        ));
    }
    Ok(index)
}

/// Little-endian cursor that reports truncation as corruption.
struct ByteReader<'a> {
    buf: &'a [u8],
    pos: usize,
    path: &'a Path,
}

impl<'a> ByteReader<'a> {
    fn new(buf: &'a [u8], path: &'a Path) -> Self {
        Self { buf, pos: 0, path }
    }

    fn is_empty(&self) -> bool {
        self.pos == self.buf.len()
    }

    fn bytes(&mut self, n: usize) -> IndexResult<&'a [u8]> {
        let end = self
            .pos
            .checked_add(n)
            .filter(|&end| end <= self.buf.len())
            .ok_or_else(|| IndexError::corrupted(self.path, "unexpected end of file"))?;
        let slice = &self.buf[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u32(&mut self) -> IndexResult<u32> {
        let b = self.bytes(4)?;
        Ok(u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
    }

    fn u32s(&mut self, n: usize) -> IndexResult<Vec<u32>> {
        let bytes = self.bytes(n.saturating_mul(4))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }

    fn f32s(&mut self, n: usize) -> IndexResult<Vec<f32>> {
        let bytes = self.bytes(n.saturating_mul(4))?;
        Ok(bytes
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect())
    }
}
