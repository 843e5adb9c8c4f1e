use std::{
    collections::HashMap,
    fs::File,
    io::{self, BufReader, Read, Seek, SeekFrom},
    sync::Arc,
};

use binrw::BinRead;
use byteorder::{ReadBytesExt, LE};
use camino::Utf8Path;
use xxhash_rust::xxh3::Xxh3;

use crate::{
    hash_entry_key, normalize_entry_name, normalize_owner, ContainerCompression, ContainerEntry,
    ContainerError, EntryKind, RangeReader, ReadSeek, Result, SharedSource,
};

/// File magic of a resource container.
pub const CONTAINER_MAGIC: [u8; 8] = *b"_pkcont_";

/// Newest container format revision this build can read and write.
pub const CONTAINER_VERSION: u32 = 1;

/// Strings in the owner/name tables are never longer than this.
pub(crate) const MAX_STRING_LEN: u32 = 4096;

/// A mounted resource container.
///
/// Cloning is cheap and every clone refers to the same open source. Streams handed out by
/// [`get_resource`](Self::get_resource) and friends stay valid until the container is
/// [closed](Self::close), after which they fail with an IO error.
#[derive(Clone)]
pub struct ResourceContainer {
    inner: Arc<ContainerInner>,
}

struct ContainerInner {
    source: SharedSource,
    version: u32,
    owners: Vec<String>,
    names: Vec<String>,
    entries: HashMap<u64, ContainerEntry>,
}

/// A borrowed view of one index entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo<'a> {
    pub owner: &'a str,
    pub name: &'a str,
    pub kind: EntryKind,
    pub compression: ContainerCompression,
    pub size: u64,
    pub stored_size: u64,
}

/// A readable stream over one entry's decoded bytes.
pub enum EntryReader {
    Stored(RangeReader),
    Zstd(zstd::stream::read::Decoder<'static, BufReader<RangeReader>>),
}

impl EntryReader {
    fn new(range: RangeReader, compression: ContainerCompression) -> io::Result<Self> {
        Ok(match compression {
            ContainerCompression::None => EntryReader::Stored(range),
            ContainerCompression::Zstd => {
                EntryReader::Zstd(zstd::stream::read::Decoder::new(range)?)
            }
        })
    }
}

impl Read for EntryReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            EntryReader::Stored(reader) => reader.read(buf),
            EntryReader::Zstd(reader) => reader.read(buf),
        }
    }
}

impl ResourceContainer {
    /// Open and validate the container at `path`.
    pub fn open(path: impl AsRef<Utf8Path>) -> Result<Self> {
        let path = path.as_ref();
        tracing::debug!("Opening container path={}", path);
        Self::mount(File::open(path.as_std_path())?)
    }

    /// Validate and mount a container from any seekable reader.
    ///
    /// The header and the whole index are checked up front: magic, version, string table
    /// indices, duplicate keys and that every entry's byte range lies inside the payload.
    pub fn mount<R: ReadSeek + 'static>(source: R) -> Result<Self> {
        let source = SharedSource::new(source);
        let inner = read_index(&source).map_err(|error| match error {
            ContainerError::Io(io) if io.kind() == io::ErrorKind::UnexpectedEof => {
                ContainerError::Corrupt("unexpected end of file".to_string())
            }
            other => other,
        })?;

        Ok(Self {
            inner: Arc::new(inner),
        })
    }

    pub fn version(&self) -> u32 {
        self.inner.version
    }

    pub fn len(&self) -> usize {
        self.inner.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.entries.is_empty()
    }

    pub fn is_open(&self) -> bool {
        self.inner.source.is_open()
    }

    /// Release the underlying source. Outstanding streams fail on their next read.
    pub fn close(&self) {
        if self.inner.source.close() {
            tracing::debug!("Closed container entries={}", self.len());
        }
    }

    /// Owner ids recorded in the container, in table order.
    pub fn owners(&self) -> &[String] {
        &self.inner.owners
    }

    /// Every entry, ordered by owner, kind and name.
    pub fn entries(&self) -> Vec<EntryInfo<'_>> {
        let mut entries = self
            .inner
            .entries
            .values()
            .map(|entry| self.info(entry))
            .collect::<Vec<_>>();
        entries.sort_by(|a, b| {
            (a.owner, a.kind, a.name).cmp(&(b.owner, b.kind, b.name))
        });
        entries
    }

    pub fn contains(&self, owner: &str, name: &str, kind: EntryKind) -> bool {
        self.find(owner, name, kind).is_some()
    }

    /// Stream a resource; `normalized` selects the canonicalized variant.
    pub fn get_resource(&self, owner: &str, name: &str, normalized: bool) -> Result<EntryReader> {
        let kind = match normalized {
            true => EntryKind::NormalizedResource,
            false => EntryKind::Resource,
        };
        self.open_entry(owner, name, kind)
    }

    pub fn get_asset(&self, owner: &str, name: &str) -> Result<EntryReader> {
        self.open_entry(owner, name, EntryKind::Asset)
    }

    pub fn open_entry(&self, owner: &str, name: &str, kind: EntryKind) -> Result<EntryReader> {
        if !self.is_open() {
            return Err(ContainerError::Closed);
        }

        let entry = self
            .find(owner, name, kind)
            .ok_or_else(|| ContainerError::ResourceNotFound {
                owner: owner.to_string(),
                name: name.to_string(),
                kind,
            })?;

        let range = self.inner.source.range(entry.data_offset, entry.stored_size);
        Ok(EntryReader::new(range, entry.compression)?)
    }

    /// Re-hash every entry's stored bytes and compare against the index checksums.
    pub fn verify(&self) -> Result<()> {
        if !self.is_open() {
            return Err(ContainerError::Closed);
        }

        let mut buf = vec![0u8; 64 * 1024];
        for entry in self.inner.entries.values() {
            let mut range = self.inner.source.range(entry.data_offset, entry.stored_size);
            let mut hasher = Xxh3::new();
            loop {
                let read = range.read(&mut buf)?;
                if read == 0 {
                    break;
                }
                hasher.update(&buf[..read]);
            }

            if hasher.digest() != entry.checksum {
                let info = self.info(entry);
                return Err(ContainerError::Corrupt(format!(
                    "checksum mismatch for {} '{}' of owner '{}'",
                    info.kind, info.name, info.owner
                )));
            }
        }

        Ok(())
    }

    fn find(&self, owner: &str, name: &str, kind: EntryKind) -> Option<&ContainerEntry> {
        let entry = self.inner.entries.get(&hash_entry_key(owner, name, kind))?;
        let info = self.info(entry);

        // Hash collisions between distinct keys are possible in principle
        let matches = normalize_owner(info.owner) == normalize_owner(owner)
            && normalize_entry_name(info.name) == normalize_entry_name(name);
        matches.then_some(entry)
    }

    fn info<'a>(&'a self, entry: &ContainerEntry) -> EntryInfo<'a> {
        EntryInfo {
            owner: &self.inner.owners[entry.owner_index as usize],
            name: &self.inner.names[entry.name_index as usize],
            kind: entry.kind,
            compression: entry.compression,
            size: entry.size,
            stored_size: entry.stored_size,
        }
    }
}

impl std::fmt::Debug for ResourceContainer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ResourceContainer")
            .field("version", &self.inner.version)
            .field("owners", &self.inner.owners)
            .field("entries", &self.inner.entries.len())
            .field("open", &self.is_open())
            .finish()
    }
}

fn read_index(source: &SharedSource) -> Result<ContainerInner> {
    let file_len = source.len()?;
    let mut reader = BufReader::new(source.full_range()?);

    let mut magic = [0u8; 8];
    reader.read_exact(&mut magic)?;
    if magic != CONTAINER_MAGIC {
        return Err(ContainerError::Corrupt(format!("invalid magic {:02x?}", magic)));
    }

    let version = reader.read_u32::<LE>()?;
    if version == 0 {
        return Err(ContainerError::Corrupt("version 0 is not valid".to_string()));
    }
    if version > CONTAINER_VERSION {
        return Err(ContainerError::UnsupportedVersion {
            version,
            supported: CONTAINER_VERSION,
        });
    }

    let entry_count = reader.read_u32::<LE>()?;
    let owner_count = reader.read_u32::<LE>()?;
    let name_count = reader.read_u32::<LE>()?;

    let owners = read_string_table(&mut reader, owner_count, file_len)?;
    let names = read_string_table(&mut reader, name_count, file_len)?;

    // Skip alignment
    let position = reader.stream_position()?;
    let padding = (8 - (position % 8)) % 8;
    reader.seek(SeekFrom::Current(padding as i64))?;

    let index_len = entry_count as u64 * ContainerEntry::size_of() as u64;
    let payload_offset = position + padding + index_len;
    if payload_offset > file_len {
        return Err(ContainerError::Corrupt(format!(
            "index of {} entries extends past end of file",
            entry_count
        )));
    }

    let mut entries = HashMap::with_capacity(entry_count as usize);
    for _ in 0..entry_count {
        let entry = ContainerEntry::read(&mut reader)?;
        validate_entry(&entry, &owners, &names, payload_offset, file_len)?;

        if entries.insert(entry.key_hash, entry).is_some() {
            return Err(ContainerError::Corrupt(format!(
                "duplicate entry '{}' in index",
                names[entry.name_index as usize]
            )));
        }
    }

    tracing::debug!(
        "Mounted container version={} entries={} owners={}",
        version,
        entries.len(),
        owners.len()
    );

    Ok(ContainerInner {
        source: source.clone(),
        version,
        owners,
        names,
        entries,
    })
}

fn read_string_table<R: Read>(reader: &mut R, count: u32, file_len: u64) -> Result<Vec<String>> {
    // Each string needs at least its length prefix
    if count as u64 * 4 > file_len {
        return Err(ContainerError::Corrupt(format!(
            "string table of {} entries exceeds file size",
            count
        )));
    }

    let mut strings = Vec::with_capacity(count as usize);
    for _ in 0..count {
        let len = reader.read_u32::<LE>()?;
        if len > MAX_STRING_LEN {
            return Err(ContainerError::Corrupt(format!(
                "string of length {} exceeds the maximum of {}",
                len, MAX_STRING_LEN
            )));
        }

        let mut buf = vec![0; len as usize];
        reader.read_exact(&mut buf)?;
        let string = String::from_utf8(buf).map_err(|_| {
            ContainerError::Corrupt("string table contains invalid UTF-8".to_string())
        })?;
        strings.push(string);
    }

    Ok(strings)
}

fn validate_entry(
    entry: &ContainerEntry,
    owners: &[String],
    names: &[String],
    payload_offset: u64,
    file_len: u64,
) -> Result<()> {
    let owner = owners.get(entry.owner_index as usize).ok_or_else(|| {
        ContainerError::Corrupt(format!("owner index {} out of range", entry.owner_index))
    })?;
    let name = names.get(entry.name_index as usize).ok_or_else(|| {
        ContainerError::Corrupt(format!("name index {} out of range", entry.name_index))
    })?;

    let in_bounds = entry.data_offset >= payload_offset
        && entry.data_end().is_some_and(|end| end <= file_len);
    if !in_bounds {
        return Err(ContainerError::Corrupt(format!(
            "{} '{}' of owner '{}' points outside the payload region",
            entry.kind, name, owner
        )));
    }

    if entry.compression == ContainerCompression::None && entry.size != entry.stored_size {
        return Err(ContainerError::Corrupt(format!(
            "uncompressed {} '{}' has mismatching sizes",
            entry.kind, name
        )));
    }

    if entry.key_hash != hash_entry_key(owner, name, entry.kind) {
        return Err(ContainerError::Corrupt(format!(
            "key hash mismatch for {} '{}' of owner '{}'",
            entry.kind, name, owner
        )));
    }

    Ok(())
}
