use binrw::BinWrite;
use byteorder::{WriteBytesExt, LE};
use std::collections::{BTreeMap, HashMap};
use std::io::{self, BufWriter, Seek, SeekFrom, Write};
use xxhash_rust::xxh3::Xxh3;

use crate::container::MAX_STRING_LEN;
use crate::{
    hash_entry_key, normalize_entry_name, normalize_owner, ContainerCompression, ContainerEntry,
    EntryKind, CONTAINER_MAGIC, CONTAINER_VERSION,
};

/// zstd level used for compressed entries.
const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, thiserror::Error)]
pub enum ContainerBuilderError {
    #[error("io error")]
    IoError(#[from] io::Error),

    #[error("binrw error")]
    BinWriteError(#[from] binrw::Error),

    #[error("duplicate {kind} '{name}' for owner '{owner}'")]
    DuplicateEntry {
        owner: String,
        name: String,
        kind: EntryKind,
    },

    #[error("invalid entry name: {0:?}")]
    InvalidName(String),

    #[error("invalid owner id: {0:?}")]
    InvalidOwner(String),

    #[error("failed to provide data for '{name}': {reason}")]
    Provider { name: String, reason: String },
}

/// Collects entries and writes a container in one pass.
#[derive(Debug, Clone, Default)]
pub struct ContainerBuilder {
    entries: BTreeMap<u64, ContainerEntryBuilder>,
}

#[derive(Debug, Clone)]
pub struct ContainerEntryBuilder {
    key_hash: u64,
    pub owner: String,
    pub name: String,
    pub kind: EntryKind,
    pub compression: ContainerCompression,
}

impl ContainerBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an entry. Two entries with the same owner, name and kind are rejected.
    pub fn with_entry(mut self, entry: ContainerEntryBuilder) -> Result<Self, ContainerBuilderError> {
        let owner = normalize_owner(&entry.owner);
        if owner.is_empty() || owner.len() > MAX_STRING_LEN as usize {
            return Err(ContainerBuilderError::InvalidOwner(entry.owner));
        }
        let name = normalize_entry_name(&entry.name);
        if name.is_empty() || name.len() > MAX_STRING_LEN as usize {
            return Err(ContainerBuilderError::InvalidName(entry.name));
        }

        if self.entries.contains_key(&entry.key_hash) {
            return Err(ContainerBuilderError::DuplicateEntry {
                owner: entry.owner,
                name: entry.name,
                kind: entry.kind,
            });
        }

        self.entries.insert(entry.key_hash, entry);
        Ok(self)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn entries(&self) -> impl Iterator<Item = &ContainerEntryBuilder> {
        self.entries.values()
    }

    /// Build the container and write it to the given writer.
    ///
    /// * `writer` - The writer to write the container to.
    /// * `provide_entry_data` - Streams the decoded bytes of each entry into the given sink.
    ///   Compression and checksumming happen on the way through.
    pub fn build_to_writer<
        TWriter: io::Write + io::Seek,
        TEntryDataProvider: FnMut(&ContainerEntryBuilder, &mut dyn Write) -> Result<(), ContainerBuilderError>,
    >(
        self,
        writer: &mut TWriter,
        mut provide_entry_data: TEntryDataProvider,
    ) -> Result<(), ContainerBuilderError> {
        let mut writer = BufWriter::new(writer);

        let (owners, owner_indices) = self.collect_unique(|entry| (&entry.owner, normalize_owner(&entry.owner)));
        let (names, name_indices) =
            self.collect_unique(|entry| (&entry.name, normalize_entry_name(&entry.name)));

        Self::write_header(&mut writer, self.entries.len(), owners.len(), names.len())?;
        Self::write_string_table(&mut writer, &owners)?;
        Self::write_string_table(&mut writer, &names)?;
        Self::write_alignment(&mut writer)?;

        // Reserve the index, it is filled in once all offsets are known
        let index_position = writer.stream_position()?;
        writer.write_all(&vec![0; self.entries.len() * ContainerEntry::size_of()])?;

        let mut index = Vec::with_capacity(self.entries.len());
        for (key_hash, entry) in &self.entries {
            let data_offset = writer.stream_position()?;
            let (size, stored_size, checksum) =
                Self::write_entry_data(&mut writer, entry, &mut provide_entry_data)?;

            index.push(ContainerEntry {
                key_hash: *key_hash,
                owner_index: owner_indices[&normalize_owner(&entry.owner)],
                name_index: name_indices[&normalize_entry_name(&entry.name)],
                kind: entry.kind,
                compression: entry.compression,
                data_offset,
                stored_size,
                size,
                checksum,
            });
        }

        writer.seek(SeekFrom::Start(index_position))?;
        for entry in &index {
            entry.write(&mut writer)?;
        }
        writer.seek(SeekFrom::End(0))?;
        writer.flush()?;

        tracing::debug!(
            "Built container entries={} owners={} names={}",
            index.len(),
            owners.len(),
            names.len()
        );

        Ok(())
    }

    fn write_header<W: io::Write>(
        writer: &mut W,
        entry_count: usize,
        owner_count: usize,
        name_count: usize,
    ) -> Result<(), ContainerBuilderError> {
        writer.write_all(&CONTAINER_MAGIC)?;
        writer.write_u32::<LE>(CONTAINER_VERSION)?;
        writer.write_u32::<LE>(entry_count as u32)?;
        writer.write_u32::<LE>(owner_count as u32)?;
        writer.write_u32::<LE>(name_count as u32)?;
        Ok(())
    }

    fn write_string_table<W: io::Write>(
        writer: &mut W,
        strings: &[String],
    ) -> Result<(), ContainerBuilderError> {
        for string in strings {
            writer.write_u32::<LE>(string.len() as u32)?;
            writer.write_all(string.as_bytes())?;
        }
        Ok(())
    }

    fn write_alignment<W: io::Write + io::Seek>(writer: &mut W) -> Result<(), ContainerBuilderError> {
        let position = writer.stream_position()?;
        let padding = ((8 - (position % 8)) % 8) as usize;
        writer.write_all(&[0; 8][..padding])?;
        Ok(())
    }

    /// Returns `(size, stored_size, checksum)`.
    fn write_entry_data<W: io::Write, F>(
        writer: &mut W,
        entry: &ContainerEntryBuilder,
        provide_entry_data: &mut F,
    ) -> Result<(u64, u64, u64), ContainerBuilderError>
    where
        F: FnMut(&ContainerEntryBuilder, &mut dyn Write) -> Result<(), ContainerBuilderError>,
    {
        let mut stored = HashingWriter::new(writer);
        let size = match entry.compression {
            ContainerCompression::None => {
                provide_entry_data(entry, &mut stored)?;
                stored.written
            }
            ContainerCompression::Zstd => {
                let mut encoder = zstd::Encoder::new(&mut stored, ZSTD_LEVEL)?;
                let size = {
                    let mut decoded = HashingWriter::new(&mut encoder);
                    provide_entry_data(entry, &mut decoded)?;
                    decoded.written
                };
                encoder.finish()?;
                size
            }
        };

        Ok((size, stored.written, stored.hasher.digest()))
    }

    /// Collect unique strings in first-seen order, keyed by their normalized form.
    fn collect_unique<'a>(
        &'a self,
        select: impl Fn(&'a ContainerEntryBuilder) -> (&'a String, String),
    ) -> (Vec<String>, HashMap<String, u32>) {
        let mut strings = Vec::new();
        let mut indices = HashMap::new();
        for entry in self.entries.values() {
            let (string, key) = select(entry);
            indices.entry(key).or_insert_with(|| {
                strings.push(string.clone());
                (strings.len() - 1) as u32
            });
        }
        (strings, indices)
    }
}

impl ContainerEntryBuilder {
    pub fn new(owner: impl Into<String>, name: impl Into<String>, kind: EntryKind) -> Self {
        let owner = owner.into();
        let name = name.into();
        Self {
            key_hash: hash_entry_key(&owner, &name, kind),
            owner,
            name,
            kind,
            compression: ContainerCompression::None,
        }
    }

    pub fn resource(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(owner, name, EntryKind::Resource)
    }

    pub fn normalized_resource(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(owner, name, EntryKind::NormalizedResource)
    }

    pub fn asset(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self::new(owner, name, EntryKind::Asset)
    }

    pub fn with_compression(mut self, compression: ContainerCompression) -> Self {
        self.compression = compression;
        self
    }

    pub fn key(&self) -> u64 {
        self.key_hash
    }
}

/// Counts and hashes everything written through it.
struct HashingWriter<W: Write> {
    inner: W,
    written: u64,
    hasher: Xxh3,
}

impl<W: Write> HashingWriter<W> {
    fn new(inner: W) -> Self {
        Self {
            inner,
            written: 0,
            hasher: Xxh3::new(),
        }
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let written = self.inner.write(buf)?;
        self.hasher.update(&buf[..written]);
        self.written += written as u64;
        Ok(written)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_duplicate_entry_is_rejected() {
        let result = ContainerBuilder::new()
            .with_entry(ContainerEntryBuilder::resource("patch", "a.txt"))
            .unwrap()
            .with_entry(ContainerEntryBuilder::resource("Patch", "A.TXT"));

        assert!(matches!(
            result,
            Err(ContainerBuilderError::DuplicateEntry { .. })
        ));
    }

    #[test]
    fn test_raw_and_normalized_variants_coexist() {
        let builder = ContainerBuilder::new()
            .with_entry(ContainerEntryBuilder::resource("patch", "a.txt"))
            .unwrap()
            .with_entry(ContainerEntryBuilder::normalized_resource("patch", "a.txt"))
            .unwrap();

        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn test_empty_name_is_rejected() {
        let result = ContainerBuilder::new().with_entry(ContainerEntryBuilder::asset("patch", "//"));
        assert!(matches!(result, Err(ContainerBuilderError::InvalidName(_))));
    }

    #[test]
    fn test_overlong_strings_are_rejected() {
        let name = format!("{}.txt", "a".repeat(MAX_STRING_LEN as usize));
        let result = ContainerBuilder::new().with_entry(ContainerEntryBuilder::resource("patch", &name));
        assert!(matches!(result, Err(ContainerBuilderError::InvalidName(_))));

        let owner = "o".repeat(MAX_STRING_LEN as usize + 1);
        let result = ContainerBuilder::new().with_entry(ContainerEntryBuilder::resource(&owner, "a.txt"));
        assert!(matches!(result, Err(ContainerBuilderError::InvalidOwner(_))));

        let longest = "a".repeat(MAX_STRING_LEN as usize);
        assert!(ContainerBuilder::new()
            .with_entry(ContainerEntryBuilder::resource("patch", &longest))
            .is_ok());
    }

    #[test]
    fn test_provider_error_aborts_build() {
        let builder = ContainerBuilder::new()
            .with_entry(ContainerEntryBuilder::resource("patch", "a.txt"))
            .unwrap();

        let mut cursor = Cursor::new(Vec::new());
        let result = builder.build_to_writer(&mut cursor, |entry, _| {
            Err(ContainerBuilderError::Provider {
                name: entry.name.clone(),
                reason: "gone".to_string(),
            })
        });

        assert!(matches!(result, Err(ContainerBuilderError::Provider { .. })));
    }
}
