//! Archive codec contract and the zip reference codec.
//!
//! The overlay never knows the byte layout of a game archive. Everything format-specific
//! goes through [`ArchiveCodec`]: list the entries of an original archive, stream one of
//! them, and write a new archive from an [`ArchiveFileGenerator`]. The format used for a
//! game is picked from configuration through [`ArchiveFormat`].

use std::collections::HashMap;
use std::fmt::Debug;
use std::fs::File;
use std::hash::Hash;
use std::io::{self, Seek, Write};

use camino::Utf8Path;
use pk_container::SharedSource;
use serde::{Deserialize, Serialize};
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::error::{Error, Result};
use crate::generator::ArchiveFileGenerator;
use crate::source::ResourceStream;

/// Archive formats with a built-in codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum ArchiveFormat {
    #[default]
    Zip,
}

/// One entry of an original archive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry<E> {
    pub id: E,
    /// Path inside the archive, as stored.
    pub path: String,
    /// Decoded size.
    pub size: u64,
}

/// An original archive opened for reading.
pub trait ArchiveReader: Send + Sync {
    type Entry;

    /// Entries in file-table order.
    fn entries(&self) -> &[ArchiveEntry<Self::Entry>];

    /// Stream the decoded bytes of one entry straight from the archive file.
    fn open_entry(&self, id: &Self::Entry) -> Result<ResourceStream>;

    /// Release the archive file. Streams opened earlier fail afterwards.
    fn close(&self);
}

/// Format-specific archive operations.
pub trait ArchiveCodec: Send + Sync {
    /// File-table key of one entry.
    type Entry: Clone + Eq + Hash + Debug + Send + Sync + 'static;
    type Reader: ArchiveReader<Entry = Self::Entry> + 'static;

    fn name(&self) -> &'static str;

    fn open_for_read(&self, path: &Utf8Path) -> Result<Self::Reader>;

    /// File-table key for an entry that does not exist in the original archive yet.
    fn new_entry(&self, path: &str) -> Self::Entry;

    /// Write a complete archive to `output`, requesting every generator entry exactly once
    /// in [`entries`](ArchiveFileGenerator::entries) order.
    fn write_archive<W: Write + Seek>(
        &self,
        output: W,
        generator: &mut ArchiveFileGenerator<Self::Entry>,
    ) -> Result<()>;
}

/// Zip archives, stored or deflated entries.
#[derive(Debug, Clone, Copy, Default)]
pub struct ZipCodec {
    /// Deflate level for written entries; `None` uses the zip crate default.
    pub compression_level: Option<i64>,
}

#[derive(Debug, Clone, Copy)]
struct ZipEntryLocation {
    data_start: u64,
    compressed_size: u64,
    method: CompressionMethod,
}

/// A zip archive opened by [`ZipCodec`].
pub struct ZipReader {
    source: SharedSource,
    entries: Vec<ArchiveEntry<String>>,
    locations: HashMap<String, ZipEntryLocation>,
}

impl ArchiveReader for ZipReader {
    type Entry = String;

    fn entries(&self) -> &[ArchiveEntry<String>] {
        &self.entries
    }

    fn open_entry(&self, id: &String) -> Result<ResourceStream> {
        let location = self.locations.get(id).ok_or_else(|| Error::EntryNotFound {
            kind: "zip entry",
            name: id.clone(),
            location: "zip archive".to_string(),
        })?;

        let range = self
            .source
            .range(location.data_start, location.compressed_size);
        match location.method {
            CompressionMethod::Stored => Ok(Box::new(range)),
            CompressionMethod::Deflated => Ok(Box::new(flate2::read::DeflateDecoder::new(range))),
            method => Err(Error::Codec {
                codec: "zip",
                message: format!("entry '{}' uses unsupported compression {:?}", id, method),
            }),
        }
    }

    fn close(&self) {
        self.source.close();
    }
}

impl ArchiveCodec for ZipCodec {
    type Entry = String;
    type Reader = ZipReader;

    fn name(&self) -> &'static str {
        "zip"
    }

    fn open_for_read(&self, path: &Utf8Path) -> Result<ZipReader> {
        let mut archive = ZipArchive::new(File::open(path.as_std_path())?)?;

        let mut entries = Vec::with_capacity(archive.len());
        let mut locations = HashMap::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            let name = file.name().to_string();

            locations.insert(
                name.clone(),
                ZipEntryLocation {
                    data_start: file.data_start(),
                    compressed_size: file.compressed_size(),
                    method: file.compression(),
                },
            );
            entries.push(ArchiveEntry {
                id: name.clone(),
                path: name,
                size: file.size(),
            });
        }

        tracing::debug!("Listed zip archive path={} entries={}", path, entries.len());

        Ok(ZipReader {
            source: SharedSource::new(archive.into_inner()),
            entries,
            locations,
        })
    }

    fn new_entry(&self, path: &str) -> String {
        path.to_string()
    }

    fn write_archive<W: Write + Seek>(
        &self,
        output: W,
        generator: &mut ArchiveFileGenerator<String>,
    ) -> Result<()> {
        let mut zip = ZipWriter::new(output);
        let options = SimpleFileOptions::default()
            .compression_method(CompressionMethod::Deflated)
            .compression_level(self.compression_level);

        let entries = generator.entries().to_vec();
        for entry in &entries {
            let mut stream = generator.get_file_stream(&entry.id)?;

            if entry.path.ends_with('/') {
                zip.add_directory(entry.path.as_str(), options)?;
                continue;
            }

            zip.start_file(entry.path.as_str(), options.large_file(needs_zip64(entry.size_hint)))?;
            io::copy(&mut stream, &mut zip)?;
        }

        zip.finish()?;
        Ok(())
    }
}

/// Entries of unknown size get zip64 headers, since they may exceed 4 GiB.
fn needs_zip64(size_hint: Option<u64>) -> bool {
    size_hint.map_or(true, |size| size >= u32::MAX as u64)
}
