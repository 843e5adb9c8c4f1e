//! Single-file resource containers.
//!
//! A container stores named byte streams grouped by owner (usually a patch id). Every
//! resource may be stored twice: as authored and in its normalized encoding. Owners can also
//! carry assets such as the patch manifest or a thumbnail.
//!
//! Layout: `_pkcont_` magic, format version, entry/owner/name counts, the owner and name
//! string tables, padding to 8 bytes, the entry index and finally the payload region.

pub mod builder;
mod container;
mod entry;
mod error;
pub mod shared;
pub mod utils;

pub use container::{EntryInfo, EntryReader, ResourceContainer, CONTAINER_MAGIC, CONTAINER_VERSION};
pub use entry::{ContainerCompression, ContainerEntry, EntryKind};
pub use error::{ContainerError, Result};
pub use shared::{RangeReader, ReadSeek, SharedSource};
pub use utils::*;

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read, Write};

    use super::builder::{ContainerBuilder, ContainerEntryBuilder};
    use super::*;

    struct TestEntry {
        owner: &'static str,
        name: &'static str,
        kind: EntryKind,
        compression: ContainerCompression,
        data: &'static [u8],
    }

    fn entry(owner: &'static str, name: &'static str, kind: EntryKind, data: &'static [u8]) -> TestEntry {
        TestEntry {
            owner,
            name,
            kind,
            compression: ContainerCompression::None,
            data,
        }
    }

    fn build(entries: &[TestEntry]) -> Vec<u8> {
        let mut builder = ContainerBuilder::new();
        for e in entries {
            builder = builder
                .with_entry(ContainerEntryBuilder::new(e.owner, e.name, e.kind).with_compression(e.compression))
                .unwrap();
        }

        let mut cursor = Cursor::new(Vec::new());
        builder
            .build_to_writer(&mut cursor, |builder_entry, writer| {
                let data = entries
                    .iter()
                    .find(|e| e.name == builder_entry.name && e.kind == builder_entry.kind)
                    .map(|e| e.data)
                    .unwrap();
                writer.write_all(data)?;
                Ok(())
            })
            .unwrap();

        cursor.into_inner()
    }

    fn read_all(mut reader: impl Read) -> Vec<u8> {
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_raw_and_normalized_round_trip() {
        let bytes = build(&[
            entry("patch", "data/a.tex", EntryKind::Resource, b"raw bytes"),
            entry("patch", "data/a.tex", EntryKind::NormalizedResource, b"normalized bytes"),
        ]);

        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();

        assert_eq!(container.version(), CONTAINER_VERSION);
        assert_eq!(container.len(), 2);
        assert_eq!(read_all(container.get_resource("patch", "data/a.tex", false).unwrap()), b"raw bytes");
        assert_eq!(
            read_all(container.get_resource("patch", "data/a.tex", true).unwrap()),
            b"normalized bytes"
        );
    }

    #[test]
    fn test_zstd_entry_round_trip() {
        let data: &'static [u8] = &[7u8; 10_000];
        let bytes = build(&[TestEntry {
            compression: ContainerCompression::Zstd,
            ..entry("patch", "big.bin", EntryKind::Resource, data)
        }]);

        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();
        let info = container.entries()[0];

        assert_eq!(info.size, 10_000);
        assert!(info.stored_size < info.size);
        assert_eq!(read_all(container.get_resource("patch", "big.bin", false).unwrap()), data);
        container.verify().unwrap();
    }

    #[test]
    fn test_lookup_is_case_and_separator_insensitive() {
        let bytes = build(&[entry("My-Patch", "Data\\X.txt", EntryKind::Resource, b"x")]);
        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();

        assert!(container.contains("my-patch", "data/x.txt", EntryKind::Resource));
        assert_eq!(read_all(container.get_resource("MY-PATCH", "DATA/X.TXT", false).unwrap()), b"x");
        assert_eq!(container.owners(), ["My-Patch".to_string()]);
    }

    #[test]
    fn test_missing_entry() {
        let bytes = build(&[
            entry("patch", "a.txt", EntryKind::Resource, b"a"),
            entry("patch", "patch.json", EntryKind::Asset, b"{}"),
        ]);
        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();

        assert!(matches!(
            container.get_resource("patch", "a.txt", true),
            Err(ContainerError::ResourceNotFound { kind: EntryKind::NormalizedResource, .. })
        ));
        assert!(matches!(
            container.get_resource("other", "a.txt", false),
            Err(ContainerError::ResourceNotFound { .. })
        ));
        assert!(matches!(
            container.get_asset("patch", "a.txt"),
            Err(ContainerError::ResourceNotFound { kind: EntryKind::Asset, .. })
        ));
        assert_eq!(read_all(container.get_asset("patch", "patch.json").unwrap()), b"{}");
    }

    #[test]
    fn test_independent_streams_interleave() {
        let bytes = build(&[
            entry("patch", "a.txt", EntryKind::Resource, b"aaaaaaaa"),
            entry("patch", "b.txt", EntryKind::Resource, b"bbbbbbbb"),
        ]);
        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();

        let mut a = container.get_resource("patch", "a.txt", false).unwrap();
        let mut b = container.get_resource("patch", "b.txt", false).unwrap();

        let mut buf = [0u8; 3];
        a.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"aaa");
        b.read_exact(&mut buf).unwrap();
        assert_eq!(&buf, b"bbb");

        assert_eq!(read_all(a), b"aaaaa");
        assert_eq!(read_all(b), b"bbbbb");
    }

    #[test]
    fn test_invalid_magic() {
        let mut bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"a")]);
        bytes[0] = b'X';

        assert!(matches!(
            ResourceContainer::mount(Cursor::new(bytes)),
            Err(ContainerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_newer_version_is_unsupported() {
        let mut bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"a")]);
        bytes[8..12].copy_from_slice(&(CONTAINER_VERSION + 1).to_le_bytes());

        assert!(matches!(
            ResourceContainer::mount(Cursor::new(bytes)),
            Err(ContainerError::UnsupportedVersion { .. })
        ));
    }

    #[test]
    fn test_truncated_payload_is_corrupt() {
        let mut bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"some payload")]);
        bytes.truncate(bytes.len() - 4);

        assert!(matches!(
            ResourceContainer::mount(Cursor::new(bytes)),
            Err(ContainerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_truncated_header_is_corrupt() {
        let bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"a")]);

        assert!(matches!(
            ResourceContainer::mount(Cursor::new(bytes[..10].to_vec())),
            Err(ContainerError::Corrupt(_))
        ));
    }

    #[test]
    fn test_verify_detects_tampered_payload() {
        let mut bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"payload")]);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xff;

        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();
        assert!(matches!(container.verify(), Err(ContainerError::Corrupt(_))));
    }

    #[test]
    fn test_close_invalidates_streams_and_clones() {
        let bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"payload")]);
        let container = ResourceContainer::mount(Cursor::new(bytes)).unwrap();
        let clone = container.clone();
        let mut stream = container.get_resource("patch", "a.txt", false).unwrap();

        clone.close();

        assert!(!container.is_open());
        assert!(matches!(
            container.get_resource("patch", "a.txt", false),
            Err(ContainerError::Closed)
        ));
        let mut buf = [0u8; 1];
        assert!(stream.read(&mut buf).is_err());
    }

    #[test]
    fn test_open_from_file() {
        let bytes = build(&[entry("patch", "a.txt", EntryKind::Resource, b"on disk")]);
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(&bytes).unwrap();

        let path = camino::Utf8PathBuf::from_path_buf(file.path().to_path_buf()).unwrap();
        let container = ResourceContainer::open(&path).unwrap();

        assert_eq!(read_all(container.get_resource("patch", "a.txt", false).unwrap()), b"on disk");
    }
}
