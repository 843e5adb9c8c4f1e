use binrw::binrw;
use std::fmt::Display;

/// What an index entry stores.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Default)]
pub enum EntryKind {
    /// A resource as authored.
    #[default]
    Resource = 0,
    /// The canonicalized encoding of a resource (e.g. a converted texture).
    NormalizedResource = 1,
    /// Auxiliary data such as icons, thumbnails or the patch manifest.
    Asset = 2,
}

/// How an entry's bytes are stored in the payload region.
#[binrw]
#[brw(little, repr = u8)]
#[derive(Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Clone, Copy, Default)]
pub enum ContainerCompression {
    #[default]
    None = 0,
    Zstd = 1,
}

/// One record of the container index.
#[binrw]
#[brw(little)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ContainerEntry {
    pub key_hash: u64,

    pub owner_index: u32,
    pub name_index: u32,
    pub kind: EntryKind,
    pub compression: ContainerCompression,

    pub data_offset: u64,
    pub stored_size: u64,
    pub size: u64,

    /// xxhash3 of the stored bytes.
    pub checksum: u64,
}

impl ContainerEntry {
    pub const fn size_of() -> usize {
        (std::mem::size_of::<u64>() * 5) + (std::mem::size_of::<u32>() * 2) + 2
    }

    /// Offset one past the last stored byte.
    pub fn data_end(&self) -> Option<u64> {
        self.data_offset.checked_add(self.stored_size)
    }
}

impl Display for EntryKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            EntryKind::Resource => "resource",
            EntryKind::NormalizedResource => "normalized resource",
            EntryKind::Asset => "asset",
        })
    }
}

impl Display for ContainerCompression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            ContainerCompression::None => "none",
            ContainerCompression::Zstd => "zstd",
        })
    }
}

#[cfg(test)]
mod tests {
    use std::io::Cursor;

    use binrw::{BinRead, BinWrite};

    use super::*;

    #[test]
    fn test_size_of() {
        let entry = ContainerEntry::default();

        let mut writer = Cursor::new(Vec::new());
        entry.write(&mut writer).unwrap();

        assert_eq!(writer.position() as usize, ContainerEntry::size_of());
    }

    #[test]
    fn test_unknown_kind_is_rejected() {
        let mut bytes = Vec::new();
        ContainerEntry::default()
            .write(&mut Cursor::new(&mut bytes))
            .unwrap();
        // kind tag sits right after key_hash + owner_index + name_index
        bytes[16] = 9;

        assert!(ContainerEntry::read(&mut Cursor::new(&bytes)).is_err());
    }
}
