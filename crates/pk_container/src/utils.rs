use crate::EntryKind;
use xxhash_rust::xxh3;

/// Normalize a resource or asset name for lookups.
///
/// Lower-cases every component, accepts both `/` and `\` as separators and drops empty
/// components, so `"Textures\\\\Hero.PNG"` and `"/textures/hero.png"` name the same entry.
pub fn normalize_entry_name(name: &str) -> String {
    name.split(['/', '\\'])
        .filter(|part| !part.is_empty())
        .map(str::to_lowercase)
        .collect::<Vec<_>>()
        .join("/")
}

/// Normalize an owner (patch) id for lookups.
pub fn normalize_owner(owner: &str) -> String {
    owner.trim().to_lowercase()
}

/// Hash an entry key using xxhash3.
///
/// The key covers the normalized owner, the normalized name and the entry kind, so the raw
/// and normalized variants of one resource never collide.
pub fn hash_entry_key(owner: &str, name: &str, kind: EntryKind) -> u64 {
    let owner = normalize_owner(owner);
    let name = normalize_entry_name(name);

    let mut buf = Vec::with_capacity(owner.len() + name.len() + 3);
    buf.extend_from_slice(owner.as_bytes());
    buf.push(0);
    buf.extend_from_slice(name.as_bytes());
    buf.push(0);
    buf.push(kind as u8);

    xxh3::xxh3_64(&buf)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_entry_name() {
        assert_eq!(normalize_entry_name("Textures\\\\Hero.PNG"), "textures/hero.png");
        assert_eq!(normalize_entry_name("/textures/hero.png/"), "textures/hero.png");
        assert_eq!(normalize_entry_name("a//b\\c"), "a/b/c");
    }

    #[test]
    fn test_key_depends_on_kind() {
        let raw = hash_entry_key("patch", "a.txt", EntryKind::Resource);
        let normalized = hash_entry_key("patch", "a.txt", EntryKind::NormalizedResource);
        let asset = hash_entry_key("patch", "a.txt", EntryKind::Asset);
        assert_ne!(raw, normalized);
        assert_ne!(raw, asset);
        assert_ne!(normalized, asset);
    }

    #[test]
    fn test_key_is_case_insensitive() {
        assert_eq!(
            hash_entry_key("My-Patch", "Data\\X.txt", EntryKind::Resource),
            hash_entry_key("my-patch", "data/x.txt", EntryKind::Resource)
        );
    }

    proptest::proptest! {
        #[test]
        fn test_normalize_is_idempotent(name in "[a-zA-Z0-9_./\\\\]{0,40}") {
            let once = normalize_entry_name(&name);
            proptest::prop_assert_eq!(normalize_entry_name(&once), once.clone());
            proptest::prop_assert!(!once.contains('\\'));
        }
    }
}
