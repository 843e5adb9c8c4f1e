//! Lazy per-entry byte producers for archive writes.
//!
//! The repack driver decides the shape of an output archive up front (which entries, in
//! which order) and registers one producer per entry. A codec then walks
//! [`entries`](ArchiveFileGenerator::entries) and calls
//! [`get_file_stream`](ArchiveFileGenerator::get_file_stream) right before it writes each
//! entry, so producers only run during the write pass and only as often as declared.

use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;

use crate::error::{Error, Result};
use crate::source::ResourceStream;

type Producer = Box<dyn FnMut() -> Result<ResourceStream> + Send>;
type DisposeHook = Box<dyn FnOnce() + Send>;

/// One entry of the output archive, in write order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GeneratorEntry<E> {
    /// Format-specific file-table key.
    pub id: E,
    /// Path of the entry inside the archive.
    pub path: String,
    /// Decoded size, when known before the write pass.
    pub size_hint: Option<u64>,
}

struct Slot {
    producer: Producer,
    remaining: u32,
}

/// Maps archive entry ids to deferred streams for one repack.
///
/// Dropping the generator drops every producer (and whatever sources they captured) and
/// runs the registered dispose hooks, whether or not all entries were requested.
pub struct ArchiveFileGenerator<E> {
    entries: Vec<GeneratorEntry<E>>,
    slots: HashMap<E, Slot>,
    writing: bool,
    dispose_hooks: Vec<DisposeHook>,
}

impl<E> Default for ArchiveFileGenerator<E> {
    fn default() -> Self {
        Self {
            entries: Vec::new(),
            slots: HashMap::new(),
            writing: false,
            dispose_hooks: Vec::new(),
        }
    }
}

impl<E: Clone + Eq + Hash + Debug> ArchiveFileGenerator<E> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an entry whose stream can be requested once.
    pub fn add<F>(&mut self, entry: GeneratorEntry<E>, producer: F) -> Result<()>
    where
        F: FnMut() -> Result<ResourceStream> + Send + 'static,
    {
        self.add_repeatable(entry, 1, producer)
    }

    /// Register an entry whose stream can be requested up to `times` times.
    pub fn add_repeatable<F>(&mut self, entry: GeneratorEntry<E>, times: u32, producer: F) -> Result<()>
    where
        F: FnMut() -> Result<ResourceStream> + Send + 'static,
    {
        if self.slots.contains_key(&entry.id) {
            return Err(Error::Other(format!(
                "generator entry {:?} registered twice",
                entry.id
            )));
        }

        self.slots.insert(
            entry.id.clone(),
            Slot {
                producer: Box::new(producer),
                remaining: times,
            },
        );
        self.entries.push(entry);
        Ok(())
    }

    /// Run `hook` when the generator is dropped.
    pub fn on_dispose<F>(&mut self, hook: F)
    where
        F: FnOnce() + Send + 'static,
    {
        self.dispose_hooks.push(Box::new(hook));
    }

    /// Number of entries that can still produce a stream.
    pub fn count(&self) -> usize {
        self.slots.values().filter(|slot| slot.remaining > 0).count()
    }

    /// All registered entries in write order.
    pub fn entries(&self) -> &[GeneratorEntry<E>] {
        &self.entries
    }

    pub fn is_writing(&self) -> bool {
        self.writing
    }

    /// Allow streams to be requested. Called by the repack driver right before the codec
    /// writes the archive.
    pub fn begin_write_pass(&mut self) {
        self.writing = true;
    }

    /// Produce the stream for `id`.
    pub fn get_file_stream(&mut self, id: &E) -> Result<ResourceStream> {
        if !self.writing {
            return Err(Error::GeneratorNotWriting);
        }

        let slot = self
            .slots
            .get_mut(id)
            .filter(|slot| slot.remaining > 0)
            .ok_or_else(|| Error::GeneratorEntryUnavailable(format!("{:?}", id)))?;

        slot.remaining -= 1;
        (slot.producer)()
    }
}

impl<E> Drop for ArchiveFileGenerator<E> {
    fn drop(&mut self) {
        // Producers may hold open sources; release them before the hooks run
        self.slots.clear();
        for hook in self.dispose_hooks.drain(..) {
            hook();
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::{Cursor, Read};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    use super::*;

    fn entry(id: u32, path: &str) -> GeneratorEntry<u32> {
        GeneratorEntry {
            id,
            path: path.to_string(),
            size_hint: None,
        }
    }

    fn bytes(data: &'static [u8]) -> impl FnMut() -> Result<ResourceStream> + Send + 'static {
        move || Ok(Box::new(Cursor::new(data)) as ResourceStream)
    }

    #[test]
    fn test_exactly_count_entries_can_be_requested() {
        let mut generator = ArchiveFileGenerator::new();
        generator.add(entry(1, "a"), bytes(b"first")).unwrap();
        generator.add(entry(2, "b"), bytes(b"second")).unwrap();
        generator.add(entry(3, "c"), bytes(b"third")).unwrap();
        assert_eq!(generator.count(), 3);

        generator.begin_write_pass();
        let ids: Vec<u32> = generator.entries().iter().map(|e| e.id).collect();
        let mut contents = Vec::new();
        for id in ids {
            let mut stream = generator.get_file_stream(&id).unwrap();
            let mut buf = Vec::new();
            stream.read_to_end(&mut buf).unwrap();
            drop(stream);
            contents.push(buf);
        }

        assert_eq!(contents, vec![b"first".to_vec(), b"second".to_vec(), b"third".to_vec()]);
        assert_eq!(generator.count(), 0);
        assert!(matches!(
            generator.get_file_stream(&1),
            Err(Error::GeneratorEntryUnavailable(_))
        ));
    }

    #[test]
    fn test_streams_are_independent() {
        let mut generator = ArchiveFileGenerator::new();
        generator.add(entry(1, "a"), bytes(b"aaaa")).unwrap();
        generator.add(entry(2, "b"), bytes(b"bbbb")).unwrap();
        generator.begin_write_pass();

        let mut a = generator.get_file_stream(&1).unwrap();
        let mut b = generator.get_file_stream(&2).unwrap();
        let mut buf = [0u8; 2];
        a.read_exact(&mut buf).unwrap();
        drop(a);

        let mut rest = Vec::new();
        b.read_to_end(&mut rest).unwrap();
        assert_eq!(rest, b"bbbb");
    }

    #[test]
    fn test_repeatable_entry() {
        let mut generator = ArchiveFileGenerator::new();
        generator.add_repeatable(entry(1, "a"), 2, bytes(b"x")).unwrap();
        generator.begin_write_pass();

        assert!(generator.get_file_stream(&1).is_ok());
        assert_eq!(generator.count(), 1);
        assert!(generator.get_file_stream(&1).is_ok());
        assert!(generator.get_file_stream(&1).is_err());
    }

    #[test]
    fn test_streams_require_write_pass() {
        let mut generator = ArchiveFileGenerator::new();
        generator.add(entry(1, "a"), bytes(b"x")).unwrap();

        assert!(matches!(generator.get_file_stream(&1), Err(Error::GeneratorNotWriting)));
        assert_eq!(generator.count(), 1);
    }

    #[test]
    fn test_duplicate_id_is_rejected() {
        let mut generator = ArchiveFileGenerator::new();
        generator.add(entry(1, "a"), bytes(b"x")).unwrap();
        assert!(generator.add(entry(1, "b"), bytes(b"y")).is_err());
        assert_eq!(generator.entries().len(), 1);
    }

    #[test]
    fn test_drop_releases_unrequested_entries() {
        let disposed = Arc::new(AtomicUsize::new(0));
        let captured = Arc::new(());

        let mut generator = ArchiveFileGenerator::new();
        let held = captured.clone();
        generator
            .add(entry(1, "a"), move || {
                let _keep = Arc::clone(&held);
                Ok(Box::new(Cursor::new(Vec::new())) as ResourceStream)
            })
            .unwrap();
        let counter = disposed.clone();
        generator.on_dispose(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        assert_eq!(Arc::strong_count(&captured), 2);
        drop(generator);

        assert_eq!(disposed.load(Ordering::SeqCst), 1);
        assert_eq!(Arc::strong_count(&captured), 1);
    }
}
