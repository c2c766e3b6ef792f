use dashmap::DashMap;

use crate::filemap::FileMap;

/// Registry of live maps keyed by an opaque name, typically the identifier
/// of the object being assembled.
#[derive(Default)]
pub struct FileMapRegistry {
    maps: DashMap<String, FileMap>,
}

impl FileMapRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a map under `name`, replacing (and closing) any previous
    /// map with the same name.
    pub fn register(&self, name: String, map: FileMap) {
        if let Some(old) = self.maps.insert(name, map) {
            old.close();
        }
    }

    /// Removes the map under `name` and requests its close. Returns true
    /// if a map was registered.
    pub fn unregister(&self, name: &str) -> bool {
        match self.maps.remove(name) {
            Some((_, map)) => {
                map.close();
                true
            }
            None => false,
        }
    }

    pub fn get(&self, name: &str) -> Option<FileMap> {
        self.maps.get(name).map(|entry| entry.clone())
    }

    pub fn contains(&self, name: &str) -> bool {
        self.maps.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Forces a metadata snapshot for every registered map.
    pub fn flush_all(&self) {
        for entry in self.maps.iter() {
            entry.value().flush_meta();
        }
    }
}
