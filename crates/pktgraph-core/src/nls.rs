//! Per-NUMA-node keyed storage for element state.
//!
//! Elements allocate keys during per-node init and look them up from every
//! thread on that node afterwards. Writers only run during init, so
//! steady-state readers share the entries without coordination beyond the
//! cheap read lock.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Error, Result};

/// Handle to a raw byte region in node-local storage.
pub type NlsBytes = Arc<RwLock<Box<[u8]>>>;

enum NlsEntry {
    Bytes(NlsBytes),
    Typed {
        type_id: TypeId,
        value: Option<Arc<dyn Any + Send + Sync>>,
    },
}

/// String-keyed storage local to one NUMA node.
pub struct NodeLocalStorage {
    node_id: usize,
    entries: RwLock<HashMap<String, NlsEntry>>,
}

impl NodeLocalStorage {
    /// Create storage for a node.
    pub fn new(node_id: usize) -> Self {
        Self {
            node_id,
            entries: RwLock::new(HashMap::new()),
        }
    }

    /// Owning node.
    pub fn node_id(&self) -> usize {
        self.node_id
    }

    /// Allocate a zeroed byte region. A key may be allocated once per node;
    /// a second allocation is an init-time error.
    pub fn alloc_bytes(&self, key: &str, size: usize) -> Result<NlsBytes> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(Error::NlsDuplicateKey(key.to_string()));
        }
        let region: NlsBytes = Arc::new(RwLock::new(vec![0u8; size].into_boxed_slice()));
        entries.insert(key.to_string(), NlsEntry::Bytes(Arc::clone(&region)));
        Ok(region)
    }

    /// Look up a byte region.
    pub fn get_bytes(&self, key: &str) -> Result<NlsBytes> {
        match self.entries.read().get(key) {
            Some(NlsEntry::Bytes(region)) => Ok(Arc::clone(region)),
            Some(NlsEntry::Typed { .. }) => Err(Error::Config(format!(
                "node-local storage key '{}' holds a typed value",
                key
            ))),
            None => Err(Error::NlsMissingKey(key.to_string())),
        }
    }

    /// Reserve a typed slot without constructing the value yet.
    pub fn alloc_slot<T: Send + Sync + 'static>(&self, key: &str) -> Result<()> {
        let mut entries = self.entries.write();
        if entries.contains_key(key) {
            return Err(Error::NlsDuplicateKey(key.to_string()));
        }
        entries.insert(
            key.to_string(),
            NlsEntry::Typed {
                type_id: TypeId::of::<T>(),
                value: None,
            },
        );
        Ok(())
    }

    /// Construct the value of a reserved slot.
    pub fn init_slot<T: Send + Sync + 'static>(&self, key: &str, value: T) -> Result<()> {
        let mut entries = self.entries.write();
        match entries.get_mut(key) {
            Some(NlsEntry::Typed {
                type_id,
                value: slot,
            }) => {
                if *type_id != TypeId::of::<T>() {
                    return Err(Error::Config(format!(
                        "node-local storage key '{}' initialized with a different type",
                        key
                    )));
                }
                *slot = Some(Arc::new(value));
                Ok(())
            }
            Some(NlsEntry::Bytes(_)) => Err(Error::Config(format!(
                "node-local storage key '{}' holds a byte region",
                key
            ))),
            None => Err(Error::NlsMissingKey(key.to_string())),
        }
    }

    /// Reserve and construct in one step.
    pub fn put_slot<T: Send + Sync + 'static>(&self, key: &str, value: T) -> Result<()> {
        self.alloc_slot::<T>(key)?;
        self.init_slot(key, value)
    }

    /// Borrow an initialized typed slot.
    pub fn get_slot<T: Send + Sync + 'static>(&self, key: &str) -> Result<Arc<T>> {
        match self.entries.read().get(key) {
            Some(NlsEntry::Typed { value: Some(v), .. }) => v
                .clone()
                .downcast::<T>()
                .map_err(|_| Error::Config(format!("node-local storage key '{}' type mismatch", key))),
            Some(NlsEntry::Typed { value: None, .. }) => Err(Error::Config(format!(
                "node-local storage key '{}' allocated but never initialized",
                key
            ))),
            Some(NlsEntry::Bytes(_)) => Err(Error::Config(format!(
                "node-local storage key '{}' holds a byte region",
                key
            ))),
            None => Err(Error::NlsMissingKey(key.to_string())),
        }
    }

    /// Drop an entry (build-time state freed before steady state).
    pub fn remove(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_alloc_exact_size_and_double_alloc_rejected() {
        let nls = NodeLocalStorage::new(0);
        nls.alloc_bytes("table", 128).unwrap();
        let region = nls.get_bytes("table").unwrap();
        assert_eq!(region.read().len(), 128);
        assert!(matches!(
            nls.alloc_bytes("table", 64),
            Err(Error::NlsDuplicateKey(_))
        ));
    }

    #[test]
    fn test_missing_key() {
        let nls = NodeLocalStorage::new(0);
        assert!(matches!(
            nls.get_bytes("nope"),
            Err(Error::NlsMissingKey(_))
        ));
    }

    #[test]
    fn test_typed_slot_lifecycle() {
        let nls = NodeLocalStorage::new(1);
        nls.alloc_slot::<Vec<u32>>("flows").unwrap();
        assert!(nls.get_slot::<Vec<u32>>("flows").is_err());
        nls.init_slot("flows", vec![1u32, 2, 3]).unwrap();
        let flows = nls.get_slot::<Vec<u32>>("flows").unwrap();
        assert_eq!(flows.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_typed_slot_wrong_type() {
        let nls = NodeLocalStorage::new(0);
        nls.alloc_slot::<u64>("x").unwrap();
        assert!(nls.init_slot("x", "wrong".to_string()).is_err());
    }

    #[test]
    fn test_remove() {
        let nls = NodeLocalStorage::new(0);
        nls.put_slot("tmp", 7u64).unwrap();
        assert!(nls.remove("tmp"));
        assert!(!nls.remove("tmp"));
        assert!(nls.get_slot::<u64>("tmp").is_err());
    }

    #[test]
    fn test_cross_thread_readers() {
        let nls = std::sync::Arc::new(NodeLocalStorage::new(0));
        nls.alloc_bytes("shared", 8).unwrap();
        nls.get_bytes("shared").unwrap().write()[0] = 42;
        let mut handles = Vec::new();
        for _ in 0..4 {
            let n = std::sync::Arc::clone(&nls);
            handles.push(std::thread::spawn(move || {
                assert_eq!(n.get_bytes("shared").unwrap().read()[0], 42);
            }));
        }
        for h in handles {
            h.join().unwrap();
        }
    }
}
