//! Signed VAAs by message id.
//!
//! Finalized VAAs are kept in memory and, when a directory is configured, written there as one
//! file per message so they outlive the process. Messages still collecting signatures are
//! tracked separately so a lookup can tell "not yet" apart from "never heard of it".

use std::{
    collections::{HashMap, HashSet},
    fs, io,
    path::{Path, PathBuf},
    sync::{Arc, PoisonError, RwLock},
};

use guardian_vaa::MessageId;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Lookup {
    Found(Vec<u8>),
    /// Observed but not yet quorate.
    Pending,
    NotFound,
}

#[derive(Debug, Default)]
struct Inner {
    finalized: HashMap<MessageId, Vec<u8>>,
    pending: HashSet<MessageId>,
}

/// File access is synchronous and happens on the processor's task, so `dir` is expected to be
/// a fast local disk.
#[derive(Debug, Default, Clone)]
pub struct VaaStore {
    inner: Arc<RwLock<Inner>>,
    dir: Option<PathBuf>,
}

impl VaaStore {
    pub fn in_memory() -> VaaStore {
        VaaStore::default()
    }

    /// A store that also persists finalized VAAs under `dir`, creating it if needed.
    pub fn with_dir<P: AsRef<Path>>(dir: P) -> io::Result<VaaStore> {
        fs::create_dir_all(dir.as_ref())?;
        Ok(VaaStore {
            inner: Default::default(),
            dir: Some(dir.as_ref().to_path_buf()),
        })
    }

    fn file_name(id: &MessageId) -> String {
        format!(
            "{}_{}_{}.vaa",
            u16::from(id.emitter_chain),
            id.emitter_address,
            id.sequence
        )
    }

    pub fn mark_pending(&self, id: MessageId) {
        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        if !inner.finalized.contains_key(&id) {
            let _ = inner.pending.insert(id);
        }
    }

    pub fn forget_pending(&self, id: &MessageId) {
        let _ = self
            .inner
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .pending
            .remove(id);
    }

    /// Records the signed VAA for `id`. The in-memory copy is updated even if writing the file
    /// fails.
    pub fn store(&self, id: MessageId, signed: Vec<u8>) -> io::Result<()> {
        let persisted = match &self.dir {
            Some(dir) => fs::write(dir.join(Self::file_name(&id)), &signed),
            None => Ok(()),
        };

        let mut inner = self.inner.write().unwrap_or_else(PoisonError::into_inner);
        let _ = inner.pending.remove(&id);
        let _ = inner.finalized.insert(id, signed);

        persisted
    }

    pub fn lookup(&self, id: &MessageId) -> io::Result<Lookup> {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if let Some(signed) = inner.finalized.get(id) {
                return Ok(Lookup::Found(signed.clone()));
            }
            if inner.pending.contains(id) {
                return Ok(Lookup::Pending);
            }
        }

        let Some(dir) = &self.dir else {
            return Ok(Lookup::NotFound);
        };
        match fs::read(dir.join(Self::file_name(id))) {
            Ok(signed) => Ok(Lookup::Found(signed)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(Lookup::NotFound),
            Err(e) => Err(e),
        }
    }

    /// Whether a signed VAA exists for `id`, without reading it back from disk.
    pub fn contains(&self, id: &MessageId) -> io::Result<bool> {
        {
            let inner = self.inner.read().unwrap_or_else(PoisonError::into_inner);
            if inner.finalized.contains_key(id) {
                return Ok(true);
            }
        }

        match &self.dir {
            Some(dir) => dir.join(Self::file_name(id)).try_exists(),
            None => Ok(false),
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .finalized
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use guardian_vaa::{Address, Chain};

    fn id(sequence: u64) -> MessageId {
        MessageId {
            emitter_chain: Chain::Near,
            emitter_address: Address([7; 32]),
            sequence,
        }
    }

    #[test]
    fn lookup_states() {
        let store = VaaStore::in_memory();
        assert_eq!(Lookup::NotFound, store.lookup(&id(1)).unwrap());

        store.mark_pending(id(1));
        assert_eq!(Lookup::Pending, store.lookup(&id(1)).unwrap());

        store.store(id(1), vec![1, 2, 3]).unwrap();
        assert_eq!(Lookup::Found(vec![1, 2, 3]), store.lookup(&id(1)).unwrap());

        // A finalized message never goes back to pending.
        store.mark_pending(id(1));
        assert_eq!(Lookup::Found(vec![1, 2, 3]), store.lookup(&id(1)).unwrap());

        store.mark_pending(id(2));
        store.forget_pending(&id(2));
        assert_eq!(Lookup::NotFound, store.lookup(&id(2)).unwrap());
        assert_eq!(1, store.len());
        assert!(store.contains(&id(1)).unwrap());
        assert!(!store.contains(&id(2)).unwrap());
    }

    #[test]
    fn persisted_across_instances() {
        let dir = std::env::temp_dir().join(format!("guardiand-store-{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);

        let store = VaaStore::with_dir(&dir).unwrap();
        store.store(id(5), vec![9; 10]).unwrap();

        let reopened = VaaStore::with_dir(&dir).unwrap();
        assert!(reopened.is_empty());
        assert_eq!(Lookup::Found(vec![9; 10]), reopened.lookup(&id(5)).unwrap());
        assert_eq!(Lookup::NotFound, reopened.lookup(&id(6)).unwrap());
        assert!(reopened.contains(&id(5)).unwrap());
        assert!(!reopened.contains(&id(6)).unwrap());

        fs::remove_dir_all(&dir).unwrap();
    }
}
