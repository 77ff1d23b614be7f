//! Transactional Layer Module
//!
//! Publishes new versions of a value atomically while readers keep working
//! on the version they started with.
//!
//! ## Lifecycle
//! ```text
//!   begin() ──► private layer ──► commit()   ──► new committed version
//!                    │
//!                    └──────────► rollback() / drop ──► discarded
//! ```
//! One transaction may be open per [`Transactional`] at a time; readers
//! never wait for it.

use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard, RwLock};
use tracing::debug;

use crate::btree::BPlusTree;
use crate::error::Result;

/// A value that can hand out a private, mutable layer and turn a finished
/// layer into its next committed version
pub trait Versioned {
    type Layer;

    /// Private working copy for one transaction
    fn create_layer(&self) -> Self::Layer;

    /// Committed value holding every change made to `layer`
    fn commit_layer(&self, layer: Self::Layer) -> Self;
}

/// Cloning a tree shares all nodes; the layer copies the ones it touches.
/// A value that is itself a tree is cloned on its first `get_mut` in the
/// layer, so changes to nested trees stay private until commit as well.
impl<K: Ord + Clone, V: Clone> Versioned for BPlusTree<K, V> {
    type Layer = BPlusTree<K, V>;

    fn create_layer(&self) -> Self::Layer {
        self.clone()
    }

    fn commit_layer(&self, layer: Self::Layer) -> Self {
        layer
    }
}

/// Any shared value: the layer is a full copy of the inner value
impl<T: Clone> Versioned for Arc<T> {
    type Layer = T;

    fn create_layer(&self) -> Self::Layer {
        T::clone(self)
    }

    fn commit_layer(&self, layer: Self::Layer) -> Self {
        Arc::new(layer)
    }
}

/// Holder of the committed version of a value
pub struct Transactional<T: Versioned> {
    committed: RwLock<Arc<T>>,
    version: AtomicU64,
    /// Held by the open transaction
    writer: Mutex<()>,
}

impl<T: Versioned> Transactional<T> {
    pub fn new(value: T) -> Self {
        Self {
            committed: RwLock::new(Arc::new(value)),
            version: AtomicU64::new(0),
            writer: Mutex::new(()),
        }
    }

    /// Current committed version; stays valid and unchanged while held
    pub fn snapshot(&self) -> Arc<T> {
        Arc::clone(&self.committed.read())
    }

    /// Number of commits so far
    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Open a transaction, waiting for any open one to finish
    pub fn begin(&self) -> TransactionGuard<'_, T> {
        let writer = self.writer.lock();
        self.start(writer)
    }

    /// Open a transaction unless one is already open
    pub fn try_begin(&self) -> Option<TransactionGuard<'_, T>> {
        self.writer.try_lock().map(|writer| self.start(writer))
    }

    /// Run `work` in a transaction, committing on `Ok` and rolling back on `Err`
    pub fn update<R, F>(&self, work: F) -> Result<R>
    where
        F: FnOnce(&mut T::Layer) -> Result<R>,
    {
        let mut transaction = self.begin();
        let outcome = work(&mut transaction)?;
        transaction.commit();
        Ok(outcome)
    }

    fn start<'t>(&'t self, writer: MutexGuard<'t, ()>) -> TransactionGuard<'t, T> {
        let base = self.snapshot();
        let layer = T::create_layer(&base);
        debug!(base_version = self.version(), "Transaction started");
        TransactionGuard {
            owner: self,
            base,
            layer: Some(layer),
            _writer: writer,
        }
    }
}

impl<T: Versioned + Default> Default for Transactional<T> {
    fn default() -> Self {
        Self::new(T::default())
    }
}

/// An open transaction; derefs to its private layer.
///
/// Dropping it without [`commit`](Self::commit) rolls back.
pub struct TransactionGuard<'t, T: Versioned> {
    owner: &'t Transactional<T>,
    base: Arc<T>,
    /// `None` once committed or rolled back
    layer: Option<T::Layer>,
    _writer: MutexGuard<'t, ()>,
}

impl<T: Versioned> TransactionGuard<'_, T> {
    /// Version the transaction started from
    pub fn base(&self) -> &Arc<T> {
        &self.base
    }

    /// Publish the layer as the new committed version, returning its number
    pub fn commit(mut self) -> u64 {
        let version = match self.layer.take() {
            Some(layer) => {
                let next = Arc::new(T::commit_layer(&self.base, layer));
                *self.owner.committed.write() = next;
                self.owner.version.fetch_add(1, Ordering::AcqRel) + 1
            }
            None => self.owner.version(),
        };
        debug!(version, "Transaction committed");
        version
    }

    /// Discard the layer
    pub fn rollback(mut self) {
        self.layer = None;
        debug!("Transaction rolled back");
    }
}

impl<T: Versioned> Deref for TransactionGuard<'_, T> {
    type Target = T::Layer;

    fn deref(&self) -> &Self::Target {
        match &self.layer {
            Some(layer) => layer,
            None => unreachable!("transaction layer used after commit"),
        }
    }
}

impl<T: Versioned> DerefMut for TransactionGuard<'_, T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        match &mut self.layer {
            Some(layer) => layer,
            None => unreachable!("transaction layer used after commit"),
        }
    }
}

impl<T: Versioned> Drop for TransactionGuard<'_, T> {
    fn drop(&mut self) {
        if self.layer.take().is_some() {
            debug!("Transaction dropped without commit, rolled back");
        }
    }
}
