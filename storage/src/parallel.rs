use std::{
    hash::BuildHasherDefault,
    marker::PhantomData,
    ptr::null_mut,
    slice,
    sync::atomic::{AtomicPtr, AtomicUsize, Ordering},
};

use hashbrown::HashMap;
use zwohash::ZwoHasher;

use crate::chunked::{chunk_elements, ChunkHeader};
use crate::ChunkedStorage;

type ThreadIdMap = HashMap<u32, usize, BuildHasherDefault<ZwoHasher>>;

/// One worker's storage in a [`ParallelChunkedStorage`].
struct LocalEntry<T> {
    storage: ChunkedStorage<T>,
    /// The thread id passed to [`ParallelChunkedStorage::create_local_storage`].
    thread_id: u32,
    /// The position of this entry in snapshot iteration vectors. Indexes are
    /// unique but need not match the order of the `next` pointers.
    index: usize,
    next: *mut LocalEntry<T>,
}

/// A collection of per-worker [`ChunkedStorage`] values with lock-free
/// registration and chunk-granular parallel iteration.
///
/// Workers register with [`create_local_storage`] and append through the
/// returned [`LocalStorageRef`]; nothing else may mutate a worker's storage.
/// Entries are never removed individually: the collection as a whole is
/// iterated, cleared, or dropped. Iteration must not overlap with appends;
/// the execution coordinator guarantees this with its phase barrier.
///
/// [`create_local_storage`]: ParallelChunkedStorage::create_local_storage
pub struct ParallelChunkedStorage<T> {
    front: AtomicPtr<LocalEntry<T>>,
    num_entries: AtomicUsize,
}

// SAFETY: the collection owns its entries; entry storages are only mutated
// through the LocalStorageRef handed to their single registering worker
unsafe impl<T: Send> Send for ParallelChunkedStorage<T> {}
// SAFETY: registration is lock-free and appends go through per-worker
// exclusive handles, so sharing the collection itself is safe for T: Send
unsafe impl<T: Send> Sync for ParallelChunkedStorage<T> {}

impl<T> Default for ParallelChunkedStorage<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ParallelChunkedStorage<T> {
    /// Creates an empty collection. Does not allocate.
    pub fn new() -> Self {
        Self {
            front: AtomicPtr::new(null_mut()),
            num_entries: AtomicUsize::new(0),
        }
    }

    /// Registers a new per-worker storage and returns the handle through
    /// which the calling worker appends to it.
    ///
    /// Safe to call from any number of threads concurrently; progress is
    /// lock-free. The `thread_id` is used by the parallel iterator to start
    /// a caller at its own entry.
    pub fn create_local_storage(&self, thread_id: u32) -> LocalStorageRef<T> {
        let entry = Box::into_raw(Box::new(LocalEntry {
            storage: ChunkedStorage::new(),
            thread_id,
            index: self.num_entries.fetch_add(1, Ordering::Relaxed),
            next: null_mut(),
        }));
        let mut head = self.front.load(Ordering::Acquire);
        loop {
            // SAFETY: entry is not yet shared; we own it until the exchange
            // below succeeds
            unsafe { (*entry).next = head };
            match self
                .front
                .compare_exchange_weak(head, entry, Ordering::AcqRel, Ordering::Acquire)
            {
                Ok(_) => break,
                Err(found) => head = found,
            }
        }
        LocalStorageRef { entry }
    }

    /// The total number of stored elements.
    ///
    /// Not synchronized: callers must ensure no appends are in flight, which
    /// the coordinator's phase barrier provides.
    pub fn len(&self) -> usize {
        let mut total = 0;
        let mut entry = self.front.load(Ordering::Acquire);
        while !entry.is_null() {
            // SAFETY: entries stay alive until the collection is dropped
            unsafe {
                total += (*entry).storage.len();
                entry = (*entry).next;
            }
        }
        total
    }

    /// Returns `true` when no elements are stored. Same synchronization
    /// caveat as [`len`](ParallelChunkedStorage::len).
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops all entries and their elements.
    pub fn clear(&mut self) {
        let mut entry = *self.front.get_mut();
        while !entry.is_null() {
            // SAFETY: the entry was created by Box::into_raw in
            // create_local_storage and is dropped exactly once here
            let boxed = unsafe { Box::from_raw(entry) };
            entry = boxed.next;
        }
        *self.front.get_mut() = null_mut();
        *self.num_entries.get_mut() = 0;
    }

    /// Iterates over all elements, entry by entry, skipping empty storages.
    /// No ordering across entries is guaranteed.
    pub fn iter(&self) -> StorageIter<'_, T> {
        StorageIter {
            entry: self.front.load(Ordering::Acquire),
            inner: None,
            _marker: PhantomData,
        }
    }

    /// Creates a snapshot iterator that hands out whole chunks to concurrent
    /// callers for shared access, each chunk exactly once.
    pub fn parallel_iter(&self) -> ParallelIter<'_, T> {
        ParallelIter {
            core: IterCore::snapshot(self),
            _marker: PhantomData,
        }
    }

    /// Creates a snapshot iterator that hands out whole chunks to concurrent
    /// callers for exclusive access, each chunk exactly once.
    ///
    /// Taking `&mut self` guarantees that no appends overlap the iteration
    /// and that at most one claiming iterator is live at a time.
    pub fn parallel_iter_mut(&mut self) -> ParallelIterMut<'_, T> {
        ParallelIterMut {
            core: IterCore::snapshot(self),
            _marker: PhantomData,
        }
    }
}

impl<T> Drop for ParallelChunkedStorage<T> {
    fn drop(&mut self) {
        self.clear();
    }
}

/// The append handle for one worker's storage in a
/// [`ParallelChunkedStorage`].
///
/// Only the worker holding the handle may append to the underlying storage.
pub struct LocalStorageRef<T> {
    entry: *mut LocalEntry<T>,
}

// SAFETY: the handle grants exclusive access to its entry's storage, so it
// may move between threads whenever the elements may
unsafe impl<T: Send> Send for LocalStorageRef<T> {}

impl<T> LocalStorageRef<T> {
    /// Appends a value to this worker's storage, returning a reference with
    /// the same stability guarantee as [`ChunkedStorage::push`].
    pub fn push(&mut self, value: T) -> &mut T {
        // SAFETY: the entry outlives the handle and this handle is the only
        // mutator of its storage
        unsafe { (*self.entry).storage.push(value) }
    }

    /// The number of elements in this worker's storage.
    pub fn len(&self) -> usize {
        // SAFETY: the entry outlives the handle
        unsafe { (*self.entry).storage.len() }
    }

    /// Returns `true` when this worker's storage is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Sequential iterator over all elements of a [`ParallelChunkedStorage`].
pub struct StorageIter<'a, T> {
    entry: *mut LocalEntry<T>,
    inner: Option<crate::Iter<'a, T>>,
    _marker: PhantomData<&'a ParallelChunkedStorage<T>>,
}

impl<'a, T> Iterator for StorageIter<'a, T> {
    type Item = &'a T;

    fn next(&mut self) -> Option<&'a T> {
        loop {
            if let Some(inner) = &mut self.inner {
                if let Some(item) = inner.next() {
                    return Some(item);
                }
                self.inner = None;
            }
            if self.entry.is_null() {
                return None;
            }
            // SAFETY: entries stay alive for the borrowed collection
            unsafe {
                self.inner = Some((*self.entry).storage.iter());
                self.entry = (*self.entry).next;
            }
        }
    }
}

/// Per-entry cursor state of a snapshot iterator.
struct IterEntry<T> {
    /// The next chunk available in this entry. Starts at the entry's last
    /// chunk and walks backwards via `prev`, so claiming terminates at null.
    next_chunk: AtomicPtr<ChunkHeader<T>>,
    /// The entry a caller that owns this slot should try next. Only the
    /// owning caller reads and writes it; it merely skips known-empty
    /// entries faster.
    next_thread_index: AtomicUsize,
}

/// Shared claiming state of the snapshot iterators.
struct IterCore<T> {
    thread_map: ThreadIdMap,
    entries: Vec<IterEntry<T>>,
}

impl<T> Default for IterCore<T> {
    fn default() -> Self {
        Self {
            thread_map: ThreadIdMap::default(),
            entries: Vec::new(),
        }
    }
}

impl<T> IterCore<T> {
    fn snapshot(storage: &ParallelChunkedStorage<T>) -> Self {
        let len = storage.num_entries.load(Ordering::Acquire);
        let mut entries: Vec<IterEntry<T>> = (0..len)
            .map(|_| IterEntry {
                next_chunk: AtomicPtr::new(null_mut()),
                next_thread_index: AtomicUsize::new(usize::MAX),
            })
            .collect();
        let mut thread_map = ThreadIdMap::default();
        let mut entry = storage.front.load(Ordering::Acquire);
        while !entry.is_null() {
            // SAFETY: entries stay alive for the borrowed collection
            let local = unsafe { &*entry };
            // An entry whose registration raced with reading num_entries is
            // skipped; the coordinator only iterates quiesced collections.
            if let Some(slot) = entries.get_mut(local.index) {
                thread_map.insert(local.thread_id, local.index);
                *slot.next_chunk.get_mut() = local.storage.back_chunk();
                *slot.next_thread_index.get_mut() = local.index;
            }
            entry = local.next;
        }
        Self {
            thread_map,
            entries,
        }
    }

    fn start_index(&self, thread_id: u32) -> usize {
        self.thread_map.get(&thread_id).copied().unwrap_or(0)
    }

    /// Claims the next unclaimed chunk, starting at the caller's own entry
    /// and moving circularly through the others.
    fn claim(&self, own_index: usize) -> *mut ChunkHeader<T> {
        let Some(own) = self.entries.get(own_index) else {
            return null_mut();
        };
        let mut current = own.next_thread_index.load(Ordering::Relaxed);
        if current == usize::MAX {
            return null_mut();
        }
        loop {
            let entry = &self.entries[current];
            let mut chunk = entry.next_chunk.load(Ordering::Acquire);
            while !chunk.is_null() {
                // SAFETY: chunks of the snapshotted storage stay alive and
                // unchanged for the iterator's lifetime
                let prev = unsafe { (*chunk).prev };
                match entry.next_chunk.compare_exchange_weak(
                    chunk,
                    prev,
                    Ordering::AcqRel,
                    Ordering::Acquire,
                ) {
                    Ok(_) => {
                        own.next_thread_index.store(current, Ordering::Relaxed);
                        return chunk;
                    }
                    Err(found) => chunk = found,
                }
            }

            current += 1;
            if current >= self.entries.len() {
                current = 0;
            }
            own.next_thread_index.store(current, Ordering::Relaxed);
            if current == own_index {
                break;
            }
        }
        // A full round found nothing; remember that this caller is done.
        own.next_thread_index.store(usize::MAX, Ordering::Relaxed);
        null_mut()
    }
}

/// A snapshot iterator handing out chunks of a [`ParallelChunkedStorage`]
/// for shared access.
///
/// Built from the collection at the moment of construction; every chunk is
/// claimed by exactly one caller across the iterator's lifetime. There is no
/// global ordering across chunks; per entry, chunks are handed out newest
/// first.
pub struct ParallelIter<'a, T> {
    core: IterCore<T>,
    _marker: PhantomData<&'a ParallelChunkedStorage<T>>,
}

// SAFETY: claiming only touches atomics and hands out shared element access
unsafe impl<T: Sync> Sync for ParallelIter<'_, T> {}
// SAFETY: the iterator owns no elements, only cursors into the storage
unsafe impl<T: Send> Send for ParallelIter<'_, T> {}

impl<T> Default for ParallelIter<'_, T> {
    /// An empty iterator; every call to [`next`](ParallelIter::next) returns
    /// `None`.
    fn default() -> Self {
        Self {
            core: IterCore::default(),
            _marker: PhantomData,
        }
    }
}

impl<'a, T> ParallelIter<'a, T> {
    /// Claims the next chunk for the caller with the given thread id, or
    /// `None` once all chunks are claimed.
    pub fn next(&self, thread_id: u32) -> Option<Range<'a, T>> {
        let chunk = self.core.claim(self.core.start_index(thread_id));
        if chunk.is_null() {
            None
        } else {
            Some(Range {
                chunk,
                _marker: PhantomData,
            })
        }
    }
}

/// A snapshot iterator handing out chunks of a [`ParallelChunkedStorage`]
/// for exclusive access.
///
/// Same claiming discipline as [`ParallelIter`]; chunk exclusivity is what
/// makes handing out `&mut` element slices sound.
pub struct ParallelIterMut<'a, T> {
    core: IterCore<T>,
    _marker: PhantomData<&'a mut ParallelChunkedStorage<T>>,
}

// SAFETY: claiming only touches atomics; exclusivity of each claimed chunk
// makes transferring mutable element access across threads safe for T: Send
unsafe impl<T: Send> Sync for ParallelIterMut<'_, T> {}
// SAFETY: the iterator owns no elements, only cursors into the storage
unsafe impl<T: Send> Send for ParallelIterMut<'_, T> {}

impl<T> Default for ParallelIterMut<'_, T> {
    /// An empty iterator; every call to [`next`](ParallelIterMut::next)
    /// returns `None`.
    fn default() -> Self {
        Self {
            core: IterCore::default(),
            _marker: PhantomData,
        }
    }
}

impl<'a, T> ParallelIterMut<'a, T> {
    /// Claims the next chunk for the caller with the given thread id, or
    /// `None` once all chunks are claimed.
    pub fn next(&self, thread_id: u32) -> Option<RangeMut<'a, T>> {
        let chunk = self.core.claim(self.core.start_index(thread_id));
        if chunk.is_null() {
            None
        } else {
            Some(RangeMut {
                chunk,
                _marker: PhantomData,
            })
        }
    }

    /// Erases the borrow of the underlying storage.
    ///
    /// This exists for operators that keep the snapshot next to the storage
    /// it iterates inside one struct.
    ///
    /// # Safety
    /// The caller must ensure the iterator (and every range claimed from it)
    /// is dropped before the storage, that the storage is not appended to or
    /// moved while the iterator is live, and that no other claiming iterator
    /// over the same storage is live at the same time.
    pub unsafe fn detach(self) -> ParallelIterMut<'static, T> {
        ParallelIterMut {
            core: self.core,
            _marker: PhantomData,
        }
    }
}

/// One chunk's worth of elements, claimed for shared access.
pub struct Range<'a, T> {
    chunk: *mut ChunkHeader<T>,
    _marker: PhantomData<&'a [T]>,
}

// SAFETY: a range only hands out shared element references
unsafe impl<T: Sync> Send for Range<'_, T> {}

impl<'a, T> Range<'a, T> {
    /// The elements of the claimed chunk, in insertion order.
    pub fn as_slice(&self) -> &'a [T] {
        // SAFETY: the chunk is live for 'a and its first len elements are
        // initialized; no exclusive references exist while 'a is shared
        unsafe { slice::from_raw_parts(chunk_elements(self.chunk), (*self.chunk).len) }
    }

    /// The number of elements in this range.
    pub fn len(&self) -> usize {
        // SAFETY: the chunk is live for 'a
        unsafe { (*self.chunk).len }
    }

    /// Returns `true` when the range holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<'a, T> IntoIterator for &Range<'a, T> {
    type Item = &'a T;
    type IntoIter = slice::Iter<'a, T>;

    fn into_iter(self) -> slice::Iter<'a, T> {
        self.as_slice().iter()
    }
}

/// One chunk's worth of elements, claimed for exclusive access.
pub struct RangeMut<'a, T> {
    chunk: *mut ChunkHeader<T>,
    _marker: PhantomData<&'a mut [T]>,
}

// SAFETY: the range grants exclusive access to its chunk's elements
unsafe impl<T: Send> Send for RangeMut<'_, T> {}

impl<T> RangeMut<'_, T> {
    /// The elements of the claimed chunk, in insertion order.
    pub fn as_slice(&self) -> &[T] {
        // SAFETY: the chunk is live and exclusively claimed by this range
        unsafe { slice::from_raw_parts(chunk_elements(self.chunk), (*self.chunk).len) }
    }

    /// Mutable access to the elements of the claimed chunk.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        // SAFETY: the chunk is live and exclusively claimed by this range,
        // so no other reference to its elements exists
        unsafe { slice::from_raw_parts_mut(chunk_elements(self.chunk), (*self.chunk).len) }
    }

    /// The number of elements in this range.
    pub fn len(&self) -> usize {
        // SAFETY: the chunk is live while the range is
        unsafe { (*self.chunk).len }
    }

    /// Returns `true` when the range holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
