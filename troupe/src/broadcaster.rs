//! Fanning one append-only log out to many independently paced stream consumers.
//!
//! Each consumer's read offset lives in an [`OffsetHeap`], so the slowest consumer is always
//! at the root. Whenever the minimum moves, the log is told it may forget everything before
//! it; when the last consumer leaves, the log may forget everything.

use super::actor::Activation;
use super::actor::Actor;
use super::error::ActorResult;
use super::error::Error;
use super::stream::OutputId;
use super::stream::OutputOptions;
use super::stream::Pull;
use super::stream::StreamOutput;

use std::any::Any;
use std::collections::HashMap;
use std::collections::HashSet;
use std::collections::VecDeque;
use std::hash::Hash;

/// An append-only log answering range queries by offset.
#[allow(unused_variables)]
pub trait ChangeLog: Send + 'static {
    type Item: Clone + Any + Send;

    /// The oldest retained offset.
    fn tail(&self) -> u64;

    /// The offset the next appended item will get.
    fn head(&self) -> u64;

    fn append(&mut self, item: Self::Item) -> u64;

    /// At most `max_len` items starting at `from`.
    fn read(&self, from: u64, max_len: usize) -> Result<Vec<Self::Item>, Error>;

    /// No consumer will read before `offset` again.
    fn last_offset_changed(&mut self, offset: u64) {}

    /// Nobody is reading any more.
    fn no_more_subscribers(&mut self) {}
}

/// An in-memory [`ChangeLog`] that trims itself as consumers advance.
#[derive(Debug, Clone)]
pub struct VecLog<T> {
    base: u64,
    items: VecDeque<T>,
}

impl<T> VecLog<T> {
    pub fn new() -> Self {
        VecLog { base: 0, items: VecDeque::new() }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }
}

impl<T> Default for VecLog<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Any + Send> ChangeLog for VecLog<T> {
    type Item = T;

    fn tail(&self) -> u64 {
        self.base
    }

    fn head(&self) -> u64 {
        self.base + self.items.len() as u64
    }

    fn append(&mut self, item: T) -> u64 {
        let offset = self.head();
        self.items.push_back(item);
        offset
    }

    fn read(&self, from: u64, max_len: usize) -> Result<Vec<T>, Error> {
        if from < self.base || from > self.head() {
            return Err(Error::OffsetOutOfRange(from));
        }
        let start = (from - self.base) as usize;
        Ok(self.items.iter().skip(start).take(max_len).cloned().collect())
    }

    fn last_offset_changed(&mut self, offset: u64) {
        while self.base < offset && self.items.pop_front().is_some() {
            self.base += 1;
        }
    }

    fn no_more_subscribers(&mut self) {
        self.base = self.head();
        self.items.clear();
    }
}

//---------------------------------------------------------------------------

/// A binary min-heap of offsets with O(1) lookup of any key's position.
#[derive(Debug, Clone)]
pub struct OffsetHeap<K> {
    heap: Vec<(u64, K)>,
    index: HashMap<K, usize>,
}

impl<K: Clone + Eq + Hash> OffsetHeap<K> {
    pub fn new() -> Self {
        OffsetHeap { heap: Vec::new(), index: HashMap::new() }
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn min(&self) -> Option<(u64, &K)> {
        self.heap.first().map(|(o, k)| (*o, k))
    }

    pub fn min_offset(&self) -> Option<u64> {
        self.heap.first().map(|(o, _)| *o)
    }

    pub fn offset(&self, key: &K) -> Option<u64> {
        self.index.get(key).map(|&i| self.heap[i].0)
    }

    pub fn contains(&self, key: &K) -> bool {
        self.index.contains_key(key)
    }

    /// Inserts `key`, or moves it to `offset` if already present.
    pub fn insert(&mut self, key: K, offset: u64) {
        if self.index.contains_key(&key) {
            self.update(&key, offset);
            return;
        }
        let i = self.heap.len();
        self.index.insert(key.clone(), i);
        self.heap.push((offset, key));
        self.sift_up(i);
    }

    pub fn update(&mut self, key: &K, offset: u64) -> bool {
        let i = match self.index.get(key) {
            Some(&i) => i,
            None => return false,
        };
        let old = std::mem::replace(&mut self.heap[i].0, offset);
        if offset < old {
            self.sift_up(i);
        } else {
            self.sift_down(i);
        }
        true
    }

    pub fn remove(&mut self, key: &K) -> Option<u64> {
        let i = self.index.remove(key)?;
        let last = self.heap.len() - 1;
        self.heap.swap(i, last);
        let (offset, _) = self.heap.pop()?;
        if i < self.heap.len() {
            self.index.insert(self.heap[i].1.clone(), i);
            self.sift_up(i);
            self.sift_down(i);
        }
        Some(offset)
    }

    pub fn keys(&self) -> impl Iterator<Item = &K> {
        self.heap.iter().map(|(_, k)| k)
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.index.insert(self.heap[i].1.clone(), i);
        self.index.insert(self.heap[j].1.clone(), j);
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.heap[parent].0 <= self.heap[i].0 {
                break;
            }
            self.swap(parent, i);
            i = parent;
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        loop {
            let left = 2 * i + 1;
            let right = left + 1;
            let mut smallest = i;
            if left < self.heap.len() && self.heap[left].0 < self.heap[smallest].0 {
                smallest = left;
            }
            if right < self.heap.len() && self.heap[right].0 < self.heap[smallest].0 {
                smallest = right;
            }
            if smallest == i {
                break;
            }
            self.swap(i, smallest);
            i = smallest;
        }
    }
}

impl<K: Clone + Eq + Hash> Default for OffsetHeap<K> {
    fn default() -> Self {
        Self::new()
    }
}

//---------------------------------------------------------------------------

/// Decides, on each append, whether the slowest consumer has fallen too far behind.
pub enum DropPolicy {
    /// Evict consumers more than this many items behind the head.
    MaxLag(u64),
    /// Called with the consumer's offset and the log head.
    Custom(Box<dyn Fn(u64, u64) -> bool + Send>),
}

impl DropPolicy {
    fn should_drop(&self, offset: u64, head: u64) -> bool {
        match self {
            DropPolicy::MaxLag(n) => head.saturating_sub(offset) > *n,
            DropPolicy::Custom(f) => f(offset, head),
        }
    }
}

impl std::fmt::Debug for DropPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> Result<(), std::fmt::Error> {
        match self {
            DropPolicy::MaxLag(n) => write!(f, "MaxLag({})", n),
            DropPolicy::Custom(_) => f.write_str("Custom"),
        }
    }
}

/// Serves one [`ChangeLog`] to any number of stream consumers.
///
/// Lives inside the hosting actor's state; [`subscribe`][Broadcaster::subscribe] is given a
/// function finding it again there, which the stream output uses on every pull.
pub struct Broadcaster<L: ChangeLog> {
    log: L,
    consumers: OffsetHeap<OutputId>,
    waiting: HashSet<OutputId>,
    drop_policy: Option<DropPolicy>,
    last_min: Option<u64>,
}

impl<L: ChangeLog> Broadcaster<L> {
    pub fn new(log: L) -> Self {
        Broadcaster {
            log,
            consumers: OffsetHeap::new(),
            waiting: HashSet::new(),
            drop_policy: None,
            last_min: None,
        }
    }

    pub fn with_drop_policy(mut self, policy: DropPolicy) -> Self {
        self.drop_policy = Some(policy);
        self
    }

    pub fn log(&self) -> &L {
        &self.log
    }

    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    pub fn offset_of(&self, id: &OutputId) -> Option<u64> {
        self.consumers.offset(id)
    }

    pub fn min_offset(&self) -> Option<u64> {
        self.consumers.min_offset()
    }

    /// Accepts the stream opened by the current command, starting at `from` (default: the
    /// head, i.e. only new items).
    pub fn subscribe<A: Actor>(
        &mut self,
        t: &mut Activation<A>,
        from: Option<u64>,
        access: fn(&mut A) -> &mut Broadcaster<L>,
        options: OutputOptions,
    ) -> Result<OutputId, Error> {
        let offset = from.unwrap_or_else(|| self.log.head());
        if offset < self.log.tail() || offset > self.log.head() {
            return Err(Error::OffsetOutOfRange(offset));
        }
        let id = t.accept_stream(BroadcastOutput { access }, options)?;
        tracing::debug!(?id, offset, "broadcast subscriber");
        self.consumers.insert(id.clone(), offset);
        self.offsets_changed();
        Ok(id)
    }

    /// Appends `item`, evicts laggards, and wakes consumers that were waiting for data.
    pub fn append<A: Actor>(&mut self, t: &mut Activation<A>, item: L::Item) -> u64 {
        let offset = self.log.append(item);
        if let Some(policy) = &self.drop_policy {
            let head = self.log.head();
            while let Some((min, id)) = self.consumers.min() {
                if !policy.should_drop(min, head) {
                    break;
                }
                let id = id.clone();
                tracing::debug!(?id, lag = head - min, "dropping slow consumer");
                self.consumers.remove(&id);
                self.waiting.remove(&id);
                t.close_output(&id, Some(Error::StreamConsumerSlow));
            }
        }
        for id in self.waiting.drain() {
            t.flush_later(&id);
        }
        self.offsets_changed();
        offset
    }

    fn read_for(&mut self, id: &OutputId, max_len: usize) -> Pull<L::Item> {
        let offset = match self.consumers.offset(id) {
            Some(o) => o,
            None => return Pull::Finished(Some(Error::BadStream)),
        };
        if offset >= self.log.head() {
            self.waiting.insert(id.clone());
            return Pull::Pending;
        }
        match self.log.read(offset, max_len) {
            Ok(items) => {
                self.consumers.update(id, offset + items.len() as u64);
                self.offsets_changed();
                Pull::Data(items)
            }
            Err(e) => Pull::Finished(Some(e)),
        }
    }

    fn remove_consumer(&mut self, id: &OutputId) {
        self.waiting.remove(id);
        if self.consumers.remove(id).is_some() {
            self.offsets_changed();
        }
    }

    fn offsets_changed(&mut self) {
        let min = self.consumers.min_offset();
        if min == self.last_min {
            return;
        }
        self.last_min = min;
        match min {
            Some(m) => self.log.last_offset_changed(m),
            None => self.log.no_more_subscribers(),
        }
    }
}

struct BroadcastOutput<A, L: ChangeLog> {
    access: fn(&mut A) -> &mut Broadcaster<L>,
}

impl<A: Actor, L: ChangeLog> StreamOutput<A> for BroadcastOutput<A, L> {
    type Item = L::Item;

    fn pull(&mut self, a: &mut A, _t: &mut Activation<A>, id: &OutputId, max_len: usize) -> Pull<L::Item> {
        (self.access)(a).read_for(id, max_len)
    }

    fn on_close(&mut self, a: &mut A, _t: &mut Activation<A>, id: &OutputId, _error: Option<&Error>) -> ActorResult {
        (self.access)(a).remove_consumer(id);
        Ok(())
    }
}
