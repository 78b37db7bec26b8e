// Log-structured timer wheel.
//
// A bucketed delay queue whose bucket spans grow exponentially away from
// "now": the head bucket is fine-grained (minimum span `1 << bucket_shift`),
// far-future buckets are coarse. Timers land in their bucket in constant
// time; only the head bucket is heap-ordered, and lazily. A coarse bucket
// arriving at the head splits while it is oversized, restoring fine
// granularity exactly where ordering starts to matter.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;

/// A bucket of timers covering `[start, end)`.
#[derive(Debug)]
struct Bucket<T> {
    start: u64,
    end: u64,
    /// Heap-ordered by deadline once true; insertion order otherwise.
    heapified: bool,
    items: Vec<(u64, T)>,
}

impl<T: Eq> Bucket<T> {
    fn span(&self) -> u64 {
        self.end - self.start
    }

    fn heapify(&mut self) {
        if self.heapified {
            return;
        }
        let len = self.items.len();
        for i in (0..len / 2).rev() {
            self.sift_down(i);
        }
        self.heapified = true;
    }

    fn sift_up(&mut self, mut i: usize) {
        while i > 0 {
            let parent = (i - 1) / 2;
            if self.items[i].0 < self.items[parent].0 {
                self.items.swap(i, parent);
                i = parent;
            } else {
                break;
            }
        }
    }

    fn sift_down(&mut self, mut i: usize) {
        let len = self.items.len();
        loop {
            let (l, r) = (2 * i + 1, 2 * i + 2);
            let mut smallest = i;
            if l < len && self.items[l].0 < self.items[smallest].0 {
                smallest = l;
            }
            if r < len && self.items[r].0 < self.items[smallest].0 {
                smallest = r;
            }
            if smallest == i {
                return;
            }
            self.items.swap(i, smallest);
            i = smallest;
        }
    }

    fn push(&mut self, deadline: u64, timer: T) {
        self.items.push((deadline, timer));
        if self.heapified {
            self.sift_up(self.items.len() - 1);
        }
    }

    fn peek_min(&self) -> Option<u64> {
        debug_assert!(self.heapified);
        self.items.first().map(|(d, _)| *d)
    }

    fn pop_min(&mut self) -> Option<(u64, T)> {
        debug_assert!(self.heapified);
        if self.items.is_empty() {
            return None;
        }
        let last = self.items.len() - 1;
        self.items.swap(0, last);
        let out = self.items.pop();
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        out
    }

    fn remove(&mut self, timer: &T) -> bool {
        let Some(pos) = self.items.iter().position(|(_, t)| t == timer) else {
            return false;
        };
        let last = self.items.len() - 1;
        self.items.swap(pos, last);
        self.items.pop();
        if self.heapified && pos < self.items.len() {
            self.sift_down(pos);
            self.sift_up(pos);
        }
        true
    }
}

/// The timer wheel. `T` identifies a timer; re-adding an existing identity
/// updates its deadline.
#[derive(Debug)]
pub struct LogGroupTimers<T: Clone + Eq + Hash> {
    min_span: u64,
    bucket_split_size: usize,
    /// Contiguous, non-overlapping, time-ordered.
    buckets: VecDeque<Bucket<T>>,
    /// Timer -> registered deadline; the membership source of truth.
    index: HashMap<T, u64>,
}

impl<T: Clone + Eq + Hash> LogGroupTimers<T> {
    pub fn new(bucket_shift: u32, bucket_split_size: usize) -> Self {
        Self {
            min_span: 1u64 << bucket_shift,
            bucket_split_size: bucket_split_size.max(1),
            buckets: VecDeque::new(),
            index: HashMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.index.len()
    }

    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }

    pub fn contains(&self, timer: &T) -> bool {
        self.index.contains_key(timer)
    }

    /// Register a timer. Constant time in the far future; `O(log n)` in a
    /// heapified head bucket.
    pub fn add(&mut self, deadline: u64, timer: T) {
        if self.index.contains_key(&timer) {
            self.update(deadline, timer);
            return;
        }
        self.index.insert(timer.clone(), deadline);
        let idx = self.bucket_index_for(deadline);
        self.buckets[idx].push(deadline, timer);
    }

    /// Move an existing timer (or add a missing one) to a new deadline.
    pub fn update(&mut self, deadline: u64, timer: T) {
        let Some(old) = self.index.get(&timer).copied() else {
            self.add(deadline, timer);
            return;
        };
        if old == deadline {
            return;
        }
        let old_idx = self.existing_bucket_index(old);
        let new_idx = self.bucket_index_for(deadline);
        self.index.insert(timer.clone(), deadline);
        if Some(new_idx) == old_idx {
            // Same bucket: rewrite the deadline in place.
            let bucket = &mut self.buckets[new_idx];
            if let Some(pos) = bucket.items.iter().position(|(_, t)| *t == timer) {
                bucket.items[pos].0 = deadline;
                if bucket.heapified {
                    bucket.sift_down(pos);
                    bucket.sift_up(pos);
                }
            }
            return;
        }
        if let Some(idx) = old_idx {
            self.buckets[idx].remove(&timer);
        }
        let idx = self.bucket_index_for(deadline);
        self.buckets[idx].push(deadline, timer);
    }

    pub fn remove(&mut self, timer: &T) -> bool {
        let Some(deadline) = self.index.remove(timer) else {
            return false;
        };
        if let Some(idx) = self.existing_bucket_index(deadline) {
            if self.buckets[idx].remove(timer) {
                return true;
            }
        }
        // Deadline moved across bucket boundaries during structural
        // maintenance: fall back to a scan.
        for bucket in &mut self.buckets {
            if bucket.remove(timer) {
                return true;
            }
        }
        false
    }

    /// The instant the embedder should next call back: the minimum pending
    /// deadline, or the head bucket's end when the head is empty but later
    /// buckets hold timers.
    pub fn wake_at(&mut self) -> Option<u64> {
        if self.index.is_empty() {
            return None;
        }
        self.drop_leading_empty_buckets();
        let head = self.buckets.front_mut()?;
        if head.items.is_empty() {
            return Some(head.end);
        }
        head.heapify();
        head.peek_min()
    }

    /// Drain every timer with `deadline <= now` into `sink`, in arbitrary
    /// order across buckets but deadline order within the current bucket.
    /// Reentrant: the sink may add, update or remove timers.
    pub fn advance(&mut self, now: u64, sink: &mut impl FnMut(&mut Self, T)) {
        loop {
            match self.pop_expired(now) {
                Some((_, timer)) => sink(self, timer),
                None => return,
            }
        }
    }

    /// Remove and return the strictly earliest pending timer.
    pub fn poll(&mut self) -> Option<(u64, T)> {
        loop {
            let bucket = self.first_nonempty_bucket()?;
            bucket.heapify();
            if let Some((deadline, timer)) = bucket.pop_min() {
                self.index.remove(&timer);
                return Some((deadline, timer));
            }
        }
    }

    // ------------------------------------------------------------------

    fn pop_expired(&mut self, now: u64) -> Option<(u64, T)> {
        loop {
            self.drop_leading_empty_buckets();
            let head = self.buckets.front_mut()?;
            if head.items.is_empty() {
                // Head not yet expired and nothing in it.
                return None;
            }
            if head.end <= now {
                // Whole bucket expired: order inside it does not matter.
                let (deadline, timer) = head.items.pop().expect("non-empty");
                self.index.remove(&timer);
                return Some((deadline, timer));
            }
            if head.start > now {
                return None;
            }
            // `now` falls inside the head bucket: split while oversized,
            // then drain in deadline order.
            self.split_head_while_oversized();
            let head = self.buckets.front_mut().expect("non-empty wheel");
            if head.items.is_empty() {
                continue;
            }
            head.heapify();
            if head.peek_min().expect("non-empty") <= now {
                let (deadline, timer) = head.pop_min().expect("non-empty");
                self.index.remove(&timer);
                return Some((deadline, timer));
            }
            return None;
        }
    }

    fn drop_leading_empty_buckets(&mut self) {
        while self.buckets.len() > 1 {
            let drop = {
                let head = &self.buckets[0];
                head.items.is_empty()
            };
            if drop {
                self.buckets.pop_front();
            } else {
                return;
            }
        }
        if self.buckets.len() == 1 && self.buckets[0].items.is_empty() && self.index.is_empty() {
            self.buckets.pop_front();
        }
    }

    /// Split the head bucket in half while it is both oversized and wider
    /// than the minimum span, preserving every contained timer.
    fn split_head_while_oversized(&mut self) {
        loop {
            let head = match self.buckets.front() {
                Some(h) => h,
                None => return,
            };
            if head.span() <= self.min_span || head.items.len() <= self.bucket_split_size {
                return;
            }
            let head = self.buckets.pop_front().expect("checked non-empty");
            let mid = head.start + head.span() / 2;
            let mut low = Bucket {
                start: head.start,
                end: mid,
                heapified: false,
                items: Vec::new(),
            };
            let mut high = Bucket {
                start: mid,
                end: head.end,
                heapified: false,
                items: Vec::new(),
            };
            for (deadline, timer) in head.items {
                if deadline < mid {
                    low.items.push((deadline, timer));
                } else {
                    high.items.push((deadline, timer));
                }
            }
            self.buckets.push_front(high);
            self.buckets.push_front(low);
        }
    }

    /// Bucket index that should hold `deadline`, growing the wheel as
    /// needed.
    fn bucket_index_for(&mut self, deadline: u64) -> usize {
        if self.buckets.is_empty() {
            let start = deadline & !(self.min_span - 1);
            self.buckets.push_back(Bucket {
                start,
                end: start + self.min_span,
                heapified: false,
                items: Vec::new(),
            });
            return 0;
        }
        if deadline < self.buckets[0].start {
            // Already-expired or head-bound timer: the head bucket takes it.
            return 0;
        }
        // Extend with exponentially growing spans until covered.
        while deadline >= self.buckets.back().expect("non-empty").end {
            let last = self.buckets.back().expect("non-empty");
            let span = (last.span() * 2).max(self.min_span);
            let start = last.end;
            self.buckets.push_back(Bucket {
                start,
                end: start + span,
                heapified: false,
                items: Vec::new(),
            });
        }
        // Binary search by start.
        let mut lo = 0usize;
        let mut hi = self.buckets.len();
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            if self.buckets[mid].start <= deadline {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        lo
    }

    fn existing_bucket_index(&self, deadline: u64) -> Option<usize> {
        if self.buckets.is_empty() {
            return None;
        }
        if deadline < self.buckets[0].start {
            return Some(0);
        }
        let mut lo = 0usize;
        let mut hi = self.buckets.len();
        while lo + 1 < hi {
            let mid = (lo + hi) / 2;
            if self.buckets[mid].start <= deadline {
                lo = mid;
            } else {
                hi = mid;
            }
        }
        Some(lo)
    }

    fn first_nonempty_bucket(&mut self) -> Option<&mut Bucket<T>> {
        self.drop_leading_empty_buckets();
        let pos = self.buckets.iter().position(|b| !b.items.is_empty())?;
        Some(&mut self.buckets[pos])
    }
}
