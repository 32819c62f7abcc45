//! tri-partite request queue backing one client.
//!
//! slots are partitioned by two indices into `[done | running | pending]`:
//! `[0, run_idx)` completed and nulled, `[run_idx, pend_idx)` written and
//! awaiting response, `[pend_idx, len)` not yet written. the head of the
//! queue is compacted once `run_idx` grows past a threshold so per request
//! cost stays amortized O(1).

const COMPACT_THRESHOLD: usize = 256;

pub(crate) struct Queue<T> {
    slots: Vec<Option<T>>,
    run_idx: usize,
    pend_idx: usize,
}

impl<T> Queue<T> {
    pub(crate) fn new() -> Self {
        Self {
            slots: Vec::new(),
            run_idx: 0,
            pend_idx: 0,
        }
    }

    pub(crate) fn running(&self) -> usize {
        self.pend_idx - self.run_idx
    }

    pub(crate) fn pending(&self) -> usize {
        self.slots.len() - self.pend_idx
    }

    pub(crate) fn size(&self) -> usize {
        self.slots.len() - self.run_idx
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.size() == 0
    }

    pub(crate) fn push(&mut self, item: T) {
        self.slots.push(Some(item));
        self.check();
    }

    /// first pending slot, the next candidate for a write.
    pub(crate) fn peek_pending(&self) -> Option<&T> {
        self.slots.get(self.pend_idx).map(|s| s.as_ref().expect("pending slot is live"))
    }

    pub(crate) fn peek_pending_mut(&mut self) -> Option<&mut T> {
        self.slots.get_mut(self.pend_idx).map(|s| s.as_mut().expect("pending slot is live"))
    }

    /// promote the first pending slot to running after a successful write.
    pub(crate) fn mark_running(&mut self) {
        debug_assert!(self.pend_idx < self.slots.len());
        self.pend_idx += 1;
        self.check();
    }

    /// remove the first pending slot without running it.
    pub(crate) fn remove_pending_head(&mut self) -> Option<T> {
        if self.pend_idx < self.slots.len() {
            let item = self.slots.remove(self.pend_idx);
            self.check();
            item
        } else {
            None
        }
    }

    /// head of the running region, the request the parser is resolving.
    pub(crate) fn head_running(&self) -> Option<&T> {
        if self.run_idx < self.pend_idx {
            self.slots[self.run_idx].as_ref()
        } else {
            None
        }
    }

    pub(crate) fn head_running_mut(&mut self) -> Option<&mut T> {
        if self.run_idx < self.pend_idx {
            self.slots[self.run_idx].as_mut()
        } else {
            None
        }
    }

    /// null the head running slot and advance past it, compacting when the
    /// dead prefix grows large.
    pub(crate) fn complete_head(&mut self) -> Option<T> {
        if self.run_idx >= self.pend_idx {
            return None;
        }
        let item = self.slots[self.run_idx].take();
        self.run_idx += 1;
        if self.run_idx > COMPACT_THRESHOLD {
            self.compact();
        }
        self.check();
        item
    }

    /// tear the running region down for a dead socket: the head request is
    /// returned to be errored (its response state is undefined), the rest are
    /// re-enqueued in order at the front of the pending region.
    pub(crate) fn split_for_retry(&mut self) -> (Option<T>, usize) {
        let head = if self.run_idx < self.pend_idx {
            self.run_idx += 1;
            self.slots[self.run_idx - 1].take()
        } else {
            None
        };

        let retried = self.pend_idx.saturating_sub(self.run_idx);

        // drop the nulled prefix. former running tail lands at the queue
        // front, ahead of everything never written.
        self.slots.drain(..self.run_idx);
        self.run_idx = 0;
        self.pend_idx = 0;
        self.check();

        (head, retried)
    }

    /// drain every live slot, completed prefix excluded, for destroy.
    pub(crate) fn drain_all(&mut self) -> Vec<T> {
        let items = self.slots.drain(self.run_idx..).flatten().collect();
        self.slots.clear();
        self.run_idx = 0;
        self.pend_idx = 0;
        items
    }

    /// iterate pending slots mutably together with their queue positions.
    pub(crate) fn pending_iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots[self.pend_idx..].iter_mut().map(|s| s.as_mut().expect("pending slot is live"))
    }

    /// iterate running slots mutably, head first.
    pub(crate) fn running_iter_mut(&mut self) -> impl Iterator<Item = &mut T> {
        self.slots[self.run_idx..self.pend_idx]
            .iter_mut()
            .map(|s| s.as_mut().expect("running slot is live"))
    }

    /// remove pending slots matching a predicate, returning them.
    pub(crate) fn remove_pending_where(&mut self, mut pred: impl FnMut(&T) -> bool) -> Vec<T> {
        let mut removed = Vec::new();
        let mut i = self.pend_idx;
        while i < self.slots.len() {
            if pred(self.slots[i].as_ref().expect("pending slot is live")) {
                removed.push(self.slots.remove(i).expect("pending slot is live"));
            } else {
                i += 1;
            }
        }
        self.check();
        removed
    }

    /// reset indices once everything completed so the vec can be reused.
    pub(crate) fn reset_if_empty(&mut self) {
        if self.is_empty() {
            self.slots.clear();
            self.run_idx = 0;
            self.pend_idx = 0;
        }
    }

    fn compact(&mut self) {
        self.slots.drain(..self.run_idx);
        self.pend_idx -= self.run_idx;
        self.run_idx = 0;
    }

    #[inline]
    fn check(&self) {
        debug_assert!(self.run_idx <= self.pend_idx);
        debug_assert!(self.pend_idx <= self.slots.len());
    }
}
