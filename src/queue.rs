//! An unbounded multi-producer, single-consumer queue of intrusive
//! nodes.  Producers linearise on a `tail` exchange and publish with
//! a release store into the predecessor's `next`; the consumer pairs
//! that with an acquire fence.  A stationary sentinel node keeps both
//! ends simple: the queue is empty exactly when the consumer sits on
//! the sentinel and its `next` is null.
use std::cell::Cell;
use std::ptr::NonNull;
use std::sync::atomic::fence;
use std::sync::atomic::AtomicPtr;
use std::sync::atomic::Ordering;

/// One atomic link; embed this in anything that goes on a queue.
#[derive(Debug, Default)]
pub struct QueueNode {
    next: AtomicPtr<QueueNode>,
}

impl QueueNode {
    pub fn new() -> QueueNode {
        QueueNode {
            next: AtomicPtr::new(std::ptr::null_mut()),
        }
    }
}

pub struct MpscQueue {
    // Boxed so the queue value can move without invalidating the
    // producers' and nodes' pointers to the sentinel.
    sentinel: Box<QueueNode>,
    // Consumer-side cursor; points at the sentinel or at the last
    // node handed back.
    head: Cell<*mut QueueNode>,
    tail: AtomicPtr<QueueNode>,
}

// Producers share `&MpscQueue` across threads; all producer-visible
// state is atomic, and the `head` cursor is only touched by the
// single consumer `pop` demands.
unsafe impl Send for MpscQueue {}
unsafe impl Sync for MpscQueue {}

impl Default for MpscQueue {
    fn default() -> MpscQueue {
        MpscQueue::new()
    }
}

impl MpscQueue {
    pub fn new() -> MpscQueue {
        let sentinel = Box::new(QueueNode::new());
        let sentinel_ptr = &*sentinel as *const QueueNode as *mut QueueNode;

        MpscQueue {
            sentinel,
            head: Cell::new(sentinel_ptr),
            tail: AtomicPtr::new(sentinel_ptr),
        }
    }

    fn sentinel_ptr(&self) -> *mut QueueNode {
        &*self.sentinel as *const QueueNode as *mut QueueNode
    }

    /// Appends `node`.  Never blocks: producers only contend on the
    /// tail exchange.
    ///
    /// # Safety
    ///
    /// `node` must stay pinned and untouched by the caller until
    /// `pop` hands it back.
    pub unsafe fn push(&self, node: NonNull<QueueNode>) {
        self.push_raw(node.as_ptr());
    }

    unsafe fn push_raw(&self, node: *mut QueueNode) {
        (*node).next.store(std::ptr::null_mut(), Ordering::Relaxed);

        // The exchange linearises producers; the release store below
        // is the publication point the consumer's fence pairs with.
        let prev = self.tail.swap(node, Ordering::AcqRel);
        (*prev).next.store(node, Ordering::Release);
    }

    /// Removes the oldest node, or returns `None` when the queue is
    /// empty or a producer is still mid-publish.
    ///
    /// # Safety
    ///
    /// Single consumer only: `pop` must never run concurrently with
    /// itself.
    pub unsafe fn pop(&self) -> Option<NonNull<QueueNode>> {
        let sentinel = self.sentinel_ptr();
        let mut head = self.head.get();

        if head == sentinel {
            let next = (*sentinel).next.load(Ordering::Relaxed);

            if next.is_null() {
                return None;
            }

            // Step off the sentinel; it is not a payload node.
            self.advance(next);
            head = next;
        }

        let next = (*head).next.load(Ordering::Relaxed);
        if !next.is_null() {
            return Some(self.advance(next));
        }

        if head != self.tail.load(Ordering::Relaxed) {
            // A producer exchanged the tail but has not published its
            // `next` yet; report empty rather than wait on it.
            return None;
        }

        // The consumer caught up with the tail: re-enqueue the
        // sentinel so the last node gains a successor and can be
        // handed out.
        self.push_raw(sentinel);

        let next = (*head).next.load(Ordering::Relaxed);
        if !next.is_null() {
            return Some(self.advance(next));
        }

        None
    }

    /// Moves the consumer cursor to `next` and returns the node it
    /// left, making the producers' writes to it visible first.
    unsafe fn advance(&self, next: *mut QueueNode) -> NonNull<QueueNode> {
        fence(Ordering::Acquire);

        let head = self.head.replace(next);
        NonNull::new_unchecked(head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicBool;
    use std::sync::Arc;

    fn make_node() -> NonNull<QueueNode> {
        NonNull::from(Box::leak(Box::new(QueueNode::new())))
    }

    fn reclaim(node: NonNull<QueueNode>) {
        unsafe {
            let _ = Box::from_raw(node.as_ptr());
        }
    }

    #[test]
    fn fifo_smoke_test() {
        let queue = MpscQueue::new();
        let nodes: Vec<_> = (0..3).map(|_| make_node()).collect();

        unsafe {
            assert_eq!(queue.pop(), None);

            for node in &nodes {
                queue.push(*node);
            }

            for node in &nodes {
                assert_eq!(queue.pop(), Some(*node));
            }

            assert_eq!(queue.pop(), None);
        }

        nodes.into_iter().for_each(reclaim);
    }

    #[test]
    fn drains_interleaved_with_pushes() {
        let queue = MpscQueue::new();
        let nodes: Vec<_> = (0..4).map(|_| make_node()).collect();

        unsafe {
            queue.push(nodes[0]);
            assert_eq!(queue.pop(), Some(nodes[0]));
            assert_eq!(queue.pop(), None);

            queue.push(nodes[1]);
            queue.push(nodes[2]);
            assert_eq!(queue.pop(), Some(nodes[1]));

            queue.push(nodes[3]);
            assert_eq!(queue.pop(), Some(nodes[2]));
            assert_eq!(queue.pop(), Some(nodes[3]));
            assert_eq!(queue.pop(), None);
        }

        nodes.into_iter().for_each(reclaim);
    }

    #[test]
    fn queue_value_can_move() {
        let queue = MpscQueue::new();
        let nodes: Vec<_> = (0..2).map(|_| make_node()).collect();

        unsafe {
            queue.push(nodes[0]);
            queue.push(nodes[1]);
        }

        // Moving the queue value must not disturb the linked nodes:
        // the sentinel is boxed and stays put.
        let moved = queue;

        unsafe {
            assert_eq!(moved.pop(), Some(nodes[0]));
            assert_eq!(moved.pop(), Some(nodes[1]));
            assert_eq!(moved.pop(), None);
        }

        nodes.into_iter().for_each(reclaim);
    }

    // An intrusive item with its link first, so node pointers cast
    // back to the item.
    #[repr(C)]
    struct Item {
        node: QueueNode,
        producer: usize,
        seq: usize,
    }

    #[test]
    fn concurrent_producers_keep_order() {
        const PRODUCERS: usize = 4;
        const PER_PRODUCER: usize = 10_000;

        let queue = Arc::new(MpscQueue::new());
        let done = Arc::new(AtomicBool::new(false));

        let handles: Vec<_> = (0..PRODUCERS)
            .map(|producer| {
                let queue = Arc::clone(&queue);

                std::thread::spawn(move || {
                    for seq in 0..PER_PRODUCER {
                        let item = Box::leak(Box::new(Item {
                            node: QueueNode::new(),
                            producer,
                            seq,
                        }));

                        unsafe {
                            queue.push(NonNull::from(&mut item.node));
                        }
                    }
                })
            })
            .collect();

        let consumer = {
            let queue = Arc::clone(&queue);
            let done = Arc::clone(&done);

            std::thread::spawn(move || {
                let mut popped: Vec<usize> = Vec::new();

                loop {
                    match unsafe { queue.pop() } {
                        Some(node) => popped.push(node.as_ptr() as usize),
                        None => {
                            if done.load(Ordering::Acquire) && popped.len() == PRODUCERS * PER_PRODUCER
                            {
                                break;
                            }
                            std::thread::yield_now();
                        }
                    }
                }

                popped
            })
        };

        for handle in handles {
            handle.join().expect("producer should not panic");
        }
        done.store(true, Ordering::Release);

        let popped = consumer.join().expect("consumer should not panic");

        // No loss, no duplication.
        assert_eq!(popped.len(), PRODUCERS * PER_PRODUCER);
        let unique: std::collections::HashSet<_> = popped.iter().cloned().collect();
        assert_eq!(unique.len(), popped.len());

        // Per-producer FIFO: each producer's sequence numbers arrive
        // in order.
        let mut next_seq = [0usize; PRODUCERS];
        for &item in &popped {
            let item = unsafe { &*(item as *mut Item) };

            assert_eq!(item.seq, next_seq[item.producer]);
            next_seq[item.producer] += 1;
        }

        // All nodes accounted for; drain is null-stable.
        assert_eq!(unsafe { queue.pop() }, None);

        for item in popped {
            unsafe {
                let _ = Box::from_raw(item as *mut Item);
            }
        }
    }
}
