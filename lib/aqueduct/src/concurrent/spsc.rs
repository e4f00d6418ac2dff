use bedrock::bits::is_power_of_two;
use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Wait-free single-producer single-consumer queue of command values.
/// Exactly one agent may offer and exactly one agent may drain; the
/// conductor wiring in `driver::media_driver` upholds this.
///
/// Commands are plain tagged enums so the hot path never allocates or
/// dispatches through closures.
pub struct CommandQueue<T> {
    inner: Arc<Inner<T>>,
}

#[repr(align(64))]
struct PaddedCounter(AtomicUsize);

struct Inner<T> {
    slots: Vec<UnsafeCell<Option<T>>>,
    mask: usize,
    head: PaddedCounter,
    tail: PaddedCounter,
}

unsafe impl<T: Send> Send for Inner<T> {}
unsafe impl<T: Send> Sync for Inner<T> {}

impl<T> CommandQueue<T> {
    pub fn new(capacity: usize) -> CommandQueue<T> {
        assert!(
            is_power_of_two(capacity),
            "queue capacity must be a power of two, got {}",
            capacity
        );
        let mut slots = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            slots.push(UnsafeCell::new(None));
        }

        CommandQueue {
            inner: Arc::new(Inner {
                slots,
                mask: capacity - 1,
                head: PaddedCounter(AtomicUsize::new(0)),
                tail: PaddedCounter(AtomicUsize::new(0)),
            }),
        }
    }

    /// Cloneable producer handle.
    #[inline]
    pub fn producer(&self) -> CommandProducer<T> {
        CommandProducer {
            inner: self.inner.clone(),
        }
    }

    /// Drain up to `limit` commands into `handler`, returning the count.
    #[inline]
    pub fn drain<F: FnMut(T)>(&self, mut handler: F, limit: usize) -> usize {
        let inner = &*self.inner;
        let head = inner.head.0.load(Ordering::Relaxed);
        let tail = inner.tail.0.load(Ordering::Acquire);

        let available = tail.wrapping_sub(head);
        let count = available.min(limit);

        for i in 0..count {
            let index = head.wrapping_add(i) & inner.mask;
            let value = unsafe { (*inner.slots[index].get()).take() }
                .expect("producer published an empty slot");
            // Free the slot before running the handler so a producer
            // blocked on capacity makes progress even if the handler
            // re-enters the queue.
            inner.head.0.store(head.wrapping_add(i + 1), Ordering::Release);
            handler(value);
        }

        count
    }
}

pub struct CommandProducer<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for CommandProducer<T> {
    #[inline]
    fn clone(&self) -> Self {
        CommandProducer {
            inner: self.inner.clone(),
        }
    }
}

impl<T> CommandProducer<T> {
    /// Offer a command; returns it back if the queue is full so the caller
    /// can apply back-pressure.
    #[inline]
    pub fn offer(&self, value: T) -> Result<(), T> {
        let inner = &*self.inner;
        let tail = inner.tail.0.load(Ordering::Relaxed);
        let head = inner.head.0.load(Ordering::Acquire);

        if tail.wrapping_sub(head) > inner.mask {
            return Err(value);
        }

        unsafe { *inner.slots[tail & inner.mask].get() = Some(value) };
        inner.tail.0.store(tail.wrapping_add(1), Ordering::Release);

        Ok(())
    }
}
