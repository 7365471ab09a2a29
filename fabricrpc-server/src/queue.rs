//! Item queues.
//!
//! An [`ItemQueue`] is a rendezvous between producers pushing items from
//! any thread and consumers popping them asynchronously. Whichever side
//! arrives first waits for the other: a push with a consumer waiting hands
//! the item straight to it, a pop with items backlogged takes one at once.
//! The queue never holds backlogged items and waiting consumers at the same
//! time.
//!
//! Both backlogs are FIFO.

use fabricrpc_transport::Event;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use thiserror::Error;

/// The queue was closed and has nothing left to hand out.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("queue closed")]
pub struct QueueClosed;

/// Where a popped item is delivered.
pub struct PopSlot<T> {
    value: Mutex<Option<Result<T, QueueClosed>>>,
}

impl<T> PopSlot<T> {
    pub fn new() -> Self {
        Self {
            value: Mutex::new(None),
        }
    }

    pub fn take(&self) -> Option<Result<T, QueueClosed>> {
        self.value.lock().take()
    }

    fn fill(&self, value: Result<T, QueueClosed>) {
        *self.value.lock() = Some(value);
    }
}

impl<T> Default for PopSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

struct Waiter<T> {
    event: Arc<Event>,
    slot: Arc<PopSlot<T>>,
}

impl<T> Waiter<T> {
    fn deliver(self, value: Result<T, QueueClosed>) {
        self.slot.fill(value);
        self.event.set();
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    waiters: VecDeque<Waiter<T>>,
    closed: bool,
}

/// Producer/consumer rendezvous queue.
pub struct ItemQueue<T> {
    inner: Mutex<Inner<T>>,
}

impl<T: Send> ItemQueue<T> {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::new(),
                waiters: VecDeque::new(),
                closed: false,
            }),
        }
    }

    /// Hands `item` to the oldest waiter, or backlogs it. A closed queue
    /// gives the item back.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut inner = self.inner.lock();
        if inner.closed {
            return Err(item);
        }
        match inner.waiters.pop_front() {
            Some(waiter) => waiter.deliver(Ok(item)),
            None => inner.items.push_back(item),
        }
        Ok(())
    }

    /// Puts `item` back at the head of the queue. Allowed after close so
    /// the item still drains.
    pub fn requeue(&self, item: T) {
        let mut inner = self.inner.lock();
        match inner.waiters.pop_front() {
            Some(waiter) => waiter.deliver(Ok(item)),
            None => inner.items.push_front(item),
        }
    }

    /// Starts a pop. If an item is backlogged it is moved into `slot` and
    /// `event` is set before this returns; otherwise the pair waits its turn
    /// and the caller awaits `event`.
    pub fn async_pop(&self, event: &Arc<Event>, slot: &Arc<PopSlot<T>>) {
        let mut inner = self.inner.lock();
        let waiter = Waiter {
            event: event.clone(),
            slot: slot.clone(),
        };
        if let Some(item) = inner.items.pop_front() {
            waiter.deliver(Ok(item));
        } else if inner.closed {
            waiter.deliver(Err(QueueClosed));
        } else {
            inner.waiters.push_back(waiter);
        }
    }

    /// Withdraws the pending pop registered with `event`. Returns `false`,
    /// touching nothing, if no such pop is waiting.
    pub fn cancel(&self, event: &Arc<Event>) -> bool {
        let mut inner = self.inner.lock();
        match inner
            .waiters
            .iter()
            .position(|w| Arc::ptr_eq(&w.event, event))
        {
            Some(index) => {
                inner.waiters.remove(index);
                true
            }
            None => false,
        }
    }

    /// Pops the next item.
    ///
    /// Dropping the returned future withdraws the pop; an item that was
    /// already handed over goes back to the head of the queue.
    pub async fn pop(&self) -> Result<T, QueueClosed> {
        let event = Arc::new(Event::new());
        let slot = Arc::new(PopSlot::new());
        self.async_pop(&event, &slot);

        let mut guard = PendingPop {
            queue: self,
            event: &event,
            slot: &slot,
            armed: true,
        };
        event.wait().await;
        guard.armed = false;

        slot.take().unwrap_or(Err(QueueClosed))
    }

    /// Rejects future pushes. Waiting consumers are released with
    /// [`QueueClosed`]; backlogged items still drain.
    pub fn close(&self) {
        let mut inner = self.inner.lock();
        if inner.closed {
            return;
        }
        inner.closed = true;
        for waiter in inner.waiters.drain(..) {
            waiter.deliver(Err(QueueClosed));
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }

    /// Number of backlogged items.
    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of consumers waiting for an item.
    pub fn waiting(&self) -> usize {
        self.inner.lock().waiters.len()
    }
}

impl<T: Send> Default for ItemQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Cancels an abandoned [`ItemQueue::pop`].
struct PendingPop<'a, T: Send> {
    queue: &'a ItemQueue<T>,
    event: &'a Arc<Event>,
    slot: &'a Arc<PopSlot<T>>,
    armed: bool,
}

impl<T: Send> Drop for PendingPop<'_, T> {
    fn drop(&mut self) {
        if !self.armed || self.queue.cancel(self.event) {
            return;
        }
        // Lost the race: an item was delivered after the pop was abandoned.
        if let Some(Ok(item)) = self.slot.take() {
            self.queue.requeue(item);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    #[tokio::test]
    async fn test_push_then_pop() {
        let queue = ItemQueue::new();
        queue.push(1u32).unwrap();
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.pop().await, Ok(1));
        assert!(queue.is_empty());
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_pop_then_push() {
        let queue = Arc::new(ItemQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        while queue.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        queue.push("token").unwrap();
        assert_eq!(consumer.await.unwrap(), Ok("token"));
        assert_eq!(queue.len(), 0);
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_rendezvous_across_threads() {
        const ITEMS: usize = 500;
        let queue = Arc::new(ItemQueue::new());

        let producer = {
            let queue = queue.clone();
            std::thread::spawn(move || {
                for i in 0..ITEMS {
                    queue.push(i).unwrap();
                    if i % 7 == 0 {
                        std::thread::yield_now();
                    }
                }
            })
        };

        let mut received = Vec::with_capacity(ITEMS);
        for _ in 0..ITEMS {
            let item = tokio::time::timeout(WAIT, queue.pop()).await.unwrap().unwrap();
            received.push(item);
        }
        producer.join().unwrap();

        assert_eq!(received, (0..ITEMS).collect::<Vec<_>>());
        assert!(queue.is_empty());
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test]
    async fn test_low_level_pop_signals_immediately_when_backlogged() {
        let queue = ItemQueue::new();
        queue.push(5u8).unwrap();

        let event = Arc::new(Event::new());
        let slot = Arc::new(PopSlot::new());
        queue.async_pop(&event, &slot);
        assert!(event.is_set());
        assert_eq!(slot.take(), Some(Ok(5)));
    }

    #[test]
    fn test_waiters_served_in_order() {
        let queue = ItemQueue::new();
        let first = (Arc::new(Event::new()), Arc::new(PopSlot::new()));
        let second = (Arc::new(Event::new()), Arc::new(PopSlot::new()));
        queue.async_pop(&first.0, &first.1);
        queue.async_pop(&second.0, &second.1);
        assert_eq!(queue.waiting(), 2);

        queue.push('a').unwrap();
        assert!(first.0.is_set());
        assert!(!second.0.is_set());
        assert_eq!(first.1.take(), Some(Ok('a')));

        queue.push('b').unwrap();
        assert_eq!(second.1.take(), Some(Ok('b')));
    }

    #[test]
    fn test_cancel_unknown_event_is_noop() {
        let queue: ItemQueue<u32> = ItemQueue::new();
        let waiting = (Arc::new(Event::new()), Arc::new(PopSlot::new()));
        queue.async_pop(&waiting.0, &waiting.1);

        // Never registered.
        assert!(!queue.cancel(&Arc::new(Event::new())));
        assert_eq!(queue.waiting(), 1);

        queue.push(9).unwrap();
        // Already satisfied.
        assert!(!queue.cancel(&waiting.0));
        assert_eq!(waiting.1.take(), Some(Ok(9)));
    }

    #[test]
    fn test_cancel_leaves_other_waiters() {
        let queue = ItemQueue::new();
        let first = (Arc::new(Event::new()), Arc::new(PopSlot::new()));
        let second = (Arc::new(Event::new()), Arc::new(PopSlot::new()));
        queue.async_pop(&first.0, &first.1);
        queue.async_pop(&second.0, &second.1);

        assert!(queue.cancel(&first.0));
        assert!(!queue.cancel(&first.0));
        assert_eq!(queue.waiting(), 1);

        queue.push(3u16).unwrap();
        assert!(!first.0.is_set());
        assert_eq!(second.1.take(), Some(Ok(3)));
    }

    #[tokio::test]
    async fn test_dropped_pop_is_withdrawn() {
        let queue = ItemQueue::new();
        let timed_out = tokio::time::timeout(Duration::from_millis(20), queue.pop()).await;
        assert!(timed_out.is_err());
        assert_eq!(queue.waiting(), 0);

        queue.push(4u64).unwrap();
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_abandoned_delivery_is_requeued() {
        let queue = ItemQueue::new();
        queue.push(2u32).unwrap();

        let event = Arc::new(Event::new());
        let slot = Arc::new(PopSlot::new());
        queue.async_pop(&event, &slot);
        queue.push(3).unwrap();

        // The delivered item goes back ahead of the backlog.
        drop(PendingPop {
            queue: &queue,
            event: &event,
            slot: &slot,
            armed: true,
        });
        assert_eq!(queue.len(), 2);

        let next = Arc::new(PopSlot::new());
        queue.async_pop(&Arc::new(Event::new()), &next);
        assert_eq!(next.take(), Some(Ok(2)));
    }

    #[tokio::test]
    async fn test_close_drains_then_fails() {
        let queue = ItemQueue::new();
        queue.push(1u8).unwrap();
        queue.push(2).unwrap();
        queue.close();

        assert_eq!(queue.push(3), Err(3));
        assert_eq!(queue.pop().await, Ok(1));
        assert_eq!(queue.pop().await, Ok(2));
        assert_eq!(queue.pop().await, Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_close_releases_waiters() {
        let queue: Arc<ItemQueue<u8>> = Arc::new(ItemQueue::new());
        let consumer = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.pop().await })
        };
        while queue.waiting() == 0 {
            tokio::task::yield_now().await;
        }
        queue.close();
        assert_eq!(consumer.await.unwrap(), Err(QueueClosed));
        assert!(queue.is_closed());
    }
}
