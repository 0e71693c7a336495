use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crossbeam::queue::SegQueue;
use tokio::sync::Notify;

/// 无界异步队列
///
/// 生产者 `push` 永不阻塞；消费者 `pop` 按 FIFO 取出。可以有多个生产者和多个消费者，
/// 所有句柄共享同一个队列。`stop` 之后新的 `push` 失败并把元素还给调用方，
/// 已经入队的元素仍然可以取完，取完后 `pop` 返回 `None`。
///
/// 注意：没有背压。下游消费者卡住时队列会无限增长，调用方应通过 `len` 观察深度。
pub struct Queue<T> {
    shared: Arc<Shared<T>>,
}

struct Shared<T> {
    items: SegQueue<T>,
    stopped: AtomicBool,
    notify: Notify,
}

impl<T> Queue<T> {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                items: SegQueue::new(),
                stopped: AtomicBool::new(false),
                notify: Notify::new(),
            }),
        }
    }

    pub fn push(&self, item: T) -> Result<(), T> {
        if self.shared.stopped.load(Ordering::Acquire) {
            return Err(item);
        }
        self.shared.items.push(item);
        self.shared.notify.notify_one();
        Ok(())
    }

    /// 取出下一个元素；可以安全地放在 `select!` 里被取消
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.shared.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(item) = self.shared.items.pop() {
                return Some(item);
            }
            if self.shared.stopped.load(Ordering::Acquire) {
                return None;
            }

            notified.await;
        }
    }

    pub fn try_pop(&self) -> Option<T> {
        self.shared.items.pop()
    }

    pub fn stop(&self) {
        if !self.shared.stopped.swap(true, Ordering::AcqRel) {
            self.shared.notify.notify_waiters();
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shared.stopped.load(Ordering::Acquire)
    }

    pub fn len(&self) -> usize {
        self.shared.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.items.is_empty()
    }
}

impl<T> Clone for Queue<T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<T> Default for Queue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn fifo_order() {
        let queue = Queue::new();
        for i in 0..5 {
            queue.push(i).unwrap();
        }
        assert_eq!(queue.len(), 5);
        for i in 0..5 {
            assert_eq!(queue.pop().await, Some(i));
        }
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn stop_drains_then_ends() {
        let queue = Queue::new();
        queue.push("a").unwrap();
        queue.stop();
        assert_eq!(queue.push("b"), Err("b"));
        assert_eq!(queue.pop().await, Some("a"));
        assert_eq!(queue.pop().await, None);
        assert!(queue.is_stopped());
    }

    #[tokio::test]
    async fn pop_wakes_on_push_from_other_task() {
        let queue = Queue::new();
        let producer = queue.clone();
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(10)).await;
            producer.push(42u32).unwrap();
        });
        assert_eq!(queue.pop().await, Some(42));
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn stop_wakes_all_waiting_consumers() {
        let queue: Queue<u8> = Queue::new();
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();
        tokio::task::yield_now().await;
        queue.stop();
        for waiter in waiters {
            assert_eq!(waiter.await.unwrap(), None);
        }
    }

    #[tokio::test]
    async fn cancelled_pop_does_not_lose_items() {
        let queue = Queue::new();
        let cancelled = tokio::time::timeout(Duration::from_millis(5), queue.pop()).await;
        assert!(cancelled.is_err());
        queue.push(1u8).unwrap();
        assert_eq!(queue.try_pop(), Some(1));
    }
}
