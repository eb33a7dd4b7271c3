use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{error, info, warn};

use stockwise_core::InventoryResult;
use stockwise_events::{BusMessage, DeadLetter, EventBus, Subscription};

use crate::compensation::CompensationHandler;
use crate::consumer::OrderEventConsumer;
use crate::publisher::{Publisher, publish_dead_letter};
use crate::retry::RetryPolicy;

/// Something a worker can hand a delivery to.
///
/// An `Err` means "try again later": the pool retries it according to its
/// [`RetryPolicy`] and dead-letters it once attempts run out.
pub trait MessageHandler: Send + Sync + 'static {
    fn handle_message(&self, message: &BusMessage) -> InventoryResult<()>;
}

impl MessageHandler for OrderEventConsumer {
    fn handle_message(&self, message: &BusMessage) -> InventoryResult<()> {
        self.handle(message).map(|_| ())
    }
}

impl MessageHandler for CompensationHandler {
    fn handle_message(&self, message: &BusMessage) -> InventoryResult<()> {
        self.handle(message).map(|_| ())
    }
}

#[derive(Debug, Clone)]
pub struct WorkerPoolConfig {
    pub name: &'static str,
    pub workers: usize,
    /// Only messages on this channel are handled; the rest are ignored.
    pub channel: &'static str,
    pub retry: RetryPolicy,
    pub poll_interval: Duration,
}

impl WorkerPoolConfig {
    pub fn new(name: &'static str, channel: &'static str, workers: usize) -> Self {
        Self {
            name,
            workers,
            channel,
            retry: RetryPolicy::default(),
            poll_interval: Duration::from_millis(250),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }
}

/// Handle to stop and join a running pool.
#[derive(Debug)]
pub struct WorkerPoolHandle {
    name: &'static str,
    stop: Arc<AtomicBool>,
    joins: Vec<thread::JoinHandle<()>>,
}

impl WorkerPoolHandle {
    pub fn worker_count(&self) -> usize {
        self.joins.len()
    }

    /// Signal every worker and wait for them to finish their current message.
    pub fn shutdown(self) {
        self.stop.store(true, Ordering::SeqCst);
        for join in self.joins {
            if join.join().is_err() {
                error!(pool = self.name, "worker thread panicked");
            }
        }
    }
}

/// Fixed-size pool of threads sharing one bus subscription.
#[derive(Debug)]
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn<B, H>(
        config: WorkerPoolConfig,
        bus: &B,
        handler: Arc<H>,
        dead_letters: Arc<dyn Publisher>,
    ) -> io::Result<WorkerPoolHandle>
    where
        B: EventBus<BusMessage>,
        H: MessageHandler,
    {
        let subscription = Arc::new(Mutex::new(bus.subscribe()));
        let stop = Arc::new(AtomicBool::new(false));
        let mut joins = Vec::with_capacity(config.workers);

        for index in 0..config.workers.max(1) {
            let worker = Worker {
                config: config.clone(),
                index,
                subscription: Arc::clone(&subscription),
                stop: Arc::clone(&stop),
                handler: Arc::clone(&handler),
                dead_letters: Arc::clone(&dead_letters),
            };
            let spawned = thread::Builder::new()
                .name(format!("{}-{index}", config.name))
                .spawn(move || worker.run());

            match spawned {
                Ok(join) => joins.push(join),
                Err(err) => {
                    // Don't leave half a pool running.
                    WorkerPoolHandle {
                        name: config.name,
                        stop,
                        joins,
                    }
                    .shutdown();
                    return Err(err);
                }
            }
        }

        info!(pool = config.name, channel = config.channel, workers = joins.len(), "worker pool started");
        Ok(WorkerPoolHandle {
            name: config.name,
            stop,
            joins,
        })
    }
}

struct Worker<H: ?Sized> {
    config: WorkerPoolConfig,
    index: usize,
    subscription: Arc<Mutex<Subscription<BusMessage>>>,
    stop: Arc<AtomicBool>,
    handler: Arc<H>,
    dead_letters: Arc<dyn Publisher>,
}

impl<H: MessageHandler + ?Sized> Worker<H> {
    fn run(self) {
        while !self.stop.load(Ordering::SeqCst) {
            let received = match self.subscription.lock() {
                Ok(sub) => sub.recv_timeout(self.config.poll_interval),
                Err(_) => {
                    error!(pool = self.config.name, worker = self.index, "subscription lock poisoned");
                    break;
                }
            };

            match received {
                Ok(message) if message.channel() == self.config.channel => self.process(message),
                Ok(_) => continue,
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!(pool = self.config.name, worker = self.index, "worker stopped");
    }

    fn process(&self, message: BusMessage) {
        let retry = &self.config.retry;
        let mut attempt: u32 = 0;

        loop {
            attempt += 1;
            let err = match self.handler.handle_message(&message) {
                Ok(()) => return,
                Err(err) => err,
            };

            if !err.is_retryable() || !retry.should_retry(attempt) {
                warn!(
                    pool = self.config.name,
                    message_id = %message.message_id(),
                    attempts = attempt,
                    error = %err,
                    "giving up on message"
                );
                self.dead_letter(&message, err.to_string(), attempt);
                return;
            }

            let delay = retry.delay_for_attempt(attempt);
            warn!(
                pool = self.config.name,
                message_id = %message.message_id(),
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retryable failure; backing off"
            );
            if !self.sleep_unless_stopped(delay) {
                self.dead_letter(&message, format!("shutdown during retry: {err}"), attempt);
                return;
            }
        }
    }

    /// Returns `false` when the pool was stopped before `delay` elapsed.
    fn sleep_unless_stopped(&self, delay: Duration) -> bool {
        let until = Instant::now() + delay;
        loop {
            if self.stop.load(Ordering::SeqCst) {
                return false;
            }
            let now = Instant::now();
            if now >= until {
                return true;
            }
            thread::sleep((until - now).min(Duration::from_millis(50)));
        }
    }

    fn dead_letter(&self, message: &BusMessage, reason: String, attempts: u32) {
        let dead_letter = DeadLetter::new(message, reason, attempts);
        if let Err(err) = publish_dead_letter(self.dead_letters.as_ref(), dead_letter) {
            error!(pool = self.config.name, error = %err, "failed to record dead letter");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::publisher::OutboxPublisher;
    use std::sync::atomic::AtomicU32;
    use stockwise_core::InventoryError;
    use stockwise_events::{InMemoryEventBus, channels};

    /// Fails with a storage error until `fail_first` calls have been made.
    struct Flaky {
        fail_first: u32,
        calls: AtomicU32,
    }

    impl MessageHandler for Flaky {
        fn handle_message(&self, _message: &BusMessage) -> InventoryResult<()> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if n <= self.fail_first {
                Err(InventoryError::storage("down"))
            } else {
                Ok(())
            }
        }
    }

    fn wait_for(mut cond: impl FnMut() -> bool) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while !cond() {
            assert!(Instant::now() < deadline, "condition not reached in time");
            thread::sleep(Duration::from_millis(10));
        }
    }

    fn run_pool(fail_first: u32, max_attempts: u32) -> (Arc<Flaky>, Vec<DeadLetter>) {
        let bus = Arc::new(InMemoryEventBus::<BusMessage>::new());
        let tap = bus.subscribe();
        let outbox: Arc<dyn Publisher> = Arc::new(OutboxPublisher::new(Arc::clone(&bus)));
        let handler = Arc::new(Flaky {
            fail_first,
            calls: AtomicU32::new(0),
        });
        let config = WorkerPoolConfig {
            poll_interval: Duration::from_millis(10),
            ..WorkerPoolConfig::new("test-pool", channels::ORDER_EVENTS, 2)
        }
        .with_retry(RetryPolicy::new(max_attempts, Duration::from_millis(1), Duration::from_millis(1)));

        let pool = WorkerPool::spawn(config, &bus, Arc::clone(&handler), outbox).unwrap();
        bus.publish(BusMessage::raw("elsewhere", None, "{}")).unwrap();
        bus.publish(BusMessage::raw(channels::ORDER_EVENTS, None, "{}")).unwrap();

        let expected_calls = (fail_first + 1).min(max_attempts);
        wait_for(|| handler.calls.load(Ordering::SeqCst) >= expected_calls);
        thread::sleep(Duration::from_millis(30));
        pool.shutdown();

        let dead = tap
            .drain()
            .into_iter()
            .filter(|m| m.channel() == channels::DEAD_LETTER)
            .map(|m| m.decode().unwrap())
            .collect();
        (handler, dead)
    }

    #[test]
    fn transient_failures_are_retried() {
        let (handler, dead) = run_pool(2, 5);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert!(dead.is_empty());
    }

    #[test]
    fn exhausted_messages_are_dead_lettered() {
        let (handler, dead) = run_pool(10, 3);

        assert_eq!(handler.calls.load(Ordering::SeqCst), 3);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].attempts, 3);
        assert_eq!(dead[0].original_channel, channels::ORDER_EVENTS);
    }
}
