//! Single-flight admission control for one device connection.
//!
//! Every read cycle and every write action on a device runs under a
//! [`QueuePermit`] obtained from the device's [`CommandQueue`]. Only one permit
//! exists at a time. Waiting callers poll with a fixed backoff and are not
//! served in any particular order, so a caller may starve under heavy
//! contention.
//!
//! Before waiting, [`CommandQueue::admit`] counts the queued and in-flight
//! commands with the same name and refuses admission with
//! [`Error::QueueSaturated`] once that count reaches the caller's limit.

use crate::{Error, Result};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

#[derive(Debug, Default)]
struct State {
    busy: Option<String>,
    waiting: Vec<String>,
}

impl State {
    fn count(&self, name: &str) -> usize {
        self.waiting.iter().filter(|w| *w == name).count()
            + usize::from(self.busy.as_deref() == Some(name))
    }

    fn leave_waiting(&mut self, name: &str) {
        if let Some(pos) = self.waiting.iter().position(|w| w == name) {
            self.waiting.remove(pos);
        }
    }
}

/// Serialises access to a device. Cloning shares the same queue.
#[derive(Debug, Clone)]
pub struct CommandQueue {
    state: Arc<Mutex<State>>,
    poll_interval: Duration,
}

impl Default for CommandQueue {
    fn default() -> Self {
        Self::new(Self::DEFAULT_POLL_INTERVAL)
    }
}

impl CommandQueue {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(250);

    pub fn new(poll_interval: Duration) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            poll_interval,
        }
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        // The state stays consistent even if a holder panicked.
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Waits until the device is idle and marks it busy with `command`.
    ///
    /// # Errors
    ///
    /// [`Error::QueueSaturated`] without waiting if `max_same_name` commands
    /// named `command` are already queued or in flight.
    pub async fn admit(&self, command: &str, max_same_name: usize) -> Result<QueuePermit> {
        {
            let mut state = self.lock();
            if state.count(command) >= max_same_name {
                log::debug!("Refusing '{command}', {max_same_name} already queued");
                return Err(Error::QueueSaturated(command.to_string()));
            }
            state.waiting.push(command.to_string());
        }
        // Leaves the waiting list if the caller drops this future early.
        let mut waiting = WaitingEntry {
            queue: self,
            command,
            armed: true,
        };
        loop {
            {
                let mut state = self.lock();
                if state.busy.is_none() {
                    state.leave_waiting(command);
                    state.busy = Some(command.to_string());
                    waiting.armed = false;
                    log::trace!("Admitted '{command}'");
                    return Ok(QueuePermit {
                        state: self.state.clone(),
                        released: false,
                    });
                }
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    /// `true` while a permit is held.
    pub fn is_busy(&self) -> bool {
        self.lock().busy.is_some()
    }

    /// Number of callers waiting for admission.
    pub fn waiting(&self) -> usize {
        self.lock().waiting.len()
    }
}

struct WaitingEntry<'a> {
    queue: &'a CommandQueue,
    command: &'a str,
    armed: bool,
}

impl Drop for WaitingEntry<'_> {
    fn drop(&mut self) {
        if self.armed {
            self.queue.lock().leave_waiting(self.command);
        }
    }
}

/// Grants exclusive use of the device until released or dropped.
#[derive(Debug)]
pub struct QueuePermit {
    state: Arc<Mutex<State>>,
    released: bool,
}

impl QueuePermit {
    /// Returns the device to idle.
    pub fn release(mut self) {
        self.release_inner();
    }

    fn release_inner(&mut self) {
        if !self.released {
            self.released = true;
            let mut state = self.state.lock().unwrap_or_else(|p| p.into_inner());
            if let Some(command) = state.busy.take() {
                log::trace!("Released '{command}'");
            }
        }
    }
}

impl Drop for QueuePermit {
    fn drop(&mut self) {
        self.release_inner();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test(start_paused = true)]
    async fn idle_busy_idle() {
        let queue = CommandQueue::default();
        assert!(!queue.is_busy());
        let permit = queue.admit("read", 1).await.unwrap();
        assert!(queue.is_busy());
        permit.release();
        assert!(!queue.is_busy());
        let _permit = queue.admit("read", 1).await.unwrap();
        assert!(queue.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn dropping_permit_releases() {
        let queue = CommandQueue::default();
        {
            let _permit = queue.admit("write", 1).await.unwrap();
        }
        assert!(!queue.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn excess_duplicates_are_refused_immediately() {
        let queue = CommandQueue::default();
        let first = queue.admit("write_all_timeslots", 2).await.unwrap();

        let second = tokio::spawn({
            let queue = queue.clone();
            async move { queue.admit("write_all_timeslots", 2).await.map(|_| ()) }
        });
        while queue.waiting() == 0 {
            tokio::task::yield_now().await;
        }

        assert_matches!(
            queue.admit("write_all_timeslots", 2).await,
            Err(Error::QueueSaturated(name)) if name == "write_all_timeslots"
        );
        // a different command is not affected by the limit and just waits
        let other = tokio::spawn({
            let queue = queue.clone();
            async move { queue.admit("read_all_registers", 1).await.map(|_| ()) }
        });

        drop(first);
        assert!(second.await.unwrap().is_ok());
        assert!(other.await.unwrap().is_ok());
        assert!(!queue.is_busy());
        assert_eq!(queue.waiting(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn waiters_are_served_one_at_a_time() {
        let queue = CommandQueue::new(Duration::from_millis(200));
        let active = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let mut tasks = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let active = active.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = queue.admit("read_all_registers", 10).await.unwrap();
                let now = active.fetch_add(1, std::sync::atomic::Ordering::SeqCst) + 1;
                assert_eq!(now, 1);
                tokio::time::sleep(Duration::from_millis(500)).await;
                active.fetch_sub(1, std::sync::atomic::Ordering::SeqCst);
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert!(!queue.is_busy());
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_waiter_leaves_queue() {
        let queue = CommandQueue::default();
        let _permit = queue.admit("read", 5).await.unwrap();
        let result = tokio::time::timeout(Duration::from_secs(1), queue.admit("write", 1)).await;
        assert!(result.is_err());
        assert_eq!(queue.waiting(), 0);
    }
}
