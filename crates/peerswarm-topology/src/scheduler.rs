//! Timers for topologies.
//!
//! A topology cannot call back into its swarm from a timer task, so timers
//! only post a `Wakeup` into the swarm's queue. The swarm handles it on its
//! own task like any other event.

use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// What a swarm should do when a topology timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Wakeup {
    /// Run the topology's `update()`.
    Update,
    /// Ask the signaling layer for fresh candidates.
    Lookup,
}

/// Cloneable sender of wakeups into one swarm.
#[derive(Debug, Clone)]
pub struct Scheduler {
    tx: mpsc::UnboundedSender<Wakeup>,
}

impl Scheduler {
    pub fn new(tx: mpsc::UnboundedSender<Wakeup>) -> Self {
        Self { tx }
    }

    /// Create a scheduler together with the receiving end of its queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<Wakeup>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// Post a wakeup immediately.
    pub fn wake(&self, wakeup: Wakeup) {
        let _ = self.tx.send(wakeup);
    }

    /// Post `wakeup` once after `delay`.
    pub fn after(&self, delay: Duration, wakeup: Wakeup) -> Timer {
        let tx = self.tx.clone();
        Timer(tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(wakeup);
        }))
    }

    /// Post `wakeup` every `period`, first after one full period.
    pub fn every(&self, period: Duration, wakeup: Wakeup) -> Timer {
        let tx = self.tx.clone();
        Timer(tokio::spawn(async move {
            let start = tokio::time::Instant::now() + period;
            let mut interval = tokio::time::interval_at(start, period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                interval.tick().await;
                if tx.send(wakeup).is_err() {
                    // Swarm is gone.
                    break;
                }
            }
        }))
    }
}

/// Pending timer. Cancelled on `cancel()` or when dropped.
#[derive(Debug)]
pub struct Timer(JoinHandle<()>);

impl Timer {
    pub fn cancel(&self) {
        self.0.abort();
    }

    pub fn is_finished(&self) -> bool {
        self.0.is_finished()
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.0.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_after_fires_once() {
        let (scheduler, mut rx) = Scheduler::channel();
        let _timer = scheduler.after(Duration::from_millis(100), Wakeup::Lookup);

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(rx.try_recv().ok(), Some(Wakeup::Lookup));
        tokio::time::sleep(Duration::from_millis(500)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_timer_never_fires() {
        let (scheduler, mut rx) = Scheduler::channel();
        let timer = scheduler.after(Duration::from_millis(100), Wakeup::Update);
        timer.cancel();

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_every_repeats_until_dropped() {
        let (scheduler, mut rx) = Scheduler::channel();
        let timer = scheduler.every(Duration::from_millis(100), Wakeup::Lookup);

        tokio::time::sleep(Duration::from_millis(350)).await;
        let mut fired = 0;
        while rx.try_recv().is_ok() {
            fired += 1;
        }
        assert_eq!(fired, 3);

        drop(timer);
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
