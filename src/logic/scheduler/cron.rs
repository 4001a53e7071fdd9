//! Cron Dispatcher
//!
//! Single thread multiplexing low-frequency maintenance tasks. Each tick
//! compares every task's last run against its interval and runs the first
//! one that is due; the others wait for a later tick.

use std::time::{Duration, Instant};

pub type CronAction<C> = Box<dyn Fn(&C) + Send>;

struct CronTask<C> {
    name: String,
    interval: Duration,
    last_run: Instant,
    action: CronAction<C>,
}

pub struct CronDispatcher<C> {
    tasks: Vec<CronTask<C>>,
}

impl<C> Default for CronDispatcher<C> {
    fn default() -> Self {
        Self { tasks: Vec::new() }
    }
}

impl<C> CronDispatcher<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Schedule `action` every `interval`, first run one interval from now
    pub fn every<F>(&mut self, name: &str, interval: Duration, action: F)
    where
        F: Fn(&C) + Send + 'static,
    {
        self.tasks.push(CronTask {
            name: name.to_string(),
            interval,
            last_run: Instant::now(),
            action: Box::new(action),
        });
    }

    /// Run the first due task, returning its name
    pub fn tick(&mut self, ctx: &C, now: Instant) -> Option<&str> {
        let task = self
            .tasks
            .iter_mut()
            .find(|t| now.saturating_duration_since(t.last_run) >= t.interval)?;
        task.last_run = now;
        (task.action)(ctx);
        Some(task.name.as_str())
    }

    pub fn names(&self) -> Vec<&str> {
        self.tasks.iter().map(|t| t.name.as_str()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counters {
        fast: AtomicUsize,
        slow: AtomicUsize,
    }

    fn dispatcher() -> CronDispatcher<Counters> {
        let mut cron = CronDispatcher::new();
        cron.every("fast", Duration::from_secs(1), |c: &Counters| {
            c.fast.fetch_add(1, Ordering::SeqCst);
        });
        cron.every("slow", Duration::from_secs(10), |c: &Counters| {
            c.slow.fetch_add(1, Ordering::SeqCst);
        });
        cron
    }

    #[test]
    fn test_nothing_due() {
        let mut cron = dispatcher();
        let counters = Counters::default();
        assert_eq!(cron.tick(&counters, Instant::now()), None);
        assert_eq!(counters.fast.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_one_task_per_tick() {
        let mut cron = dispatcher();
        let counters = Counters::default();
        let later = Instant::now() + Duration::from_secs(11);

        // Both are due, registration order wins
        assert_eq!(cron.tick(&counters, later), Some("fast"));
        assert_eq!(cron.tick(&counters, later), Some("slow"));
        assert_eq!(cron.tick(&counters, later), None);

        assert_eq!(counters.fast.load(Ordering::SeqCst), 1);
        assert_eq!(counters.slow.load(Ordering::SeqCst), 1);
        assert_eq!(cron.names(), vec!["fast", "slow"]);
    }
}
