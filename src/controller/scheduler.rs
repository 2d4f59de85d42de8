use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::mpsc;
use tokio::task::AbortHandle;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, info};

/// Random offset applied to every scheduled delay so that independent
/// sources do not converge on the same poll instant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JitterPolicy {
    /// Offsets are drawn uniformly from `[-spread, +spread]`
    pub spread: Duration,
    /// No timer is ever armed for less than this
    pub floor: Duration,
}

impl Default for JitterPolicy {
    fn default() -> Self {
        Self {
            spread: Duration::from_millis(1500),
            floor: Duration::from_millis(500),
        }
    }
}

impl JitterPolicy {
    pub fn apply<R: Rng + ?Sized>(&self, nominal: Duration, rng: &mut R) -> Duration {
        let spread = self.spread.as_millis() as i64;
        let offset = if spread > 0 { rng.gen_range(-spread..=spread) } else { 0 };
        let jittered = nominal.as_millis() as i64 + offset;
        Duration::from_millis(jittered.max(self.floor.as_millis() as i64) as u64)
    }
}

/// Message sent when an armed timer elapses
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FiredTimer<K> {
    pub name: K,
    generation: u64,
}

#[derive(Debug)]
struct TimerEntry {
    target: Instant,
    exempt: bool,
    generation: u64,
    /// Still owes one invocation
    pending: bool,
    handle: Option<AbortHandle>,
}

impl TimerEntry {
    fn disarm(&mut self) {
        if let Some(handle) = self.handle.take() {
            handle.abort();
        }
    }
}

/// Named one-shot timers with jitter, suspend/resume and overdue catch-up
///
/// At most one timer is pending per name; scheduling a name again
/// supersedes the previous one. Elapsed timers are delivered as
/// [`FiredTimer`] messages and must be passed through [`claim`] before
/// acting on them, which drops deliveries from superseded timers.
///
/// While suspended only exempt timers run. Suspended timers keep their
/// target and are caught up by [`check_timeouts`], which fires anything
/// overdue by more than the grace period exactly once.
///
/// [`claim`]: TimerRegistry::claim
/// [`check_timeouts`]: TimerRegistry::check_timeouts
pub struct TimerRegistry<K> {
    entries: HashMap<K, TimerEntry>,
    jitter: JitterPolicy,
    grace: Duration,
    suspended: bool,
    next_generation: u64,
    rng: StdRng,
    fired_tx: mpsc::UnboundedSender<FiredTimer<K>>,
}

impl<K> TimerRegistry<K>
where
    K: Copy + Eq + Hash + Debug + Send + 'static,
{
    pub fn new(
        jitter: JitterPolicy,
        grace: Duration,
        fired_tx: mpsc::UnboundedSender<FiredTimer<K>>,
    ) -> Self {
        Self::with_rng(jitter, grace, fired_tx, StdRng::from_entropy())
    }

    pub fn with_rng(
        jitter: JitterPolicy,
        grace: Duration,
        fired_tx: mpsc::UnboundedSender<FiredTimer<K>>,
        rng: StdRng,
    ) -> Self {
        Self {
            entries: HashMap::new(),
            jitter,
            grace,
            suspended: false,
            next_generation: 0,
            rng,
            fired_tx,
        }
    }

    /// Arm `name` to fire after `nominal` plus jitter, replacing any timer
    /// already pending under that name. Returns the actual delay.
    pub fn schedule(&mut self, name: K, nominal: Duration, exempt: bool) -> Duration {
        self.cancel(name);

        let delay = self.jitter.apply(nominal, &mut self.rng);
        self.next_generation += 1;
        let generation = self.next_generation;

        let handle = if self.suspended && !exempt {
            None
        } else {
            Some(self.arm(name, generation, delay))
        };
        self.entries.insert(
            name,
            TimerEntry {
                target: Instant::now() + delay,
                exempt,
                generation,
                pending: true,
                handle,
            },
        );
        debug!(timer = ?name, delay_ms = delay.as_millis() as u64, exempt, "timer scheduled");
        delay
    }

    pub fn cancel(&mut self, name: K) {
        if let Some(mut entry) = self.entries.remove(&name) {
            entry.disarm();
        }
    }

    fn arm(&self, name: K, generation: u64, delay: Duration) -> AbortHandle {
        let tx = self.fired_tx.clone();
        tokio::spawn(async move {
            sleep(delay).await;
            // Receiver gone means the loop is shutting down
            let _ = tx.send(FiredTimer { name, generation });
        })
        .abort_handle()
    }

    /// Accept a delivered timer. Returns false for deliveries from a
    /// superseded or already caught-up timer, which must be ignored.
    pub fn claim(&mut self, fired: &FiredTimer<K>) -> bool {
        match self.entries.get_mut(&fired.name) {
            Some(entry) if entry.generation == fired.generation && entry.pending => {
                entry.pending = false;
                entry.handle = None;
                true
            }
            _ => {
                debug!(timer = ?fired.name, "ignoring stale timer delivery");
                false
            }
        }
    }

    /// Cancel every non-exempt timer, keeping its target for catch-up
    pub fn suspend(&mut self) {
        if self.suspended {
            return;
        }
        self.suspended = true;
        for entry in self.entries.values_mut().filter(|e| !e.exempt) {
            entry.disarm();
        }
        info!("timers suspended");
    }

    /// Re-arm suspended timers whose target is still ahead. Overdue ones
    /// are left to the next [`check_timeouts`](Self::check_timeouts) sweep.
    pub fn resume(&mut self) {
        if !self.suspended {
            return;
        }
        self.suspended = false;
        let now = Instant::now();
        let rearm: Vec<(K, u64, Duration)> = self
            .entries
            .iter()
            .filter(|(_, e)| !e.exempt && e.pending && e.handle.is_none() && e.target > now)
            .map(|(name, e)| (*name, e.generation, e.target - now))
            .collect();
        for (name, generation, remaining) in rearm {
            let handle = self.arm(name, generation, remaining);
            if let Some(entry) = self.entries.get_mut(&name) {
                entry.handle = Some(handle);
            }
        }
        info!("timers resumed");
    }

    /// Liveness sweep: returns the timers overdue by more than the grace
    /// period. Each is fired at most once and its target reset to now.
    pub fn check_timeouts(&mut self) -> Vec<K> {
        let now = Instant::now();
        let suspended = self.suspended;
        let grace = self.grace;
        let mut due = Vec::new();
        for (name, entry) in self.entries.iter_mut() {
            let runnable = entry.exempt || !suspended;
            if entry.pending && runnable && now.saturating_duration_since(entry.target) > grace {
                entry.disarm();
                entry.pending = false;
                entry.target = now;
                due.push(*name);
            }
        }
        for name in &due {
            info!(timer = ?name, "firing overdue timer");
        }
        due
    }

    pub fn is_suspended(&self) -> bool {
        self.suspended
    }

    pub fn is_pending(&self, name: K) -> bool {
        self.entries.get(&name).map_or(false, |e| e.pending)
    }

    pub fn target(&self, name: K) -> Option<Instant> {
        self.entries.get(&name).map(|e| e.target)
    }
}

impl<K> Drop for TimerRegistry<K> {
    fn drop(&mut self) {
        for entry in self.entries.values_mut() {
            entry.disarm();
        }
    }
}
