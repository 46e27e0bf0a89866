//! Per-connection timers.
//!
//! Each connection carries one `ConnectionTimers` driving three
//! deadlines: the capability-exchange timeout (a peer that stays silent
//! before `Ready` is dropped after one watchdog interval), the
//! device-watchdog schedule with RFC 3539 jitter, and the idle cutoff
//! fed only by non-base traffic.
//!
//! Every method takes an explicit `now` so timer behavior is testable
//! without sleeping; the owning event loop passes `Instant::now()`.

use crate::config::JitterPrng;
use rand::rngs::{SmallRng, StdRng};
use rand::{Rng, SeedableRng};
use std::time::{Duration, Instant};

/// RFC 3539 section 3.4.1: jitter the watchdog by +/- 2 seconds.
const JITTER_RANGE_MS: i64 = 2000;

/// What the timer walk should do with a connection.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TimerAction {
    /// Nothing due.
    None,
    /// Not ready and the capability-exchange window elapsed: hard close.
    DisconnectNoCer,
    /// A DWR has gone unanswered for a full watchdog interval: hard close.
    DisconnectNoDw,
    /// No application traffic within the idle timeout: DPR with cause BUSY.
    DisconnectIdle,
    /// The jittered watchdog deadline arrived: send a DWR.
    Dwr,
}

/// Source of watchdog jitter.
///
/// The secure variant is seeded from the operating system entropy pool.
/// The `bogus` variant is a plain time-seeded PRNG for hosts where
/// entropy gathering stalls the first connection; configuring it
/// deviates from RFC 3539 -> RFC 1750.
#[derive(Debug)]
pub enum JitterSource {
    Secure(StdRng),
    Bogus(SmallRng),
}

impl JitterSource {
    pub fn new(kind: JitterPrng) -> Self {
        match kind {
            JitterPrng::Secure => JitterSource::Secure(StdRng::from_entropy()),
            JitterPrng::Bogus => {
                let seed = std::time::SystemTime::now()
                    .duration_since(std::time::UNIX_EPOCH)
                    .map(|d| d.as_nanos() as u64)
                    .unwrap_or(0);
                JitterSource::Bogus(SmallRng::seed_from_u64(seed))
            }
        }
    }

    fn offset_ms(&mut self) -> i64 {
        match self {
            JitterSource::Secure(rng) => rng.gen_range(-JITTER_RANGE_MS..=JITTER_RANGE_MS),
            JitterSource::Bogus(rng) => rng.gen_range(-JITTER_RANGE_MS..=JITTER_RANGE_MS),
        }
    }
}

/// Timer state for one connection.
#[derive(Debug)]
pub struct ConnectionTimers {
    watchdog_interval: Duration,
    idle_timeout: Duration,
    last_activity: Instant,
    last_real_activity: Instant,
    last_dwr_sent: Instant,
    dwa_outstanding: bool,
    next_dwr: Instant,
    jitter: JitterSource,
}

impl ConnectionTimers {
    pub fn new(watchdog_interval: Duration, idle_timeout: Duration, jitter: JitterSource, now: Instant) -> Self {
        let mut timers = Self {
            watchdog_interval,
            idle_timeout,
            last_activity: now,
            last_real_activity: now,
            last_dwr_sent: now,
            dwa_outstanding: false,
            next_dwr: now,
            jitter,
        };
        timers.next_dwr = timers.jittered_deadline(now);
        timers
    }

    /// The next jittered watchdog deadline from `now`.
    fn jittered_deadline(&mut self, now: Instant) -> Instant {
        let offset = self.jitter.offset_ms();
        let base = now + self.watchdog_interval;
        if offset >= 0 {
            base + Duration::from_millis(offset as u64)
        } else {
            base - Duration::from_millis(offset.unsigned_abs())
        }
    }

    /// Any frame arrived. Restarts the watchdog schedule (RFC 3539:
    /// received traffic proves liveness) unless a DWR is in flight.
    pub fn mark_activity(&mut self, now: Instant) {
        self.last_activity = now;
        if !self.dwa_outstanding {
            self.next_dwr = self.jittered_deadline(now);
        }
    }

    /// A non-base frame arrived; keeps the idle cutoff at bay.
    pub fn mark_real_activity(&mut self, now: Instant) {
        self.last_real_activity = now;
    }

    /// The peer sent us a DWR (which we answer); their watchdog ran, so
    /// reschedule ours.
    pub fn mark_dwr_received(&mut self, now: Instant) {
        if !self.dwa_outstanding {
            self.next_dwr = self.jittered_deadline(now);
        }
    }

    /// A DWA answered our outstanding DWR.
    pub fn mark_dwa_received(&mut self, now: Instant) {
        self.dwa_outstanding = false;
        self.next_dwr = self.jittered_deadline(now);
    }

    /// We sent a DWR; the answer window opens.
    pub fn mark_dwr_sent(&mut self, now: Instant) {
        self.last_dwr_sent = now;
        self.dwa_outstanding = true;
    }

    pub fn dwa_outstanding(&self) -> bool {
        self.dwa_outstanding
    }

    /// Wall-time of the next event on this connection.
    pub fn calc_next_timeout(&self, ready: bool) -> Instant {
        if !ready {
            return self.last_activity + self.watchdog_interval;
        }
        let watchdog = if self.dwa_outstanding {
            self.last_dwr_sent + self.watchdog_interval
        } else {
            self.next_dwr
        };
        watchdog.min(self.last_real_activity + self.idle_timeout)
    }

    /// What, if anything, is due at `now`.
    pub fn calc_action(&self, ready: bool, now: Instant) -> TimerAction {
        if !ready {
            if now >= self.last_activity + self.watchdog_interval {
                return TimerAction::DisconnectNoCer;
            }
            return TimerAction::None;
        }
        if self.dwa_outstanding && now >= self.last_dwr_sent + self.watchdog_interval {
            return TimerAction::DisconnectNoDw;
        }
        if now >= self.last_real_activity + self.idle_timeout {
            return TimerAction::DisconnectIdle;
        }
        if !self.dwa_outstanding && now >= self.next_dwr {
            return TimerAction::Dwr;
        }
        TimerAction::None
    }
}
