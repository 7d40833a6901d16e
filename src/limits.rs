//! Resource limits and the background thread that enforces them.
//!
//! A [`ResourceLimit`] reports its current value, whether that value is over
//! the limit, and how long the checker may sleep before the limit could
//! possibly be exceeded. The [`ResourceLimitChecker`] polls all limits on its
//! own thread and requests shutdown on the first one exceeded; the
//! reachability loop only observes the [`ShutdownNotifier`].

use std::fmt;
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::shutdown::ShutdownNotifier;

pub trait ResourceLimit: Send {
    fn name(&self) -> String;

    fn current_value(&self) -> u64;

    fn is_exceeded(&self, value: u64) -> bool;

    /// Nanoseconds until the limit could be exceeded, given the current value.
    fn nanos_to_next_check(&self, value: u64) -> u64;
}

/// Wall-clock time since creation.
#[derive(Debug, Clone)]
pub struct WallTimeLimit {
    start: Instant,
    limit: Duration,
}

impl WallTimeLimit {
    pub fn new(limit: Duration) -> Self {
        Self {
            start: Instant::now(),
            limit,
        }
    }

    pub fn limit(&self) -> Duration {
        self.limit
    }
}

impl ResourceLimit for WallTimeLimit {
    fn name(&self) -> String {
        format!("wall time limit of {:?}", self.limit)
    }

    fn current_value(&self) -> u64 {
        self.start.elapsed().as_nanos() as u64
    }

    fn is_exceeded(&self, value: u64) -> bool {
        value >= self.limit.as_nanos() as u64
    }

    fn nanos_to_next_check(&self, value: u64) -> u64 {
        (self.limit.as_nanos() as u64).saturating_sub(value)
    }
}

/// Clock ticks per second assumed for `/proc/self/stat`.
const CLOCK_TICKS_PER_SECOND: u64 = 100;

/// CPU time (user + system) of the whole process, read from `/proc`.
#[derive(Debug, Clone)]
pub struct ProcessCpuTimeLimit {
    limit: Duration,
    processors: u64,
}

impl ProcessCpuTimeLimit {
    /// Returns `None` if process CPU time cannot be read on this platform.
    pub fn new(limit: Duration) -> Option<Self> {
        read_process_cpu_nanos()?;
        let processors = thread::available_parallelism().map_or(1, |n| n.get() as u64);
        Some(Self { limit, processors })
    }
}

/// Parses `utime + stime` out of a `/proc/<pid>/stat` line, in nanoseconds.
fn parse_proc_stat(stat: &str) -> Option<u64> {
    // The command name may contain spaces; fields restart after the last ')'.
    let rest = &stat[stat.rfind(')')? + 1..];
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // Field 14 (utime) and 15 (stime) overall; `rest` starts at field 3.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some((utime + stime) * (1_000_000_000 / CLOCK_TICKS_PER_SECOND))
}

fn read_process_cpu_nanos() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    parse_proc_stat(&stat)
}

impl ResourceLimit for ProcessCpuTimeLimit {
    fn name(&self) -> String {
        format!("CPU time limit of {:?}", self.limit)
    }

    fn current_value(&self) -> u64 {
        read_process_cpu_nanos().unwrap_or(0)
    }

    fn is_exceeded(&self, value: u64) -> bool {
        value >= self.limit.as_nanos() as u64
    }

    fn nanos_to_next_check(&self, value: u64) -> u64 {
        // All processors may burn CPU time concurrently.
        (self.limit.as_nanos() as u64).saturating_sub(value) / self.processors
    }
}

/// A limit on an arbitrary measured quantity, e.g. the reached-set size.
pub struct ProbeLimit {
    name: String,
    probe: Box<dyn Fn() -> u64 + Send>,
    max: u64,
    interval: Duration,
}

impl ProbeLimit {
    /// Exceeded once `probe()` returns more than `max`; polled every `interval`.
    pub fn new(name: impl Into<String>, max: u64, interval: Duration, probe: impl Fn() -> u64 + Send + 'static) -> Self {
        Self {
            name: name.into(),
            probe: Box::new(probe),
            max,
            interval,
        }
    }
}

impl fmt::Debug for ProbeLimit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProbeLimit")
            .field("name", &self.name)
            .field("max", &self.max)
            .field("interval", &self.interval)
            .finish()
    }
}

impl ResourceLimit for ProbeLimit {
    fn name(&self) -> String {
        format!("{} limit of {}", self.name, self.max)
    }

    fn current_value(&self) -> u64 {
        (self.probe)()
    }

    fn is_exceeded(&self, value: u64) -> bool {
        value > self.max
    }

    fn nanos_to_next_check(&self, _value: u64) -> u64 {
        self.interval.as_nanos() as u64
    }
}

const MIN_SLEEP: Duration = Duration::from_millis(1);
const MAX_SLEEP: Duration = Duration::from_millis(500);

/// Background thread enforcing a set of limits.
pub struct ResourceLimitChecker {
    handle: Option<JoinHandle<()>>,
    stopped: Arc<(Mutex<bool>, Condvar)>,
}

impl fmt::Debug for ResourceLimitChecker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceLimitChecker")
            .field("running", &self.handle.is_some())
            .finish()
    }
}

impl ResourceLimitChecker {
    /// Starts checking `limits`, requesting shutdown on `notifier` when one
    /// is exceeded. With no limits, no thread is spawned.
    pub fn start(notifier: ShutdownNotifier, limits: Vec<Box<dyn ResourceLimit>>) -> Self {
        let stopped = Arc::new((Mutex::new(false), Condvar::new()));
        if limits.is_empty() {
            return Self { handle: None, stopped };
        }
        let signal = Arc::clone(&stopped);
        let handle = thread::spawn(move || check_loop(notifier, limits, signal));
        Self {
            handle: Some(handle),
            stopped,
        }
    }

    /// Stops the checker thread and waits for it.
    pub fn stop(mut self) {
        self.shutdown_thread();
    }

    fn shutdown_thread(&mut self) {
        let (lock, cvar) = &*self.stopped;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("resource limit checker thread panicked");
            }
        }
    }
}

impl Drop for ResourceLimitChecker {
    fn drop(&mut self) {
        self.shutdown_thread();
    }
}

fn check_loop(notifier: ShutdownNotifier, limits: Vec<Box<dyn ResourceLimit>>, stopped: Arc<(Mutex<bool>, Condvar)>) {
    let (lock, cvar) = &*stopped;
    debug!("checking {} resource limits", limits.len());
    loop {
        if notifier.should_shutdown() {
            return;
        }
        let mut sleep = MAX_SLEEP;
        for limit in &limits {
            let value = limit.current_value();
            if limit.is_exceeded(value) {
                let reason = format!("{} exceeded", limit.name());
                info!("{}", reason);
                notifier.request_shutdown(reason);
                return;
            }
            sleep = sleep.min(Duration::from_nanos(limit.nanos_to_next_check(value)));
        }
        let sleep = sleep.max(MIN_SLEEP);

        let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (guard, _) = cvar
            .wait_timeout_while(guard, sleep, |stopped| !*stopped)
            .unwrap_or_else(|e| e.into_inner());
        if *guard {
            return;
        }
    }
}
