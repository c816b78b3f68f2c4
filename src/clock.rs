use std::collections::BTreeMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

/// Nanoseconds since boot, including time spent in suspend.
///
/// All event timestamps and TTL anchors use this clock; it never goes
/// backwards across an NTP step.
pub fn elapsed_ns() -> i64 {
    clock_gettime_ns(libc::CLOCK_BOOTTIME)
}

/// Wall-clock nanoseconds since the epoch. Used only for report metadata
/// and storage file names.
pub fn wall_clock_ns() -> i64 {
    clock_gettime_ns(libc::CLOCK_REALTIME)
}

pub fn wall_clock_sec() -> i64 {
    wall_clock_ns() / NS_PER_SEC
}

pub const NS_PER_SEC: i64 = 1_000_000_000;

pub fn nanos_to_millis(ns: i64) -> i64 {
    ns / 1_000_000
}

pub fn millis_to_nanos(ms: i64) -> i64 {
    ms * 1_000_000
}

fn clock_gettime_ns(clock: libc::clockid_t) -> i64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: clock_gettime is thread-safe and only requires a valid pointer.
    if unsafe { libc::clock_gettime(clock, &mut ts) } == 0 {
        (ts.tv_sec as i64)
            .saturating_mul(NS_PER_SEC)
            .saturating_add(ts.tv_nsec as i64)
    } else {
        0
    }
}

/// One scheduled wake-up, second-granular like the platform alarm service.
#[derive(Debug)]
pub struct Alarm {
    pub timestamp_sec: u32,
}

type PlatformUpdateFn = Box<dyn Fn(i64) + Send + Sync>;
type PlatformCancelFn = Box<dyn Fn() + Send + Sync>;

/// Keeps pending alarms sorted and relays the soonest deadline to the
/// platform alarm service.
///
/// The platform is only re-armed when the soonest deadline actually moves,
/// and never for deadlines closer than `min_update_sec` apart.
pub struct AlarmMonitor {
    inner: Mutex<AlarmMonitorState>,
    min_update_sec: u32,
    update_platform: PlatformUpdateFn,
    cancel_platform: PlatformCancelFn,
}

struct AlarmMonitorState {
    /// Sorted by (deadline, identity) so equal deadlines stay distinct.
    alarms: BTreeMap<(u32, usize), Arc<Alarm>>,
    registered_sec: u32,
}

impl AlarmMonitor {
    pub fn new(
        min_update_sec: u32,
        update_platform: PlatformUpdateFn,
        cancel_platform: PlatformCancelFn,
    ) -> Self {
        Self {
            inner: Mutex::new(AlarmMonitorState {
                alarms: BTreeMap::new(),
                registered_sec: 0,
            }),
            min_update_sec,
            update_platform,
            cancel_platform,
        }
    }

    /// A monitor with no platform backend, for callers that drain alarms
    /// inline from the event path.
    pub fn unbacked() -> Self {
        Self::new(0, Box::new(|_| {}), Box::new(|| {}))
    }

    pub fn add(&self, alarm: Arc<Alarm>) {
        let mut inner = self.inner.lock();
        let key = (alarm.timestamp_sec, Arc::as_ptr(&alarm) as usize);
        inner.alarms.insert(key, alarm);
        self.rearm(&mut inner);
    }

    pub fn remove(&self, alarm: &Arc<Alarm>) {
        let mut inner = self.inner.lock();
        let key = (alarm.timestamp_sec, Arc::as_ptr(alarm) as usize);
        inner.alarms.remove(&key);
        self.rearm(&mut inner);
    }

    /// Removes and returns every alarm with a deadline at or before
    /// `timestamp_sec`.
    pub fn pop_sooner_than(&self, timestamp_sec: u32) -> Vec<Arc<Alarm>> {
        let mut inner = self.inner.lock();
        let mut fired = Vec::new();
        while let Some((&(sec, ptr), _)) = inner.alarms.iter().next() {
            if sec > timestamp_sec {
                break;
            }
            if let Some(alarm) = inner.alarms.remove(&(sec, ptr)) {
                fired.push(alarm);
            }
        }
        if !fired.is_empty() {
            self.rearm(&mut inner);
        }
        fired
    }

    pub fn len(&self) -> usize {
        self.inner.lock().alarms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().alarms.is_empty()
    }

    fn rearm(&self, inner: &mut AlarmMonitorState) {
        match inner.alarms.keys().next() {
            Some(&(soonest, _)) => {
                if inner.registered_sec == 0
                    || soonest + self.min_update_sec < inner.registered_sec
                    || soonest > inner.registered_sec
                {
                    inner.registered_sec = soonest;
                    debug!(soonest, "rearming platform alarm");
                    (self.update_platform)(i64::from(soonest) * 1000);
                }
            }
            None => {
                if inner.registered_sec != 0 {
                    inner.registered_sec = 0;
                    (self.cancel_platform)();
                }
            }
        }
    }
}
