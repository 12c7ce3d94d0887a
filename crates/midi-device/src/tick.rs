/// High-precision tick generator for MIDI clock and playback scheduling.
///
/// Two strategies:
///   - `Thread`: a dedicated thread sleeping on a condition variable against the
///     monotonic clock. It re-checks the clock after every wake, so a tick never
///     fires before `previous tick + interval`. Cancellation goes through the
///     same condition variable, which makes `stop` prompt and synchronous.
///   - `Multimedia` (Windows): the system multimedia timer at the finest
///     resolution the timer device allows for the interval.
///
/// On macOS the tick thread asks for a real-time time-constraint policy; if the
/// kernel refuses, the generator keeps running at normal priority.

use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use tracing::{debug, info, warn};

use crate::config::{TickConfig, TickStrategy};
use crate::error::{NativeError, TickStartError, TickStopError};

pub type TickCallback = Box<dyn FnMut() + Send + 'static>;

pub struct TickGenerator {
    interval: Duration,
    timer: Option<Timer>,
}

enum Timer {
    Thread {
        shared: Arc<ThreadShared>,
        handle: JoinHandle<()>,
    },
    #[cfg(target_os = "windows")]
    Multimedia(multimedia::MultimediaTimer),
}

struct ThreadShared {
    stopped: Mutex<bool>,
    wake: Condvar,
}

impl TickGenerator {
    /// Start calling `callback` every `interval`.
    pub fn start<F>(interval: Duration, callback: F, config: &TickConfig) -> Result<Self, TickStartError>
    where
        F: FnMut() + Send + 'static,
    {
        if interval.is_zero() {
            return Err(TickStartError::Interval(NativeError::InvalidParameter));
        }

        let callback: TickCallback = Box::new(callback);
        let timer = match config.strategy {
            #[cfg(target_os = "windows")]
            TickStrategy::Multimedia => {
                Timer::Multimedia(multimedia::MultimediaTimer::start(interval, callback)?)
            }
            #[cfg(not(target_os = "windows"))]
            TickStrategy::Multimedia => {
                warn!("Multimedia timer is only available on Windows, using tick thread");
                start_thread(interval, callback, config.realtime)?
            }
            TickStrategy::Thread => start_thread(interval, callback, config.realtime)?,
        };

        info!(interval_us = interval.as_micros() as u64, strategy = ?config.strategy, "Tick generator started");

        Ok(Self {
            interval,
            timer: Some(timer),
        })
    }

    pub fn interval(&self) -> Duration {
        self.interval
    }

    /// Stop the generator. When this returns the callback is not running and
    /// will not be called again (unless called from inside the callback itself,
    /// in which case the current invocation is the last).
    pub fn stop(mut self) -> Result<(), TickStopError> {
        self.shutdown()
    }

    fn shutdown(&mut self) -> Result<(), TickStopError> {
        let Some(timer) = self.timer.take() else {
            return Ok(());
        };

        match timer {
            Timer::Thread { shared, handle } => {
                *shared.stopped.lock().unwrap_or_else(PoisonError::into_inner) = true;
                shared.wake.notify_all();
                if handle.thread().id() != std::thread::current().id() {
                    handle
                        .join()
                        .map_err(|_| TickStopError::Join(NativeError::Unknown(-1)))?;
                }
            }
            #[cfg(target_os = "windows")]
            Timer::Multimedia(timer) => timer.stop()?,
        }

        info!("Tick generator stopped");
        Ok(())
    }
}

impl Drop for TickGenerator {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            warn!(error = %e, "Failed to stop tick generator on drop");
        }
    }
}

fn start_thread(interval: Duration, callback: TickCallback, realtime: bool) -> Result<Timer, TickStartError> {
    let shared = Arc::new(ThreadShared {
        stopped: Mutex::new(false),
        wake: Condvar::new(),
    });
    let thread_shared = Arc::clone(&shared);

    let handle = std::thread::Builder::new()
        .name("midi-tick".into())
        .spawn(move || run_ticks(&thread_shared, interval, callback, realtime))
        .map_err(|e| {
            warn!(error = %e, "Failed to spawn tick thread");
            TickStartError::ThreadStart(NativeError::NoResources)
        })?;

    Ok(Timer::Thread { shared, handle })
}

fn run_ticks(shared: &ThreadShared, interval: Duration, mut callback: TickCallback, realtime: bool) {
    if realtime {
        match realtime::promote_current_thread(interval) {
            Ok(()) => debug!("Tick thread promoted to real-time policy"),
            Err(code) => warn!(code, "Real-time policy refused, running at normal priority"),
        }
    }

    let mut next = Instant::now() + interval;
    let mut stopped = shared.stopped.lock().unwrap_or_else(PoisonError::into_inner);

    loop {
        loop {
            if *stopped {
                return;
            }
            let now = Instant::now();
            if now >= next {
                break;
            }
            let (guard, _) = shared
                .wake
                .wait_timeout(stopped, next - now)
                .unwrap_or_else(PoisonError::into_inner);
            stopped = guard;
        }
        drop(stopped);

        let fired = Instant::now();
        callback();
        next = fired + interval;

        stopped = shared.stopped.lock().unwrap_or_else(PoisonError::into_inner);
    }
}

#[cfg(target_os = "macos")]
mod realtime {
    use std::time::Duration;

    const THREAD_TIME_CONSTRAINT_POLICY: u32 = 2;
    const THREAD_TIME_CONSTRAINT_POLICY_COUNT: u32 = 4;

    #[repr(C)]
    struct TimeConstraintPolicy {
        period: u32,
        computation: u32,
        constraint: u32,
        preemptible: i32,
    }

    #[repr(C)]
    struct MachTimebaseInfo {
        numer: u32,
        denom: u32,
    }

    extern "C" {
        fn mach_thread_self() -> u32;
        fn mach_timebase_info(info: *mut MachTimebaseInfo) -> i32;
        fn thread_policy_set(thread: u32, flavor: u32, policy_info: *mut i32, count: u32) -> i32;
    }

    /// Ask the scheduler for the interval as period with a tight compute budget.
    pub fn promote_current_thread(interval: Duration) -> Result<(), i32> {
        let mut timebase = MachTimebaseInfo { numer: 0, denom: 0 };
        // SAFETY: plain out-parameter call.
        let kr = unsafe { mach_timebase_info(&mut timebase) };
        if kr != 0 || timebase.numer == 0 {
            return Err(kr);
        }

        let to_abs = |ns: u128| -> u32 {
            (ns * timebase.denom as u128 / timebase.numer as u128).min(u32::MAX as u128) as u32
        };
        let period_ns = interval.as_nanos();
        let computation_ns = (period_ns / 4).clamp(50_000, 5_000_000).min(period_ns);

        let mut policy = TimeConstraintPolicy {
            period: to_abs(period_ns),
            computation: to_abs(computation_ns),
            constraint: to_abs(period_ns),
            preemptible: 1,
        };

        // SAFETY: the policy struct matches thread_time_constraint_policy_data_t
        // and the count is its size in integers.
        let kr = unsafe {
            thread_policy_set(
                mach_thread_self(),
                THREAD_TIME_CONSTRAINT_POLICY,
                &mut policy as *mut TimeConstraintPolicy as *mut i32,
                THREAD_TIME_CONSTRAINT_POLICY_COUNT,
            )
        };
        if kr == 0 {
            Ok(())
        } else {
            Err(kr)
        }
    }
}

#[cfg(not(target_os = "macos"))]
mod realtime {
    use std::time::Duration;

    pub fn promote_current_thread(_interval: Duration) -> Result<(), i32> {
        Ok(())
    }
}

#[cfg(target_os = "windows")]
mod multimedia {
    use std::sync::{Mutex, PoisonError};
    use std::time::Duration;

    use tracing::debug;
    use windows::Win32::Media::{
        timeBeginPeriod, timeEndPeriod, timeGetDevCaps, timeKillEvent, timeSetEvent, TIMECAPS,
        TIMERR_NOERROR, TIME_KILL_SYNCHRONOUS, TIME_PERIODIC,
    };

    use super::TickCallback;
    use crate::error::{NativeError, TickStartError, TickStopError};

    pub struct MultimediaTimer {
        id: u32,
        resolution: u32,
        callback: *mut Mutex<TickCallback>,
    }

    // SAFETY: the callback box is only touched by the timer thread (through the
    // mutex) and by `stop`, after the event has been killed.
    unsafe impl Send for MultimediaTimer {}

    unsafe extern "system" fn tick_proc(_id: u32, _msg: u32, user: usize, _dw1: usize, _dw2: usize) {
        if user == 0 {
            return;
        }
        let callback = &*(user as *const Mutex<TickCallback>);
        if let Ok(mut f) = callback.try_lock() {
            f();
        }
    }

    impl MultimediaTimer {
        pub fn start(interval: Duration, callback: TickCallback) -> Result<Self, TickStartError> {
            let interval_ms = interval.as_millis().clamp(1, u32::MAX as u128) as u32;

            let mut caps = TIMECAPS::default();
            // SAFETY: caps is a valid TIMECAPS out-parameter of the given size.
            let result = unsafe { timeGetDevCaps(&mut caps, std::mem::size_of::<TIMECAPS>() as u32) };
            if result != TIMERR_NOERROR {
                return Err(TickStartError::DeviceCaps(NativeError::Unknown(result as i32)));
            }

            let resolution = interval_ms.clamp(caps.wPeriodMin, caps.wPeriodMax.max(caps.wPeriodMin));
            // SAFETY: resolution lies within the device's supported range.
            unsafe { timeBeginPeriod(resolution) };

            let callback = Box::into_raw(Box::new(Mutex::new(callback)));
            // SAFETY: the callback pointer stays alive until `stop` frees it.
            let id = unsafe {
                timeSetEvent(
                    interval_ms,
                    resolution,
                    Some(tick_proc),
                    callback as usize,
                    TIME_PERIODIC | TIME_KILL_SYNCHRONOUS,
                )
            };
            if id == 0 {
                // SAFETY: the event was never armed, so nobody else holds the box.
                unsafe {
                    timeEndPeriod(resolution);
                    drop(Box::from_raw(callback));
                }
                return Err(TickStartError::SetTimer(NativeError::NoResources));
            }

            debug!(id, resolution, interval_ms, "Multimedia timer armed");
            Ok(Self {
                id,
                resolution,
                callback,
            })
        }

        pub fn stop(self) -> Result<(), TickStopError> {
            // SAFETY: id came from timeSetEvent and has not been killed yet.
            let result = unsafe { timeKillEvent(self.id) };
            if result != TIMERR_NOERROR {
                return Err(TickStopError::KillEvent(NativeError::InvalidParameter));
            }

            // Wait out a callback that was already running when the event died.
            // SAFETY: the event is dead; we are the last user of the box.
            unsafe {
                drop((*self.callback).lock().unwrap_or_else(PoisonError::into_inner));
                drop(Box::from_raw(self.callback));
            }

            // SAFETY: pairs the timeBeginPeriod from `start`.
            let result = unsafe { timeEndPeriod(self.resolution) };
            if result != TIMERR_NOERROR {
                return Err(TickStopError::EndPeriod(NativeError::Unknown(result as i32)));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn thread_config() -> TickConfig {
        TickConfig {
            strategy: TickStrategy::Thread,
            realtime: false,
        }
    }

    #[test]
    fn zero_interval_is_rejected() {
        let err = TickGenerator::start(Duration::ZERO, || {}, &thread_config()).err();
        assert_eq!(err, Some(TickStartError::Interval(NativeError::InvalidParameter)));
    }

    #[test]
    fn stop_is_synchronous() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        let gen = TickGenerator::start(
            Duration::from_millis(2),
            move || {
                counter.fetch_add(1, Ordering::SeqCst);
            },
            &thread_config(),
        )
        .unwrap();

        std::thread::sleep(Duration::from_millis(30));
        gen.stop().unwrap();
        let after_stop = count.load(Ordering::SeqCst);
        assert!(after_stop > 0);

        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), after_stop);
    }

    #[test]
    fn drop_stops_generator() {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&count);
        {
            let _gen = TickGenerator::start(
                Duration::from_millis(1),
                move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                },
                &thread_config(),
            )
            .unwrap();
            std::thread::sleep(Duration::from_millis(10));
        }
        let after_drop = count.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(10));
        assert_eq!(count.load(Ordering::SeqCst), after_drop);
    }

    #[test]
    fn ticks_never_early() {
        let stamps = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&stamps);
        let interval = Duration::from_millis(5);
        let gen = TickGenerator::start(
            interval,
            move || sink.lock().unwrap().push(Instant::now()),
            &thread_config(),
        )
        .unwrap();

        while stamps.lock().unwrap().len() < 10 {
            std::thread::sleep(Duration::from_millis(5));
        }
        gen.stop().unwrap();

        let stamps = stamps.lock().unwrap();
        for pair in stamps.windows(2) {
            assert!(pair[1] - pair[0] >= interval);
        }
    }
}
