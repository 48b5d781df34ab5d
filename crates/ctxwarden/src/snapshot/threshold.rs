//! Usage-threshold callbacks.
//!
//! Callbacks are edge-triggered: a threshold fires the first time usage
//! reaches it and re-arms once usage falls back below. The pre-overflow
//! warning at [`OVERFLOW_WARNING_FRACTION`] is always checked, whether or
//! not any callback is registered for it.

use crate::context::ContextUsage;
use crate::{OVERFLOW_WARNING_FRACTION, THRESHOLD_EPSILON, at_or_above};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Callback invoked when a threshold is reached.
pub type ThresholdCallback = Arc<dyn Fn(&ThresholdHit) + Send + Sync>;

/// What a callback receives.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ThresholdHit {
    /// The registered fraction that was reached.
    pub fraction: f64,
    /// Current usage fraction.
    pub usage: f64,
    pub current_tokens: usize,
    pub max_tokens: usize,
    /// Set for the pre-overflow warning.
    pub overflow_warning: bool,
}

/// Outcome of one [`ThresholdMonitor::check`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ThresholdReport {
    pub usage: f64,
    /// Registered fractions that fired on this check, ascending.
    pub crossed: Vec<f64>,
    /// The pre-overflow warning fired on this check.
    pub overflow_warning: bool,
    /// The check was ignored because another one was already running.
    pub skipped: bool,
}

impl ThresholdReport {
    pub fn fired(&self) -> bool {
        !self.crossed.is_empty() || self.overflow_warning
    }
}

struct Registration {
    fraction: f64,
    callback: ThresholdCallback,
    armed: bool,
}

impl Registration {
    fn same_as(&self, fraction: f64, callback: &ThresholdCallback) -> bool {
        (self.fraction - fraction).abs() < THRESHOLD_EPSILON
            && callback_addr(&self.callback) == callback_addr(callback)
    }
}

struct MonitorState {
    thresholds: Vec<Registration>,
    overflow: Vec<ThresholdCallback>,
    overflow_armed: bool,
}

/// Thin-pointer identity for a callback; vtable pointers are not stable
/// across codegen units.
fn callback_addr(callback: &ThresholdCallback) -> *const () {
    Arc::as_ptr(callback) as *const ()
}

/// Resets the in-progress flag when a check ends, even by panic.
struct CheckGuard<'a>(&'a AtomicBool);

impl Drop for CheckGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::Release);
    }
}

/// Registry of threshold callbacks and their arm state.
pub struct ThresholdMonitor {
    state: Mutex<MonitorState>,
    checking: AtomicBool,
}

impl Default for ThresholdMonitor {
    fn default() -> Self {
        Self::new()
    }
}

impl ThresholdMonitor {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MonitorState {
                thresholds: Vec::new(),
                overflow: Vec::new(),
                overflow_armed: true,
            }),
            checking: AtomicBool::new(false),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MonitorState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Register `callback` for `fraction`.
    ///
    /// Returns `false` when the same callback is already registered for the
    /// same fraction; the duplicate is dropped.
    pub fn on_context_threshold(&self, fraction: f64, callback: ThresholdCallback) -> bool {
        let mut state = self.lock();
        if state
            .thresholds
            .iter()
            .any(|r| r.same_as(fraction, &callback))
        {
            debug!("Ignoring duplicate threshold callback at {fraction:.2}");
            return false;
        }
        state.thresholds.push(Registration {
            fraction,
            callback,
            armed: true,
        });
        true
    }

    /// Register a pre-overflow callback. Duplicates are dropped.
    pub fn on_before_overflow(&self, callback: ThresholdCallback) -> bool {
        let mut state = self.lock();
        let addr = callback_addr(&callback);
        if state.overflow.iter().any(|c| callback_addr(c) == addr) {
            return false;
        }
        state.overflow.push(callback);
        true
    }

    /// Number of registered threshold callbacks (excluding overflow ones).
    pub fn registered(&self) -> usize {
        self.lock().thresholds.len()
    }

    /// Re-arm every threshold, e.g. after the context was replaced.
    pub fn reset(&self) {
        let mut state = self.lock();
        for registration in &mut state.thresholds {
            registration.armed = true;
        }
        state.overflow_armed = true;
    }

    /// Evaluate usage and fire every threshold reached since the last check.
    ///
    /// Callbacks run after the registry lock is released. A check started
    /// from inside a callback is skipped.
    pub fn check(&self, current_tokens: usize, max_tokens: usize) -> ThresholdReport {
        let usage = ContextUsage::new(current_tokens, max_tokens).usage_pct;
        if self.checking.swap(true, Ordering::Acquire) {
            trace!("Nested threshold check ignored");
            return ThresholdReport {
                usage,
                skipped: true,
                ..ThresholdReport::default()
            };
        }
        let _guard = CheckGuard(&self.checking);

        let hit = |fraction: f64, overflow_warning: bool| ThresholdHit {
            fraction,
            usage,
            current_tokens,
            max_tokens,
            overflow_warning,
        };

        let mut to_fire: Vec<(ThresholdCallback, ThresholdHit)> = Vec::new();
        let mut report = ThresholdReport {
            usage,
            ..ThresholdReport::default()
        };
        {
            let mut state = self.lock();
            for registration in &mut state.thresholds {
                if at_or_above(usage, registration.fraction) {
                    if registration.armed {
                        registration.armed = false;
                        to_fire.push((
                            Arc::clone(&registration.callback),
                            hit(registration.fraction, false),
                        ));
                        if !report
                            .crossed
                            .iter()
                            .any(|f| (f - registration.fraction).abs() < THRESHOLD_EPSILON)
                        {
                            report.crossed.push(registration.fraction);
                        }
                    }
                } else {
                    registration.armed = true;
                }
            }

            if at_or_above(usage, OVERFLOW_WARNING_FRACTION) {
                if state.overflow_armed {
                    state.overflow_armed = false;
                    report.overflow_warning = true;
                    for callback in &state.overflow {
                        to_fire.push((Arc::clone(callback), hit(OVERFLOW_WARNING_FRACTION, true)));
                    }
                }
            } else {
                state.overflow_armed = true;
            }
        }
        report.crossed.sort_by(f64::total_cmp);

        if report.fired() {
            debug!(
                "Usage {:.1}% crossed {:?}{}",
                usage * 100.0,
                report.crossed,
                if report.overflow_warning {
                    " (overflow warning)"
                } else {
                    ""
                }
            );
        }
        for (callback, hit) in to_fire {
            callback(&hit);
        }
        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counter() -> (Arc<AtomicUsize>, ThresholdCallback) {
        let count = Arc::new(AtomicUsize::new(0));
        let c = Arc::clone(&count);
        let callback: ThresholdCallback = Arc::new(move |_hit: &ThresholdHit| {
            c.fetch_add(1, Ordering::SeqCst);
        });
        (count, callback)
    }

    #[test]
    fn fires_at_threshold_with_epsilon() {
        let monitor = ThresholdMonitor::new();
        let (count, callback) = counter();
        monitor.on_context_threshold(0.8, callback);

        assert!(monitor.check(799, 1000).crossed.is_empty());
        let report = monitor.check(800, 1000);
        assert_eq!(report.crossed, vec![0.8]);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn duplicate_registration_is_ignored() {
        let monitor = ThresholdMonitor::new();
        let (count, callback) = counter();
        assert!(monitor.on_context_threshold(0.5, Arc::clone(&callback)));
        assert!(!monitor.on_context_threshold(0.5, Arc::clone(&callback)));
        assert!(monitor.on_context_threshold(0.7, callback));
        assert_eq!(monitor.registered(), 2);

        monitor.check(900, 1000);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn edge_triggered_and_rearmed() {
        let monitor = ThresholdMonitor::new();
        let (count, callback) = counter();
        monitor.on_context_threshold(0.5, callback);

        monitor.check(600, 1000);
        monitor.check(700, 1000);
        assert_eq!(count.load(Ordering::SeqCst), 1);

        monitor.check(100, 1000);
        monitor.check(550, 1000);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn overflow_warning_always_checked() {
        let monitor = ThresholdMonitor::new();
        let report = monitor.check(950, 1000);
        assert!(report.overflow_warning);
        assert!(report.crossed.is_empty());

        let (count, callback) = counter();
        monitor.on_before_overflow(Arc::clone(&callback));
        assert!(!monitor.on_before_overflow(callback));
        assert!(!monitor.check(990, 1000).overflow_warning);
        monitor.check(10, 1000);
        assert!(monitor.check(960, 1000).overflow_warning);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn hit_carries_usage() {
        let monitor = ThresholdMonitor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let s = Arc::clone(&seen);
        monitor.on_context_threshold(
            0.25,
            Arc::new(move |hit: &ThresholdHit| s.lock().unwrap().push(*hit)),
        );
        monitor.check(300, 1000);
        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].current_tokens, 300);
        assert!((seen[0].usage - 0.3).abs() < 1e-9);
        assert!(!seen[0].overflow_warning);
    }

    #[test]
    fn nested_check_is_skipped() {
        let monitor = Arc::new(ThresholdMonitor::new());
        let inner = Arc::new(Mutex::new(None));
        let m = Arc::clone(&monitor);
        let i = Arc::clone(&inner);
        monitor.on_context_threshold(
            0.5,
            Arc::new(move |_hit: &ThresholdHit| {
                *i.lock().unwrap() = Some(m.check(1000, 1000));
            }),
        );

        let outer = monitor.check(600, 1000);
        assert_eq!(outer.crossed, vec![0.5]);
        let nested = inner.lock().unwrap().clone().unwrap();
        assert!(nested.skipped);
        assert!(!nested.fired());

        // The guard was released.
        assert!(!monitor.check(600, 1000).skipped);
    }

    #[test]
    fn reset_rearms_everything() {
        let monitor = ThresholdMonitor::new();
        let (count, callback) = counter();
        monitor.on_context_threshold(0.5, callback);
        monitor.check(600, 1000);
        monitor.reset();
        monitor.check(600, 1000);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }
}
