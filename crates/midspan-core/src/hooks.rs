//! API hook callout driver.
//!
//! Each callout point has an ordered chain of global and transaction-local
//! observers. The driver walks the chain; for each observer it attempts a
//! non-blocking lock of the observer's mutex, and a lost race reschedules
//! the whole step after a configurable backoff rather than blocking a
//! worker thread. Observers answer immediately or defer; a deferred
//! observer re-enables the transaction later with its verdict, and the
//! wall time it held the transaction is charged to the API milestones.

use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use http::Uri;
use tracing::debug;

use crate::milestones::Milestones;

/// Callout points exposed to observers, in transaction order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookId {
    /// Transaction created
    TxnStart,
    /// Before remap runs
    PreRemap,
    /// After remap ran
    PostRemap,
    /// Tunnel about to start
    TunnelStart,
    /// Client request header parsed
    ReadRequestHdr,
    /// Full request body buffered (when buffering was requested)
    RequestBufferReadComplete,
    /// Origin server name about to resolve
    OsDns,
    /// Request header about to go to the origin
    SendRequestHdr,
    /// Cached response header read
    ReadCacheHdr,
    /// Cache lookup finished
    CacheLookupComplete,
    /// Origin response header parsed
    ReadResponseHdr,
    /// Response header about to go to the client
    SendResponseHdr,
    /// Transaction closing
    TxnClose,
    /// Request body transform attachment point
    RequestTransform,
    /// Response body transform attachment point
    ResponseTransform,
    /// Request-side client hook
    RequestClient,
    /// Response-side client hook
    ResponseClient,
}

/// What an observer did with the transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ObserverVerdict {
    /// Proceed to the next observer / next state
    Continue,
    /// Abort the transaction with the plugin-error response
    Error,
    /// Rewind the machine to the previous step
    Rewind,
    /// The observer holds the transaction and will re-enable it later
    Defer,
}

/// Mutable surface an observer may touch during a callout.
#[derive(Debug, Default)]
pub struct TxnOverrides {
    /// Observer-set redirect target; drives one more remap round
    pub redirect_url: Option<Uri>,
    /// Overrides the configured outbound inactivity timeout
    pub no_activity_timeout_out: Option<Duration>,
    /// Overrides the configured outbound active timeout
    pub active_timeout_out: Option<Duration>,
    /// Overrides the configured connect timeout
    pub connect_timeout: Option<Duration>,
    /// Marks the outbound session private (never pooled)
    pub session_private: bool,
}

/// A registered observer. The mutex is the observer's continuation lock;
/// the driver only ever `try_lock`s it.
pub type SharedObserver = Arc<Mutex<dyn TxnObserver + Send>>;

/// Observer interface.
pub trait TxnObserver {
    /// Called at each hook the observer registered for.
    fn on_hook(&mut self, hook: HookId, overrides: &mut TxnOverrides) -> ObserverVerdict;
}

/// Callout bookkeeping the transaction tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CalloutStatus {
    /// No callout in flight
    #[default]
    Idle,
    /// An observer chain is being walked
    InCallout,
    /// A server error arrived mid-callout; handle it after re-enable
    DeferredServerError,
    /// A shutdown arrived mid-callout; close after re-enable
    DeferredClose,
}

/// Progress of one callout step.
#[derive(Debug, PartialEq, Eq)]
pub enum CalloutProgress {
    /// Every observer ran and continued
    Complete,
    /// An observer failed the transaction
    Error,
    /// An observer asked to rewind to the previous step
    Rewind,
    /// An observer deferred; await [`HookDispatcher::resume`]
    InFlight,
    /// An observer's lock was contended; reschedule the step after the
    /// configured backoff
    Retry,
}

/// Process-lifetime registry of global observers.
#[derive(Default)]
pub struct HookRegistry {
    observers: HashMap<HookId, Vec<SharedObserver>>,
}

impl HookRegistry {
    /// Empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `observer` to the global chain for `hook`.
    pub fn register(&mut self, hook: HookId, observer: SharedObserver) {
        self.observers.entry(hook).or_default().push(observer);
    }

    fn chain(&self, hook: HookId) -> &[SharedObserver] {
        self.observers.get(&hook).map_or(&[], Vec::as_slice)
    }
}

/// Per-transaction dispatcher: local observers plus walk state.
#[derive(Default)]
pub struct HookDispatcher {
    local: HashMap<HookId, Vec<SharedObserver>>,
    walk: Option<WalkState>,
}

struct WalkState {
    hook: HookId,
    next_index: usize,
    started: Instant,
}

impl HookDispatcher {
    /// Dispatcher with no transaction-local observers.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Append `observer` to this transaction's chain for `hook`.
    pub fn register_local(&mut self, hook: HookId, observer: SharedObserver) {
        self.local.entry(hook).or_default().push(observer);
    }

    /// True while a walk is suspended awaiting a deferred observer.
    #[must_use]
    pub fn in_flight(&self) -> bool {
        self.walk.is_some()
    }

    /// Walk the observer chain for `hook`: globals first, then locals.
    ///
    /// Resumable: after `Retry` the same call retries the contended
    /// observer; after `InFlight` the walk parks until
    /// [`Self::resume`].
    pub fn run(
        &mut self,
        registry: &HookRegistry,
        hook: HookId,
        overrides: &mut TxnOverrides,
        milestones: &mut Milestones,
        now: Instant,
    ) -> CalloutProgress {
        let start_index = match &self.walk {
            Some(state) if state.hook == hook => state.next_index,
            _ => {
                self.walk = Some(WalkState { hook, next_index: 0, started: now });
                0
            }
        };

        let globals = registry.chain(hook);
        let locals = self.local.get(&hook).map_or(&[][..], Vec::as_slice);
        let total = globals.len() + locals.len();

        for index in start_index..total {
            let observer = if index < globals.len() {
                &globals[index]
            } else {
                &locals[index - globals.len()]
            };

            let Ok(mut guard) = observer.try_lock() else {
                // Continuation lock contended; the whole step is retried
                debug!(?hook, index, "observer lock contended, rescheduling callout");
                if let Some(state) = &mut self.walk {
                    state.next_index = index;
                }
                return CalloutProgress::Retry;
            };

            let verdict = guard.on_hook(hook, overrides);
            drop(guard);

            match verdict {
                ObserverVerdict::Continue => {
                    if let Some(state) = &mut self.walk {
                        state.next_index = index + 1;
                    }
                }
                ObserverVerdict::Error => {
                    self.finish(milestones, now);
                    return CalloutProgress::Error;
                }
                ObserverVerdict::Rewind => {
                    self.finish(milestones, now);
                    return CalloutProgress::Rewind;
                }
                ObserverVerdict::Defer => {
                    if let Some(state) = &mut self.walk {
                        state.next_index = index + 1;
                    }
                    return CalloutProgress::InFlight;
                }
            }
        }

        self.finish(milestones, now);
        CalloutProgress::Complete
    }

    /// Deliver a deferred observer's verdict and continue the walk.
    pub fn resume(
        &mut self,
        registry: &HookRegistry,
        verdict: &ObserverVerdict,
        overrides: &mut TxnOverrides,
        milestones: &mut Milestones,
        now: Instant,
    ) -> CalloutProgress {
        let Some(state) = &self.walk else {
            debug!("hook re-enable with no callout in flight");
            return CalloutProgress::Complete;
        };
        let hook = state.hook;

        match verdict {
            ObserverVerdict::Error => {
                self.finish(milestones, now);
                CalloutProgress::Error
            }
            ObserverVerdict::Rewind => {
                self.finish(milestones, now);
                CalloutProgress::Rewind
            }
            _ => self.run(registry, hook, overrides, milestones, now),
        }
    }

    fn finish(&mut self, milestones: &mut Milestones, now: Instant) {
        if let Some(state) = self.walk.take() {
            milestones.add_api_time(now.saturating_duration_since(state.started));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Recorder {
        verdicts: Vec<ObserverVerdict>,
        calls: usize,
    }

    impl Recorder {
        fn with(verdicts: Vec<ObserverVerdict>) -> SharedObserver {
            Arc::new(Mutex::new(Self { verdicts, calls: 0 }))
        }
    }

    impl TxnObserver for Recorder {
        fn on_hook(&mut self, _hook: HookId, _overrides: &mut TxnOverrides) -> ObserverVerdict {
            let verdict = self
                .verdicts
                .get(self.calls)
                .cloned()
                .unwrap_or(ObserverVerdict::Continue);
            self.calls += 1;
            verdict
        }
    }

    #[test]
    fn walks_globals_then_locals() {
        let mut registry = HookRegistry::new();
        let global = Recorder::with(vec![ObserverVerdict::Continue]);
        registry.register(HookId::ReadRequestHdr, Arc::clone(&global));

        let mut dispatcher = HookDispatcher::new();
        let local = Recorder::with(vec![ObserverVerdict::Continue]);
        dispatcher.register_local(HookId::ReadRequestHdr, Arc::clone(&local));

        let mut overrides = TxnOverrides::default();
        let mut milestones = Milestones::new(Instant::now());
        let progress = dispatcher.run(
            &registry,
            HookId::ReadRequestHdr,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(progress, CalloutProgress::Complete);
        assert!(!dispatcher.in_flight());
        drop(global);
    }

    #[test]
    fn error_verdict_stops_chain() {
        let registry = HookRegistry::new();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_local(
            HookId::SendResponseHdr,
            Recorder::with(vec![ObserverVerdict::Error]),
        );
        let late = Recorder::with(vec![ObserverVerdict::Continue]);
        dispatcher.register_local(HookId::SendResponseHdr, Arc::clone(&late));

        let mut overrides = TxnOverrides::default();
        let mut milestones = Milestones::new(Instant::now());
        let progress = dispatcher.run(
            &registry,
            HookId::SendResponseHdr,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(progress, CalloutProgress::Error);
        assert!(!dispatcher.in_flight());
    }

    #[test]
    fn contended_lock_retries_at_same_observer() {
        let registry = HookRegistry::new();
        let mut dispatcher = HookDispatcher::new();
        let first = Recorder::with(vec![ObserverVerdict::Continue]);
        let second = Recorder::with(vec![ObserverVerdict::Continue]);
        dispatcher.register_local(HookId::OsDns, Arc::clone(&first));
        dispatcher.register_local(HookId::OsDns, Arc::clone(&second));

        let mut overrides = TxnOverrides::default();
        let mut milestones = Milestones::new(Instant::now());

        // Hold the second observer's lock so the walk stops there
        let held = Arc::clone(&second);
        let guard = held.lock().ok();
        let progress = dispatcher.run(
            &registry,
            HookId::OsDns,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(progress, CalloutProgress::Retry);
        drop(guard);

        // The retry picks up at the contended observer, not the start
        let progress = dispatcher.run(
            &registry,
            HookId::OsDns,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(progress, CalloutProgress::Complete);
        drop(first);
    }

    #[test]
    fn deferred_observer_parks_the_walk() {
        let registry = HookRegistry::new();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_local(
            HookId::ReadResponseHdr,
            Recorder::with(vec![ObserverVerdict::Defer]),
        );
        let tail = Recorder::with(vec![ObserverVerdict::Continue]);
        dispatcher.register_local(HookId::ReadResponseHdr, Arc::clone(&tail));

        let mut overrides = TxnOverrides::default();
        let t0 = Instant::now();
        let mut milestones = Milestones::new(t0);

        let progress =
            dispatcher.run(&registry, HookId::ReadResponseHdr, &mut overrides, &mut milestones, t0);
        assert_eq!(progress, CalloutProgress::InFlight);
        assert!(dispatcher.in_flight());

        let progress = dispatcher.resume(
            &registry,
            &ObserverVerdict::Continue,
            &mut overrides,
            &mut milestones,
            t0 + Duration::from_millis(25),
        );
        assert_eq!(progress, CalloutProgress::Complete);
        assert!(!dispatcher.in_flight());
        // Held wall time charged to the API milestones
        assert!(milestones.api_active() >= Duration::from_millis(25));
    }

    #[test]
    fn rewind_verdict_propagates() {
        let registry = HookRegistry::new();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_local(
            HookId::PostRemap,
            Recorder::with(vec![ObserverVerdict::Rewind]),
        );

        let mut overrides = TxnOverrides::default();
        let mut milestones = Milestones::new(Instant::now());
        let progress = dispatcher.run(
            &registry,
            HookId::PostRemap,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(progress, CalloutProgress::Rewind);
    }

    #[test]
    fn observers_can_override_timeouts() {
        struct TimeoutSetter;
        impl TxnObserver for TimeoutSetter {
            fn on_hook(
                &mut self,
                _hook: HookId,
                overrides: &mut TxnOverrides,
            ) -> ObserverVerdict {
                overrides.connect_timeout = Some(Duration::from_secs(3));
                ObserverVerdict::Continue
            }
        }

        let registry = HookRegistry::new();
        let mut dispatcher = HookDispatcher::new();
        dispatcher.register_local(HookId::TxnStart, Arc::new(Mutex::new(TimeoutSetter)));

        let mut overrides = TxnOverrides::default();
        let mut milestones = Milestones::new(Instant::now());
        dispatcher.run(
            &registry,
            HookId::TxnStart,
            &mut overrides,
            &mut milestones,
            Instant::now(),
        );
        assert_eq!(overrides.connect_timeout, Some(Duration::from_secs(3)));
    }
}
