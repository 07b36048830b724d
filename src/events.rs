//! Ordered, per-subject listener registry with failure isolation.
//!
//! Every stateful entity in the crate (connection, channels, presence,
//! message subscriptions) holds an [`EventEmitter`] by value and emits its
//! state changes or messages through it.
//!
//! # Semantics
//!
//! - Listeners run synchronously, in registration order, on the thread that
//!   calls [`EventEmitter::emit`]. Inside a client that is always the
//!   client's event loop task, so emissions never interleave.
//! - `emit` works on the set of listeners registered **when it starts**.
//!   Listeners added by a handler during an emission wait for the next one;
//!   listeners removed during an emission do not run if not yet invoked.
//! - A `once` listener is claimed and removed before its handler runs, so
//!   re-entrant registration from inside the handler is unaffected.
//! - Safe listeners (the default) have panics caught and logged; the
//!   remaining listeners still run. Unsafe listeners resume the panic in the
//!   caller of `emit`.
//!
//! ```ignore
//! let emitter: EventEmitter<ChannelEvent, ChannelStateChange> = EventEmitter::new();
//! let id = emitter.on(ChannelEvent::Attached, |change| log::info!("{change:?}"));
//! emitter.once(Subjects::All, |_| log::info!("first event"));
//! emitter.off(None, Some(id));
//! ```

// Rust guideline compliant 2026-02

use std::fmt::Debug;
use std::panic::{catch_unwind, resume_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use crate::error::{Error, Result};

/// Handle returned by registration, used with [`EventEmitter::off`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(u64);

/// Subjects a listener is registered for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Subjects<E> {
    /// Every subject, including ones defined later.
    All,
    /// Only the listed subjects. An empty list means [`Subjects::All`].
    Only(Vec<E>),
}

impl<E> Subjects<E> {
    /// Build from any collection of subjects.
    pub fn any_of(subjects: impl IntoIterator<Item = E>) -> Self {
        Self::Only(subjects.into_iter().collect())
    }

    fn into_keys(self) -> Vec<Option<E>> {
        match self {
            Self::All => vec![None],
            Self::Only(list) if list.is_empty() => vec![None],
            Self::Only(list) => list.into_iter().map(Some).collect(),
        }
    }
}

impl<E> From<E> for Subjects<E> {
    fn from(subject: E) -> Self {
        Self::Only(vec![subject])
    }
}

/// Emitter construction options.
///
/// Replaces per-type global configuration: each emitter is told at
/// construction how to coerce subject names and whether listeners are safe
/// unless registered otherwise.
#[derive(Debug)]
pub struct EmitterOptions<E> {
    /// Converts a subject name to a typed subject for [`EventEmitter::on_named`].
    pub coerce: Option<fn(&str) -> Option<E>>,
    /// Whether `on`/`once` register safe (panic-catching) listeners.
    pub safe_by_default: bool,
}

impl<E> Clone for EmitterOptions<E> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<E> Copy for EmitterOptions<E> {}

impl<E> Default for EmitterOptions<E> {
    fn default() -> Self {
        Self {
            coerce: None,
            safe_by_default: true,
        }
    }
}

type Handler<P> = Box<dyn Fn(&P) + Send + Sync>;

struct Listener<P> {
    id: ListenerId,
    handler: Handler<P>,
    once: bool,
    safe: bool,
    active: AtomicBool,
}

struct Registration<E, P> {
    /// `None` registers for every subject.
    subject: Option<E>,
    listener: Arc<Listener<P>>,
}

struct Registry<E, P> {
    next_id: u64,
    registrations: Vec<Registration<E, P>>,
}

/// Listener registry keyed by subject `E`, delivering payloads of type `P`.
///
/// Cloning yields another handle to the same registry.
pub struct EventEmitter<E, P> {
    registry: Arc<Mutex<Registry<E, P>>>,
    options: EmitterOptions<E>,
}

impl<E: Clone, P> Clone for EventEmitter<E, P> {
    fn clone(&self) -> Self {
        Self {
            registry: Arc::clone(&self.registry),
            options: self.options,
        }
    }
}

impl<E: Debug, P> Debug for EventEmitter<E, P> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventEmitter")
            .field(
                "listeners",
                &self
                    .registry
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .registrations
                    .len(),
            )
            .field("safe_by_default", &self.options.safe_by_default)
            .finish_non_exhaustive()
    }
}

impl<E, P> Default for EventEmitter<E, P>
where
    E: Clone + PartialEq + Debug,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<E, P> EventEmitter<E, P>
where
    E: Clone + PartialEq + Debug,
{
    /// Create an emitter with safe listeners and no name coercion.
    pub fn new() -> Self {
        Self::with_options(EmitterOptions::default())
    }

    /// Create an emitter with explicit options.
    pub fn with_options(options: EmitterOptions<E>) -> Self {
        Self {
            registry: Arc::new(Mutex::new(Registry {
                next_id: 0,
                registrations: Vec::new(),
            })),
            options,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Registry<E, P>> {
        self.registry.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn register<F>(&self, subjects: Subjects<E>, handler: F, once: bool, safe: bool) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let mut registry = self.lock();
        let id = ListenerId(registry.next_id);
        registry.next_id += 1;

        let listener = Arc::new(Listener {
            id,
            handler: Box::new(handler),
            once,
            safe,
            active: AtomicBool::new(true),
        });
        for subject in subjects.into_keys() {
            registry.registrations.push(Registration {
                subject,
                listener: Arc::clone(&listener),
            });
        }
        id
    }

    /// Register a persistent listener.
    pub fn on<F>(&self, subjects: impl Into<Subjects<E>>, handler: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(subjects.into(), handler, false, self.options.safe_by_default)
    }

    /// Register a listener removed after its first invocation.
    pub fn once<F>(&self, subjects: impl Into<Subjects<E>>, handler: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(subjects.into(), handler, true, self.options.safe_by_default)
    }

    /// Register a persistent listener whose panics propagate to `emit`.
    pub fn on_unsafe<F>(&self, subjects: impl Into<Subjects<E>>, handler: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(subjects.into(), handler, false, false)
    }

    /// Register a one-shot listener whose panics propagate to `emit`.
    pub fn once_unsafe<F>(&self, subjects: impl Into<Subjects<E>>, handler: F) -> ListenerId
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        self.register(subjects.into(), handler, true, false)
    }

    /// Register a persistent listener by subject names, using the coercion
    /// function supplied at construction.
    pub fn on_named<F>(&self, names: &[&str], handler: F) -> Result<ListenerId>
    where
        F: Fn(&P) + Send + Sync + 'static,
    {
        let coerce = self.options.coerce.ok_or_else(|| {
            Error::InvalidArgument("emitter has no subject name coercion".to_string())
        })?;
        let subjects = names
            .iter()
            .map(|name| {
                coerce(name)
                    .ok_or_else(|| Error::InvalidArgument(format!("unknown event '{name}'")))
            })
            .collect::<Result<Vec<E>>>()?;
        Ok(self.on(Subjects::Only(subjects), handler))
    }

    /// Remove registrations.
    ///
    /// - neither argument: remove every listener
    /// - subjects only: remove every listener for those subjects
    /// - listener only: remove that listener from every subject
    /// - both: remove that listener from those subjects
    pub fn off(&self, subjects: Option<Subjects<E>>, listener: Option<ListenerId>) {
        let mut registry = self.lock();
        let keys = subjects.map(Subjects::into_keys);

        let mut removed = Vec::new();
        registry.registrations.retain(|reg| {
            let subject_matches = keys.as_ref().is_none_or(|keys| keys.contains(&reg.subject));
            let listener_matches = listener.is_none_or(|id| reg.listener.id == id);
            if subject_matches && listener_matches {
                removed.push(Arc::clone(&reg.listener));
                false
            } else {
                true
            }
        });

        // A listener left with no subjects must not run again, even from an
        // emission already in progress.
        for gone in removed {
            let still_registered = registry
                .registrations
                .iter()
                .any(|reg| reg.listener.id == gone.id);
            if !still_registered {
                gone.active.store(false, Ordering::SeqCst);
            }
        }
    }

    /// Remove a single listener from every subject.
    pub fn off_listener(&self, listener: ListenerId) {
        self.off(None, Some(listener));
    }

    /// Number of listeners that would receive an emission for `subject`.
    pub fn listener_count(&self, subject: &E) -> usize {
        let registry = self.lock();
        let mut ids: Vec<ListenerId> = registry
            .registrations
            .iter()
            .filter(|reg| reg.subject.as_ref().is_none_or(|s| s == subject))
            .map(|reg| reg.listener.id)
            .collect();
        ids.sort_unstable();
        ids.dedup();
        ids.len()
    }

    /// Invoke every listener registered for `subject` as of this call.
    pub fn emit(&self, subject: &E, payload: &P) {
        let snapshot: Vec<Arc<Listener<P>>> = {
            let registry = self.lock();
            let mut seen = Vec::new();
            registry
                .registrations
                .iter()
                .filter(|reg| reg.subject.as_ref().is_none_or(|s| s == subject))
                .filter(|reg| {
                    if seen.contains(&reg.listener.id) {
                        false
                    } else {
                        seen.push(reg.listener.id);
                        true
                    }
                })
                .map(|reg| Arc::clone(&reg.listener))
                .collect()
        };

        for listener in snapshot {
            if listener.once {
                if !listener.active.swap(false, Ordering::SeqCst) {
                    continue;
                }
                self.lock()
                    .registrations
                    .retain(|reg| reg.listener.id != listener.id);
            } else if !listener.active.load(Ordering::SeqCst) {
                continue;
            }

            Self::invoke(&listener, subject, payload);
        }
    }

    fn invoke(listener: &Listener<P>, subject: &E, payload: &P) {
        let result = catch_unwind(AssertUnwindSafe(|| (listener.handler)(payload)));
        if let Err(panic_info) = result {
            if !listener.safe {
                resume_unwind(panic_info);
            }
            let msg = panic_info
                .downcast_ref::<String>()
                .map(String::as_str)
                .or_else(|| panic_info.downcast_ref::<&str>().copied())
                .unwrap_or("unknown panic");
            log::error!(
                "[Events] Listener {:?} for {:?} panicked: {}",
                listener.id,
                subject,
                msg
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    #[derive(Debug, Clone, PartialEq, Eq)]
    enum Ev {
        A,
        B,
        C,
    }

    fn coerce(name: &str) -> Option<Ev> {
        match name {
            "a" => Some(Ev::A),
            "b" => Some(Ev::B),
            _ => None,
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<String>>>, impl Fn(&str) -> Box<dyn Fn(&u32) + Send + Sync>) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let log_clone = Arc::clone(&log);
        let make = move |tag: &str| -> Box<dyn Fn(&u32) + Send + Sync> {
            let log = Arc::clone(&log_clone);
            let tag = tag.to_string();
            Box::new(move |v: &u32| log.lock().unwrap().push(format!("{tag}:{v}")))
        };
        (log, make)
    }

    #[test]
    fn test_clones_share_registry_and_options() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::with_options(EmitterOptions {
            coerce: Some(coerce),
            safe_by_default: false,
        });
        let other = emitter.clone();
        other.on(Ev::A, |_| {});

        assert_eq!(emitter.listener_count(&Ev::A), 1);
        assert!(other.on_named(&["b"], |_| {}).is_ok());
        let debug = format!("{emitter:?}");
        assert!(debug.contains("listeners: 2"));
        assert!(debug.contains("safe_by_default: false"));
    }

    #[test]
    fn test_emit_runs_in_registration_order() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let (log, make) = recorder();
        emitter.on(Ev::A, make("first"));
        emitter.on(Subjects::All, make("all"));
        emitter.on(Ev::A, make("second"));
        emitter.on(Ev::B, make("other"));

        emitter.emit(&Ev::A, &1);

        assert_eq!(*log.lock().unwrap(), vec!["first:1", "all:1", "second:1"]);
    }

    #[test]
    fn test_listener_added_during_emit_is_deferred() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let count = Arc::new(AtomicUsize::new(0));

        let inner_emitter = emitter.clone();
        let inner_count = Arc::clone(&count);
        emitter.once(Ev::A, move |_| {
            let c = Arc::clone(&inner_count);
            inner_emitter.on(Ev::A, move |_| {
                c.fetch_add(1, Ordering::SeqCst);
            });
        });

        emitter.emit(&Ev::A, &1);
        assert_eq!(count.load(Ordering::SeqCst), 0, "new listener ran in same emit");

        emitter.emit(&Ev::A, &2);
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_listener_removed_during_emit_does_not_run() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let (log, make) = recorder();

        let victim = Arc::new(Mutex::new(None::<ListenerId>));
        let victim_clone = Arc::clone(&victim);
        let inner = emitter.clone();
        emitter.on(Ev::A, move |_| {
            if let Some(id) = *victim_clone.lock().unwrap() {
                inner.off_listener(id);
            }
        });
        let id = emitter.on(Ev::A, make("victim"));
        *victim.lock().unwrap() = Some(id);

        emitter.emit(&Ev::A, &1);
        emitter.emit(&Ev::A, &2);

        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_once_is_removed_before_handler_runs() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let calls = Arc::new(AtomicUsize::new(0));

        let inner = emitter.clone();
        let inner_calls = Arc::clone(&calls);
        emitter.once(Ev::A, move |v| {
            inner_calls.fetch_add(1, Ordering::SeqCst);
            // Nested emit must not re-enter this once listener.
            if *v == 1 {
                inner.emit(&Ev::A, &2);
            }
        });

        emitter.emit(&Ev::A, &1);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(emitter.listener_count(&Ev::A), 0);
    }

    #[test]
    fn test_once_across_subjects_fires_once() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let (log, make) = recorder();
        emitter.once(Subjects::any_of([Ev::A, Ev::B]), make("once"));

        emitter.emit(&Ev::B, &1);
        emitter.emit(&Ev::A, &2);

        assert_eq!(*log.lock().unwrap(), vec!["once:1"]);
        assert_eq!(emitter.listener_count(&Ev::A), 0);
    }

    #[test]
    fn test_safe_listener_panic_is_isolated() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let (log, make) = recorder();
        emitter.on(Ev::A, |_| panic!("boom"));
        emitter.on(Ev::A, make("after"));

        emitter.emit(&Ev::A, &7);

        assert_eq!(*log.lock().unwrap(), vec!["after:7"]);
    }

    #[test]
    fn test_unsafe_listener_panic_propagates() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        emitter.on_unsafe(Ev::A, |_| panic!("boom"));

        let result = catch_unwind(AssertUnwindSafe(|| emitter.emit(&Ev::A, &1)));
        assert!(result.is_err());
    }

    #[test]
    fn test_unsafe_by_default_option() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::with_options(EmitterOptions {
            coerce: None,
            safe_by_default: false,
        });
        emitter.on(Ev::A, |_| panic!("boom"));

        let result = catch_unwind(AssertUnwindSafe(|| emitter.emit(&Ev::A, &1)));
        assert!(result.is_err());
    }

    #[test]
    fn test_off_variants() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        let (log, make) = recorder();
        let multi = emitter.on(Subjects::any_of([Ev::A, Ev::B]), make("multi"));
        emitter.on(Ev::B, make("b"));
        emitter.on(Ev::C, make("c"));

        // Listener + subject: only the A registration goes.
        emitter.off(Some(Ev::A.into()), Some(multi));
        emitter.emit(&Ev::A, &1);
        emitter.emit(&Ev::B, &2);
        assert_eq!(*log.lock().unwrap(), vec!["multi:2", "b:2"]);

        // Subject only: everything on B goes.
        emitter.off(Some(Ev::B.into()), None);
        assert_eq!(emitter.listener_count(&Ev::B), 0);
        assert_eq!(emitter.listener_count(&Ev::C), 1);

        // Neither: clear.
        emitter.off(None, None);
        assert_eq!(emitter.listener_count(&Ev::C), 0);
    }

    #[test]
    fn test_on_named_uses_coercion() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::with_options(EmitterOptions {
            coerce: Some(coerce),
            safe_by_default: true,
        });
        let (log, make) = recorder();
        emitter.on_named(&["a", "b"], make("named")).unwrap();
        emitter.emit(&Ev::B, &3);
        assert_eq!(*log.lock().unwrap(), vec!["named:3"]);

        let err = emitter.on_named(&["nope"], |_| {}).unwrap_err();
        assert!(matches!(err, Error::InvalidArgument(_)));
    }

    #[test]
    fn test_on_named_without_coercion_fails() {
        let emitter: EventEmitter<Ev, u32> = EventEmitter::new();
        assert!(emitter.on_named(&["a"], |_| {}).is_err());
    }
}
