//! Method call dispatch tables.
//!
//! A dispatch table is an ordered slice of [`DispatchRule`]s. Each rule
//! carries up to four filters (sender, path, interface, method); an unset
//! filter matches anything. The first rule whose filters all match wins,
//! so specific rules must come before catch-all ones.
//!
//! ```
//! use dbus_dispatch::dispatch::DispatchRule;
//! use dbus_dispatch::MethodInvocation;
//!
//! struct Service;
//!
//! fn get_version(inv: MethodInvocation, _: &Service) {
//!     let _ = inv.return_value(&("1.0",));
//! }
//!
//! fn reload(inv: MethodInvocation, _: &Service) {
//!     let _ = inv.return_empty();
//! }
//!
//! static RULES: &[DispatchRule<Service>] = &[
//!     DispatchRule::new(get_version).method("GetVersion"),
//!     DispatchRule::new(reload).method("Reload").asynchronous(),
//! ];
//! # assert_eq!(RULES.len(), 2);
//! ```

use std::fmt;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

use tracing::{debug, error, trace};

use crate::error::DispatchError;
use crate::invocation::{CallInfo, MethodInvocation};

/// Name given to asynchronous handler threads.
const WORKER_THREAD_NAME: &str = "dbus-call";

/// Handler invoked for a matched method call.
///
/// The handler owns the invocation and must answer it exactly once.
pub type MethodHandler<T> = fn(MethodInvocation, &T);

/// A single routing rule of a dispatch table.
pub struct DispatchRule<T> {
    /// Required sender, or any.
    pub sender: Option<&'static str>,
    /// Required object path, or any.
    pub path: Option<&'static str>,
    /// Required interface name, or any.
    pub interface: Option<&'static str>,
    /// Required method name, or any.
    pub method: Option<&'static str>,
    /// Function called for matching calls.
    pub handler: MethodHandler<T>,
    /// Run the handler on its own detached thread.
    pub asynchronous: bool,
}

impl<T> DispatchRule<T> {
    /// Create a catch-all synchronous rule for the given handler.
    pub const fn new(handler: MethodHandler<T>) -> Self {
        Self {
            sender: None,
            path: None,
            interface: None,
            method: None,
            handler,
            asynchronous: false,
        }
    }

    /// Only match calls from this sender.
    pub const fn sender(mut self, sender: &'static str) -> Self {
        self.sender = Some(sender);
        self
    }

    /// Only match calls on this object path.
    pub const fn path(mut self, path: &'static str) -> Self {
        self.path = Some(path);
        self
    }

    /// Only match calls on this interface.
    pub const fn interface(mut self, interface: &'static str) -> Self {
        self.interface = Some(interface);
        self
    }

    /// Only match calls of this method.
    pub const fn method(mut self, method: &'static str) -> Self {
        self.method = Some(method);
        self
    }

    /// Run the handler on a dedicated worker thread.
    pub const fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    /// Check whether a call passes every filter of this rule.
    pub fn matches(&self, call: &CallInfo<'_>) -> bool {
        filter_matches(self.sender, call.sender)
            && filter_matches(self.path, call.path)
            && filter_matches(self.interface, call.interface)
            && filter_matches(self.method, call.method)
    }
}

/// An unset filter matches anything; a set filter needs an equal value.
fn filter_matches(filter: Option<&str>, value: Option<&str>) -> bool {
    match filter {
        None => true,
        Some(expected) => value == Some(expected),
    }
}

impl<T> Clone for DispatchRule<T> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<T> Copy for DispatchRule<T> {}

impl<T> fmt::Debug for DispatchRule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DispatchRule")
            .field("sender", &self.sender)
            .field("path", &self.path)
            .field("interface", &self.interface)
            .field("method", &self.method)
            .field("asynchronous", &self.asynchronous)
            .finish_non_exhaustive()
    }
}

/// Find the first rule matching a call.
pub fn find_rule<'r, T>(rules: &'r [DispatchRule<T>], call: &CallInfo<'_>) -> Option<&'r DispatchRule<T>> {
    rules.iter().find(|rule| rule.matches(call))
}

/// Result of a successful dispatch attempt.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// A rule matched and the handler took the invocation.
    Handled,
    /// No rule matched. The invocation is returned unanswered.
    Unhandled(MethodInvocation),
}

impl DispatchOutcome {
    /// Whether a rule matched.
    pub fn is_handled(&self) -> bool {
        matches!(self, DispatchOutcome::Handled)
    }
}

/// State handed to an asynchronous handler thread.
struct AsyncDispatchTask<T> {
    handler: MethodHandler<T>,
    invocation: MethodInvocation,
    userdata: Arc<T>,
}

impl<T> AsyncDispatchTask<T> {
    fn run(self) {
        (self.handler)(self.invocation, &self.userdata);
    }
}

/// Dispatch an incoming method call.
///
/// Scans `rules` in order and invokes the handler of the first matching
/// rule. Synchronous handlers run on the calling thread before this
/// function returns. Asynchronous handlers run on a new detached thread;
/// this function returns as soon as the thread has been started.
///
/// No reply is ever sent by the dispatcher itself. When no rule matches, the
/// invocation is handed back in [`DispatchOutcome::Unhandled`]. When the
/// worker thread cannot be created, it is handed back inside
/// [`DispatchError::Spawn`].
pub fn dispatch_method_call<T>(
    rules: &[DispatchRule<T>],
    invocation: MethodInvocation,
    userdata: &Arc<T>,
) -> Result<DispatchOutcome, DispatchError>
where
    T: Send + Sync + 'static,
{
    let rule = match find_rule(rules, &invocation.call_info()) {
        Some(rule) => *rule,
        None => {
            trace!(
                path = ?invocation.path(),
                interface = ?invocation.interface(),
                method = ?invocation.method(),
                "No dispatch rule matched"
            );
            return Ok(DispatchOutcome::Unhandled(invocation));
        }
    };

    debug!(
        path = ?invocation.path(),
        interface = ?invocation.interface(),
        method = ?invocation.method(),
        asynchronous = rule.asynchronous,
        "Called D-Bus method"
    );

    if !rule.asynchronous {
        (rule.handler)(invocation, userdata);
        return Ok(DispatchOutcome::Handled);
    }

    let task = AsyncDispatchTask {
        handler: rule.handler,
        invocation,
        userdata: Arc::clone(userdata),
    };
    spawn_detached(task)?;
    Ok(DispatchOutcome::Handled)
}

/// Start a detached worker running `task`.
///
/// The task only moves into the worker once the thread exists, so a spawn
/// failure leaves the invocation with us.
fn spawn_detached<T>(task: AsyncDispatchTask<T>) -> Result<(), DispatchError>
where
    T: Send + Sync + 'static,
{
    let (tx, rx) = mpsc::sync_channel::<AsyncDispatchTask<T>>(1);

    let spawned = spawn_worker(move || {
        if let Ok(task) = rx.recv() {
            task.run();
        }
    });

    // Dropping the JoinHandle detaches the thread.
    if let Err(source) = spawned {
        error!(error = %source, "Couldn't create D-Bus call dispatcher");
        return Err(DispatchError::Spawn {
            source,
            invocation: task.invocation,
        });
    }

    tx.send(task).map_err(|mpsc::SendError(task)| {
        let source = std::io::Error::other("dispatcher thread exited before receiving the call");
        error!(error = %source, "Couldn't hand D-Bus call to dispatcher");
        DispatchError::Spawn {
            source,
            invocation: task.invocation,
        }
    })
}

fn spawn_worker<F>(work: F) -> std::io::Result<thread::JoinHandle<()>>
where
    F: FnOnce() + Send + 'static,
{
    if spawn_refused() {
        return Err(std::io::ErrorKind::OutOfMemory.into());
    }
    thread::Builder::new()
        .name(WORKER_THREAD_NAME.to_string())
        .spawn(work)
}

#[cfg(not(test))]
fn spawn_refused() -> bool {
    false
}

#[cfg(test)]
thread_local! {
    static REFUSE_SPAWN: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

#[cfg(test)]
fn spawn_refused() -> bool {
    REFUSE_SPAWN.with(std::cell::Cell::take)
}

/// Make the next worker spawn on this thread fail.
#[cfg(test)]
pub(crate) fn refuse_next_spawn() {
    REFUSE_SPAWN.with(|refuse| refuse.set(true));
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Barrier, Mutex};
    use std::time::Duration;

    use super::*;
    use crate::invocation::testing::{call, invocation, RecordingSink};

    #[derive(Default)]
    struct Recorder {
        hits: Mutex<Vec<&'static str>>,
        finished: AtomicUsize,
    }

    impl Recorder {
        fn hits(&self) -> Vec<&'static str> {
            self.hits.lock().unwrap().clone()
        }
    }

    fn first(inv: MethodInvocation, rec: &Recorder) {
        rec.hits.lock().unwrap().push("first");
        inv.return_empty().unwrap();
    }

    fn second(inv: MethodInvocation, rec: &Recorder) {
        rec.hits.lock().unwrap().push("second");
        inv.return_empty().unwrap();
    }

    fn catch_all(inv: MethodInvocation, rec: &Recorder) {
        rec.hits.lock().unwrap().push("catch_all");
        inv.return_empty().unwrap();
    }

    fn info<'a>(sender: &'a str, path: &'a str, interface: &'a str, method: &'a str) -> CallInfo<'a> {
        CallInfo {
            sender: Some(sender),
            path: Some(path),
            interface: Some(interface),
            method: Some(method),
        }
    }

    #[test]
    fn test_unset_filters_match_anything() {
        let rule = DispatchRule::<Recorder>::new(catch_all);
        assert!(rule.matches(&info(":1.1", "/a", "org.a", "A")));
        assert!(rule.matches(&info(":1.99", "/b/c", "org.b", "Zzz")));
        assert!(rule.matches(&CallInfo {
            sender: None,
            path: None,
            interface: None,
            method: None,
        }));
    }

    #[test]
    fn test_each_filter_is_checked() {
        let rule = DispatchRule::<Recorder>::new(first)
            .sender(":1.1")
            .path("/a")
            .interface("org.a")
            .method("A");
        assert!(rule.matches(&info(":1.1", "/a", "org.a", "A")));
        assert!(!rule.matches(&info(":1.2", "/a", "org.a", "A")));
        assert!(!rule.matches(&info(":1.1", "/b", "org.a", "A")));
        assert!(!rule.matches(&info(":1.1", "/a", "org.b", "A")));
        assert!(!rule.matches(&info(":1.1", "/a", "org.a", "B")));
    }

    #[test]
    fn test_match_is_case_sensitive() {
        let rule = DispatchRule::<Recorder>::new(first).method("Open");
        assert!(!rule.matches(&info(":1.1", "/a", "org.a", "open")));
    }

    #[test]
    fn test_set_filter_rejects_missing_attribute() {
        let rule = DispatchRule::<Recorder>::new(first).sender(":1.1");
        let call = CallInfo {
            sender: None,
            path: Some("/a"),
            interface: Some("org.a"),
            method: Some("A"),
        };
        assert!(!rule.matches(&call));
    }

    #[test]
    fn test_first_match_wins() {
        let rules = [
            DispatchRule::new(first).method("Open"),
            DispatchRule::new(second).method("Open"),
            DispatchRule::new(catch_all),
        ];
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());

        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Open"));
        let outcome = dispatch_method_call(&rules, inv, &rec).unwrap();
        assert!(outcome.is_handled());

        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Close"));
        dispatch_method_call(&rules, inv, &rec).unwrap();

        assert_eq!(rec.hits(), vec!["first", "catch_all"]);
        assert_eq!(sink.count(), 2);
    }

    #[test]
    fn test_find_rule_returns_lowest_index() {
        let rules = [
            DispatchRule::new(first).interface("org.b"),
            DispatchRule::new(second).path("/x"),
            DispatchRule::new(catch_all).path("/x").method("M"),
        ];
        let found = find_rule(&rules, &info(":1.1", "/x", "org.a", "M")).unwrap();
        assert_eq!(found.path, Some("/x"));
        assert_eq!(found.method, None);
    }

    #[test]
    fn test_unmatched_call_sends_no_reply() {
        let rules = [DispatchRule::new(first).method("Open")];
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());

        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Drain"));
        let outcome = dispatch_method_call(&rules, inv, &rec).unwrap();
        match outcome {
            DispatchOutcome::Unhandled(inv) => {
                assert_eq!(inv.method(), Some("Drain"));
                assert_eq!(sink.count(), 0);
                inv.return_empty().unwrap();
            }
            DispatchOutcome::Handled => panic!("call should not have matched"),
        }
        assert!(rec.hits().is_empty());
    }

    #[test]
    fn test_empty_table_is_unhandled() {
        let rules: [DispatchRule<Recorder>; 0] = [];
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());
        let inv = invocation(&sink, call(":1.5", "/", "org.a", "A"));
        let outcome = dispatch_method_call(&rules, inv, &rec).unwrap();
        assert!(!outcome.is_handled());
        drop(outcome);
        assert_eq!(sink.count(), 0);
    }

    #[test]
    fn test_synchronous_handler_replies_before_return() {
        let rules = [DispatchRule::new(first)];
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());

        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Open"));
        dispatch_method_call(&rules, inv, &rec).unwrap();
        assert_eq!(sink.count(), 1);
    }

    struct Gate {
        barrier: Barrier,
        done: AtomicUsize,
    }

    fn gated(inv: MethodInvocation, gate: &Gate) {
        gate.barrier.wait();
        inv.return_value(&("late",)).unwrap();
        gate.done.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_asynchronous_handler_runs_detached() {
        static RULES: &[DispatchRule<Gate>] = &[DispatchRule::new(gated).asynchronous()];
        let sink = Arc::new(RecordingSink::default());
        let gate = Arc::new(Gate {
            barrier: Barrier::new(2),
            done: AtomicUsize::new(0),
        });

        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Open"));
        let outcome = dispatch_method_call(RULES, inv, &gate).unwrap();
        assert!(outcome.is_handled());

        // The handler is parked on the barrier, so dispatch returned first.
        assert_eq!(sink.count(), 0);
        gate.barrier.wait();

        let mut waited = Duration::ZERO;
        while gate.done.load(Ordering::SeqCst) == 0 && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(gate.done.load(Ordering::SeqCst), 1);
        assert_eq!(sink.count(), 1);
    }

    fn counted(inv: MethodInvocation, rec: &Recorder) {
        std::thread::sleep(Duration::from_millis(5));
        inv.return_empty().unwrap();
        rec.finished.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn test_many_asynchronous_calls_reply_once_each() {
        let rules = [DispatchRule::new(counted).asynchronous()];
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());

        for _ in 0..16 {
            let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Open"));
            dispatch_method_call(&rules, inv, &rec).unwrap();
        }

        let mut waited = Duration::ZERO;
        while rec.finished.load(Ordering::SeqCst) < 16 && waited < Duration::from_secs(5) {
            std::thread::sleep(Duration::from_millis(10));
            waited += Duration::from_millis(10);
        }
        assert_eq!(rec.finished.load(Ordering::SeqCst), 16);
        assert_eq!(sink.count(), 16);
    }

    #[test]
    fn test_spawn_error_returns_invocation() {
        let sink = Arc::new(RecordingSink::default());
        let rec = Arc::new(Recorder::default());
        let rules = [DispatchRule::new(first).method("Open").asynchronous()];

        refuse_next_spawn();
        let inv = invocation(&sink, call(":1.5", "/pcm", "org.a.PCM1", "Open"));
        let err = dispatch_method_call(&rules, inv, &rec).unwrap_err();

        assert!(matches!(err, DispatchError::Spawn { .. }));
        // Handler never ran and nothing was answered yet.
        assert!(rec.hits().is_empty());
        assert_eq!(sink.count(), 0);

        let inv = err.into_invocation();
        assert_eq!(inv.method(), Some("Open"));
        inv.return_error(crate::message::error_names::NO_MEMORY, "out of threads")
            .unwrap();
        assert_eq!(sink.count(), 1);
    }
}
