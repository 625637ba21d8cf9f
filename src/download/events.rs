// BlockFetch - Resumable block-parallel HTTP downloader
// Copyright (C) 2025 Henning Berge
//
// This program is free software: you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation, either version 3 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE. See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License
// along with this program. If not, see <https://www.gnu.org/licenses/>.


//! Mission events and their delivery
//!
//! Workers never call listeners directly. Every registration captures an
//! [`EventLoopHandle`] and each event is posted onto that loop as a closure,
//! so listeners always run on the thread they registered from.
//!
//! Registrations hold a `Weak` reference. Listeners that have been dropped
//! are skipped at delivery time and pruned on the next emit.

use crate::download::mission::{ErrorCode, Mission};
use crate::error::{FetchError, Result};
use parking_lot::Mutex;
use std::cell::RefCell;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use tokio::sync::mpsc;
use tracing::{debug, error, trace};

/// Receives mission events on the event loop it was registered with
pub trait MissionListener: Send + Sync {
    fn on_progress(&self, mission: &Arc<Mission>, done: u64, total: u64) {
        let _ = (mission, done, total);
    }

    fn on_finish(&self, mission: &Arc<Mission>) {
        let _ = mission;
    }

    fn on_error(&self, mission: &Arc<Mission>, code: ErrorCode) {
        let _ = (mission, code);
    }
}

/// Event emitted by a mission
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MissionEvent {
    Progress { done: u64, total: u64 },
    Finished,
    Error(ErrorCode),
}

impl MissionEvent {
    fn deliver(self, listener: &dyn MissionListener, mission: &Arc<Mission>) {
        match self {
            MissionEvent::Progress { done, total } => listener.on_progress(mission, done, total),
            MissionEvent::Finished => listener.on_finish(mission),
            MissionEvent::Error(code) => listener.on_error(mission, code),
        }
    }
}

type Task = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Task),
    Stop,
}

thread_local! {
    static CURRENT_LOOP: RefCell<Option<EventLoopHandle>> = const { RefCell::new(None) };
}

/// Cloneable sender side of an [`EventLoop`]
#[derive(Clone)]
pub struct EventLoopHandle {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Message>,
}

impl std::fmt::Debug for EventLoopHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventLoopHandle")
            .field("name", &self.name)
            .field("closed", &self.sender.is_closed())
            .finish()
    }
}

impl EventLoopHandle {
    /// Handle of the loop the calling thread runs on, if any
    pub fn current() -> Option<Self> {
        CURRENT_LOOP.with(|current| current.borrow().clone())
    }

    /// Queue a closure; returns false once the loop is gone
    pub fn post<F>(&self, task: F) -> bool
    where
        F: FnOnce() + Send + 'static,
    {
        self.sender.send(Message::Run(Box::new(task))).is_ok()
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_same_loop(&self, other: &EventLoopHandle) -> bool {
        self.sender.same_channel(&other.sender)
    }
}

/// Named thread that runs posted closures in order
///
/// Dropping the loop lets already queued closures run, then joins the thread.
pub struct EventLoop {
    handle: EventLoopHandle,
    thread: Option<JoinHandle<()>>,
}

impl EventLoop {
    pub fn spawn(name: &str) -> Result<Self> {
        let (sender, mut receiver) = mpsc::unbounded_channel::<Message>();
        let handle = EventLoopHandle {
            name: Arc::from(name),
            sender,
        };

        let loop_handle = handle.clone();
        let thread = thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                CURRENT_LOOP.with(|current| *current.borrow_mut() = Some(loop_handle));

                while let Some(message) = receiver.blocking_recv() {
                    match message {
                        Message::Run(task) => {
                            if catch_unwind(AssertUnwindSafe(task)).is_err() {
                                error!("event listener panicked");
                            }
                        }
                        Message::Stop => break,
                    }
                }

                CURRENT_LOOP.with(|current| current.borrow_mut().take());
                trace!("event loop stopped");
            })
            .map_err(|e| FetchError::InvalidState(format!("Cannot spawn event loop: {}", e)))?;

        debug!(name, "event loop started");
        Ok(Self {
            handle,
            thread: Some(thread),
        })
    }

    pub fn handle(&self) -> EventLoopHandle {
        self.handle.clone()
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        let _ = self.handle.sender.send(Message::Stop);
        if let Some(thread) = self.thread.take() {
            // dropping from inside a listener must not join itself
            if thread.thread().id() != thread::current().id() {
                let _ = thread.join();
            }
        }
    }
}

/// Identifies one registration on an [`EventBus`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

struct Registration {
    id: ListenerId,
    listener: Weak<dyn MissionListener>,
    context: EventLoopHandle,
}

/// Per-mission listener registry
#[derive(Default)]
pub struct EventBus {
    registrations: Mutex<Vec<Registration>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("registrations", &self.registrations.lock().len())
            .finish()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener whose events are posted onto `context`
    pub fn register(&self, listener: &Arc<dyn MissionListener>, context: EventLoopHandle) -> ListenerId {
        let id = ListenerId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.registrations.lock().push(Registration {
            id,
            listener: Arc::downgrade(listener),
            context,
        });
        id
    }

    /// Register on the event loop the calling thread runs on
    pub fn register_current(&self, listener: &Arc<dyn MissionListener>) -> Result<ListenerId> {
        let context = EventLoopHandle::current().ok_or_else(|| {
            FetchError::InvalidState("register_current called outside an event loop".to_string())
        })?;
        Ok(self.register(listener, context))
    }

    pub fn unregister(&self, id: ListenerId) -> bool {
        let mut registrations = self.registrations.lock();
        let before = registrations.len();
        registrations.retain(|registration| registration.id != id);
        registrations.len() != before
    }

    /// Registrations whose listener is still alive
    pub fn listener_count(&self) -> usize {
        self.registrations
            .lock()
            .iter()
            .filter(|registration| registration.listener.strong_count() > 0)
            .count()
    }

    pub(crate) fn emit(&self, mission: &Arc<Mission>, event: MissionEvent) {
        let mut registrations = self.registrations.lock();
        registrations.retain(|registration| {
            if registration.listener.strong_count() == 0 {
                return false;
            }

            let listener = registration.listener.clone();
            let mission = Arc::clone(mission);
            registration.context.post(move || {
                if let Some(listener) = listener.upgrade() {
                    event.deliver(listener.as_ref(), &mission);
                }
            })
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::mpsc as std_mpsc;
    use std::time::Duration;

    #[test]
    fn test_post_runs_on_loop_thread_in_order() {
        let event_loop = EventLoop::spawn("test-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();

        for i in 0..5 {
            let tx = tx.clone();
            event_loop.handle().post(move || {
                let name = thread::current().name().map(str::to_string);
                tx.send((i, name)).unwrap();
            });
        }

        for expected in 0..5 {
            let (i, name) = rx.recv_timeout(Duration::from_secs(5)).unwrap();
            assert_eq!(i, expected);
            assert_eq!(name.as_deref(), Some("test-loop"));
        }
    }

    #[test]
    fn test_current_handle_inside_loop() {
        assert!(EventLoopHandle::current().is_none());

        let event_loop = EventLoop::spawn("current-loop").unwrap();
        let expected = event_loop.handle();
        let (tx, rx) = std_mpsc::channel();
        event_loop.handle().post(move || {
            let current = EventLoopHandle::current().unwrap();
            tx.send(current.is_same_loop(&expected)).unwrap();
        });
        assert!(rx.recv_timeout(Duration::from_secs(5)).unwrap());
    }

    #[test]
    fn test_panicking_task_does_not_stop_loop() {
        let event_loop = EventLoop::spawn("panic-loop").unwrap();
        let (tx, rx) = std_mpsc::channel();
        event_loop.handle().post(|| panic!("listener bug"));
        event_loop.handle().post(move || tx.send(()).unwrap());
        assert!(rx.recv_timeout(Duration::from_secs(5)).is_ok());
    }

    #[test]
    fn test_post_after_drop_fails() {
        let event_loop = EventLoop::spawn("dropped-loop").unwrap();
        let handle = event_loop.handle();
        drop(event_loop);
        assert!(!handle.post(|| {}));
    }

    struct Quiet;
    impl MissionListener for Quiet {}

    #[test]
    fn test_register_and_unregister() {
        let event_loop = EventLoop::spawn("registry-loop").unwrap();
        let bus = EventBus::new();
        let listener: Arc<dyn MissionListener> = Arc::new(Quiet);

        let first = bus.register(&listener, event_loop.handle());
        let second = bus.register(&listener, event_loop.handle());
        assert_ne!(first, second);
        assert_eq!(bus.listener_count(), 2);

        assert!(bus.unregister(first));
        assert!(!bus.unregister(first));
        assert_eq!(bus.listener_count(), 1);

        drop(listener);
        assert_eq!(bus.listener_count(), 0);
    }

    struct Forward(Mutex<std_mpsc::Sender<MissionEvent>>);
    impl MissionListener for Forward {
        fn on_finish(&self, _mission: &Arc<Mission>) {
            let _ = self.0.lock().send(MissionEvent::Finished);
        }
    }

    #[test]
    fn test_emit_prunes_dropped_listeners() {
        let event_loop = EventLoop::spawn("prune-loop").unwrap();
        let context = Arc::new(
            crate::download::stream::DownloadContext::new(&crate::config::DownloadConfig::default()).unwrap(),
        );
        let dir = tempfile::tempdir().unwrap();
        let mission = Mission::create("a.bin", "http://x/a.bin", dir.path(), context).unwrap();

        let (tx, rx) = std_mpsc::channel();
        let live: Arc<dyn MissionListener> = Arc::new(Forward(Mutex::new(tx)));
        let gone: Arc<dyn MissionListener> = Arc::new(Quiet);
        mission.events().register(&gone, event_loop.handle());
        mission.events().register(&live, event_loop.handle());
        drop(gone);
        assert_eq!(mission.events().registrations.lock().len(), 2);

        mission.events().emit(&mission, MissionEvent::Finished);
        assert_eq!(mission.events().registrations.lock().len(), 1);
        assert_eq!(rx.recv_timeout(Duration::from_secs(5)).unwrap(), MissionEvent::Finished);
    }

    #[test]
    fn test_register_current_needs_a_loop() {
        let bus = EventBus::new();
        let listener: Arc<dyn MissionListener> = Arc::new(Quiet);
        assert!(matches!(
            bus.register_current(&listener),
            Err(FetchError::InvalidState(_))
        ));
    }
}
