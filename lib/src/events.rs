// Copyright 2024 The PJJ Authors
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
// https://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Hook dispatch. Synchronous listeners run in registration order and a
//! failure becomes the operation's failure; asynchronous listeners are
//! queued and fire after the operation commits, with errors swallowed and
//! re-emitted on the `error` channel.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use thiserror::Error;
use tracing::warn;

use crate::backend::{ChangeId, OperationId};
use crate::conflicts::Conflict;
use crate::error::{ClassifiedError, ErrorKind};

pub const PRE_COMMIT: &str = "pre-commit";
pub const POST_COMMIT: &str = "post-commit";
pub const PRE_MERGE: &str = "pre-merge";
pub const POST_MERGE: &str = "post-merge";
pub const CONFLICT_DETECTED: &str = "conflict-detected";
pub const OPERATION_RECORDED: &str = "operation-recorded";
pub const DRIVER_FAILED: &str = "driver:failed";
pub const ERROR: &str = "error";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("Pre-hook rejected the operation: {message}")]
    Rejected { message: String },
    #[error("Hook failed: {message}")]
    Failed { message: String },
    #[error("The engine cannot be re-entered from an event listener")]
    Reentrancy,
}

impl ClassifiedError for HookError {
    fn kind(&self) -> ErrorKind {
        match self {
            HookError::Rejected { .. } => ErrorKind::PreHookRejected,
            HookError::Failed { .. } => ErrorKind::PreHookRejected,
            HookError::Reentrancy => ErrorKind::UnsupportedOperation,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EventPayload {
    /// An operation is being or has been committed.
    Operation {
        op_id: OperationId,
        kind: String,
        description: String,
    },
    /// A merge is about to run or just finished.
    Merge {
        sources: Vec<ChangeId>,
        destination: Option<ChangeId>,
    },
    Conflict(Box<Conflict>),
    DriverFailed {
        path: String,
        driver: String,
        error: String,
    },
    Error {
        event: String,
        message: String,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub name: String,
    pub payload: EventPayload,
}

impl Event {
    pub fn new(name: &str, payload: EventPayload) -> Self {
        Event {
            name: name.to_owned(),
            payload,
        }
    }
}

pub type Listener = Arc<dyn Fn(&Event) -> Result<(), HookError> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerToken(u64);

#[derive(Default)]
struct Listeners {
    sync_listeners: HashMap<String, Vec<(ListenerToken, Listener)>>,
    async_listeners: HashMap<String, Vec<(ListenerToken, Listener)>>,
    next_token: u64,
}

/// Ordered hook dispatch for one repository handle.
#[derive(Default)]
pub struct EventBus {
    listeners: Mutex<Listeners>,
    queue: Mutex<Vec<Event>>,
    dispatching: AtomicBool,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus").finish_non_exhaustive()
    }
}

impl EventBus {
    pub fn new() -> Self {
        EventBus::default()
    }

    /// Subscribes a synchronous listener. Pre-events may veto by returning
    /// an error.
    pub fn subscribe(&self, event_name: &str, listener: Listener) -> ListenerToken {
        let mut listeners = self.listeners.lock().unwrap();
        let token = ListenerToken(listeners.next_token);
        listeners.next_token += 1;
        listeners
            .sync_listeners
            .entry(event_name.to_owned())
            .or_default()
            .push((token, listener));
        token
    }

    /// Subscribes an asynchronous listener: it runs after operation commit,
    /// and its errors are swallowed and re-emitted on the `error` channel.
    pub fn subscribe_async(&self, event_name: &str, listener: Listener) -> ListenerToken {
        let mut listeners = self.listeners.lock().unwrap();
        let token = ListenerToken(listeners.next_token);
        listeners.next_token += 1;
        listeners
            .async_listeners
            .entry(event_name.to_owned())
            .or_default()
            .push((token, listener));
        token
    }

    pub fn unsubscribe(&self, token: ListenerToken) {
        let mut listeners = self.listeners.lock().unwrap();
        for list in listeners.sync_listeners.values_mut() {
            list.retain(|(t, _)| *t != token);
        }
        for list in listeners.async_listeners.values_mut() {
            list.retain(|(t, _)| *t != token);
        }
    }

    /// True while a listener is running. Mutations check this to reject
    /// re-entering the engine from a hook.
    pub fn is_dispatching(&self) -> bool {
        self.dispatching.load(Ordering::SeqCst)
    }

    fn sync_listeners_for(&self, name: &str) -> Vec<Listener> {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .sync_listeners
            .get(name)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    fn async_listeners_for(&self, name: &str) -> Vec<Listener> {
        let listeners = self.listeners.lock().unwrap();
        listeners
            .async_listeners
            .get(name)
            .map(|list| list.iter().map(|(_, l)| l.clone()).collect())
            .unwrap_or_default()
    }

    /// Runs synchronous listeners in registration order; the first failure
    /// propagates and becomes the operation's failure.
    pub fn emit_sync(&self, event: &Event) -> Result<(), HookError> {
        let listeners = self.sync_listeners_for(&event.name);
        self.dispatching.store(true, Ordering::SeqCst);
        let result = listeners.iter().try_for_each(|listener| listener(event));
        self.dispatching.store(false, Ordering::SeqCst);
        result
    }

    /// Queues an event for asynchronous delivery after commit.
    pub fn queue_async(&self, event: Event) {
        self.queue.lock().unwrap().push(event);
    }

    /// Delivers queued events. Listener errors are swallowed and re-emitted
    /// on the `error` channel (whose own listener errors are dropped).
    pub fn drain_async(&self) {
        let events: Vec<Event> = std::mem::take(&mut *self.queue.lock().unwrap());
        for event in events {
            let listeners = self.async_listeners_for(&event.name);
            self.dispatching.store(true, Ordering::SeqCst);
            for listener in listeners {
                if let Err(err) = listener(&event) {
                    warn!(event = %event.name, error = %err, "async listener failed");
                    let error_event = Event::new(
                        ERROR,
                        EventPayload::Error {
                            event: event.name.clone(),
                            message: err.to_string(),
                        },
                    );
                    for error_listener in self.async_listeners_for(ERROR) {
                        error_listener(&error_event).ok();
                    }
                    for error_listener in self.sync_listeners_for(ERROR) {
                        error_listener(&error_event).ok();
                    }
                }
            }
            self.dispatching.store(false, Ordering::SeqCst);
        }
    }

    /// Drops any events queued by an operation that failed to commit.
    pub fn discard_queued(&self) {
        self.queue.lock().unwrap().clear();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use super::*;
    use crate::object_id::ObjectId;

    fn operation_event(name: &str) -> Event {
        Event::new(
            name,
            EventPayload::Operation {
                op_id: OperationId::from_bytes(&[1; 32]),
                kind: "describe".to_owned(),
                description: "test".to_owned(),
            },
        )
    }

    #[test]
    fn test_sync_listeners_run_in_registration_order() {
        let bus = EventBus::new();
        let order = Arc::new(Mutex::new(vec![]));
        for i in 0..3 {
            let order = order.clone();
            bus.subscribe(
                PRE_COMMIT,
                Arc::new(move |_| {
                    order.lock().unwrap().push(i);
                    Ok(())
                }),
            );
        }
        bus.emit_sync(&operation_event(PRE_COMMIT)).unwrap();
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    }

    #[test]
    fn test_sync_failure_aborts() {
        let bus = EventBus::new();
        let ran_after = Arc::new(AtomicBool::new(false));
        bus.subscribe(
            PRE_COMMIT,
            Arc::new(|_| {
                Err(HookError::Rejected {
                    message: "no".to_owned(),
                })
            }),
        );
        let ran_after2 = ran_after.clone();
        bus.subscribe(
            PRE_COMMIT,
            Arc::new(move |_| {
                ran_after2.store(true, Ordering::SeqCst);
                Ok(())
            }),
        );
        assert!(bus.emit_sync(&operation_event(PRE_COMMIT)).is_err());
        assert!(!ran_after.load(Ordering::SeqCst));
    }

    #[test]
    fn test_async_errors_reemitted_on_error_channel() {
        let bus = EventBus::new();
        let errors = Arc::new(AtomicUsize::new(0));
        bus.subscribe_async(
            POST_COMMIT,
            Arc::new(|_| {
                Err(HookError::Failed {
                    message: "boom".to_owned(),
                })
            }),
        );
        let errors2 = errors.clone();
        bus.subscribe_async(
            ERROR,
            Arc::new(move |event| {
                assert!(matches!(event.payload, EventPayload::Error { .. }));
                errors2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.queue_async(operation_event(POST_COMMIT));
        bus.drain_async();
        assert_eq!(errors.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unsubscribe() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        let token = bus.subscribe(
            POST_COMMIT,
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.emit_sync(&operation_event(POST_COMMIT)).unwrap();
        bus.unsubscribe(token);
        bus.emit_sync(&operation_event(POST_COMMIT)).unwrap();
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_discard_queued() {
        let bus = EventBus::new();
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = count.clone();
        bus.subscribe_async(
            POST_COMMIT,
            Arc::new(move |_| {
                count2.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }),
        );
        bus.queue_async(operation_event(POST_COMMIT));
        bus.discard_queued();
        bus.drain_async();
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
