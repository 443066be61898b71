// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Event fan-out to independent observers.
//!
//! Each event category has its own ordered registry. Delivery follows
//! registration order, and a failing or panicking observer is logged and
//! skipped without affecting the others. Nothing is buffered: an observer
//! only sees events emitted after it registered.

use anyhow::Result;
use parking_lot::RwLock;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use tracing::{debug, error};

use crate::bluetooth::{ChatMessage, Device};

/// Connection state change.
#[derive(Debug, Clone, PartialEq)]
pub struct ConnectionEvent {
    pub connected: bool,
    /// Peer the change concerns. `None` on an explicit disconnect.
    pub device: Option<Device>,
}

impl ConnectionEvent {
    pub fn connected(device: Device) -> Self {
        Self {
            connected: true,
            device: Some(device),
        }
    }

    pub fn disconnected() -> Self {
        Self {
            connected: false,
            device: None,
        }
    }

    /// The link dropped on its own; the peer is still remembered.
    pub fn lost(device: Device) -> Self {
        Self {
            connected: false,
            device: Some(device),
        }
    }
}

/// A message sent to or received from the connected peer.
#[derive(Debug, Clone, PartialEq)]
pub struct MessageEvent {
    pub device: Device,
    pub message: ChatMessage,
}

/// A registered observer.
///
/// Identity is the `Arc` allocation: keep a clone to unregister later.
pub type Listener<E> = Arc<dyn Fn(&E) -> Result<()> + Send + Sync>;

/// Wrap a closure as a [`Listener`].
pub fn listener<E, F>(f: F) -> Listener<E>
where
    F: Fn(&E) -> Result<()> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Ordered observer registry for one event category.
pub struct Registry<E> {
    category: &'static str,
    listeners: RwLock<Vec<Listener<E>>>,
}

impl<E> Registry<E> {
    pub fn new(category: &'static str) -> Self {
        Self {
            category,
            listeners: RwLock::new(Vec::new()),
        }
    }

    /// Append an observer. Registering the same listener twice makes it fire twice.
    pub fn add(&self, listener: Listener<E>) {
        self.listeners.write().push(listener);
    }

    /// Remove every occurrence of `listener`. Returns how many were removed.
    pub fn remove(&self, listener: &Listener<E>) -> usize {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|l| !Arc::ptr_eq(l, listener));
        before - listeners.len()
    }

    pub fn len(&self) -> usize {
        self.listeners.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.listeners.read().is_empty()
    }

    /// Deliver `event` to every observer in registration order.
    ///
    /// Returns the number of observers that handled it without error.
    pub fn emit(&self, event: &E) -> usize {
        // Snapshot so observers may (un)register while we deliver
        let snapshot: Vec<Listener<E>> = self.listeners.read().clone();
        let mut delivered = 0;

        for (index, listener) in snapshot.iter().enumerate() {
            match panic::catch_unwind(AssertUnwindSafe(|| listener(event))) {
                Ok(Ok(())) => delivered += 1,
                Ok(Err(e)) => {
                    error!("{} listener #{} failed: {:#}", self.category, index, e);
                }
                Err(_) => {
                    error!("{} listener #{} panicked", self.category, index);
                }
            }
        }

        debug!(
            "{} event delivered to {}/{} listeners",
            self.category,
            delivered,
            snapshot.len()
        );
        delivered
    }
}

/// The two registries shared by the connection core and its consumers.
pub struct EventBus {
    messages: Registry<MessageEvent>,
    connections: Registry<ConnectionEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            messages: Registry::new("message"),
            connections: Registry::new("connection"),
        }
    }

    pub fn messages(&self) -> &Registry<MessageEvent> {
        &self.messages
    }

    pub fn connections(&self) -> &Registry<ConnectionEvent> {
        &self.connections
    }
}
