//-
// Copyright (c) 2020, 2024, Jason Lingle
//
// This file is part of Postern.
//
// Postern is free software: you can  redistribute it and/or modify it under
// the terms of the GNU General Public License as published by the Free
// Software Foundation, either version 3 of the License, or (at your option)
// any later version.
//
// Postern is distributed in the hope that it will be useful, but WITHOUT ANY
// WARRANTY; without  even the implied  warranty of MERCHANTABILITY  or FITNESS
// FOR  A PARTICULAR  PURPOSE.  See the  GNU General  Public  License for  more
// details.
//
// You should have received a copy of the GNU General Public License along with
// Postern. If not, see <http://www.gnu.org/licenses/>.

//! Change notifications published by a mailbox to the sessions viewing it.

use std::sync::{Arc, Mutex};

use log::warn;

use super::model::*;
use crate::support::error::Error;

/// A change to a mailbox.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum MailboxEvent {
    /// A message was added with the given UID, which is greater than every
    /// UID previously published by the mailbox.
    Added { uid: Uid },
    /// The message with the given UID was permanently removed.
    Expunged { uid: Uid },
    /// The flags of the message with the given UID are now `flags`.
    ///
    /// `origin` identifies the session that made the change, if any.
    FlagsUpdated {
        uid: Uid,
        flags: Vec<Flag>,
        origin: Option<SessionId>,
    },
    /// The mailbox was deleted. No further events follow.
    MailboxDeleted,
    /// The mailbox was renamed.
    MailboxRenamed { new_name: String },
}

/// Receives `MailboxEvent`s from a dispatcher.
///
/// Implementations are invoked on whatever thread performed the mutation,
/// which is usually not the thread that owns the listener. They are also
/// invoked while the publishing mailbox holds its internal lock, so they must
/// complete quickly and must never call back into the mailbox.
pub trait MailboxListener: Send + Sync {
    fn mailbox_event(&self, event: &MailboxEvent) -> Result<(), Error>;
}

/// Identifies a listener registered with an `EventDispatcher`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

/// Synchronous fan-out of events to the listeners of one mailbox.
///
/// Events are delivered on the calling thread to every listener in
/// registration order. An error from one listener is logged and does not stop
/// delivery to the rest.
///
/// The dispatcher does not order concurrent calls to `event()` itself; the
/// owning mailbox serialises publication so that every listener sees events
/// in the same order.
pub struct EventDispatcher {
    log_prefix: String,
    inner: Mutex<Registry>,
}

#[derive(Default)]
struct Registry {
    next_id: u64,
    listeners: Vec<(ListenerId, Arc<dyn MailboxListener>)>,
}

impl EventDispatcher {
    pub fn new(log_prefix: String) -> Self {
        EventDispatcher {
            log_prefix,
            inner: Mutex::new(Registry::default()),
        }
    }

    /// Register `listener` to receive all future events.
    pub fn add_listener(
        &self,
        listener: Arc<dyn MailboxListener>,
    ) -> ListenerId {
        let mut inner = self.inner.lock().unwrap();
        let id = ListenerId(inner.next_id);
        inner.next_id += 1;
        inner.listeners.push((id, listener));
        id
    }

    /// Stop delivering events to the listener identified by `id`.
    ///
    /// Returns whether the listener was registered.
    pub fn remove_listener(&self, id: ListenerId) -> bool {
        let mut inner = self.inner.lock().unwrap();
        let before = inner.listeners.len();
        inner.listeners.retain(|&(lid, _)| lid != id);
        before != inner.listeners.len()
    }

    /// Return the number of registered listeners.
    pub fn listener_count(&self) -> usize {
        self.inner.lock().unwrap().listeners.len()
    }

    /// Deliver `event` to every registered listener.
    pub fn event(&self, event: &MailboxEvent) {
        // Listeners may deregister themselves (or others) while handling the
        // event, so deliver to a snapshot of the registry.
        let listeners = self
            .inner
            .lock()
            .unwrap()
            .listeners
            .iter()
            .map(|&(id, ref listener)| (id, Arc::clone(listener)))
            .collect::<Vec<_>>();

        for (id, listener) in listeners {
            if let Err(e) = listener.mailbox_event(event) {
                warn!(
                    "{} Listener {:?} failed to handle {:?}: {}",
                    self.log_prefix, id, event, e
                );
            }
        }
    }
}
