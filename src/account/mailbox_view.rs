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

//! A session's view of a selected mailbox.
//!
//! Other sessions and background delivery mutate the mailbox at any time,
//! but a client may only learn about those changes when the protocol allows
//! the server to tell it, and its sequence numbers must not move until then.
//! `MailboxView` receives the mailbox's events (on whatever thread produced
//! them), keeps the session's `SeqnumMap` and buffers what the client has
//! not yet been told. The owning session drains it at the points where
//! unsolicited responses are permitted.
//!
//! The lifecycle is `Unbuilt → Building → Active → Closed`. The sequence
//! number map is built lazily from a snapshot of the mailbox on first use.
//! `Added` events are ignored until the snapshot is installed since the
//! snapshot already contains those UIDs. A closed view ignores all events
//! and drains to nothing.
//!
//! Lock order is always mailbox, then view: event callbacks run under the
//! mailbox's lock, and the snapshot is installed from inside
//! `Mailbox::with_message_uids()`. No method of this type calls into the
//! mailbox while holding the view's own lock.

use std::collections::{BTreeMap, BTreeSet};
use std::mem;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::prelude::*;
use log::{debug, info, warn};

use super::events::*;
use super::mailbox::Mailbox;
use super::model::*;
use super::seqnum_map::SeqnumMap;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ViewPhase {
    /// The sequence number map has not been built yet.
    Unbuilt,
    /// The snapshot of the mailbox is being taken.
    Building,
    /// The sequence number map tracks the mailbox.
    Active,
    /// The view has been torn down.
    Closed,
}

/// A flag change translated into the view's current sequence numbers.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct FlagUpdate {
    pub seqnum: Seqnum,
    pub uid: Uid,
    pub flags: Vec<Flag>,
}

/// Everything a session must tell its client at one poll point.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PollResponse {
    /// If the mailbox grew since the last poll, the new size.
    ///
    /// This counts messages with pending expungements, since the client has
    /// not been told about those yet.
    ///
    /// `* exists EXISTS`
    pub exists: Option<usize>,
    /// Flag changes made by other sessions, ascending.
    ///
    /// `* seqnum FETCH (FLAGS (...))`
    pub flags: Vec<FlagUpdate>,
    /// Expungements, each numbered against the sequence number space as
    /// shrunk by the ones before it. Send in this order.
    ///
    /// `* seqnum EXPUNGE`
    pub expunged: Vec<(Seqnum, Uid)>,
}

pub struct MailboxView {
    log_prefix: LogPrefix,
    session: SessionId,
    mailbox: Arc<Mailbox>,
    read_only: bool,
    listener: Mutex<Option<ListenerId>>,
    state: Mutex<ViewState>,
}

struct ViewState {
    phase: ViewPhase,
    seqnums: SeqnumMap,
    /// Set when a new UID enters `seqnums`; cleared when `EXISTS` is sent.
    size_changed: bool,
    /// UIDs expunged from the mailbox which are still in `seqnums`.
    pending_expunge: BTreeSet<Uid>,
    /// The latest flags of each message changed by another session.
    pending_flags: BTreeMap<Uid, Vec<Flag>>,
    name: String,
    deleted: bool,
}

impl ViewState {
    fn close(&mut self) {
        self.phase = ViewPhase::Closed;
        self.seqnums = SeqnumMap::new();
        self.size_changed = false;
        self.pending_expunge.clear();
        self.pending_flags.clear();
    }

    fn flag_events(&mut self, reset: bool) -> Vec<FlagUpdate> {
        let pending = if reset {
            mem::take(&mut self.pending_flags)
        } else {
            self.pending_flags.clone()
        };

        // Changes to UIDs the client can't address any more, or that came in
        // before the snapshot and were already gone from it, are dropped.
        pending
            .into_iter()
            .filter_map(|(uid, flags)| {
                self.seqnums
                    .seqnum(uid)
                    .ok()
                    .map(|seqnum| FlagUpdate { seqnum, uid, flags })
            })
            .collect()
    }

    fn expunged_events(&mut self, reset: bool) -> Vec<(Seqnum, Uid)> {
        let mut ret = Vec::with_capacity(self.pending_expunge.len());

        if reset {
            for uid in mem::take(&mut self.pending_expunge) {
                // Fails for UIDs expunged before the snapshot was taken, which
                // the client never saw.
                if let Ok(seqnum) = self.seqnums.expunge(uid) {
                    ret.push((seqnum, uid));
                }
            }
        } else {
            // Pending UIDs are visited ascending, so each one shifts down by
            // the number of removals before it.
            for &uid in &self.pending_expunge {
                if let Ok(seqnum) = self.seqnums.seqnum(uid) {
                    let shifted = seqnum.0.get() - ret.len() as u32;
                    ret.push((Seqnum::of(shifted).unwrap_or(Seqnum::MIN), uid));
                }
            }
        }

        ret
    }
}

impl MailboxView {
    /// Create a view of `mailbox` for `session` and register it as a
    /// listener.
    ///
    /// The sequence number map is not built until first needed; call
    /// `ensure_built()` to surface snapshot errors immediately.
    pub fn open(
        session: SessionId,
        mailbox: Arc<Mailbox>,
        read_only: bool,
        log_prefix: LogPrefix,
    ) -> Arc<Self> {
        let name = mailbox.name();
        let view = Arc::new(MailboxView {
            log_prefix,
            session,
            mailbox: Arc::clone(&mailbox),
            read_only,
            listener: Mutex::new(None),
            state: Mutex::new(ViewState {
                phase: ViewPhase::Unbuilt,
                seqnums: SeqnumMap::new(),
                size_changed: false,
                pending_expunge: BTreeSet::new(),
                pending_flags: BTreeMap::new(),
                name,
                deleted: false,
            }),
        });

        let listener = Arc::clone(&view) as Arc<dyn MailboxListener>;
        let id = mailbox.add_listener(listener);
        *view.listener.lock().unwrap() = Some(id);
        view
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    pub fn mailbox(&self) -> &Arc<Mailbox> {
        &self.mailbox
    }

    pub fn read_only(&self) -> bool {
        self.read_only
    }

    pub fn phase(&self) -> ViewPhase {
        self.state.lock().unwrap().phase
    }

    /// Return the name of the mailbox, following renames.
    pub fn name(&self) -> String {
        self.state.lock().unwrap().name.clone()
    }

    /// Return whether the view was closed because its mailbox was deleted.
    pub fn is_deleted(&self) -> bool {
        self.state.lock().unwrap().deleted
    }

    /// Build the sequence number map if that has not happened yet.
    ///
    /// Fails if the mailbox cannot be read, in which case the view stays
    /// unbuilt. Does nothing on a closed view.
    pub fn ensure_built(&self) -> Result<(), Error> {
        {
            let mut state = self.state.lock().unwrap();
            match state.phase {
                ViewPhase::Active | ViewPhase::Closed => return Ok(()),
                ViewPhase::Unbuilt | ViewPhase::Building => {
                    state.phase = ViewPhase::Building
                }
            }
        }

        let result = self
            .mailbox
            .with_message_uids(|uids| {
                let mut state = self.state.lock().unwrap();
                // Closed while we were waiting for the mailbox
                if ViewPhase::Building != state.phase {
                    return Ok(());
                }

                state.seqnums = SeqnumMap::from_uids(uids)?;
                state.size_changed = false;
                state.phase = ViewPhase::Active;
                debug!(
                    "{} Built sequence numbers for {} messages",
                    self.log_prefix,
                    state.seqnums.len()
                );
                Ok(())
            })
            .and_then(|r| r);

        if let Err(ref e) = result {
            warn!(
                "{} Failed to snapshot {}: {}",
                self.log_prefix,
                self.mailbox.name(),
                e
            );
            let mut state = self.state.lock().unwrap();
            if ViewPhase::Building == state.phase {
                state.phase = ViewPhase::Unbuilt;
            }
        }

        result
    }

    /// Lock the state of a view which must be usable for a command.
    fn active_state(&self) -> Result<MutexGuard<'_, ViewState>, Error> {
        self.ensure_built()?;
        let state = self.state.lock().unwrap();
        let phase = state.phase;
        match phase {
            ViewPhase::Active => Ok(state),
            _ if state.deleted => Err(Error::MailboxDeleted),
            _ => Err(Error::NoMailboxSelected),
        }
    }

    /// Return the number of messages the client currently knows about,
    /// including those with pending expungements.
    pub fn exists(&self) -> Result<usize, Error> {
        Ok(self.active_state()?.seqnums.len())
    }

    /// Record that the client has just been told the current size (e.g. by
    /// `SELECT`), returning that size.
    pub fn announce(&self) -> Result<usize, Error> {
        let mut state = self.active_state()?;
        state.size_changed = false;
        Ok(state.seqnums.len())
    }

    /// Return whether new messages have appeared since the size was last
    /// reported.
    pub fn size_changed(&self) -> bool {
        self.state.lock().unwrap().size_changed
    }

    /// Return the buffered flag changes translated to current sequence
    /// numbers, ascending.
    ///
    /// If `reset`, the buffer is emptied.
    pub fn flag_events(&self, reset: bool) -> Result<Vec<FlagUpdate>, Error> {
        self.ensure_built()?;
        let mut state = self.state.lock().unwrap();
        if ViewPhase::Active != state.phase {
            return Ok(Vec::new());
        }

        Ok(state.flag_events(reset))
    }

    /// Return the buffered expungements with their sequence numbers.
    ///
    /// Expungements are processed in ascending UID order. The sequence number
    /// of each is computed against the map as shrunk by the ones before it,
    /// so expunging the messages at 3, 5 and 7 yields 3, 4, 5.
    ///
    /// If `reset`, the messages are removed from the sequence number map as
    /// they are returned. Otherwise nothing changes and the result is what a
    /// reset call would return right now.
    pub fn expunged_events(
        &self,
        reset: bool,
    ) -> Result<Vec<(Seqnum, Uid)>, Error> {
        self.ensure_built()?;
        let mut state = self.state.lock().unwrap();
        if ViewPhase::Active != state.phase {
            return Ok(Vec::new());
        }

        Ok(state.expunged_events(reset))
    }

    /// Drain everything the client should be told now, as one consistent
    /// unit.
    ///
    /// If `omit_expunged`, expungements stay buffered and the sequence number
    /// map is not shrunk.
    pub fn poll(&self, omit_expunged: bool) -> Result<PollResponse, Error> {
        self.ensure_built()?;
        let mut state = self.state.lock().unwrap();
        if ViewPhase::Active != state.phase {
            return Ok(PollResponse::default());
        }

        let mut response = PollResponse::default();
        if mem::take(&mut state.size_changed) {
            response.exists = Some(state.seqnums.len());
        }

        response.flags = state.flag_events(true);
        if !omit_expunged {
            response.expunged = state.expunged_events(true);
        }

        Ok(response)
    }

    /// Translate a sequence number the client sent into a UID.
    pub fn seqnum_to_uid(&self, seqnum: Seqnum) -> Result<Uid, Error> {
        self.active_state()?.seqnums.uid(seqnum)
    }

    /// Translate a UID into the sequence number the client knows it by.
    pub fn uid_to_seqnum(&self, uid: Uid) -> Result<Seqnum, Error> {
        self.active_state()?.seqnums.seqnum(uid)
    }

    /// Return the sequence number of the first message without `\Seen`.
    pub fn first_unseen(&self) -> Result<Option<Seqnum>, Error> {
        self.ensure_built()?;
        let unseen = self.mailbox.search(&SearchQuery::NotFlag(Flag::Seen))?;
        let state = self.active_state()?;
        Ok(unseen
            .into_iter()
            .filter_map(|uid| state.seqnums.seqnum(uid).ok())
            .min())
    }

    pub fn uid_validity(&self) -> u32 {
        self.mailbox.uid_validity()
    }

    pub fn message_count(&self) -> usize {
        self.mailbox.message_count()
    }

    pub fn recent_count(&self) -> usize {
        self.mailbox.recent_count()
    }

    pub fn unseen_count(&self) -> usize {
        self.mailbox.unseen_count()
    }

    pub fn permanent_flags(&self) -> &[Flag] {
        self.mailbox.permanent_flags()
    }

    pub fn is_recent(&self, uid: Uid) -> bool {
        self.mailbox.is_recent(uid)
    }

    /// Append a message to the mailbox on behalf of this session.
    pub fn append(
        &self,
        flags: Vec<Flag>,
        internal_date: DateTime<FixedOffset>,
        size: u32,
    ) -> Result<AppendResponse, Error> {
        self.ensure_built()?;
        let uid =
            self.mailbox
                .append(flags, internal_date, size, Some(self.session))?;
        let seqnum = self.state.lock().unwrap().seqnums.seqnum(uid).ok();
        Ok(AppendResponse {
            uid_validity: self.mailbox.uid_validity(),
            uid,
            seqnum,
        })
    }

    /// Search the mailbox, returning the matches the client can address.
    pub fn search(
        &self,
        query: &SearchQuery,
    ) -> Result<Vec<(Seqnum, Uid)>, Error> {
        self.ensure_built()?;
        let uids = self.mailbox.search(query)?;
        let state = self.active_state()?;
        Ok(uids
            .into_iter()
            .filter_map(|uid| state.seqnums.seqnum(uid).ok().map(|s| (s, uid)))
            .collect())
    }

    /// Copy the given messages into `dest`.
    pub fn copy(
        &self,
        uids: &[Uid],
        dest: &Mailbox,
    ) -> Result<Vec<CopiedMessage>, Error> {
        self.ensure_built()?;
        let copied = self.mailbox.copy_to(uids, dest, Some(self.session))?;
        let state = self.state.lock().unwrap();
        Ok(copied
            .into_iter()
            .map(|(source_uid, dest_uid)| CopiedMessage {
                source_uid,
                source_seqnum: state.seqnums.seqnum(source_uid).ok(),
                dest_uid,
            })
            .collect())
    }

    /// Change flags on behalf of this session.
    ///
    /// The change is silent: this view does not buffer it. Instead the
    /// resulting flags of every addressable message in `uids` are returned
    /// for the command's own `FETCH` responses.
    pub fn store(
        &self,
        uids: &[Uid],
        mode: StoreMode,
        flags: &[Flag],
    ) -> Result<Vec<FlagUpdate>, Error> {
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }

        self.ensure_built()?;
        let result =
            self.mailbox.store(uids, mode, flags, Some(self.session))?;
        let state = self.state.lock().unwrap();
        Ok(result
            .into_iter()
            .filter_map(|(uid, flags)| {
                state
                    .seqnums
                    .seqnum(uid)
                    .ok()
                    .map(|seqnum| FlagUpdate { seqnum, uid, flags })
            })
            .collect())
    }

    /// Expunge all `\Deleted` messages.
    ///
    /// The expungements reach this view as events like everyone else's and
    /// are reported through the next non-omitting poll.
    pub fn expunge(&self) -> Result<Vec<Uid>, Error> {
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }

        self.mailbox.expunge(Some(self.session))
    }

    /// Expunge the `\Deleted` messages among `uids`.
    pub fn expunge_uids(&self, uids: &[Uid]) -> Result<Vec<Uid>, Error> {
        if self.read_only {
            return Err(Error::MailboxReadOnly);
        }

        self.mailbox.expunge_uids(uids, Some(self.session))
    }

    /// Tear down the view.
    ///
    /// Once this returns, events have no effect on the view. For a read-write
    /// view, the messages it made known to the client lose `\Recent`.
    pub fn close(&self) {
        let seen = {
            let mut state = self.state.lock().unwrap();
            let seen = if !self.read_only && ViewPhase::Active == state.phase
            {
                state.seqnums.uids().collect::<Vec<_>>()
            } else {
                Vec::new()
            };
            state.close();
            seen
        };

        if let Some(id) = self.listener.lock().unwrap().take() {
            self.mailbox.remove_listener(id);
            debug!("{} Closed view of {}", self.log_prefix, self.name());
        }

        if !seen.is_empty() {
            self.mailbox.clear_recent(&seen);
        }
    }
}

impl MailboxListener for MailboxView {
    fn mailbox_event(&self, event: &MailboxEvent) -> Result<(), Error> {
        let mut state = self.state.lock().unwrap();
        if ViewPhase::Closed == state.phase {
            return Ok(());
        }

        match *event {
            MailboxEvent::Added { uid } => {
                // Before the map is active, the snapshot covers this UID.
                if ViewPhase::Active == state.phase {
                    state.seqnums.add(uid)?;
                    state.size_changed = true;
                }
            }
            MailboxEvent::Expunged { uid } => {
                state.pending_expunge.insert(uid);
            }
            MailboxEvent::FlagsUpdated {
                uid,
                ref flags,
                origin,
            } => {
                if origin != Some(self.session) {
                    state.pending_flags.insert(uid, flags.clone());
                } else if let Some(pending) = state.pending_flags.get_mut(&uid)
                {
                    // A queued foreign change must not outlive our own.
                    *pending = flags.clone();
                }
            }
            MailboxEvent::MailboxDeleted => {
                info!(
                    "{} Mailbox {} deleted while selected",
                    self.log_prefix, state.name
                );
                state.deleted = true;
                state.close();
            }
            MailboxEvent::MailboxRenamed { ref new_name } => {
                state.name = new_name.clone();
                self.log_prefix.set_mailbox(Some(new_name.clone()));
            }
        }

        Ok(())
    }
}
