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

//! An in-memory mailbox.
//!
//! A `Mailbox` is the source of truth for the messages, flags and UID
//! validity of one mailbox, shared by every session that has it selected as
//! well as by background delivery. Every mutation is published to the
//! mailbox's listeners as `MailboxEvent`s.
//!
//! Events are published while the mailbox's internal lock is held. This makes
//! each mailbox the single serialisation point for its events: every listener
//! observes the same sequence, and a listener that snapshots the mailbox
//! through `with_message_uids()` sees exactly the events that happened after
//! its snapshot.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::{debug, info};

use super::events::*;
use super::model::*;
use crate::support::error::Error;
use crate::support::system_config::MailboxConfig;

pub struct Mailbox {
    log_prefix: String,
    uid_validity: u32,
    permanent_flags: Vec<Flag>,
    allow_keywords: bool,
    data: Mutex<MailboxData>,
    dispatcher: EventDispatcher,
}

struct MailboxData {
    name: String,
    /// The UID the next appended message will get, or `None` if the UID
    /// space is exhausted.
    next_uid: Option<Uid>,
    messages: BTreeMap<Uid, MessageMetadata>,
    deleted: bool,
}

impl MailboxData {
    fn check_live(&self) -> Result<(), Error> {
        if self.deleted {
            Err(Error::MailboxDeleted)
        } else {
            Ok(())
        }
    }
}

impl Mailbox {
    pub fn new(
        name: String,
        uid_validity: u32,
        config: &MailboxConfig,
    ) -> Result<Self, Error> {
        let log_prefix = format!("mailbox:{}", name);
        Ok(Mailbox {
            dispatcher: EventDispatcher::new(log_prefix.clone()),
            log_prefix,
            uid_validity,
            permanent_flags: config.parsed_permanent_flags()?,
            allow_keywords: config.allow_keywords,
            data: Mutex::new(MailboxData {
                name,
                next_uid: Some(Uid::MIN),
                messages: BTreeMap::new(),
                deleted: false,
            }),
        })
    }

    /// Return the current name of this mailbox.
    pub fn name(&self) -> String {
        self.data.lock().unwrap().name.clone()
    }

    pub fn uid_validity(&self) -> u32 {
        self.uid_validity
    }

    pub fn permanent_flags(&self) -> &[Flag] {
        &self.permanent_flags
    }

    /// Whether keywords beyond `permanent_flags()` may be stored.
    pub fn allow_keywords(&self) -> bool {
        self.allow_keywords
    }

    /// Return whether this mailbox has been deleted.
    pub fn is_deleted(&self) -> bool {
        self.data.lock().unwrap().deleted
    }

    pub fn message_count(&self) -> usize {
        self.data.lock().unwrap().messages.len()
    }

    pub fn recent_count(&self) -> usize {
        self.data
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| m.recent)
            .count()
    }

    pub fn unseen_count(&self) -> usize {
        self.data
            .lock()
            .unwrap()
            .messages
            .values()
            .filter(|m| !m.has_flag(&Flag::Seen))
            .count()
    }

    /// Return the UID the next appended message will receive.
    pub fn uid_next(&self) -> Uid {
        self.data.lock().unwrap().next_uid.unwrap_or(Uid::MAX)
    }

    /// Return the UIDs of all messages currently in the mailbox, ascending.
    pub fn message_uids(&self) -> Result<Vec<Uid>, Error> {
        self.with_message_uids(|uids| uids)
    }

    /// Invoke `f` with the UIDs of all messages currently in the mailbox,
    /// ascending.
    ///
    /// No mutation (and therefore no event) can happen while `f` runs, so a
    /// listener can use this to take a snapshot that is exactly consistent
    /// with the events it receives afterwards. `f` must not call back into
    /// this mailbox.
    pub fn with_message_uids<R>(
        &self,
        f: impl FnOnce(Vec<Uid>) -> R,
    ) -> Result<R, Error> {
        let data = self.data.lock().unwrap();
        data.check_live()?;
        Ok(f(data.messages.keys().copied().collect()))
    }

    /// Return the metadata of the message with the given UID.
    pub fn metadata(&self, uid: Uid) -> Result<MessageMetadata, Error> {
        let data = self.data.lock().unwrap();
        data.check_live()?;
        data.messages.get(&uid).cloned().ok_or(Error::NxMessage)
    }

    /// Return whether the given message exists and is `\Recent`.
    pub fn is_recent(&self, uid: Uid) -> bool {
        self.data
            .lock()
            .unwrap()
            .messages
            .get(&uid)
            .map_or(false, |m| m.recent)
    }

    /// Add a new message to the mailbox, returning its UID.
    ///
    /// The new message is `\Recent`.
    pub fn append(
        &self,
        flags: Vec<Flag>,
        internal_date: DateTime<FixedOffset>,
        size: u32,
        origin: Option<SessionId>,
    ) -> Result<Uid, Error> {
        self.check_flags(&flags)?;

        let mut data = self.data.lock().unwrap();
        data.check_live()?;
        let uid = data.next_uid.ok_or(Error::MailboxFull)?;
        data.next_uid = uid.next();

        let mut normalised = Vec::with_capacity(flags.len());
        for flag in flags {
            if !normalised.contains(&flag) {
                normalised.push(flag);
            }
        }

        data.messages.insert(
            uid,
            MessageMetadata {
                uid,
                flags: normalised,
                internal_date,
                size,
                recent: true,
            },
        );
        debug!(
            "{} Appended {:?} ({} bytes) for {:?}",
            self.log_prefix, uid, size, origin
        );

        self.dispatcher.event(&MailboxEvent::Added { uid });
        Ok(uid)
    }

    /// Set (`value == true`) or clear the given flags on the given messages.
    ///
    /// See `store()` for the return value.
    pub fn set_flags(
        &self,
        uids: &[Uid],
        flags: &[Flag],
        value: bool,
        origin: Option<SessionId>,
    ) -> Result<Vec<(Uid, Vec<Flag>)>, Error> {
        let mode = if value {
            StoreMode::Add
        } else {
            StoreMode::Remove
        };
        self.store(uids, mode, flags, origin)
    }

    /// Make the flags of the given messages exactly `flags`.
    ///
    /// See `store()` for the return value.
    pub fn replace_flags(
        &self,
        uids: &[Uid],
        flags: &[Flag],
        origin: Option<SessionId>,
    ) -> Result<Vec<(Uid, Vec<Flag>)>, Error> {
        self.store(uids, StoreMode::Replace, flags, origin)
    }

    /// Modify the flags of the given messages according to `mode`.
    ///
    /// UIDs which do not refer to existing messages are ignored. A
    /// `FlagsUpdated` event tagged with `origin` is published for every
    /// message whose flags actually changed.
    ///
    /// Returns the UID and resulting flags of every existing message in
    /// `uids`, whether or not it changed.
    pub fn store(
        &self,
        uids: &[Uid],
        mode: StoreMode,
        flags: &[Flag],
        origin: Option<SessionId>,
    ) -> Result<Vec<(Uid, Vec<Flag>)>, Error> {
        self.check_flags(flags)?;

        let mut data = self.data.lock().unwrap();
        data.check_live()?;

        let mut ret = Vec::with_capacity(uids.len());
        for &uid in uids {
            let message = match data.messages.get_mut(&uid) {
                Some(m) => m,
                None => continue,
            };

            let mut new_flags = match mode {
                StoreMode::Add | StoreMode::Remove => message.flags.clone(),
                StoreMode::Replace => Vec::new(),
            };
            for flag in flags {
                match mode {
                    StoreMode::Add | StoreMode::Replace => {
                        if !new_flags.contains(flag) {
                            new_flags.push(flag.clone());
                        }
                    }
                    StoreMode::Remove => new_flags.retain(|f| f != flag),
                }
            }

            let changed = new_flags.len() != message.flags.len()
                || new_flags.iter().any(|f| !message.flags.contains(f));
            if changed {
                message.flags = new_flags.clone();
                self.dispatcher.event(&MailboxEvent::FlagsUpdated {
                    uid,
                    flags: new_flags.clone(),
                    origin,
                });
            }

            ret.push((uid, new_flags));
        }

        Ok(ret)
    }

    /// Permanently remove every message with the `\Deleted` flag.
    ///
    /// Returns the removed UIDs, ascending.
    pub fn expunge(
        &self,
        origin: Option<SessionId>,
    ) -> Result<Vec<Uid>, Error> {
        self.expunge_matching(origin, |_| true)
    }

    /// Permanently remove every message in `uids` with the `\Deleted` flag.
    ///
    /// Returns the removed UIDs, ascending.
    pub fn expunge_uids(
        &self,
        uids: &[Uid],
        origin: Option<SessionId>,
    ) -> Result<Vec<Uid>, Error> {
        self.expunge_matching(origin, |uid| uids.contains(&uid))
    }

    fn expunge_matching(
        &self,
        origin: Option<SessionId>,
        filter: impl Fn(Uid) -> bool,
    ) -> Result<Vec<Uid>, Error> {
        let mut data = self.data.lock().unwrap();
        data.check_live()?;

        let doomed = data
            .messages
            .values()
            .filter(|m| m.has_flag(&Flag::Deleted) && filter(m.uid))
            .map(|m| m.uid)
            .collect::<Vec<_>>();

        for &uid in &doomed {
            data.messages.remove(&uid);
            self.dispatcher.event(&MailboxEvent::Expunged { uid });
        }

        if !doomed.is_empty() {
            info!(
                "{} Expunged {} message(s) for {:?}",
                self.log_prefix,
                doomed.len(),
                origin
            );
        }

        Ok(doomed)
    }

    /// Return the UIDs of all messages matching `query`, ascending.
    pub fn search(&self, query: &SearchQuery) -> Result<Vec<Uid>, Error> {
        let data = self.data.lock().unwrap();
        data.check_live()?;
        Ok(data
            .messages
            .values()
            .filter(|m| query.matches(m))
            .map(|m| m.uid)
            .collect())
    }

    /// Copy the given messages into `dest`.
    ///
    /// The copies keep their flags and internal date and are `\Recent` in
    /// `dest`. UIDs which do not refer to existing messages are ignored.
    ///
    /// Returns (source UID, destination UID) pairs in the order the copies
    /// were made.
    pub fn copy_to(
        &self,
        uids: &[Uid],
        dest: &Mailbox,
        origin: Option<SessionId>,
    ) -> Result<Vec<(Uid, Uid)>, Error> {
        // Release our own lock before touching `dest`, which may be `self`.
        let sources = {
            let data = self.data.lock().unwrap();
            data.check_live()?;
            uids.iter()
                .filter_map(|uid| data.messages.get(uid))
                .cloned()
                .collect::<Vec<_>>()
        };

        let mut ret = Vec::with_capacity(sources.len());
        for source in sources {
            let dest_uid = dest.append(
                source.flags,
                source.internal_date,
                source.size,
                origin,
            )?;
            ret.push((source.uid, dest_uid));
        }

        Ok(ret)
    }

    /// Clear the `\Recent` status of the given messages.
    ///
    /// This is not a flag change from the perspective of listeners and
    /// publishes nothing.
    pub fn clear_recent(&self, uids: &[Uid]) {
        let mut data = self.data.lock().unwrap();
        for uid in uids {
            if let Some(message) = data.messages.get_mut(uid) {
                message.recent = false;
            }
        }
    }

    pub fn add_listener(
        &self,
        listener: Arc<dyn MailboxListener>,
    ) -> ListenerId {
        self.dispatcher.add_listener(listener)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.dispatcher.remove_listener(id)
    }

    pub fn listener_count(&self) -> usize {
        self.dispatcher.listener_count()
    }

    /// Mark the mailbox deleted and tell every listener.
    ///
    /// All further operations fail with `Error::MailboxDeleted`.
    pub(super) fn mark_deleted(&self) {
        let mut data = self.data.lock().unwrap();
        if data.deleted {
            return;
        }

        data.deleted = true;
        data.messages.clear();
        info!("{} Deleted", self.log_prefix);
        self.dispatcher.event(&MailboxEvent::MailboxDeleted);
    }

    /// Change the name of the mailbox and tell every listener.
    pub(super) fn rename(&self, new_name: String) {
        let mut data = self.data.lock().unwrap();
        info!("{} Renamed to {}", self.log_prefix, new_name);
        data.name = new_name.clone();
        self.dispatcher
            .event(&MailboxEvent::MailboxRenamed { new_name });
    }

    fn check_flags(&self, flags: &[Flag]) -> Result<(), Error> {
        if self.allow_keywords {
            return Ok(());
        }

        if flags
            .iter()
            .any(|f| f.is_keyword() && !self.permanent_flags.contains(f))
        {
            Err(Error::KeywordsNotAllowed)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub fn date() -> DateTime<FixedOffset> {
        FixedOffset::east(0).ymd(2020, 1, 1).and_hms(12, 0, 0)
    }

    /// Create a mailbox named `INBOX` containing `n` messages with UIDs
    /// `1..=n`.
    pub fn mailbox_with(n: u32) -> Arc<Mailbox> {
        let mailbox = Arc::new(
            Mailbox::new("INBOX".to_owned(), 42, &MailboxConfig::default())
                .unwrap(),
        );
        for _ in 0..n {
            mailbox.append(vec![], date(), 100, None).unwrap();
        }
        mailbox
    }
}
