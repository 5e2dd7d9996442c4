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

//! The per-connection protocol session, as far as mailbox consistency is
//! concerned.
//!
//! A session owns at most one selected `MailboxView`. After each command it
//! drains the view into unsolicited responses, always in the order `EXISTS`
//! and `RECENT`, then `FETCH`, then `EXPUNGE`. After the non-UID forms of
//! `FETCH`, `STORE` and `SEARCH`, RFC 3501 forbids `EXPUNGE` responses since
//! the client could not tell which sequence numbers in the command's own
//! output they applied to, so expunges stay queued until a later command.

use std::convert::TryFrom;
use std::sync::Arc;

use chrono::prelude::*;
use log::{error, info};

use super::response_writer::ResponseWriter;
use crate::account::account::Account;
use crate::account::mailbox::Mailbox;
use crate::account::mailbox_view::MailboxView;
use crate::account::model::*;
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;

/// The command just completed, as far as polling is concerned.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CommandKind {
    Fetch,
    Store,
    Search,
    UidFetch,
    UidStore,
    UidSearch,
    /// Anything else, including `NOOP`, `CHECK`, `EXPUNGE` and `UID` forms
    /// of other commands.
    Other,
}

impl CommandKind {
    /// Whether `EXPUNGE` responses may follow the command's own output.
    pub fn allows_expunge(self) -> bool {
        !matches!(
            self,
            CommandKind::Fetch | CommandKind::Store | CommandKind::Search
        )
    }
}

pub struct Session {
    id: SessionId,
    log_prefix: LogPrefix,
    account: Arc<Account>,
    selected: Option<Arc<MailboxView>>,
}

impl Session {
    pub fn new(log_prefix: LogPrefix, account: Arc<Account>) -> Self {
        let id = SessionId::next();
        log_prefix.set_session(id);
        Session {
            id,
            log_prefix,
            account,
            selected: None,
        }
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn log_prefix(&self) -> &LogPrefix {
        &self.log_prefix
    }

    /// The `SELECT` and `EXAMINE` commands.
    pub fn select(
        &mut self,
        name: &str,
        read_only: bool,
    ) -> Result<SelectResponse, Error> {
        // RFC 3501 requires the old mailbox to be deselected even if
        // selecting the new one fails.
        self.deselect();
        let mailbox = self.account.mailbox(name)?;
        self.set_selected(mailbox, read_only)
    }

    /// Make `mailbox` the selected mailbox, replacing any previous
    /// selection.
    ///
    /// If the mailbox cannot be read, nothing is selected afterwards.
    pub fn set_selected(
        &mut self,
        mailbox: Arc<Mailbox>,
        read_only: bool,
    ) -> Result<SelectResponse, Error> {
        self.deselect();

        let view = MailboxView::open(
            self.id,
            Arc::clone(&mailbox),
            read_only,
            self.log_prefix.clone(),
        );
        let response = match select_response(&view, &mailbox) {
            Ok(r) => r,
            Err(e) => {
                view.close();
                return Err(e);
            }
        };

        self.log_prefix.set_mailbox(Some(view.name()));
        info!(
            "{} Selected {} ({} messages, {})",
            self.log_prefix,
            view.name(),
            response.exists,
            if read_only { "read-only" } else { "read-write" }
        );
        self.selected = Some(view);
        Ok(response)
    }

    /// Drop the current selection, if any.
    pub fn deselect(&mut self) {
        if let Some(view) = self.selected.take() {
            view.close();
            self.log_prefix.set_mailbox(None);
        }
    }

    pub fn selected(&self) -> Option<&Arc<MailboxView>> {
        self.selected.as_ref()
    }

    fn selected_view(&self) -> Result<&Arc<MailboxView>, Error> {
        self.selected.as_ref().ok_or(Error::NoMailboxSelected)
    }

    /// Send everything the client must be told about changes made by others.
    ///
    /// If `omit_expunged`, expungements remain queued for a later call.
    ///
    /// If the selected mailbox has been deleted, the session is deselected and
    /// `Error::MailboxDeleted` is returned; the client should be
    /// disconnected.
    pub fn unsolicited_responses(
        &mut self,
        writer: &mut dyn ResponseWriter,
        omit_expunged: bool,
    ) -> Result<(), Error> {
        let view = match self.selected {
            Some(ref view) => Arc::clone(view),
            None => return Ok(()),
        };

        if view.is_deleted() {
            self.deselect();
            return Err(Error::MailboxDeleted);
        }

        let poll = view.poll(omit_expunged)?;
        if let Some(exists) = poll.exists {
            writer.exists_response(u32::try_from(exists).unwrap_or(u32::MAX))?;
            writer.recent_response(
                u32::try_from(view.recent_count()).unwrap_or(u32::MAX),
            )?;
        }

        for update in poll.flags {
            writer.fetch_response(
                update.seqnum,
                &flags_line(&update.flags, view.is_recent(update.uid)),
            )?;
        }

        for (seqnum, _) in poll.expunged {
            writer.expunge_response(seqnum)?;
        }

        Ok(())
    }

    /// Poll as permitted after a command of the given kind completes.
    pub fn after_command(
        &mut self,
        kind: CommandKind,
        writer: &mut dyn ResponseWriter,
    ) -> Result<(), Error> {
        let res = self.unsolicited_responses(writer, !kind.allows_expunge());
        if let Err(ref e) = res {
            error!("{} Poll failed: {}", self.log_prefix, e);
        }
        res
    }

    /// The `APPEND` command.
    pub fn append(
        &mut self,
        name: &str,
        flags: Vec<Flag>,
        internal_date: DateTime<FixedOffset>,
        size: u32,
    ) -> Result<AppendResponse, Error> {
        let mailbox = self.account.mailbox(name)?;
        if let Some(view) = self.selected.as_ref() {
            if Arc::ptr_eq(view.mailbox(), &mailbox) {
                return view.append(flags, internal_date, size);
            }
        }

        let uid = mailbox.append(flags, internal_date, size, Some(self.id))?;
        Ok(AppendResponse {
            uid_validity: mailbox.uid_validity(),
            uid,
            seqnum: None,
        })
    }

    /// Translate a client message set into UIDs.
    ///
    /// With `uid`, the numbers are UIDs and those that do not exist are
    /// silently skipped; otherwise they are sequence numbers, which must all
    /// be valid.
    pub fn resolve(&self, ids: &[u32], uid: bool) -> Result<Vec<Uid>, Error> {
        let view = self.selected_view()?;
        let mut ret = Vec::with_capacity(ids.len());
        for &id in ids {
            if uid {
                let uid = Uid::of(id).ok_or(Error::NxMessage)?;
                if view.uid_to_seqnum(uid).is_ok() {
                    ret.push(uid);
                }
            } else {
                let seqnum = Seqnum::of(id).ok_or(Error::NxMessage)?;
                ret.push(view.seqnum_to_uid(seqnum)?);
            }
        }
        Ok(ret)
    }

    /// The `FETCH (FLAGS)` command, writing the command's own responses.
    pub fn fetch_flags(
        &mut self,
        uids: &[Uid],
        writer: &mut dyn ResponseWriter,
    ) -> Result<(), Error> {
        let view = self.selected_view()?;
        let mut lines = Vec::with_capacity(uids.len());
        for &uid in uids {
            let seqnum = view.uid_to_seqnum(uid)?;
            // The client can still address a message which is gone from the
            // mailbox, but there is nothing left to fetch.
            let flags = match view.mailbox().metadata(uid) {
                Ok(metadata) => metadata.flags,
                Err(Error::NxMessage) => return Err(Error::ExpungedMessage),
                Err(e) => return Err(e),
            };
            lines.push((seqnum, flags_line(&flags, view.is_recent(uid))));
        }

        for (seqnum, line) in lines {
            writer.fetch_response(seqnum, &line)?;
        }
        Ok(())
    }

    /// The `STORE` command.
    ///
    /// Unless `silent`, the resulting flags of each message are written as
    /// the command's own `FETCH` responses.
    pub fn store(
        &mut self,
        uids: &[Uid],
        mode: StoreMode,
        flags: &[Flag],
        silent: bool,
        writer: &mut dyn ResponseWriter,
    ) -> Result<(), Error> {
        let view = self.selected_view()?;
        let updates = view.store(uids, mode, flags)?;
        if !silent {
            for update in updates {
                writer.fetch_response(
                    update.seqnum,
                    &flags_line(&update.flags, view.is_recent(update.uid)),
                )?;
            }
        }
        Ok(())
    }

    /// The `EXPUNGE` command, or `UID EXPUNGE` if `uids` is given.
    ///
    /// The `EXPUNGE` responses themselves are produced by the following
    /// poll.
    pub fn expunge(&mut self, uids: Option<&[Uid]>) -> Result<(), Error> {
        let view = self.selected_view()?;
        match uids {
            Some(uids) => view.expunge_uids(uids)?,
            None => view.expunge()?,
        };
        Ok(())
    }

    /// The `SEARCH` command, returning sequence numbers (or UIDs if `uid`).
    pub fn search(
        &mut self,
        query: &SearchQuery,
        uid: bool,
    ) -> Result<Vec<u32>, Error> {
        let view = self.selected_view()?;
        Ok(view
            .search(query)?
            .into_iter()
            .map(|(seqnum, u)| if uid { u.0.get() } else { seqnum.0.get() })
            .collect())
    }

    /// The `COPY` command.
    pub fn copy(
        &mut self,
        uids: &[Uid],
        dest: &str,
    ) -> Result<Vec<CopiedMessage>, Error> {
        let dest = self.account.mailbox(dest)?;
        self.selected_view()?.copy(uids, &dest)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.deselect();
    }
}

fn select_response(
    view: &MailboxView,
    mailbox: &Mailbox,
) -> Result<SelectResponse, Error> {
    view.ensure_built()?;
    let unseen = view.first_unseen()?;
    Ok(SelectResponse {
        flags: mailbox.permanent_flags().to_vec(),
        exists: view.announce()?,
        recent: view.recent_count(),
        unseen,
        unseen_count: view.unseen_count(),
        uid_validity: view.uid_validity(),
        uid_next: mailbox.uid_next(),
        permanent_flags: mailbox.permanent_flags().to_vec(),
        permanent_keywords: mailbox.allow_keywords(),
        read_only: view.read_only(),
    })
}

#[cfg(test)]
mod test {
    use super::super::response_writer::UntaggedResponse;
    use super::*;
    use crate::account::mailbox::test_support::date;
    use crate::support::system_config::MailboxConfig;

    fn setup(n: u32) -> (Arc<Account>, Arc<Mailbox>) {
        crate::init_test_log();

        let account =
            Arc::new(Account::new("test".to_owned(), MailboxConfig::default()));
        account.init().unwrap();
        let inbox = account.mailbox("INBOX").unwrap();
        for _ in 0..n {
            inbox.append(vec![], date(), 10, None).unwrap();
        }
        inbox.clear_recent(&inbox.message_uids().unwrap());
        (account, inbox)
    }

    fn session(account: &Arc<Account>) -> Session {
        Session::new(LogPrefix::new("imap".to_owned()), Arc::clone(account))
    }

    fn fetch(seqnum: u32, flags_line: &str) -> UntaggedResponse {
        UntaggedResponse::Fetch(Seqnum::u(seqnum), flags_line.to_owned())
    }

    #[test]
    fn responses_follow_exists_fetch_expunge_order() {
        let (account, inbox) = setup(5);
        let mut a = session(&account);
        let mut b = session(&account);
        a.select("INBOX", false).unwrap();
        b.select("inbox", false).unwrap();

        let mut ignored = Vec::<UntaggedResponse>::new();
        b.store(
            &[Uid::u(3)],
            StoreMode::Add,
            &[Flag::Deleted],
            true,
            &mut ignored,
        )
        .unwrap();
        b.store(&[Uid::u(1)], StoreMode::Add, &[Flag::Seen], true, &mut ignored)
            .unwrap();
        b.expunge(None).unwrap();
        inbox.append(vec![], date(), 10, None).unwrap();
        assert!(ignored.is_empty());

        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert_eq!(
            vec![
                UntaggedResponse::Exists(6),
                UntaggedResponse::Recent(1),
                fetch(1, "FLAGS (\\Seen)"),
                fetch(3, "FLAGS (\\Deleted)"),
                UntaggedResponse::Expunge(Seqnum::u(3)),
            ],
            out
        );

        // The session that made the changes is not told about its own flag
        // updates, but does learn of the expunge and delivery.
        let mut out = Vec::<UntaggedResponse>::new();
        b.after_command(CommandKind::Other, &mut out).unwrap();
        assert_eq!(
            vec![
                UntaggedResponse::Exists(6),
                UntaggedResponse::Recent(1),
                UntaggedResponse::Expunge(Seqnum::u(3)),
            ],
            out
        );

        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn expunges_withheld_after_non_uid_fetch() {
        let (account, _inbox) = setup(5);
        let mut a = session(&account);
        let mut b = session(&account);
        a.select("INBOX", false).unwrap();
        b.select("INBOX", false).unwrap();

        let mut ignored = Vec::<UntaggedResponse>::new();
        let victims = b.resolve(&[2, 4], false).unwrap();
        b.store(&victims, StoreMode::Add, &[Flag::Deleted], true, &mut ignored)
            .unwrap();
        b.expunge(Some(&victims)).unwrap();

        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::Fetch, &mut out).unwrap();
        assert_eq!(
            vec![fetch(2, "FLAGS (\\Deleted)"), fetch(4, "FLAGS (\\Deleted)")],
            out
        );
        // Still addressable by the old numbers
        assert_eq!(vec![Uid::u(4)], a.resolve(&[4], false).unwrap());

        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::UidFetch, &mut out).unwrap();
        assert_eq!(
            vec![
                UntaggedResponse::Expunge(Seqnum::u(2)),
                UntaggedResponse::Expunge(Seqnum::u(3)),
            ],
            out
        );
        assert_eq!(vec![Uid::u(5)], a.resolve(&[3], false).unwrap());
    }

    #[test]
    fn command_kinds() {
        assert!(!CommandKind::Fetch.allows_expunge());
        assert!(!CommandKind::Store.allows_expunge());
        assert!(!CommandKind::Search.allows_expunge());
        assert!(CommandKind::UidFetch.allows_expunge());
        assert!(CommandKind::UidStore.allows_expunge());
        assert!(CommandKind::UidSearch.allows_expunge());
        assert!(CommandKind::Other.allows_expunge());
    }

    #[test]
    fn select_reports_mailbox_state() {
        let (account, inbox) = setup(3);
        inbox
            .set_flags(&[Uid::u(1)], &[Flag::Seen], true, None)
            .unwrap();
        inbox.append(vec![], date(), 10, None).unwrap();

        let mut a = session(&account);
        let response = a.select("INBOX", true).unwrap();
        assert_eq!(4, response.exists);
        assert_eq!(1, response.recent);
        assert_eq!(Some(Seqnum::u(2)), response.unseen);
        assert_eq!(3, response.unseen_count);
        assert_eq!(inbox.uid_validity(), response.uid_validity);
        assert_eq!(Uid::u(5), response.uid_next);
        assert!(response.permanent_keywords);
        assert!(response.read_only);
        assert_eq!(5, response.permanent_flags.len());

        // Nothing left to report right after selecting
        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert!(out.is_empty());
    }

    #[test]
    fn read_only_selection_rejects_store() {
        let (account, _inbox) = setup(2);
        let mut a = session(&account);
        a.select("INBOX", true).unwrap();

        let mut out = Vec::<UntaggedResponse>::new();
        assert_matches!(
            Err(Error::MailboxReadOnly),
            a.store(
                &[Uid::u(1)],
                StoreMode::Add,
                &[Flag::Seen],
                false,
                &mut out
            )
        );
        assert_matches!(Err(Error::MailboxReadOnly), a.expunge(None));
    }

    #[test]
    fn store_reports_own_fetch_unless_silent() {
        let (account, _inbox) = setup(2);
        let mut a = session(&account);
        a.select("INBOX", false).unwrap();

        let mut out = Vec::<UntaggedResponse>::new();
        a.store(&[Uid::u(2)], StoreMode::Add, &[Flag::Flagged], false, &mut out)
            .unwrap();
        assert_eq!(vec![fetch(2, "FLAGS (\\Flagged)")], out);

        let mut out = Vec::<UntaggedResponse>::new();
        a.store(&[Uid::u(2)], StoreMode::Replace, &[], true, &mut out)
            .unwrap();
        a.fetch_flags(&[Uid::u(1), Uid::u(2)], &mut out).unwrap();
        a.after_command(CommandKind::Store, &mut out).unwrap();
        assert_eq!(vec![fetch(1, "FLAGS ()"), fetch(2, "FLAGS ()")], out);
    }

    #[test]
    fn fetch_of_expunged_message_fails() {
        let (account, inbox) = setup(3);
        let mut a = session(&account);
        a.select("INBOX", false).unwrap();

        inbox
            .set_flags(&[Uid::u(2)], &[Flag::Deleted], true, None)
            .unwrap();
        inbox.expunge(None).unwrap();

        // Sequence number 2 still refers to UID 2 until the client is told
        let mut out = Vec::<UntaggedResponse>::new();
        assert_eq!(vec![Uid::u(2)], a.resolve(&[2], false).unwrap());
        assert_matches!(
            Err(Error::ExpungedMessage),
            a.fetch_flags(&[Uid::u(1), Uid::u(2)], &mut out)
        );
        assert!(out.is_empty());

        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert_eq!(
            vec![
                fetch(2, "FLAGS (\\Deleted)"),
                UntaggedResponse::Expunge(Seqnum::u(2)),
            ],
            out
        );
    }

    #[test]
    fn own_store_supersedes_queued_foreign_flags() {
        let (account, inbox) = setup(2);
        let mut a = session(&account);
        a.select("INBOX", false).unwrap();

        inbox
            .set_flags(&[Uid::u(1)], &[Flag::Seen], true, None)
            .unwrap();
        let mut out = Vec::<UntaggedResponse>::new();
        a.store(&[Uid::u(1)], StoreMode::Add, &[Flag::Flagged], true, &mut out)
            .unwrap();
        assert!(out.is_empty());

        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert_eq!(vec![fetch(1, "FLAGS (\\Seen \\Flagged)")], out);
    }

    #[test]
    fn deleted_mailbox_ends_selection() {
        let (account, _inbox) = setup(0);
        let work = account.create("Work").unwrap();
        let mut a = session(&account);
        a.select("Work", false).unwrap();
        assert_eq!(1, work.listener_count());

        account.delete("Work").unwrap();
        let mut out = Vec::<UntaggedResponse>::new();
        assert_matches!(
            Err(Error::MailboxDeleted),
            a.unsolicited_responses(&mut out, false)
        );
        assert!(a.selected().is_none());
        assert_eq!(0, work.listener_count());
        assert_matches!(Err(Error::NoMailboxSelected), a.expunge(None));
    }

    #[test]
    fn append_and_copy() {
        let (account, inbox) = setup(2);
        account.create("Archive").unwrap();
        let mut a = session(&account);
        a.select("INBOX", false).unwrap();

        let appended = a.append("INBOX", vec![], date(), 5).unwrap();
        assert_eq!(Uid::u(3), appended.uid);
        assert_eq!(Some(Seqnum::u(3)), appended.seqnum);

        let appended = a.append("Archive", vec![], date(), 5).unwrap();
        assert_eq!(Uid::u(1), appended.uid);
        assert_eq!(None, appended.seqnum);

        let copied = a.copy(&[Uid::u(2)], "Archive").unwrap();
        assert_eq!(Uid::u(2), copied[0].dest_uid);
        assert_eq!(Some(Seqnum::u(2)), copied[0].source_seqnum);

        // Own append is still announced by the next poll
        let mut out = Vec::<UntaggedResponse>::new();
        a.after_command(CommandKind::Other, &mut out).unwrap();
        assert_eq!(
            vec![UntaggedResponse::Exists(3), UntaggedResponse::Recent(1)],
            out
        );
        assert_eq!(3, inbox.message_count());
    }

    #[test]
    fn resolve_and_search() {
        let (account, inbox) = setup(4);
        inbox
            .set_flags(&[Uid::u(2), Uid::u(4)], &[Flag::Answered], true, None)
            .unwrap();
        let mut a = session(&account);
        assert_matches!(
            Err(Error::NoMailboxSelected),
            a.resolve(&[1], false)
        );
        a.select("INBOX", false).unwrap();

        assert_matches!(Err(Error::NxMessage), a.resolve(&[5], false));
        assert_matches!(Err(Error::NxMessage), a.resolve(&[0], false));
        assert_eq!(
            vec![Uid::u(1), Uid::u(4)],
            a.resolve(&[1, 9, 4], true).unwrap()
        );

        let query = SearchQuery::Flag(Flag::Answered);
        assert_eq!(vec![2, 4], a.search(&query, false).unwrap());
        assert_eq!(vec![2, 4], a.search(&query, true).unwrap());
    }

    #[test]
    fn dropping_session_closes_view() {
        let (account, inbox) = setup(1);
        {
            let mut a = session(&account);
            a.select("INBOX", false).unwrap();
            assert_eq!(1, inbox.listener_count());
        }
        assert_eq!(0, inbox.listener_count());
    }
}
