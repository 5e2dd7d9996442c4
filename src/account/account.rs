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

use std::borrow::Cow;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use chrono::prelude::*;
use log::info;

use super::mailbox::Mailbox;
use crate::support::error::Error;
use crate::support::system_config::MailboxConfig;

/// The set of mailboxes belonging to one user.
pub struct Account {
    log_prefix: String,
    config: MailboxConfig,
    registry: Mutex<Registry>,
}

struct Registry {
    mailboxes: BTreeMap<String, Arc<Mailbox>>,
    last_uid_validity: u32,
}

impl Account {
    pub fn new(log_prefix: String, config: MailboxConfig) -> Self {
        Account {
            log_prefix,
            config,
            registry: Mutex::new(Registry {
                mailboxes: BTreeMap::new(),
                last_uid_validity: 0,
            }),
        }
    }

    pub fn config(&self) -> &MailboxConfig {
        &self.config
    }

    /// Perform minimal initialisation of the account.
    ///
    /// This ensures that INBOX exists.
    pub fn init(&self) -> Result<(), Error> {
        match self.create("INBOX") {
            Ok(_) | Err(Error::MailboxExists) => Ok(()),
            Err(e) => Err(e),
        }
    }

    /// Perform full provisioning of the account.
    ///
    /// In addition to everything `init()` does, this also creates the common
    /// mailboxes Archive, Drafts, Spam, Sent and Trash if they do not exist.
    pub fn provision(&self) -> Result<(), Error> {
        self.init()?;
        for name in &["Archive", "Drafts", "Spam", "Sent", "Trash"] {
            match self.create(name) {
                Ok(_) | Err(Error::MailboxExists) => (),
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }

    /// Create a new, empty mailbox.
    pub fn create(&self, name: &str) -> Result<Arc<Mailbox>, Error> {
        let name = normalise_name(name)?;

        let mut registry = self.registry.lock().unwrap();
        if registry.mailboxes.contains_key(&*name) {
            return Err(Error::MailboxExists);
        }

        // UID validity values must never repeat for a name, even if a mailbox
        // is deleted and recreated within the same second.
        let uid_validity = (Utc::now().timestamp() as u32)
            .max(registry.last_uid_validity.wrapping_add(1))
            .max(1);
        registry.last_uid_validity = uid_validity;

        let mailbox = Arc::new(Mailbox::new(
            name.clone().into_owned(),
            uid_validity,
            &self.config,
        )?);
        registry
            .mailboxes
            .insert(name.clone().into_owned(), Arc::clone(&mailbox));
        info!(
            "{} Created mailbox {} with UID validity {}",
            self.log_prefix, name, uid_validity
        );
        Ok(mailbox)
    }

    /// Look up the mailbox with the given name.
    pub fn mailbox(&self, name: &str) -> Result<Arc<Mailbox>, Error> {
        let name = normalise_name(name)?;
        self.registry
            .lock()
            .unwrap()
            .mailboxes
            .get(&*name)
            .cloned()
            .ok_or(Error::NxMailbox)
    }

    /// Return the names of all mailboxes, sorted.
    pub fn list(&self) -> Vec<String> {
        self.registry
            .lock()
            .unwrap()
            .mailboxes
            .keys()
            .cloned()
            .collect()
    }

    /// Delete the named mailbox.
    ///
    /// Sessions which have it selected are told through their views.
    pub fn delete(&self, name: &str) -> Result<(), Error> {
        let name = normalise_name(name)?;
        if "INBOX" == name {
            return Err(Error::BadOperationOnInbox);
        }

        let mailbox = self
            .registry
            .lock()
            .unwrap()
            .mailboxes
            .remove(&*name)
            .ok_or(Error::NxMailbox)?;
        mailbox.mark_deleted();
        info!("{} Deleted mailbox {}", self.log_prefix, name);
        Ok(())
    }

    /// Rename the mailbox `from` to `to`.
    pub fn rename(&self, from: &str, to: &str) -> Result<(), Error> {
        let from = normalise_name(from)?;
        let to = normalise_name(to)?;
        if "INBOX" == from || "INBOX" == to {
            return Err(Error::BadOperationOnInbox);
        }

        let mailbox = {
            let mut registry = self.registry.lock().unwrap();
            if registry.mailboxes.contains_key(&*to) {
                return Err(Error::MailboxExists);
            }

            let mailbox = registry
                .mailboxes
                .remove(&*from)
                .ok_or(Error::NxMailbox)?;
            registry
                .mailboxes
                .insert(to.clone().into_owned(), Arc::clone(&mailbox));
            mailbox
        };

        mailbox.rename(to.into_owned());
        Ok(())
    }
}

/// Validate `name` and map any capitalisation of `INBOX` to `INBOX`.
fn normalise_name(name: &str) -> Result<Cow<'_, str>, Error> {
    if name.is_empty()
        || name.len() > 255
        || name
            .chars()
            .any(|c| c.is_control() || '*' == c || '%' == c)
    {
        return Err(Error::UnsafeName);
    }

    if name.eq_ignore_ascii_case("INBOX") {
        Ok(Cow::Borrowed("INBOX"))
    } else {
        Ok(Cow::Borrowed(name))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn account() -> Account {
        let account =
            Account::new("test".to_owned(), MailboxConfig::default());
        account.init().unwrap();
        account
    }

    #[test]
    fn inbox_is_case_insensitive() {
        let account = account();
        assert_eq!("INBOX", account.mailbox("inbox").unwrap().name());
        assert_matches!(
            Err(Error::MailboxExists),
            account.create("Inbox").map(|_| ())
        );
        assert_matches!(
            Err(Error::BadOperationOnInbox),
            account.delete("iNbOx")
        );
        // Idempotent
        account.init().unwrap();
    }

    #[test]
    fn provision_creates_common_mailboxes() {
        let account = account();
        account.provision().unwrap();
        account.provision().unwrap();
        assert_eq!(
            vec!["Archive", "Drafts", "INBOX", "Sent", "Spam", "Trash"],
            account.list()
        );
    }

    #[test]
    fn uid_validity_never_repeats() {
        let account = account();
        let first = account.create("Work").unwrap().uid_validity();
        account.delete("Work").unwrap();
        let second = account.create("Work").unwrap().uid_validity();
        assert!(second > first);
    }

    #[test]
    fn delete_marks_mailbox_deleted() {
        let account = account();
        let mailbox = account.create("Junk").unwrap();
        account.delete("Junk").unwrap();

        assert!(mailbox.is_deleted());
        assert_matches!(
            Err(Error::NxMailbox),
            account.mailbox("Junk").map(|_| ())
        );
        assert_matches!(Err(Error::NxMailbox), account.delete("Junk"));
    }

    #[test]
    fn rename_moves_mailbox() {
        let account = account();
        let mailbox = account.create("Old").unwrap();
        account.create("Taken").unwrap();

        assert_matches!(
            Err(Error::MailboxExists),
            account.rename("Old", "Taken")
        );
        assert_matches!(Err(Error::NxMailbox), account.rename("Nx", "New"));
        assert_matches!(
            Err(Error::BadOperationOnInbox),
            account.rename("INBOX", "New")
        );

        account.rename("Old", "New").unwrap();
        assert_eq!("New", mailbox.name());
        assert!(Arc::ptr_eq(&mailbox, &account.mailbox("New").unwrap()));
        assert_matches!(
            Err(Error::NxMailbox),
            account.mailbox("Old").map(|_| ())
        );
    }

    #[test]
    fn unsafe_names_rejected() {
        let account = account();
        assert_matches!(
            Err(Error::UnsafeName),
            account.create("").map(|_| ())
        );
        assert_matches!(
            Err(Error::UnsafeName),
            account.create("a*b").map(|_| ())
        );
        assert_matches!(
            Err(Error::UnsafeName),
            account.create("a\nb").map(|_| ())
        );
    }
}
