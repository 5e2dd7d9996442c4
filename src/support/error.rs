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

use std::io;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("No such message")]
    NxMessage,
    #[error("Message has been expunged")]
    ExpungedMessage,
    #[error("UID already has a sequence number")]
    DuplicateUid,
    #[error("UID is not greater than every tracked UID")]
    UidOutOfOrder,
    #[error("No such mailbox")]
    NxMailbox,
    #[error("Mailbox already exists")]
    MailboxExists,
    #[error("Operation not allowed on INBOX")]
    BadOperationOnInbox,
    #[error("Mailbox has been deleted")]
    MailboxDeleted,
    #[error("Mailbox is read-only")]
    MailboxReadOnly,
    #[error("Mailbox full")]
    MailboxFull,
    #[error("No mailbox selected")]
    NoMailboxSelected,
    #[error("Non-existent system flag")]
    NxFlag,
    #[error("Unsafe key or mailbox name")]
    UnsafeName,
    #[error("Keywords are not permitted in this mailbox")]
    KeywordsNotAllowed,
    #[error("Delivery worker has stopped")]
    DeliveryStopped,
    #[error("Invalid replay script: {0}")]
    BadScript(String),
    #[error(transparent)]
    Io(#[from] io::Error),
    #[error(transparent)]
    Toml(#[from] toml::de::Error),
}
