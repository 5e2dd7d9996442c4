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

use std::convert::{TryFrom, TryInto};
use std::fmt;
use std::num::NonZeroU32;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::prelude::*;
use serde::{Deserialize, Serialize};

use crate::support::error::Error;

/// Uniquely identifies a message within a single mailbox.
///
/// UIDs start at 1 and increase monotonically as messages are added to the
/// mailbox. UIDs are never reused within one UID validity epoch.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Uid(pub NonZeroU32);

impl fmt::Debug for Uid {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Uid({})", self.0.get())
    }
}

impl Uid {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Uid(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self = unsafe { Uid(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(uid: u32) -> Option<Self> {
        NonZeroU32::new(uid).map(Uid)
    }

    pub fn next(self) -> Option<Self> {
        if Uid::MAX == self {
            None
        } else {
            Uid::of(self.0.get() + 1)
        }
    }

    #[cfg(test)]
    pub fn u(uid: u32) -> Self {
        Uid::of(uid).unwrap()
    }
}

impl TryFrom<u32> for Uid {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Uid> for u32 {
    fn from(uid: Uid) -> u32 {
        uid.0.get()
    }
}

/// The sequence number of a message, as seen by one session.
///
/// The sequence number of a message is one plus the number of messages the
/// session still considers present that have a UID less than it. It only
/// shifts when the session is told about an expungement, never at the moment
/// the expungement actually happens.
#[derive(
    Deserialize, Serialize, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[serde(transparent)]
pub struct Seqnum(pub NonZeroU32);

impl Seqnum {
    // Unsafe because new() isn't const for some reason
    pub const MIN: Self = unsafe { Seqnum(NonZeroU32::new_unchecked(1)) };
    pub const MAX: Self =
        unsafe { Seqnum(NonZeroU32::new_unchecked(u32::MAX)) };

    pub fn of(seqnum: u32) -> Option<Self> {
        NonZeroU32::new(seqnum).map(Seqnum)
    }

    #[cfg(test)]
    pub fn u(seqnum: u32) -> Self {
        Seqnum::of(seqnum).unwrap()
    }

    pub fn to_index(self) -> usize {
        let u: Result<usize, _> = self.0.get().try_into();
        u.unwrap() - 1
    }

    pub fn from_index(ix: usize) -> Self {
        Seqnum::of((ix + 1).try_into().unwrap()).unwrap()
    }
}

impl TryFrom<u32> for Seqnum {
    type Error = ();

    fn try_from(v: u32) -> Result<Self, ()> {
        Self::of(v).ok_or(())
    }
}

impl From<Seqnum> for u32 {
    fn from(seqnum: Seqnum) -> u32 {
        seqnum.0.get()
    }
}

impl fmt::Debug for Seqnum {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Seqnum({})", self.0.get())
    }
}

/// Identifies one protocol session for the lifetime of the process.
///
/// Every mutating mailbox call carries the `SessionId` of the session that
/// caused it (or `None` for deliveries and administrative actions) so that
/// the originating session is not re-notified of its own flag changes.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Debug)]
pub struct SessionId(pub u64);

static NEXT_SESSION_ID: AtomicU64 = AtomicU64::new(1);

impl SessionId {
    /// Allocate a new, never before used, session ID.
    pub fn next() -> Self {
        SessionId(NEXT_SESSION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// A message flag.
///
/// System flags are represented as top-level enum values. Keywords are in the
/// `Keyword` case.
///
/// The `Display` format of this type is the exact string value that would be
/// sent over the wire. `FromStr` does the reverse conversion, and also
/// understands non-standard casing of the system flags.
///
/// `\Recent` is not represented by this enum since it isn't _really_ a flag.
#[derive(Clone, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Flag {
    Answered,
    Deleted,
    Draft,
    Flagged,
    Seen,
    Keyword(String),
}

impl fmt::Display for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            Flag::Answered => write!(f, "\\Answered"),
            Flag::Deleted => write!(f, "\\Deleted"),
            Flag::Draft => write!(f, "\\Draft"),
            Flag::Flagged => write!(f, "\\Flagged"),
            Flag::Seen => write!(f, "\\Seen"),
            Flag::Keyword(ref kw) => write!(f, "{}", kw),
        }
    }
}

impl TryFrom<String> for Flag {
    type Error = Error;

    fn try_from(s: String) -> Result<Self, Error> {
        s.parse()
    }
}

impl From<Flag> for String {
    fn from(flag: Flag) -> String {
        flag.to_string()
    }
}

impl fmt::Debug for Flag {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        <Flag as fmt::Display>::fmt(self, f)
    }
}

impl FromStr for Flag {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Error> {
        if s.eq_ignore_ascii_case("\\answered") {
            Ok(Flag::Answered)
        } else if s.eq_ignore_ascii_case("\\deleted") {
            Ok(Flag::Deleted)
        } else if s.eq_ignore_ascii_case("\\draft") {
            Ok(Flag::Draft)
        } else if s.eq_ignore_ascii_case("\\flagged") {
            Ok(Flag::Flagged)
        } else if s.eq_ignore_ascii_case("\\seen") {
            Ok(Flag::Seen)
        } else if s.starts_with('\\') {
            Err(Error::NxFlag)
        } else if !s.is_empty()
            && s.as_bytes().iter().copied().all(is_atom_char)
        {
            Ok(Flag::Keyword(s.to_owned()))
        } else {
            Err(Error::UnsafeName)
        }
    }
}

fn is_atom_char(ch: u8) -> bool {
    !matches!(
        ch,
        0..=b' '
            | 127..=255
            | b'('
            | b')'
            | b'{'
            | b'*'
            | b'%'
            | b'\\'
            | b'"'
            | b']'
    )
}

impl Flag {
    pub fn is_keyword(&self) -> bool {
        matches!(*self, Flag::Keyword(..))
    }
}

impl PartialEq for Flag {
    fn eq(&self, other: &Flag) -> bool {
        match (self, other) {
            (&Flag::Answered, &Flag::Answered) => true,
            (&Flag::Deleted, &Flag::Deleted) => true,
            (&Flag::Draft, &Flag::Draft) => true,
            (&Flag::Flagged, &Flag::Flagged) => true,
            (&Flag::Seen, &Flag::Seen) => true,
            // Keywords are matched ASCII case-insensitively
            (&Flag::Keyword(ref a), &Flag::Keyword(ref b)) => {
                a.eq_ignore_ascii_case(b)
            }
            _ => false,
        }
    }
}

impl Eq for Flag {}

/// Format the parenthesised flag list of a `FETCH (FLAGS ...)` response.
///
/// `\Recent` is appended if `recent` is set.
pub fn flags_line(flags: &[Flag], recent: bool) -> String {
    let mut line = "FLAGS (".to_owned();
    let mut first = true;
    for flag in flags {
        if !first {
            line.push(' ');
        }
        first = false;
        line.push_str(&flag.to_string());
    }
    if recent {
        if !first {
            line.push(' ');
        }
        line.push_str("\\Recent");
    }
    line.push(')');
    line
}

/// How a `STORE`-like operation combines the given flags with those already
/// on a message.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum StoreMode {
    /// Set the given flags, leaving others alone.
    Add,
    /// Clear the given flags, leaving others alone.
    Remove,
    /// Make the message's flags exactly the given set.
    Replace,
}

impl Default for StoreMode {
    fn default() -> Self {
        StoreMode::Add
    }
}

/// Everything the mailbox knows about one message.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MessageMetadata {
    pub uid: Uid,
    pub flags: Vec<Flag>,
    pub internal_date: DateTime<FixedOffset>,
    pub size: u32,
    /// Whether no session has yet reported this message to a client.
    pub recent: bool,
}

impl MessageMetadata {
    pub fn has_flag(&self, flag: &Flag) -> bool {
        self.flags.contains(flag)
    }
}

/// Criteria for a mailbox search.
///
/// This covers only what the mailbox itself can answer from metadata; full
/// `SEARCH` key evaluation belongs to the protocol layer.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SearchQuery {
    All,
    Flag(Flag),
    NotFlag(Flag),
    Recent,
    And(Vec<SearchQuery>),
}

impl SearchQuery {
    pub fn matches(&self, message: &MessageMetadata) -> bool {
        match *self {
            SearchQuery::All => true,
            SearchQuery::Flag(ref flag) => message.has_flag(flag),
            SearchQuery::NotFlag(ref flag) => !message.has_flag(flag),
            SearchQuery::Recent => message.recent,
            SearchQuery::And(ref parts) => {
                parts.iter().all(|part| part.matches(message))
            }
        }
    }
}

/// Information reported to the client when a mailbox is selected.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SelectResponse {
    /// `* flags FLAGS`
    pub flags: Vec<Flag>,
    /// `* exists EXISTS`
    pub exists: usize,
    /// `* recent RECENT`
    pub recent: usize,
    /// `* OK [UNSEEN unseen]`, omitted if `None`.
    pub unseen: Option<Seqnum>,
    /// The total number of messages without `\Seen`.
    pub unseen_count: usize,
    /// `* OK [UIDVALIDITY uidvalidity]`
    pub uid_validity: u32,
    /// `* OK [UIDNEXT uidnext]`
    pub uid_next: Uid,
    /// `* OK [PERMANENTFLAGS (permanent_flags)]`
    pub permanent_flags: Vec<Flag>,
    /// Whether `\*` is also listed in `PERMANENTFLAGS`.
    pub permanent_keywords: bool,
    /// `TAG OK [READ-WRITE|READ-ONLY]`
    pub read_only: bool,
}

/// The result of appending a message through a selected view.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct AppendResponse {
    pub uid_validity: u32,
    pub uid: Uid,
    /// The sequence number the new message was given in the appending view.
    pub seqnum: Option<Seqnum>,
}

/// One message copied by a `COPY`-like operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CopiedMessage {
    pub source_uid: Uid,
    /// The sequence number of the source message in the copying view.
    pub source_seqnum: Option<Seqnum>,
    pub dest_uid: Uid,
}
