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

//! The bidirectional mapping between UIDs and one session's sequence numbers.
//!
//! Nothing here does I/O or locking; `MailboxView` owns one of these behind
//! its own lock.

use super::model::*;
use crate::support::error::Error;

/// An order-preserving bijection between the UIDs a session currently knows
/// about and the sequence numbers `1..=len()`.
///
/// The sequence number of a UID is always its 1-based rank among the tracked
/// UIDs, so the mapping never has gaps or duplicates.
///
/// Removing a UID shifts every later sequence number down by one. That is the
/// renumbering a client performs when it receives `EXPUNGE`, so `expunge()`
/// must only be called at the point the client is told.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SeqnumMap {
    /// The tracked UIDs, strictly ascending. Sequence numbers correspond (with
    /// bias 1) to the indices of this array.
    uids: Vec<Uid>,
}

impl SeqnumMap {
    /// Return a new, empty mapping.
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a mapping from a snapshot of the live UIDs of a mailbox.
    ///
    /// Fails with `Error::UidOutOfOrder` or `Error::DuplicateUid` if `uids` is
    /// not strictly ascending.
    pub fn from_uids(
        uids: impl IntoIterator<Item = Uid>,
    ) -> Result<Self, Error> {
        let mut this = Self::new();
        for uid in uids {
            this.add(uid)?;
        }
        Ok(this)
    }

    /// Return the number of tracked UIDs, which is also the greatest sequence
    /// number.
    pub fn len(&self) -> usize {
        self.uids.len()
    }

    pub fn is_empty(&self) -> bool {
        self.uids.is_empty()
    }

    /// Track `uid` with the sequence number `len() + 1`, and return that
    /// sequence number.
    ///
    /// `uid` must be greater than every UID already tracked. If it is already
    /// tracked, fails with `Error::DuplicateUid`; if it is merely too small,
    /// fails with `Error::UidOutOfOrder`. Either indicates a logic error in
    /// the caller.
    pub fn add(&mut self, uid: Uid) -> Result<Seqnum, Error> {
        if let Some(&last) = self.uids.last() {
            if uid <= last {
                return Err(if self.contains(uid) {
                    Error::DuplicateUid
                } else {
                    Error::UidOutOfOrder
                });
            }
        }

        self.uids.push(uid);
        Ok(Seqnum::from_index(self.uids.len() - 1))
    }

    /// Return whether `uid` is currently tracked.
    pub fn contains(&self, uid: Uid) -> bool {
        self.uids.binary_search(&uid).is_ok()
    }

    /// Translate `uid` into its current sequence number.
    ///
    /// Fails with `Error::NxMessage` if `uid` is not tracked. This is expected
    /// under races (e.g. the UID was expunged and already reported) and the
    /// caller must tolerate it.
    pub fn seqnum(&self, uid: Uid) -> Result<Seqnum, Error> {
        self.uids
            .binary_search(&uid)
            .map(Seqnum::from_index)
            .map_err(|_| Error::NxMessage)
    }

    /// Translate `seqnum` into the UID it currently refers to.
    ///
    /// Fails with `Error::NxMessage` if `seqnum` is greater than `len()`.
    pub fn uid(&self, seqnum: Seqnum) -> Result<Uid, Error> {
        self.uids
            .get(seqnum.to_index())
            .copied()
            .ok_or(Error::NxMessage)
    }

    /// Stop tracking `uid`, returning the sequence number it had immediately
    /// before removal.
    ///
    /// Every UID after it moves down by one sequence number.
    pub fn expunge(&mut self, uid: Uid) -> Result<Seqnum, Error> {
        let ix = self
            .uids
            .binary_search(&uid)
            .map_err(|_| Error::NxMessage)?;
        self.uids.remove(ix);
        Ok(Seqnum::from_index(ix))
    }

    /// Return an iterator to the tracked UIDs in sequence number order.
    pub fn uids(&self) -> impl Iterator<Item = Uid> + '_ {
        self.uids.iter().copied()
    }
}
