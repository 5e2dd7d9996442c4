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

//! Output side of unsolicited responses.
//!
//! The session only decides which untagged responses to send, in which order
//! and with which numbers. A `ResponseWriter` turns those into whatever the
//! connection needs.

use std::fmt;
use std::io::Write;

use crate::account::model::Seqnum;
use crate::support::error::Error;

pub trait ResponseWriter {
    /// `* exists EXISTS`
    fn exists_response(&mut self, exists: u32) -> Result<(), Error>;
    /// `* recent RECENT`
    fn recent_response(&mut self, recent: u32) -> Result<(), Error>;
    /// `* seqnum FETCH (flags_line)`, where `flags_line` is e.g.
    /// `FLAGS (\Seen)`.
    fn fetch_response(
        &mut self,
        seqnum: Seqnum,
        flags_line: &str,
    ) -> Result<(), Error>;
    /// `* seqnum EXPUNGE`
    fn expunge_response(&mut self, seqnum: Seqnum) -> Result<(), Error>;
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum UntaggedResponse {
    Exists(u32),
    Recent(u32),
    Fetch(Seqnum, String),
    Expunge(Seqnum),
}

impl fmt::Display for UntaggedResponse {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match *self {
            UntaggedResponse::Exists(n) => write!(f, "* {} EXISTS", n),
            UntaggedResponse::Recent(n) => write!(f, "* {} RECENT", n),
            UntaggedResponse::Fetch(seqnum, ref flags_line) => {
                write!(f, "* {} FETCH ({})", seqnum.0, flags_line)
            }
            UntaggedResponse::Expunge(seqnum) => {
                write!(f, "* {} EXPUNGE", seqnum.0)
            }
        }
    }
}

/// Records responses in order, for inspection.
impl ResponseWriter for Vec<UntaggedResponse> {
    fn exists_response(&mut self, exists: u32) -> Result<(), Error> {
        self.push(UntaggedResponse::Exists(exists));
        Ok(())
    }

    fn recent_response(&mut self, recent: u32) -> Result<(), Error> {
        self.push(UntaggedResponse::Recent(recent));
        Ok(())
    }

    fn fetch_response(
        &mut self,
        seqnum: Seqnum,
        flags_line: &str,
    ) -> Result<(), Error> {
        self.push(UntaggedResponse::Fetch(seqnum, flags_line.to_owned()));
        Ok(())
    }

    fn expunge_response(&mut self, seqnum: Seqnum) -> Result<(), Error> {
        self.push(UntaggedResponse::Expunge(seqnum));
        Ok(())
    }
}

/// Writes each response as a CRLF-terminated line, optionally preceded by a
/// fixed label.
pub struct LineWriter<W> {
    out: W,
    label: Option<String>,
}

impl<W: Write> LineWriter<W> {
    pub fn new(out: W) -> Self {
        LineWriter { out, label: None }
    }

    pub fn with_label(out: W, label: String) -> Self {
        LineWriter {
            out,
            label: Some(label),
        }
    }

    pub fn into_inner(self) -> W {
        self.out
    }

    /// Write an arbitrary line, such as a tagged status.
    pub fn line(&mut self, line: impl fmt::Display) -> Result<(), Error> {
        if let Some(ref label) = self.label {
            write!(self.out, "{}: ", label)?;
        }
        write!(self.out, "{}\r\n", line)?;
        Ok(())
    }
}

impl<W: Write> ResponseWriter for LineWriter<W> {
    fn exists_response(&mut self, exists: u32) -> Result<(), Error> {
        self.line(UntaggedResponse::Exists(exists))
    }

    fn recent_response(&mut self, recent: u32) -> Result<(), Error> {
        self.line(UntaggedResponse::Recent(recent))
    }

    fn fetch_response(
        &mut self,
        seqnum: Seqnum,
        flags_line: &str,
    ) -> Result<(), Error> {
        self.line(UntaggedResponse::Fetch(seqnum, flags_line.to_owned()))
    }

    fn expunge_response(&mut self, seqnum: Seqnum) -> Result<(), Error> {
        self.line(UntaggedResponse::Expunge(seqnum))
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn line_writer_formats_rfc3501() {
        let mut writer = LineWriter::new(Vec::<u8>::new());
        writer.exists_response(3).unwrap();
        writer.recent_response(1).unwrap();
        writer
            .fetch_response(Seqnum::u(2), "FLAGS (\\Seen \\Recent)")
            .unwrap();
        writer.expunge_response(Seqnum::u(3)).unwrap();

        assert_eq!(
            "* 3 EXISTS\r\n\
             * 1 RECENT\r\n\
             * 2 FETCH (FLAGS (\\Seen \\Recent))\r\n\
             * 3 EXPUNGE\r\n",
            String::from_utf8(writer.into_inner()).unwrap()
        );
    }

    #[test]
    fn labelled_lines() {
        let mut writer =
            LineWriter::with_label(Vec::<u8>::new(), "alice".to_owned());
        writer.expunge_response(Seqnum::u(1)).unwrap();
        writer.line("OK").unwrap();
        assert_eq!(
            "alice: * 1 EXPUNGE\r\nalice: OK\r\n",
            String::from_utf8(writer.into_inner()).unwrap()
        );
    }
}
