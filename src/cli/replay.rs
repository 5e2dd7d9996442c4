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

//! Scripted multi-session scenarios.
//!
//! A script sets up mailboxes and then runs a list of steps, each performed
//! by a named session, the delivery agent or the administrator. Every line a
//! session would have sent its client is printed with the session's name, so
//! the interleaving of unsolicited responses can be inspected.
//!
//! ```toml
//! [[mailbox]]
//! name = "INBOX"
//! messages = 5
//!
//! [[step]]
//! action = "select"
//! session = "alice"
//! mailbox = "INBOX"
//!
//! [[step]]
//! action = "store"
//! session = "bob"
//! messages = [3]
//! flags = ['\Deleted']
//! ```

use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::sync::Arc;

use chrono::prelude::*;
use log::info;
use serde::Deserialize;

use super::main::ReplaySubcommand;
use crate::account::account::Account;
use crate::account::delivery::{DeliveryAgent, DeliveryRequest};
use crate::account::model::*;
use crate::imap::response_writer::{LineWriter, ResponseWriter};
use crate::imap::session::{CommandKind, Session};
use crate::support::error::Error;
use crate::support::log_prefix::LogPrefix;
use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(Deserialize, Debug, Default)]
#[serde(deny_unknown_fields)]
pub struct Script {
    #[serde(default)]
    pub mailbox: Vec<MailboxSetup>,
    #[serde(default)]
    pub step: Vec<Step>,
}

#[derive(Deserialize, Debug)]
#[serde(deny_unknown_fields)]
pub struct MailboxSetup {
    pub name: String,
    /// The number of messages to put in the mailbox initially.
    #[serde(default)]
    pub messages: u32,
}

#[derive(Deserialize, Debug)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum Step {
    Select {
        session: String,
        mailbox: String,
        #[serde(default)]
        read_only: bool,
    },
    Deselect {
        session: String,
    },
    Append {
        session: String,
        mailbox: String,
        #[serde(default)]
        flags: Vec<Flag>,
    },
    /// Deliver a message in the background, with no originating session.
    Deliver {
        mailbox: String,
        #[serde(default)]
        flags: Vec<Flag>,
    },
    Store {
        session: String,
        messages: Vec<u32>,
        #[serde(default)]
        uid: bool,
        #[serde(default)]
        mode: StoreMode,
        flags: Vec<Flag>,
        #[serde(default)]
        silent: bool,
    },
    /// `EXPUNGE`, or `UID EXPUNGE` if `messages` (UIDs) is given.
    Expunge {
        session: String,
        #[serde(default)]
        messages: Option<Vec<u32>>,
    },
    Noop {
        session: String,
    },
    /// `FETCH (FLAGS)`
    Fetch {
        session: String,
        messages: Vec<u32>,
        #[serde(default)]
        uid: bool,
    },
    Search {
        session: String,
        query: SearchQuery,
        #[serde(default)]
        uid: bool,
    },
    Copy {
        session: String,
        messages: Vec<u32>,
        #[serde(default)]
        uid: bool,
        dest: String,
    },
    CreateMailbox {
        name: String,
    },
    DeleteMailbox {
        name: String,
    },
    RenameMailbox {
        from: String,
        to: String,
    },
}

pub(super) fn replay(system_config: SystemConfig, cmd: ReplaySubcommand) {
    let script = match fs::read(&cmd.script)
        .map_err(Error::from)
        .and_then(|data| toml::from_slice::<Script>(&data).map_err(Error::from))
    {
        Ok(script) => script,
        Err(e) => die!(
            Sysexit::from(&e),
            "Failed to load '{}': {}",
            cmd.script.display(),
            e
        ),
    };

    let stdout = io::stdout();
    let mut stdout = stdout.lock();
    if let Err(e) = run(&system_config, &script, &mut stdout) {
        die!(Sysexit::from(&e), "Replay failed: {}", e);
    }
}

/// Run `script` against a fresh account, writing the output to `out`.
///
/// Failures of individual steps are reported in the output as they would be
/// to a client. Only failures to set up the scenario or to write the output
/// are returned.
pub fn run(
    system_config: &SystemConfig,
    script: &Script,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let account = Arc::new(Account::new(
        "replay".to_owned(),
        system_config.mailbox.clone(),
    ));
    account.init()?;

    for setup in &script.mailbox {
        let mailbox = match account.create(&setup.name) {
            Ok(mailbox) => mailbox,
            Err(Error::MailboxExists) => account.mailbox(&setup.name)?,
            Err(e) => return Err(e),
        };
        for _ in 0..setup.messages {
            mailbox.append(Vec::new(), now(), 0, None)?;
        }
    }

    let mut delivery = DeliveryAgent::start(
        "replay:delivery".to_owned(),
        Arc::clone(&account),
        system_config.delivery.queue_depth,
    );
    let mut sessions = BTreeMap::<String, Session>::new();

    for (ix, step) in script.step.iter().enumerate() {
        info!("replay Step {}: {:?}", ix + 1, step);
        run_step(&account, &delivery, &mut sessions, step, &mut *out)?;
    }

    // Deselect everything before the account goes away
    sessions.clear();
    delivery.shutdown();
    Ok(())
}

fn run_step(
    account: &Arc<Account>,
    delivery: &DeliveryAgent,
    sessions: &mut BTreeMap<String, Session>,
    step: &Step,
    out: &mut dyn Write,
) -> Result<(), Error> {
    let session_name = match *step {
        Step::Select { ref session, .. }
        | Step::Deselect { ref session }
        | Step::Append { ref session, .. }
        | Step::Store { ref session, .. }
        | Step::Expunge { ref session, .. }
        | Step::Noop { ref session }
        | Step::Fetch { ref session, .. }
        | Step::Search { ref session, .. }
        | Step::Copy { ref session, .. } => session,

        Step::Deliver {
            ref mailbox,
            ref flags,
        } => {
            let mut writer = LineWriter::with_label(out, "delivery".to_owned());
            return match delivery.deliver_and_wait(DeliveryRequest {
                mailbox: mailbox.clone(),
                flags: flags.clone(),
                internal_date: now(),
                size: 0,
            }) {
                Ok(uid) => {
                    writer.line(format_args!("OK {} {}", mailbox, uid.0))
                },
                Err(e) => writer.line(format_args!("NO {}", e)),
            };
        }

        Step::CreateMailbox { ref name } => {
            let result = account.create(name).map(|_| ());
            return admin_result(out, result);
        }
        Step::DeleteMailbox { ref name } => {
            return admin_result(out, account.delete(name));
        }
        Step::RenameMailbox { ref from, ref to } => {
            return admin_result(out, account.rename(from, to));
        }
    };

    let session = sessions.entry(session_name.clone()).or_insert_with(|| {
        Session::new(LogPrefix::new("replay".to_owned()), Arc::clone(account))
    });
    let mut writer = LineWriter::with_label(out, session_name.clone());

    let result = session_command(session, step, &mut writer);
    let kind = match result {
        Ok(kind) => kind,
        Err(e @ Error::Io(_)) => return Err(e),
        Err(e) => return writer.line(format_args!("NO {}", e)),
    };

    match session.after_command(kind, &mut writer) {
        Ok(()) => writer.line("OK"),
        Err(Error::MailboxDeleted) => {
            writer.line("BYE Mailbox renamed or deleted")
        }
        Err(e @ Error::Io(_)) => Err(e),
        Err(e) => writer.line(format_args!("NO {}", e)),
    }
}

/// Perform the command part of a session step, returning how the following
/// poll must behave.
fn session_command(
    session: &mut Session,
    step: &Step,
    writer: &mut LineWriter<&mut dyn Write>,
) -> Result<CommandKind, Error> {
    match *step {
        Step::Select {
            ref mailbox,
            read_only,
            ..
        } => {
            let response = session.select(mailbox, read_only)?;
            writer.line(format_args!(
                "* {}",
                flags_line(&response.flags, false)
            ))?;
            writer.exists_response(response.exists as u32)?;
            writer.recent_response(response.recent as u32)?;
            if let Some(unseen) = response.unseen {
                writer.line(format_args!("* OK [UNSEEN {}]", unseen.0))?;
            }
            writer.line(format_args!(
                "* OK [UIDVALIDITY {}]",
                response.uid_validity
            ))?;
            writer.line(format_args!(
                "* OK [UIDNEXT {}]",
                response.uid_next.0
            ))?;
            writer.line(if response.read_only {
                "* OK [READ-ONLY]"
            } else {
                "* OK [READ-WRITE]"
            })?;
            Ok(CommandKind::Other)
        }

        Step::Deselect { .. } => {
            session.deselect();
            Ok(CommandKind::Other)
        }

        Step::Append {
            ref mailbox,
            ref flags,
            ..
        } => {
            session.append(mailbox, flags.clone(), now(), 0)?;
            Ok(CommandKind::Other)
        }

        Step::Store {
            ref messages,
            uid,
            mode,
            ref flags,
            silent,
            ..
        } => {
            let uids = session.resolve(messages, uid)?;
            session.store(&uids, mode, flags, silent, writer)?;
            Ok(if uid {
                CommandKind::UidStore
            } else {
                CommandKind::Store
            })
        }

        Step::Expunge { ref messages, .. } => {
            match *messages {
                Some(ref messages) => {
                    let uids = session.resolve(messages, true)?;
                    session.expunge(Some(&uids))?;
                }
                None => session.expunge(None)?,
            }
            Ok(CommandKind::Other)
        }

        Step::Noop { .. } => Ok(CommandKind::Other),

        Step::Fetch {
            ref messages, uid, ..
        } => {
            let uids = session.resolve(messages, uid)?;
            session.fetch_flags(&uids, writer)?;
            Ok(if uid {
                CommandKind::UidFetch
            } else {
                CommandKind::Fetch
            })
        }

        Step::Search { ref query, uid, .. } => {
            let mut line = "* SEARCH".to_owned();
            for hit in session.search(query, uid)? {
                line.push(' ');
                line.push_str(&hit.to_string());
            }
            writer.line(line)?;
            Ok(if uid {
                CommandKind::UidSearch
            } else {
                CommandKind::Search
            })
        }

        Step::Copy {
            ref messages,
            uid,
            ref dest,
            ..
        } => {
            let uids = session.resolve(messages, uid)?;
            session.copy(&uids, dest)?;
            Ok(CommandKind::Other)
        }

        Step::Deliver { .. }
        | Step::CreateMailbox { .. }
        | Step::DeleteMailbox { .. }
        | Step::RenameMailbox { .. } => {
            Err(Error::BadScript("not a session step".to_owned()))
        }
    }
}

fn admin_result(
    out: &mut dyn Write,
    result: Result<(), Error>,
) -> Result<(), Error> {
    let mut writer = LineWriter::with_label(out, "admin".to_owned());
    match result {
        Ok(()) => writer.line("OK"),
        Err(e) => writer.line(format_args!("NO {}", e)),
    }
}

fn now() -> DateTime<FixedOffset> {
    let now = Utc::now();
    FixedOffset::east(0).from_utc_datetime(&now.naive_utc())
}

#[cfg(test)]
mod test {
    use super::*;

    fn replay_str(script: &str) -> Vec<String> {
        crate::init_test_log();

        let script: Script = toml::from_str(script).unwrap();
        let mut out = Vec::<u8>::new();
        run(&SystemConfig::default(), &script, &mut out).unwrap();

        String::from_utf8(out)
            .unwrap()
            .split("\r\n")
            .filter(|line| !line.is_empty() && !line.contains("UIDVALIDITY"))
            .map(str::to_owned)
            .collect()
    }

    #[test]
    fn foreign_expunge_reaches_other_session() {
        let output = replay_str(
            r#"
[[mailbox]]
name = "INBOX"
messages = 5

[[step]]
action = "select"
session = "alice"
mailbox = "INBOX"

[[step]]
action = "select"
session = "bob"
mailbox = "INBOX"

[[step]]
action = "store"
session = "bob"
messages = [3]
flags = ['\Deleted']
silent = true

[[step]]
action = "expunge"
session = "bob"

[[step]]
action = "deliver"
mailbox = "INBOX"

[[step]]
action = "fetch"
session = "alice"
messages = [3]

[[step]]
action = "noop"
session = "alice"
"#,
        );

        let select = |name: &str| {
            vec![
                format!(
                    "{}: * FLAGS (\\Answered \\Deleted \\Draft \\Flagged \\Seen)",
                    name
                ),
                format!("{}: * 5 EXISTS", name),
                format!("{}: * 5 RECENT", name),
                format!("{}: * OK [UNSEEN 1]", name),
                format!("{}: * OK [UIDNEXT 6]", name),
                format!("{}: * OK [READ-WRITE]", name),
                format!("{}: OK", name),
            ]
        };

        let mut expected = select("alice");
        expected.extend(select("bob"));
        expected.extend(
            vec![
                "bob: OK",
                "bob: * 3 EXPUNGE",
                "bob: OK",
                "delivery: OK INBOX 6",
                "alice: NO Message has been expunged",
                "alice: * 6 EXISTS",
                "alice: * 5 RECENT",
                "alice: * 3 FETCH (FLAGS (\\Deleted))",
                "alice: * 3 EXPUNGE",
                "alice: OK",
            ]
            .into_iter()
            .map(str::to_owned),
        );
        assert_eq!(expected, output);
    }

    #[test]
    fn failures_are_reported_inline() {
        let output = replay_str(
            r#"
[[mailbox]]
name = "Work"
messages = 1

[[step]]
action = "fetch"
session = "carol"
messages = [1]

[[step]]
action = "select"
session = "carol"
mailbox = "Work"
read_only = true

[[step]]
action = "store"
session = "carol"
messages = [1]
flags = ['\Seen']

[[step]]
action = "search"
session = "carol"
query = "all"

[[step]]
action = "delete-mailbox"
name = "Work"

[[step]]
action = "noop"
session = "carol"

[[step]]
action = "rename-mailbox"
from = "Nowhere"
to = "Somewhere"
"#,
        );

        assert_eq!("carol: NO No mailbox selected", output[0]);
        assert!(output.contains(&"carol: * OK [READ-ONLY]".to_owned()));
        assert!(output.contains(&"carol: NO Mailbox is read-only".to_owned()));
        assert!(output.contains(&"carol: * SEARCH 1".to_owned()));
        assert!(output.contains(&"admin: OK".to_owned()));
        assert!(output
            .contains(&"carol: BYE Mailbox renamed or deleted".to_owned()));
        assert_eq!("admin: NO No such mailbox", output[output.len() - 1]);
    }

    #[test]
    fn rename_is_seen_by_selected_session() {
        let output = replay_str(
            r#"
[[step]]
action = "create-mailbox"
name = "Old"

[[step]]
action = "append"
session = "dave"
mailbox = "Old"
flags = ['$Important']

[[step]]
action = "select"
session = "dave"
mailbox = "Old"

[[step]]
action = "rename-mailbox"
from = "Old"
to = "New"

[[step]]
action = "copy"
session = "dave"
messages = [1]
dest = "INBOX"

[[step]]
action = "search"
session = "dave"
uid = true
query = { flag = '$important' }
"#,
        );

        assert_eq!(
            vec!["admin: OK", "dave: OK"],
            output[..2].to_vec()
        );
        assert!(output.contains(&"dave: * SEARCH 1".to_owned()));
        assert_eq!(
            vec!["admin: OK", "dave: OK", "dave: * SEARCH 1", "dave: OK"],
            output[output.len() - 4..].to_vec()
        );
    }

    #[test]
    fn malformed_script_is_rejected() {
        assert!(toml::from_str::<Script>(
            r#"
[[step]]
action = "levitate"
session = "x"
"#
        )
        .is_err());
        assert!(toml::from_str::<Script>(
            r#"
[[step]]
action = "store"
session = "x"
messages = [1]
flags = ['\Bogus']
"#
        )
        .is_err());
    }
}
