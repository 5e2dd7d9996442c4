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

use std::path::{Path, PathBuf};

use structopt::StructOpt;

use crate::support::sysexits::*;
use crate::support::system_config::SystemConfig;

#[derive(StructOpt)]
#[structopt(max_term_width = 80)]
struct Command {
    /// The configuration file to use [default: postern.toml in the current
    /// directory, if it exists]
    #[structopt(long, short, parse(from_os_str))]
    config: Option<PathBuf>,

    #[structopt(subcommand)]
    subcommand: Subcommand,
}

#[derive(StructOpt)]
enum Subcommand {
    Replay(ReplaySubcommand),
}

/// Replay a scripted scenario of concurrent sessions.
///
/// The script is a TOML file listing the mailboxes to create and the steps to
/// perform, each by a named session, by background delivery, or by the
/// administrator. Every response line each session sends to its client is
/// printed, prefixed by the session's name, which shows exactly when each
/// session learns about the changes made by the others.
#[derive(StructOpt)]
pub(super) struct ReplaySubcommand {
    /// The script to run.
    #[structopt(parse(from_os_str))]
    pub(super) script: PathBuf,
}

pub fn main() {
    // Clap exits with status 1 instead of EX_USAGE if we use the more concise
    // API
    let cmd = Command::from_clap(&match Command::clap().get_matches_safe() {
        Ok(matches) => matches,
        Err(
            e @ clap::Error {
                kind: clap::ErrorKind::HelpDisplayed,
                ..
            },
        )
        | Err(
            e @ clap::Error {
                kind: clap::ErrorKind::VersionDisplayed,
                ..
            },
        ) => {
            println!("{}", e.message);
            return;
        }
        Err(e) => {
            eprintln!("{}", e.message);
            EX_USAGE.exit()
        }
    });

    let system_config = load_config(cmd.config.as_deref());
    init_log(&system_config);

    match cmd.subcommand {
        Subcommand::Replay(cmd) => super::replay::replay(system_config, cmd),
    }
}

fn load_config(path: Option<&Path>) -> SystemConfig {
    let default_path = Path::new("postern.toml");
    let path = match path {
        Some(path) => path,
        None if default_path.is_file() => default_path,
        None => return SystemConfig::default(),
    };

    match SystemConfig::load(path) {
        Ok(config) => config,
        Err(e) => die!(
            EX_CONFIG,
            "Error in config file at '{}': {}",
            path.display(),
            e
        ),
    }
}

fn init_log(system_config: &SystemConfig) {
    match system_config.logging.config_file {
        Some(ref log_config_file) => {
            if let Err(e) = log4rs::init_file(
                log_config_file,
                log4rs::file::Deserializers::new(),
            ) {
                die!(
                    EX_CONFIG,
                    "Failed to initialise logging from '{}': {}",
                    log_config_file.display(),
                    e
                );
            }
        }
        None => crate::init_simple_log(system_config.logging.level_filter()),
    }
}
