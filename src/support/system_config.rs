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

use std::fs;
use std::path::{Path, PathBuf};

use log::LevelFilter;
use serde::{Deserialize, Serialize};

use crate::account::model::Flag;
use crate::support::error::Error;

/// The system-wide configuration for Postern.
///
/// This is stored in a file typically named `postern.toml`. Every section is
/// optional.
#[derive(Clone, Debug, Deserialize, Serialize, Default)]
pub struct SystemConfig {
    /// Settings applied to every mailbox an account creates.
    #[serde(default)]
    pub mailbox: MailboxConfig,

    /// Configuration for the background delivery worker.
    #[serde(default)]
    pub delivery: DeliveryConfig,

    /// Configuration for logging when not delegated to a log4rs file.
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct MailboxConfig {
    /// The flags reported in `PERMANENTFLAGS`.
    ///
    /// Each entry uses the wire syntax, e.g. `\Seen` or `$Junk`.
    pub permanent_flags: Vec<String>,

    /// Whether clients may set keywords not listed in `permanent_flags`.
    ///
    /// When true, `\*` is also reported in `PERMANENTFLAGS`.
    pub allow_keywords: bool,
}

impl Default for MailboxConfig {
    fn default() -> Self {
        MailboxConfig {
            permanent_flags: vec![
                "\\Answered".to_owned(),
                "\\Deleted".to_owned(),
                "\\Draft".to_owned(),
                "\\Flagged".to_owned(),
                "\\Seen".to_owned(),
            ],
            allow_keywords: true,
        }
    }
}

impl MailboxConfig {
    /// Parse `permanent_flags` into `Flag` values.
    pub fn parsed_permanent_flags(&self) -> Result<Vec<Flag>, Error> {
        self.permanent_flags.iter().map(|f| f.parse()).collect()
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct DeliveryConfig {
    /// The number of deliveries that may be queued before senders block.
    pub queue_depth: usize,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig { queue_depth: 64 }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// The minimum level written by the built-in stderr logger.
    pub level: String,

    /// If set, a log4rs configuration file which takes over all logging.
    pub config_file: Option<PathBuf>,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: "info".to_owned(),
            config_file: None,
        }
    }
}

impl LoggingConfig {
    /// Return the configured level, falling back to `Info` if it does not
    /// parse.
    pub fn level_filter(&self) -> LevelFilter {
        self.level.parse().unwrap_or(LevelFilter::Info)
    }
}

impl SystemConfig {
    /// Load the configuration from the TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = fs::read(path)?;
        let config: SystemConfig = toml::from_slice(&raw)?;
        // Fail early rather than on the first mailbox creation
        config.mailbox.parsed_permanent_flags()?;
        Ok(config)
    }
}
