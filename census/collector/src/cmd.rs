// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Facilities for the `census` command.

use std::path::Path;
use std::process::exit;

/// Exit status for a fatal runtime failure.
pub const EXIT_FAILURE: i32 = 1;
/// Exit status for bad command-line arguments.
pub const EXIT_USAGE: i32 = 2;

/// Errors that end the command.
#[derive(Debug)]
pub enum CmdError {
    /// Incorrect command-line arguments
    Usage(String),
    /// Everything else
    Failure(anyhow::Error),
}

impl CmdError {
    pub fn exit_code(&self) -> i32 {
        match self {
            CmdError::Usage(_) => EXIT_USAGE,
            CmdError::Failure(_) => EXIT_FAILURE,
        }
    }

    /// The message printed for this error, including the chain of causes.
    pub fn message(&self) -> String {
        match self {
            CmdError::Usage(message) => message.clone(),
            CmdError::Failure(error) => format!("{:#}", error),
        }
    }
}

/// Print `cmd_error` to stderr, prefixed with the program name, and exit.
pub fn fatal(cmd_error: CmdError) -> ! {
    let arg0 = std::env::args().next().unwrap_or_default();
    let program = Path::new(&arg0)
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("census");
    eprintln!("{}: {}", program, cmd_error.message());
    exit(cmd_error.exit_code());
}
