//! Container runtime command execution for the Incus fleet core.
//!
//! [`CommandRunner`] is the seam every runtime call goes through:
//! [`ProcessRunner`] drives real child processes with a hard timeout, and the
//! [`inspect`] module turns the runtime's free-text output into addresses and
//! snapshot listings.

#![forbid(unsafe_code)]

pub mod error;
pub mod inspect;
pub mod process;

pub use error::{EMPTY_STDERR, ExecError, ExecResult};
pub use inspect::{Addresses, get_addresses, parse_addresses, parse_snapshots};
pub use process::{
    CommandOutput, CommandRunner, LONG_TIMEOUT, ProcessRunner, QUICK_TIMEOUT, RawOutput,
    SHUTDOWN_TIMEOUT, SIGNAL_EXIT_CODE, classify, display_command, split_command,
};
