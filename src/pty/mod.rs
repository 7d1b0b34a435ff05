pub mod session;
pub mod terminal;

pub use session::{default_shell, PtySession, ShellOptions};
pub use terminal::{TerminalError, TerminalEvent, TerminalSession};
