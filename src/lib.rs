pub mod config;
pub mod pty;
pub mod server;
pub mod util;
