use portable_pty::{Child, CommandBuilder, MasterPty, PtySize};
use std::io::{Read, Write};
use std::path::PathBuf;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

type PtyResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// How to launch the shared shell
#[derive(Debug, Clone)]
pub struct ShellOptions {
    /// Shell program; `None` picks [`default_shell`]
    pub program: Option<String>,
    pub cwd: PathBuf,
    pub cols: u16,
    pub rows: u16,
}

impl ShellOptions {
    pub fn new(cwd: PathBuf) -> Self {
        Self {
            program: None,
            cwd,
            cols: 80,
            rows: 30,
        }
    }
}

/// `$SHELL`, falling back to bash (PowerShell on Windows)
pub fn default_shell() -> String {
    if cfg!(windows) {
        return "powershell.exe".to_string();
    }
    std::env::var("SHELL")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "/bin/bash".to_string())
}

pub struct PtySession {
    session_id: String,
    master: Option<Box<dyn MasterPty + Send>>,
    child: Box<dyn Child + Send + Sync>,
    reader: Option<Box<dyn Read + Send>>,
    writer: Option<Box<dyn Write + Send>>,
    shell_name: String,
}

impl PtySession {
    #[instrument(skip(options), fields(cwd = ?options.cwd))]
    pub fn new(options: &ShellOptions) -> PtyResult<Self> {
        let session_id = Uuid::new_v4().to_string();
        info!(session_id = %session_id, "Creating new PTY session");

        let shell_path = options.program.clone().unwrap_or_else(default_shell);
        let shell_name = std::path::Path::new(&shell_path)
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "shell".to_string());

        debug!(session_id = %session_id, shell = %shell_path, "Selected shell");

        let pty_system = portable_pty::native_pty_system();
        let size = PtySize {
            rows: options.rows,
            cols: options.cols,
            pixel_width: 0,
            pixel_height: 0,
        };

        let pair = pty_system.openpty(size)?;
        let master = pair.master;

        // The builder starts from the server's own environment.
        let mut cmd = CommandBuilder::new(&shell_path);
        cmd.cwd(&options.cwd);
        cmd.env("TERM", "xterm-color");

        let child = pair.slave.spawn_command(cmd)?;

        // Close the slave side in this process so the master reader sees EOF
        // once the shell exits.
        drop(pair.slave);

        info!(
            session_id = %session_id,
            shell = %shell_name,
            "PTY session created successfully"
        );

        let reader = master.try_clone_reader()?;
        let writer = master.take_writer()?;

        Ok(PtySession {
            session_id,
            master: Some(master),
            child,
            reader: Some(reader),
            writer: Some(writer),
            shell_name,
        })
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    pub fn shell_name(&self) -> &str {
        &self.shell_name
    }

    /// Hand the output stream to a dedicated reader thread
    pub fn take_reader(&mut self) -> PtyResult<Box<dyn Read + Send>> {
        if let Some(reader) = self.reader.take() {
            return Ok(reader);
        }
        self.master
            .as_ref()
            .ok_or_else(|| std::io::Error::other("PTY master already closed"))?
            .try_clone_reader()
            .map_err(|e| std::io::Error::other(e.to_string()).into())
    }

    /// Hand the input stream to a dedicated writer thread
    pub fn take_writer(&mut self) -> PtyResult<Box<dyn Write + Send>> {
        self.writer
            .take()
            .ok_or_else(|| std::io::Error::other("PTY writer already taken").into())
    }

    /// Exit code if the shell has terminated
    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub fn try_exit_code(&mut self) -> Option<i32> {
        match self.child.try_wait() {
            Ok(Some(status)) => {
                let exit_code = status.exit_code() as i32;
                info!(session_id = %self.session_id, exit_code, "Child process exited");
                Some(exit_code)
            }
            Ok(None) => {
                debug!(session_id = %self.session_id, "Child process still running");
                None
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Error checking child process status"
                );
                None
            }
        }
    }

    #[instrument(skip(self), fields(session_id = %self.session_id))]
    pub fn kill(&mut self) {
        info!(session_id = %self.session_id, "Killing PTY session");

        drop(self.reader.take());
        drop(self.writer.take());

        if let Err(e) = self.child.kill() {
            warn!(
                session_id = %self.session_id,
                error = %e,
                "Error sending kill signal to child process"
            );
        }

        match self.child.wait() {
            Ok(status) => {
                info!(
                    session_id = %self.session_id,
                    exit_code = status.exit_code(),
                    "Child process terminated"
                );
            }
            Err(e) => {
                error!(
                    session_id = %self.session_id,
                    error = %e,
                    "Error waiting for child process to exit"
                );
            }
        }

        // Master goes last so the reader thread sees the hangup.
        drop(self.master.take());
    }
}

impl Drop for PtySession {
    fn drop(&mut self) {
        debug!(session_id = %self.session_id, "Dropping PTY session");
        self.kill();
    }
}
