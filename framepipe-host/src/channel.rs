//! Output channel endpoints.
//!
//! The pipeline expects an already-connected byte stream, so opening an
//! endpoint blocks until the consumer process attaches:
//!
//! - Windows: a single-instance outbound named pipe (`\\.\pipe\…`).
//! - Unix: a listening domain socket, accepting exactly one connection.
//! - `-`: the process's stdout.

use std::io::{self, Write};

use tracing::info;

use framepipe_core::{Channel, PipelineError, Result};

/// Endpoint spelling that selects stdout.
pub const STDOUT_ENDPOINT: &str = "-";

/// Open `endpoint` and wait for the consumer.
pub fn open_channel(endpoint: &str) -> Result<Channel> {
    if endpoint == STDOUT_ENDPOINT {
        info!("writing frames to stdout");
        return Ok(Box::new(io::stdout()));
    }
    platform::open(endpoint)
}

fn init_error(endpoint: &str, e: impl std::fmt::Display) -> PipelineError {
    PipelineError::Initialization(format!("{endpoint}: {e}"))
}

// ── Windows named pipe ───────────────────────────────────────────

#[cfg(target_os = "windows")]
mod platform {
    use super::*;
    use std::fs::File;
    use std::os::windows::io::{FromRawHandle, OwnedHandle};

    use windows::Win32::Foundation::ERROR_PIPE_CONNECTED;
    use windows::Win32::Storage::FileSystem::PIPE_ACCESS_OUTBOUND;
    use windows::Win32::System::Pipes::{
        ConnectNamedPipe, CreateNamedPipeW, PIPE_TYPE_BYTE, PIPE_WAIT,
    };
    use windows::core::HSTRING;

    /// Kernel-side output buffer.
    const PIPE_BUFFER: u32 = 64 * 1024;

    pub(super) fn open(name: &str) -> Result<Channel> {
        let handle = unsafe {
            CreateNamedPipeW(
                &HSTRING::from(name),
                PIPE_ACCESS_OUTBOUND,
                PIPE_TYPE_BYTE | PIPE_WAIT,
                1,
                PIPE_BUFFER,
                0,
                0,
                None,
            )
        };
        if handle.is_invalid() {
            return Err(init_error(name, io::Error::last_os_error()));
        }
        // SAFETY: `handle` is a freshly created, valid pipe handle that
        // nothing else owns; the File closes it on drop.
        let pipe = File::from(unsafe { OwnedHandle::from_raw_handle(handle.0) });

        info!(pipe = name, "named pipe created; waiting for consumer");
        if let Err(e) = unsafe { ConnectNamedPipe(handle, None) } {
            if e.code() != ERROR_PIPE_CONNECTED.to_hresult() {
                return Err(init_error(name, e));
            }
        }
        info!(pipe = name, "consumer connected");
        Ok(Box::new(pipe))
    }
}

// ── Unix domain socket ───────────────────────────────────────────

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::fs::FileTypeExt;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};

    use tracing::debug;

    /// Accepted connection; the socket file is removed on drop.
    struct SocketChannel {
        stream: UnixStream,
        path: PathBuf,
    }

    impl Write for SocketChannel {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.stream.write(buf)
        }

        fn flush(&mut self) -> io::Result<()> {
            self.stream.flush()
        }
    }

    impl Drop for SocketChannel {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }

    pub(super) fn open(path: &str) -> Result<Channel> {
        let path = PathBuf::from(path);
        remove_stale_socket(&path)?;

        let listener =
            UnixListener::bind(&path).map_err(|e| init_error(&path.to_string_lossy(), e))?;
        info!(socket = %path.display(), "listening; waiting for consumer");

        let (stream, _) = listener
            .accept()
            .map_err(|e| init_error(&path.to_string_lossy(), e))?;
        info!(socket = %path.display(), "consumer connected");

        Ok(Box::new(SocketChannel { stream, path }))
    }

    /// A socket file left by an earlier run blocks bind. Anything else at
    /// the path is left alone.
    fn remove_stale_socket(path: &Path) -> Result<()> {
        let name = path.to_string_lossy();
        match std::fs::symlink_metadata(path) {
            Ok(meta) if meta.file_type().is_socket() => {
                std::fs::remove_file(path).map_err(|e| init_error(&name, e))?;
                debug!(socket = %path.display(), "removed stale socket");
                Ok(())
            }
            Ok(_) => Err(init_error(&name, "exists and is not a socket")),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(init_error(&name, e)),
        }
    }
}

#[cfg(not(any(unix, target_os = "windows")))]
mod platform {
    use super::*;

    pub(super) fn open(endpoint: &str) -> Result<Channel> {
        Err(init_error(endpoint, "no channel endpoint on this platform"))
    }
}

// ── Tests ────────────────────────────────────────────────────────
