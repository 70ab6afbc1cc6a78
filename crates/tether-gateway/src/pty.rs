//! PTY allocation and child-process plumbing.
//!
//! A [`Pty`] owns the master side of a pseudo-terminal pair and exposes
//! readiness-driven async I/O through `AsyncFd`, so reads wake on data
//! instead of polling. Children are spawned attached to the slave side as
//! session leaders with a controlling TTY (`setsid` + `TIOCSCTTY` in
//! `pre_exec`), which is what interactive shells and the assistant binary
//! expect.

use std::io::{Read, Write};
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Mutex;
use std::time::Duration;

use nix::pty::{openpty, Winsize};
use nix::sys::signal::{kill, Signal};
use nix::sys::termios::{tcgetattr, tcsetattr, LocalFlags, SetArg};
use nix::unistd::Pid;
use tokio::io::unix::AsyncFd;
use tokio::process::{Child, Command};
use tracing::debug;

use tether_core::error::{Error, Result};

/// What to run on the slave side of a PTY.
#[derive(Debug, Clone)]
pub struct PtyCommand {
    /// Program to execute.
    pub program: String,
    /// Arguments, exec-style.
    pub args: Vec<String>,
    /// Working directory for the child; inherited when `None`.
    pub workdir: Option<PathBuf>,
    /// Extra environment (`NAME`, `VALUE`) pairs layered over the parent's.
    pub env: Vec<(String, String)>,
    /// Initial terminal rows.
    pub rows: u16,
    /// Initial terminal columns.
    pub cols: u16,
    /// Leave terminal echo enabled on the slave.
    ///
    /// Interactive shells want echo; the assistant adapter disables it so the
    /// output scanner never sees the input reflected back.
    pub echo: bool,
}

/// Master side of a PTY pair with async I/O.
pub struct Pty {
    master: AsyncFd<std::fs::File>,
    master_fd: RawFd,
    size: Mutex<(u16, u16)>,
}

impl Pty {
    /// Open a PTY pair sized `rows` x `cols`.
    ///
    /// Returns the master and the slave fd to hand to a child.
    pub fn open(rows: u16, cols: u16, echo: bool) -> Result<(Self, OwnedFd)> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let pair = openpty(&winsize, None).map_err(|e| Error::PtyAlloc {
            message: format!("openpty failed: {}", e),
        })?;

        if !echo {
            let mut termios = tcgetattr(&pair.slave).map_err(|e| Error::PtyAlloc {
                message: format!("tcgetattr failed: {}", e),
            })?;
            termios.local_flags.remove(LocalFlags::ECHO);
            tcsetattr(&pair.slave, SetArg::TCSANOW, &termios).map_err(|e| Error::PtyAlloc {
                message: format!("tcsetattr failed: {}", e),
            })?;
        }

        let master_fd = pair.master.as_raw_fd();
        set_nonblocking(master_fd)?;

        let file = std::fs::File::from(pair.master);
        let master = AsyncFd::new(file).map_err(|e| Error::PtyAlloc {
            message: format!("AsyncFd registration failed: {}", e),
        })?;

        Ok((
            Self {
                master,
                master_fd,
                size: Mutex::new((rows, cols)),
            },
            pair.slave,
        ))
    }

    /// Spawn `cmd` attached to `slave` as session leader with controlling
    /// TTY. The slave fd is consumed; the parent keeps only the master.
    pub fn spawn_child(cmd: &PtyCommand, slave: OwnedFd) -> Result<Child> {
        let stdin = slave.try_clone().map_err(|e| Error::Spawn {
            message: format!("dup slave for stdin failed: {}", e),
        })?;
        let stdout = slave.try_clone().map_err(|e| Error::Spawn {
            message: format!("dup slave for stdout failed: {}", e),
        })?;

        let mut command = Command::new(&cmd.program);
        command
            .args(&cmd.args)
            .stdin(Stdio::from(stdin))
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(slave));

        if let Some(dir) = &cmd.workdir {
            command.current_dir(dir);
        }
        for (name, value) in &cmd.env {
            command.env(name, value);
        }
        if std::env::var_os("TERM").is_none() {
            command.env("TERM", tether_core::constants::DEFAULT_TERM);
        }

        // After stdio wiring, fd 0 is the slave: make the child a session
        // leader and give it the slave as controlling terminal.
        unsafe {
            command.pre_exec(|| {
                nix::unistd::setsid().map_err(std::io::Error::from)?;
                if libc::ioctl(0, libc::TIOCSCTTY as _, 0) < 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        command.spawn().map_err(|e| Error::Spawn {
            message: format!("failed to start {}: {}", cmd.program, e),
        })
    }

    /// Write all of `data` to the master, waiting on write readiness.
    pub async fn write(&self, data: &[u8]) -> Result<()> {
        let mut remaining = data;
        while !remaining.is_empty() {
            let mut guard = self.master.writable().await.map_err(|e| Error::Pty {
                message: format!("pty write readiness failed: {}", e),
            })?;

            match guard.try_io(|inner| inner.get_ref().write(remaining)) {
                Ok(Ok(n)) => remaining = &remaining[n..],
                Ok(Err(e)) => {
                    return Err(Error::Pty {
                        message: format!("pty write failed: {}", e),
                    });
                }
                // Spurious readiness; wait again.
                Err(_would_block) => continue,
            }
        }
        Ok(())
    }

    /// Read from the master into `buf`, waiting on read readiness.
    ///
    /// Returns `None` on EOF. EIO is normal when the slave side is closed
    /// (the child exited) and is reported as EOF.
    pub async fn read(&self, buf: &mut [u8]) -> Result<Option<usize>> {
        loop {
            let mut guard = self.master.readable().await.map_err(|e| Error::Pty {
                message: format!("pty read readiness failed: {}", e),
            })?;

            match guard.try_io(|inner| inner.get_ref().read(buf)) {
                Ok(Ok(0)) => return Ok(None),
                Ok(Ok(n)) => return Ok(Some(n)),
                Ok(Err(e)) => {
                    if e.raw_os_error() == Some(libc::EIO) {
                        debug!("pty read returned EIO, child likely exited");
                        return Ok(None);
                    }
                    return Err(Error::Pty {
                        message: format!("pty read failed: {}", e),
                    });
                }
                Err(_would_block) => continue,
            }
        }
    }

    /// Apply a new window size and record it.
    pub fn resize(&self, rows: u16, cols: u16) -> Result<()> {
        let winsize = Winsize {
            ws_row: rows,
            ws_col: cols,
            ws_xpixel: 0,
            ws_ypixel: 0,
        };

        let rc = unsafe { libc::ioctl(self.master_fd, libc::TIOCSWINSZ, &winsize) };
        if rc == -1 {
            return Err(Error::Pty {
                message: format!("TIOCSWINSZ failed: {}", std::io::Error::last_os_error()),
            });
        }

        *self.size.lock().unwrap() = (rows, cols);
        debug!(rows, cols, "pty resized");
        Ok(())
    }

    /// Current (rows, cols).
    pub fn size(&self) -> (u16, u16) {
        *self.size.lock().unwrap()
    }
}

/// Send a signal to a child by pid. No-op if the child has already been
/// reaped (its id is gone).
pub fn signal_child(child: &Child, signal: Signal) {
    if let Some(pid) = child.id() {
        let _ = kill(Pid::from_raw(pid as i32), signal);
    }
}

/// Send a signal to a raw pid.
pub fn signal_pid(pid: i32, signal: Signal) {
    let _ = kill(Pid::from_raw(pid), signal);
}

/// Graceful child shutdown: SIGTERM, wait up to `grace`, SIGKILL.
pub async fn shutdown_child(child: &mut Child, grace: Duration) -> Result<()> {
    signal_child(child, Signal::SIGTERM);

    match tokio::time::timeout(grace, child.wait()).await {
        Ok(Ok(status)) => {
            debug!(?status, "child exited after SIGTERM");
            Ok(())
        }
        Ok(Err(e)) => Err(Error::Pty {
            message: format!("wait failed: {}", e),
        }),
        Err(_) => {
            debug!("child survived grace period, sending SIGKILL");
            child.kill().await.map_err(|e| Error::Pty {
                message: format!("SIGKILL failed: {}", e),
            })?;
            Ok(())
        }
    }
}

fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = unsafe { libc::fcntl(fd, libc::F_GETFL) };
    if flags < 0 {
        return Err(Error::PtyAlloc {
            message: format!("fcntl F_GETFL failed: {}", std::io::Error::last_os_error()),
        });
    }
    if unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0 {
        return Err(Error::PtyAlloc {
            message: format!("fcntl F_SETFL failed: {}", std::io::Error::last_os_error()),
        });
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn open_and_resize() {
        // PTY allocation can fail in constrained sandboxes; skip if so.
        let Ok((pty, _slave)) = Pty::open(24, 80, true) else {
            eprintln!("skipping: no pty available");
            return;
        };

        assert_eq!(pty.size(), (24, 80));
        pty.resize(40, 120).unwrap();
        assert_eq!(pty.size(), (40, 120));
    }

    #[tokio::test]
    async fn child_output_reaches_master() {
        let Ok((pty, slave)) = Pty::open(24, 80, true) else {
            eprintln!("skipping: no pty available");
            return;
        };

        let cmd = PtyCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "printf hello-from-child".into()],
            workdir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
            echo: true,
        };

        let mut child = match Pty::spawn_child(&cmd, slave) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("skipping: spawn failed: {}", e);
                return;
            }
        };

        let mut collected = Vec::new();
        let mut buf = [0u8; 1024];
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while tokio::time::Instant::now() < deadline {
            match tokio::time::timeout(Duration::from_millis(500), pty.read(&mut buf)).await {
                Ok(Ok(Some(n))) => {
                    collected.extend_from_slice(&buf[..n]);
                    if String::from_utf8_lossy(&collected).contains("hello-from-child") {
                        break;
                    }
                }
                Ok(Ok(None)) => break,
                Ok(Err(_)) | Err(_) => break,
            }
        }

        assert!(
            String::from_utf8_lossy(&collected).contains("hello-from-child"),
            "got: {:?}",
            String::from_utf8_lossy(&collected)
        );

        let _ = child.wait().await;
    }

    #[tokio::test]
    async fn shutdown_terminates_stubborn_child() {
        let Ok((_pty, slave)) = Pty::open(24, 80, true) else {
            eprintln!("skipping: no pty available");
            return;
        };

        let cmd = PtyCommand {
            program: "/bin/sh".into(),
            args: vec!["-c".into(), "sleep 600".into()],
            workdir: None,
            env: Vec::new(),
            rows: 24,
            cols: 80,
            echo: true,
        };

        let mut child = match Pty::spawn_child(&cmd, slave) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("skipping: spawn failed: {}", e);
                return;
            }
        };

        shutdown_child(&mut child, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(child.try_wait().unwrap().is_some());
    }
}
