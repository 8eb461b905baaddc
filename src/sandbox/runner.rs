//! Launching the unprivileged sandbox helper.
//!
//! The helper consumes a NUL-separated directive stream on fd 3, one pipe
//! per injected file on the following fds, and an optional seccomp BPF
//! program on the last fd. The runner owns the write ends: it writes the
//! argument stream first, then each file body, then invokes the seccomp
//! callback, closing every fd before moving to the next so the helper can
//! rely on EOF ordering.

use std::fs::File;
use std::os::unix::io::{FromRawFd, RawFd};
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use tokio::process::{Child, Command};
use tracing::{debug, warn};

use crate::constants::{HELPER_ARGS_FD, HELPER_MIN_VERSION, HELPER_PATHS};
use crate::error::{Error, Result};
use crate::sandbox::spec::SandboxSpec;

// =============================================================================
// Helper Discovery
// =============================================================================

/// A located and version-checked sandbox helper binary.
#[derive(Debug, Clone)]
pub struct Helper {
    path: PathBuf,
    version: (u32, u32, u32),
}

impl Helper {
    /// Locates the helper and refuses versions older than the minimum.
    ///
    /// Helpers below 0.1.3 are ptrace-able while privileged (CVE-2016-8659)
    /// and must not be used.
    ///
    /// # Errors
    ///
    /// `HelperNotFound` when no candidate path exists, `HelperTooOld` when
    /// the version probe reports something ancient.
    pub async fn find() -> Result<Self> {
        let candidates: Vec<PathBuf> = HELPER_PATHS.iter().map(PathBuf::from).collect();
        let path = candidates
            .iter()
            .find(|p| p.exists())
            .cloned()
            .ok_or_else(|| Error::HelperNotFound(candidates.clone()))?;

        let version = query_version(&path).await?;
        if version < HELPER_MIN_VERSION {
            let (maj, min, pl) = version;
            let (rmaj, rmin, rpl) = HELPER_MIN_VERSION;
            return Err(Error::HelperTooOld {
                found: format!("{maj}.{min}.{pl}"),
                required: format!("{rmaj}.{rmin}.{rpl}"),
            });
        }

        debug!(path = %path.display(), ?version, "located sandbox helper");
        Ok(Self { path, version })
    }

    /// Path of the helper binary.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed helper version.
    #[must_use]
    pub fn version(&self) -> (u32, u32, u32) {
        self.version
    }

    /// Launches a child according to `spec`.
    ///
    /// On any side-channel write failure the half-constructed child is
    /// killed before the error is surfaced; the caller never sees a
    /// partially-provisioned sandbox.
    ///
    /// # Errors
    ///
    /// Spec validation errors, pipe or spawn failures, or write failures
    /// on the argument, file, or seccomp pipes.
    pub async fn spawn(&self, mut spec: SandboxSpec) -> Result<SandboxedChild> {
        // Serialize first: validation failures must precede the fork.
        let mut tokens = spec.finalize_args()?;

        // The seccomp fd trails every file pipe.
        let seccomp_fn = spec.seccomp_fn.take();
        if seccomp_fn.is_some() {
            let fd = HELPER_ARGS_FD + 1 + spec.file_count() as i32;
            tokens.push("--seccomp".into());
            tokens.push(fd.to_string());
        }

        let mut stream = Vec::new();
        for tok in &tokens {
            stream.extend_from_slice(tok.as_bytes());
            stream.push(0x00);
        }

        // One pipe for the argument stream, one per file, one for seccomp.
        let n_pipes = 1 + spec.file_count() + usize::from(seccomp_fn.is_some());
        let mut read_fds: Vec<RawFd> = Vec::with_capacity(n_pipes);
        let mut write_fds: Vec<RawFd> = Vec::with_capacity(n_pipes);
        for _ in 0..n_pipes {
            let (r, w) = make_pipe()?;
            read_fds.push(r);
            write_fds.push(w);
        }

        let mut cmd = Command::new(&self.path);
        cmd.arg("--args")
            .arg(HELPER_ARGS_FD.to_string())
            .arg(&spec.child)
            .args(&spec.child_args)
            .env_clear()
            .kill_on_drop(true);

        if let Some(stdin) = spec.stdin.take() {
            cmd.stdin(stdin);
        }
        if let Some(stdout) = spec.stdout.take() {
            cmd.stdout(stdout);
        }
        if let Some(stderr) = spec.stderr.take() {
            cmd.stderr(stderr);
        }

        // Fixed-size shuffle buffer: pre_exec runs post-fork, where heap
        // allocation is off limits.
        const MAX_PIPES: usize = 64;
        if n_pipes > MAX_PIPES {
            for fd in read_fds.iter().chain(write_fds.iter()) {
                unsafe { libc::close(*fd) };
            }
            return Err(Error::InvalidSpec(format!(
                "too many injected files: {n_pipes} pipes (limit {MAX_PIPES})"
            )));
        }

        let pdeath_sig = spec.pdeath_sig;
        let child_fds = read_fds.clone();
        unsafe {
            cmd.pre_exec(move || {
                if libc::prctl(libc::PR_SET_PDEATHSIG, pdeath_sig, 0, 0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                // Renumber the pipe read ends to the fds promised in the
                // directive stream. The sources are first parked above the
                // target range so a source fd occupying a target slot is
                // never clobbered mid-shuffle; dup2 clears O_CLOEXEC on the
                // final copies.
                let park_base = HELPER_ARGS_FD + child_fds.len() as i32;
                let mut parked = [0 as RawFd; MAX_PIPES];
                for (slot, &fd) in parked.iter_mut().zip(child_fds.iter()) {
                    let high = libc::fcntl(fd, libc::F_DUPFD, park_base);
                    if high < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                    *slot = high;
                }
                for (i, &fd) in parked[..child_fds.len()].iter().enumerate() {
                    let target = HELPER_ARGS_FD + i as i32;
                    if libc::dup2(fd, target) < 0 {
                        return Err(std::io::Error::last_os_error());
                    }
                }
                for &fd in &parked[..child_fds.len()] {
                    libc::close(fd);
                }
                Ok(())
            });
        }

        let spawn_result = cmd.spawn();

        // The parent never reads from these, spawned or not.
        for fd in read_fds {
            unsafe { libc::close(fd) };
        }

        let mut child = match spawn_result {
            Ok(child) => child,
            Err(e) => {
                for fd in write_fds {
                    unsafe { libc::close(fd) };
                }
                return Err(Error::LaunchFailed {
                    child: spec.child.display().to_string(),
                    reason: e.to_string(),
                });
            }
        };

        // Feed the side channels in protocol order. Ownership of each raw
        // fd passes to the File, which closes it when the write finishes.
        let mut writes: Vec<(File, Vec<u8>)> = Vec::with_capacity(1 + spec.file_data.len());
        let mut write_fds = write_fds.into_iter();
        let args_file = unsafe { File::from_raw_fd(write_fds.next().expect("args pipe")) };
        writes.push((args_file, stream));
        for body in std::mem::take(&mut spec.file_data) {
            let f = unsafe { File::from_raw_fd(write_fds.next().expect("file pipe")) };
            writes.push((f, body));
        }

        let wrote = tokio::task::spawn_blocking(move || -> Result<()> {
            use std::io::Write;
            for (mut f, body) in writes {
                f.write_all(&body)?;
            }
            if let Some(emit) = seccomp_fn {
                let f = unsafe { File::from_raw_fd(write_fds.next().expect("seccomp pipe")) };
                emit(f)?;
            }
            Ok(())
        })
        .await
        .map_err(|e| Error::LaunchFailed {
            child: spec.child.display().to_string(),
            reason: format!("side-channel writer panicked: {e}"),
        })?;

        if let Err(e) = wrote {
            warn!(error = %e, "sandbox side-channel write failed, killing child");
            let _ = child.start_kill();
            let _ = child.wait().await;
            return Err(e);
        }

        Ok(SandboxedChild { child })
    }
}

fn make_pipe() -> Result<(RawFd, RawFd)> {
    let mut fds = [0 as RawFd; 2];
    // O_CLOEXEC keeps the write ends out of the helper; the read ends are
    // re-created inside the child by dup2.
    if unsafe { libc::pipe2(fds.as_mut_ptr(), libc::O_CLOEXEC) } != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    Ok((fds[0], fds[1]))
}

async fn query_version(path: &Path) -> Result<(u32, u32, u32)> {
    let output = Command::new(path)
        .arg("--version")
        .env_clear()
        .output()
        .await
        .map_err(|e| Error::LaunchFailed {
            child: path.display().to_string(),
            reason: format!("version probe failed: {e}"),
        })?;

    let text = String::from_utf8_lossy(&output.stdout);
    parse_version(&text).ok_or_else(|| Error::LaunchFailed {
        child: path.display().to_string(),
        reason: format!("unparseable version output: {:?}", text.trim()),
    })
}

/// Parses `<name> MAJOR.MINOR.PATCH` version probe output.
fn parse_version(text: &str) -> Option<(u32, u32, u32)> {
    let last = text.split_whitespace().last()?;
    let mut parts = last.split('.');
    let maj = parts.next()?.parse().ok()?;
    let min = parts.next()?.parse().ok()?;
    let pl = parts.next()?.parse().ok()?;
    Some((maj, min, pl))
}

// =============================================================================
// Child Handle
// =============================================================================

/// A running sandboxed child. Owned by the caller after launch.
#[derive(Debug)]
pub struct SandboxedChild {
    child: Child,
}

impl SandboxedChild {
    /// Waits for the child to exit.
    ///
    /// # Errors
    ///
    /// Propagates waitpid failures.
    pub async fn wait(&mut self) -> Result<ExitStatus> {
        Ok(self.child.wait().await?)
    }

    /// Kills the child with SIGKILL.
    pub fn kill(&mut self) {
        let _ = self.child.start_kill();
    }

    /// Sends a signal to the child, if it is still running.
    pub fn signal(&mut self, sig: i32) {
        if let Some(pid) = self.child.id() {
            unsafe {
                libc::kill(pid as libc::pid_t, sig);
            }
        }
    }

    /// OS pid of the child, while running.
    #[must_use]
    pub fn id(&self) -> Option<u32> {
        self.child.id()
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_version_standard() {
        assert_eq!(parse_version("bubblewrap 0.4.1\n"), Some((0, 4, 1)));
    }

    #[test]
    fn test_parse_version_bare() {
        assert_eq!(parse_version("0.1.3"), Some((0, 1, 3)));
    }

    #[test]
    fn test_parse_version_garbage() {
        assert_eq!(parse_version("not a version"), None);
        assert_eq!(parse_version(""), None);
        assert_eq!(parse_version("helper 1.2"), None);
    }

    #[test]
    fn test_version_ordering() {
        // Tuple comparison does the right thing for the gate.
        assert!((0, 1, 3) >= HELPER_MIN_VERSION);
        assert!((0, 2, 0) >= HELPER_MIN_VERSION);
        assert!((1, 0, 0) >= HELPER_MIN_VERSION);
        assert!((0, 1, 2) < HELPER_MIN_VERSION);
    }
}
