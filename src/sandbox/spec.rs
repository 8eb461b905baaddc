//! Declarative description of one sandboxed child invocation.
//!
//! A [`SandboxSpec`] accumulates mounts, environment, injected files, and
//! namespace options in insertion order; the runner serializes it into the
//! NUL-separated directive stream the helper reads from fd 3. Injected
//! files are numbered in the order they were added, starting at fd 4, and
//! the optional seccomp pipe always comes last.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use crate::constants::{HELPER_ARGS_FD, SANDBOX_HOME, SANDBOX_HOSTNAME};
use crate::error::{Error, Result};

/// Callback that receives the write end of the helper's seccomp pipe and
/// must write a complete BPF program into it.
pub type SeccompEmitter = Box<dyn FnOnce(std::fs::File) -> Result<()> + Send + 'static>;

// =============================================================================
// Namespace Options
// =============================================================================

/// Which namespaces to unshare for the child.
///
/// `user` and `cgroup` are best-effort: the helper is asked to try, and
/// proceeds without them on kernels where they are unavailable.
#[derive(Debug, Clone, Copy)]
pub struct UnshareOpts {
    pub user: bool,
    pub ipc: bool,
    pub pid: bool,
    pub net: bool,
    pub uts: bool,
    pub cgroup: bool,
}

impl UnshareOpts {
    /// Unshare everything possible.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            user: true,
            ipc: true,
            pid: true,
            net: true,
            uts: true,
            cgroup: true,
        }
    }

    fn push_args(self, args: &mut Vec<String>) {
        if self.user {
            args.push("--unshare-user-try".into());
        }
        if self.ipc {
            args.push("--unshare-ipc".into());
        }
        if self.pid {
            args.push("--unshare-pid".into());
        }
        if self.net {
            args.push("--unshare-net".into());
        }
        if self.uts {
            args.push("--unshare-uts".into());
        }
        if self.cgroup {
            args.push("--unshare-cgroup-try".into());
        }
    }
}

// =============================================================================
// SandboxSpec
// =============================================================================

/// Builder for one child invocation.
///
/// The spec is a plain value until handed to the runner; nothing here
/// touches the host beyond existence checks on bind sources.
pub struct SandboxSpec {
    pub(crate) child: PathBuf,
    pub(crate) child_args: Vec<String>,

    pub(crate) unshare: UnshareOpts,
    pub(crate) hostname: Option<String>,
    pub(crate) runtime_dir: String,
    pub(crate) home_dir: String,
    pub(crate) chdir: Option<String>,
    pub(crate) mount_proc: bool,
    pub(crate) standard_libs: bool,
    pub(crate) fake_dbus: bool,
    pub(crate) pdeath_sig: i32,

    pub(crate) stdin: Option<Stdio>,
    pub(crate) stdout: Option<Stdio>,
    pub(crate) stderr: Option<Stdio>,

    pub(crate) seccomp_fn: Option<SeccompEmitter>,

    // Directive tokens and injected file bodies, in insertion order.
    pub(crate) args: Vec<String>,
    pub(crate) file_data: Vec<Vec<u8>>,
}

impl SandboxSpec {
    /// Creates a spec with the restrictive defaults every launch shares:
    /// all namespaces unshared, a fresh procfs, the standard library
    /// directories bound read-only, and SIGTERM on launcher death.
    pub fn new(child: impl Into<PathBuf>) -> Self {
        let uid = unsafe { libc::getuid() };
        Self {
            child: child.into(),
            child_args: Vec::new(),
            unshare: UnshareOpts::all(),
            hostname: Some(SANDBOX_HOSTNAME.to_string()),
            runtime_dir: format!("/run/user/{uid}"),
            home_dir: SANDBOX_HOME.to_string(),
            chdir: None,
            mount_proc: true,
            standard_libs: true,
            fake_dbus: false,
            pdeath_sig: libc::SIGTERM,
            stdin: None,
            stdout: None,
            stderr: None,
            seccomp_fn: None,
            args: Vec::new(),
            file_data: Vec::new(),
        }
    }

    /// Arguments passed to the child executable.
    pub fn child_args<I, S>(&mut self, args: I) -> &mut Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.child_args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Overrides the namespace set.
    pub fn unshare(&mut self, opts: UnshareOpts) -> &mut Self {
        self.unshare = opts;
        self
    }

    /// Sets the UTS hostname. Requires `unshare.uts`; validated before the
    /// helper is forked.
    pub fn hostname(&mut self, hostname: Option<String>) -> &mut Self {
        self.hostname = hostname;
        self
    }

    /// Toggles the fresh procfs mount.
    pub fn mount_proc(&mut self, yes: bool) -> &mut Self {
        self.mount_proc = yes;
        self
    }

    /// Toggles the read-only standard library binds.
    pub fn standard_libs(&mut self, yes: bool) -> &mut Self {
        self.standard_libs = yes;
        self
    }

    /// Injects a deterministic dbus machine-id.
    pub fn fake_dbus(&mut self, yes: bool) -> &mut Self {
        self.fake_dbus = yes;
        self
    }

    /// Signal delivered to the child when the launcher dies.
    pub fn pdeath_signal(&mut self, sig: i32) -> &mut Self {
        self.pdeath_sig = sig;
        self
    }

    /// Working directory inside the sandbox.
    pub fn chdir(&mut self, dir: impl Into<String>) -> &mut Self {
        self.chdir = Some(dir.into());
        self
    }

    /// Callback that writes the compiled seccomp program.
    pub fn seccomp(&mut self, f: SeccompEmitter) -> &mut Self {
        self.seccomp_fn = Some(f);
        self
    }

    /// Child stdio streams; inherited from the launcher when unset.
    pub fn stdio(&mut self, stdin: Stdio, stdout: Stdio, stderr: Stdio) -> &mut Self {
        self.stdin = Some(stdin);
        self.stdout = Some(stdout);
        self.stderr = Some(stderr);
        self
    }

    // =========================================================================
    // Ordered Directives
    // =========================================================================

    /// Sets an environment variable for the child.
    pub fn setenv(&mut self, k: &str, v: &str) -> &mut Self {
        self.push_args(&["--setenv", k, v]);
        self
    }

    /// Creates an empty directory inside the sandbox.
    pub fn dir(&mut self, dest: &str) -> &mut Self {
        self.push_args(&["--dir", dest]);
        self
    }

    /// Creates a symlink inside the sandbox.
    pub fn symlink(&mut self, src: &str, dest: &str) -> &mut Self {
        self.push_args(&["--symlink", src, dest]);
        self
    }

    /// Read-write bind mount. A missing source is an error unless
    /// `optional`, in which case the mount is silently dropped.
    pub fn bind(&mut self, src: impl AsRef<Path>, dest: &str, optional: bool) -> Result<&mut Self> {
        self.bind_inner("--bind", src.as_ref(), dest, optional)
    }

    /// Read-only bind mount, same missing-source semantics as [`Self::bind`].
    pub fn ro_bind(
        &mut self,
        src: impl AsRef<Path>,
        dest: &str,
        optional: bool,
    ) -> Result<&mut Self> {
        self.bind_inner("--ro-bind", src.as_ref(), dest, optional)
    }

    fn bind_inner(
        &mut self,
        flavor: &str,
        src: &Path,
        dest: &str,
        optional: bool,
    ) -> Result<&mut Self> {
        if !src.exists() {
            if optional {
                return Ok(self);
            }
            return Err(Error::BindSourceMissing(src.to_path_buf()));
        }
        let src = src.to_string_lossy().into_owned();
        self.push_args(&[flavor, &src, dest]);
        Ok(self)
    }

    /// Injects a file with the given content via pipe. The helper reads the
    /// body from the fd recorded in the directive stream.
    pub fn file(&mut self, dest: &str, data: Vec<u8>) -> &mut Self {
        let fd = HELPER_ARGS_FD + 1 + self.file_data.len() as i32;
        let fd = fd.to_string();
        self.push_args(&["--file", &fd, dest]);
        self.file_data.push(data);
        self
    }

    fn push_args(&mut self, args: &[&str]) {
        self.args.extend(args.iter().map(|s| (*s).to_string()));
    }

    // =========================================================================
    // Serialization
    // =========================================================================

    /// Produces the full directive token stream, in the order the helper
    /// must see it: the fixed prologue, namespace switches, then every
    /// recorded directive in insertion order.
    ///
    /// # Errors
    ///
    /// Fails fast if a hostname is set without a new UTS namespace.
    pub(crate) fn finalize_args(&mut self) -> Result<Vec<String>> {
        let mut out: Vec<String> = Vec::with_capacity(self.args.len() + 32);

        // Standard things required by most applications.
        for tok in [
            "--dev",
            "/dev",
            "--tmpfs",
            "/tmp",
            "--setenv",
            "XDG_RUNTIME_DIR",
        ] {
            out.push(tok.into());
        }
        out.push(self.runtime_dir.clone());
        out.push("--dir".into());
        out.push(self.runtime_dir.clone());
        out.push("--setenv".into());
        out.push("HOME".into());
        out.push(self.home_dir.clone());
        out.push("--dir".into());
        out.push(self.home_dir.clone());

        if self.standard_libs {
            for (src, dest) in [("/usr/lib", "/usr/lib"), ("/lib", "/lib")] {
                out.push("--ro-bind".into());
                out.push(src.into());
                out.push(dest.into());
            }
            #[cfg(target_arch = "x86_64")]
            {
                out.push("--ro-bind".into());
                out.push("/lib64".into());
                out.push("/lib64".into());
                if Path::new("/usr/lib64").exists() {
                    // openSUSE keeps 64 bit libraries here.
                    out.push("--ro-bind".into());
                    out.push("/usr/lib64".into());
                    out.push("/usr/lib64".into());
                }
            }
        }

        self.unshare.push_args(&mut out);

        if let Some(hostname) = &self.hostname {
            if !self.unshare.uts {
                return Err(Error::InvalidSpec(
                    "hostname set without a new UTS namespace".into(),
                ));
            }
            out.push("--hostname".into());
            out.push(hostname.clone());
        }
        if self.mount_proc {
            out.push("--proc".into());
            out.push("/proc".into());
        }
        if let Some(chdir) = &self.chdir {
            out.push("--chdir".into());
            out.push(chdir.clone());
        }

        // Synthetic passwd/group so name lookups inside the sandbox work,
        // normalized to the amnesia user.
        let uid = unsafe { libc::getuid() };
        let gid = unsafe { libc::getgid() };
        let passwd =
            format!("amnesia:x:{uid}:{gid}:Debian Live User,,,:{SANDBOX_HOME}:/bin/bash\n");
        let group = format!("amnesia:x:{gid}:\n");
        self.file("/etc/passwd", passwd.into_bytes());
        self.file("/etc/group", group.into_bytes());

        if self.fake_dbus {
            self.setup_fake_dbus();
        }

        out.append(&mut self.args);
        Ok(out)
    }

    fn setup_fake_dbus(&mut self) {
        const ID_PATH: &str = "/var/lib/dbus/machine-id";
        let mut fake_uuid = [0u8; 16];
        for (i, b) in fake_uuid.iter_mut().enumerate() {
            *b = i as u8;
        }
        self.file(ID_PATH, hex::encode(fake_uuid).into_bytes());
        self.symlink(ID_PATH, "/etc/machine-id"); // openSUSE again.
    }

    /// Number of injected files recorded so far.
    #[must_use]
    pub(crate) fn file_count(&self) -> usize {
        self.file_data.len()
    }
}

impl std::fmt::Debug for SandboxSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxSpec")
            .field("child", &self.child)
            .field("child_args", &self.child_args)
            .field("hostname", &self.hostname)
            .field("args", &self.args)
            .field("files", &self.file_data.len())
            .field("seccomp", &self.seccomp_fn.is_some())
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
