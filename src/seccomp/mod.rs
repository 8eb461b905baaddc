//! Seccomp policy compiler.
//!
//! Turns declarative syscall policies (either rule-file assets or programs
//! built in code) into classic-BPF filter programs and writes them to the
//! file descriptor the sandbox helper consumes.
//!
//! Two polarities exist. A *whitelist* fails everything with `ENOSYS`
//! except the listed syscalls; a *blacklist* allows everything except the
//! listed syscalls, which fail with `EPERM`. The bad-architecture action is
//! always kill.

mod bpf;
mod parser;
mod syscalls;

pub use bpf::{Action, Arch, SockFilter};
pub use parser::{parse_rules, ParsedRule, SeccompEnvironment};

use std::collections::BTreeMap;
use std::io::Write;

use tracing::{debug, warn};

use crate::constants::DEFAULT_DENY_ERRNO;
use crate::error::Result;

// =============================================================================
// Embedded Profiles
// =============================================================================

/// Whitelist applied to the browser process.
const BROWSER_WHITELIST: &str = include_str!("../../assets/browser-whitelist.seccomp");

/// Whitelist applied to the tor daemon.
const TOR_WHITELIST: &str = include_str!("../../assets/tor-whitelist.seccomp");

/// Whitelist applied to the tor daemon when pluggable transports run
/// alongside it.
const TOR_OBFS4_WHITELIST: &str = include_str!("../../assets/tor-obfs4-whitelist.seccomp");

/// Whitelist applied to the MAR updater.
const UPDATE_WHITELIST: &str = include_str!("../../assets/update-whitelist.seccomp");

// =============================================================================
// Program
// =============================================================================

/// Polarity of a filter program.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Polarity {
    /// Default-deny; rules allow.
    Whitelist,
    /// Default-allow; rules deny with EPERM.
    Blacklist,
}

/// A declarative syscall filter, compiled on demand.
///
/// Rules accumulate in insertion order; compilation is deterministic, so
/// the same program always serializes to byte-identical BPF.
#[derive(Debug, Clone)]
pub struct SeccompProgram {
    polarity: Polarity,
    arch: Arch,
    rules: Vec<ParsedRule>,
}

impl SeccompProgram {
    /// Creates an empty whitelist for the given architecture.
    #[must_use]
    pub fn whitelist(arch: Arch) -> Self {
        Self {
            polarity: Polarity::Whitelist,
            arch,
            rules: Vec::new(),
        }
    }

    /// Creates an empty blacklist for the given architecture.
    #[must_use]
    pub fn blacklist(arch: Arch) -> Self {
        Self {
            polarity: Polarity::Blacklist,
            arch,
            rules: Vec::new(),
        }
    }

    /// Parses a rule-file asset into this program.
    ///
    /// # Errors
    ///
    /// Propagates parser failures; a malformed asset is fatal for the
    /// sandbox spec that referenced it.
    pub fn load_rules(&mut self, src: &str, env: &SeccompEnvironment) -> Result<()> {
        self.rules.extend(parse_rules(src, env)?);
        Ok(())
    }

    /// Adds an unconditional rule for one syscall.
    pub fn add(&mut self, syscall: &str) {
        self.rules.push(ParsedRule {
            syscall: syscall.to_string(),
            conds: BTreeMap::new(),
        });
    }

    /// Adds a rule constrained to `arg<reg> == value` for any listed value.
    pub fn add_cmp_eq(&mut self, syscall: &str, reg: u8, values: &[u64]) {
        let mut conds = BTreeMap::new();
        conds.insert(reg, values.to_vec());
        self.rules.push(ParsedRule {
            syscall: syscall.to_string(),
            conds,
        });
    }

    fn rule_action(&self) -> Action {
        match self.polarity {
            Polarity::Whitelist => Action::Allow,
            Polarity::Blacklist => Action::Errno(1), // EPERM
        }
    }

    fn default_action(&self) -> Action {
        match self.polarity {
            Polarity::Whitelist => Action::Errno(DEFAULT_DENY_ERRNO),
            Polarity::Blacklist => Action::Allow,
        }
    }

    /// Compiles the program and writes the BPF records to `w`.
    ///
    /// Unknown syscalls are logged and skipped: a whitelist tolerates the
    /// host being unable to name a call (the child copes or faults), and a
    /// blacklist cannot deny what the kernel does not have. On
    /// architectures without argument filtering, conditions degrade to
    /// unconditional rules.
    ///
    /// # Errors
    ///
    /// Fails if the assembled program exceeds the kernel's 65,535
    /// instruction ceiling or the writer errors.
    pub fn compile<W: Write>(&self, w: &mut W) -> Result<()> {
        let action = self.rule_action();
        let mut match_rules = Vec::with_capacity(self.rules.len());

        for rule in &self.rules {
            let Some(nr) = syscalls::lookup(self.arch, &rule.syscall) else {
                debug!(syscall = %rule.syscall, "skipping unknown syscall");
                continue;
            };

            if rule.is_unconditional() || !self.arch.supports_arg_filter() {
                if !rule.is_unconditional() {
                    warn!(
                        syscall = %rule.syscall,
                        "argument filtering unsupported on this architecture, \
                         degrading to unconditional rule"
                    );
                }
                match_rules.push(bpf::MatchRule {
                    nr,
                    conds: Vec::new(),
                    action,
                });
                continue;
            }

            // OR-alternatives become one MatchRule per combination of
            // per-register values (registers AND together within each).
            for conds in expand_conditions(&rule.conds) {
                match_rules.push(bpf::MatchRule { nr, conds, action });
            }
        }

        let prog = bpf::assemble(self.arch, self.default_action(), &match_rules)?;
        debug!(
            len = prog.len(),
            polarity = ?self.polarity,
            "compiled seccomp filter"
        );
        bpf::write_program(w, &prog)
    }
}

/// Expands per-register OR-values into the cartesian set of AND-only
/// condition lists, preserving register order.
fn expand_conditions(conds: &BTreeMap<u8, Vec<u64>>) -> Vec<Vec<(u8, u64)>> {
    let mut out: Vec<Vec<(u8, u64)>> = vec![Vec::new()];
    for (&reg, values) in conds {
        let mut next = Vec::with_capacity(out.len() * values.len());
        for prefix in &out {
            for &v in values {
                let mut combo = prefix.clone();
                combo.push((reg, v));
                next.push(combo);
            }
        }
        out = next;
    }
    out
}

// =============================================================================
// Profile Constructors
// =============================================================================

/// Whitelist for the browser process, from the embedded asset.
pub fn browser_profile(env: &SeccompEnvironment) -> Result<SeccompProgram> {
    let mut p = SeccompProgram::whitelist(Arch::native());
    p.load_rules(BROWSER_WHITELIST, env)?;
    Ok(p)
}

/// Whitelist for the tor daemon. With bridges enabled the pluggable
/// transport runs in the same sandbox and needs extra calls.
pub fn tor_profile(env: &SeccompEnvironment, use_bridges: bool) -> Result<SeccompProgram> {
    let asset = if use_bridges {
        TOR_OBFS4_WHITELIST
    } else {
        TOR_WHITELIST
    };
    let mut p = SeccompProgram::whitelist(Arch::native());
    p.load_rules(asset, env)?;
    Ok(p)
}

/// Whitelist for the MAR updater, from the embedded asset.
pub fn update_profile(env: &SeccompEnvironment) -> Result<SeccompProgram> {
    let mut p = SeccompProgram::whitelist(Arch::native());
    p.load_rules(UPDATE_WHITELIST, env)?;
    Ok(p)
}

/// The basic blacklist, constructed in code.
///
/// Denies syscalls that have no business being executed from inside the
/// sandbox: namespace escapes, module loading, raw device access,
/// profiling interfaces, and historic information leaks.
#[must_use]
pub fn basic_blacklist() -> SeccompProgram {
    let mut p = SeccompProgram::blacklist(Arch::native());
    for call in [
        "syslog",
        "uselib",
        "personality",
        "acct",
        "modify_ldt",
        "quotactl",
        // NUMA / page migration.
        "move_pages",
        "mbind",
        "get_mempolicy",
        "set_mempolicy",
        "migrate_pages",
        // Subnamespace setups.
        "unshare",
        "mount",
        "pivot_root",
        // Profiling; perf has been a long-running CVE farm.
        "perf_event_open",
        "ptrace",
        "umount2",
        "kexec_load",
        "open_by_handle_at",
        "name_to_handle_at",
        "create_module",
        "init_module",
        "finit_module",
        "delete_module",
        "iopl",
        "ioperm",
        "ioprio_set",
        "swapon",
        "swapoff",
        "process_vm_readv",
        "process_vm_writev",
        "sysfs",
        "_sysctl",
        "adjtimex",
        "clock_adjtime",
        "lookup_dcookie",
        "fanotify_init",
        "kcmp",
        "add_key",
        "request_key",
        "keyctl",
        "io_setup",
        "io_destroy",
        "io_getevents",
        "io_submit",
        "io_cancel",
        "remap_file_pages",
        "vmsplice",
        "chroot",
        "tuxcall",
        "reboot",
        "nfsservctl",
        "get_kernel_syms",
    ] {
        p.add(call);
    }
    p
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn compile_to_vec(p: &SeccompProgram) -> Vec<u8> {
        let mut buf = Vec::new();
        p.compile(&mut buf).unwrap();
        buf
    }

    #[test]
    fn test_declaration_only_file_enforces_default_only() {
        let src = "# nothing but prose\nSOME_CONST = 42\n";
        let mut p = SeccompProgram::whitelist(Arch::X86_64);
        p.load_rules(src, &SeccompEnvironment::default()).unwrap();
        let buf = compile_to_vec(&p);
        // guard (3 insns) + default ret only.
        assert_eq!(buf.len(), 4 * 8);
    }

    #[test]
    fn test_compilation_is_idempotent() {
        let src = "PR_SET_NAME = 15\nprctl : arg0 == PR_SET_NAME\nread : 1\n";
        let mut p = SeccompProgram::whitelist(Arch::X86_64);
        p.load_rules(src, &SeccompEnvironment::default()).unwrap();
        assert_eq!(compile_to_vec(&p), compile_to_vec(&p));
    }

    #[test]
    fn test_unknown_syscall_skipped() {
        let mut p = SeccompProgram::whitelist(Arch::X86_64);
        p.load_rules("frobnicate : 1\nread : 1\n", &SeccompEnvironment::default())
            .unwrap();
        let with_unknown = compile_to_vec(&p);

        let mut q = SeccompProgram::whitelist(Arch::X86_64);
        q.load_rules("read : 1\n", &SeccompEnvironment::default())
            .unwrap();
        assert_eq!(with_unknown, compile_to_vec(&q));
    }

    #[test]
    fn test_conditions_degrade_without_arg_filtering() {
        let src = "prctl : arg0 == PR_SET_NAME\n";
        let mut p = SeccompProgram::whitelist(Arch::X86);
        p.load_rules(src, &SeccompEnvironment::default()).unwrap();
        let conditional = compile_to_vec(&p);

        let mut q = SeccompProgram::whitelist(Arch::X86);
        q.load_rules("prctl : 1\n", &SeccompEnvironment::default())
            .unwrap();
        assert_eq!(conditional, compile_to_vec(&q));
    }

    #[test]
    fn test_expand_conditions_cartesian() {
        let mut conds = BTreeMap::new();
        conds.insert(0u8, vec![1, 2]);
        conds.insert(2u8, vec![9]);
        let expanded = expand_conditions(&conds);
        assert_eq!(
            expanded,
            vec![vec![(0, 1), (2, 9)], vec![(0, 2), (2, 9)]]
        );
    }

    #[test]
    fn test_embedded_profiles_compile() {
        let env = SeccompEnvironment::default();
        for p in [
            browser_profile(&env).unwrap(),
            tor_profile(&env, false).unwrap(),
            tor_profile(&env, true).unwrap(),
            update_profile(&env).unwrap(),
            basic_blacklist(),
        ] {
            let buf = compile_to_vec(&p);
            assert!(buf.len() >= 4 * 8);
            assert_eq!(buf.len() % 8, 0, "must be whole sock_filter records");
        }
    }

    #[test]
    fn test_blacklist_defaults_to_allow() {
        let p = basic_blacklist();
        let buf = compile_to_vec(&p);
        // Final record is the default action: RET | K with SECCOMP_RET_ALLOW.
        let tail = &buf[buf.len() - 8..];
        assert_eq!(&tail[4..], &0x7fff_0000u32.to_le_bytes());
    }
}
