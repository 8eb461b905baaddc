//! Classic-BPF code generation for seccomp filters.
//!
//! The emitted program follows the layout the kernel expects for
//! `SECCOMP_MODE_FILTER`: an architecture guard, one block per rule that
//! matches the syscall number (and optionally argument registers), and a
//! trailing default action. Records are written as 8-byte little-endian
//! `sock_filter` structs, which is the wire format the sandbox helper
//! consumes on its `--seccomp` file descriptor.

use std::io::Write;

use crate::constants::BPF_MAX_INSNS;
use crate::error::{Error, Result};

// =============================================================================
// BPF Opcodes
// =============================================================================

const BPF_LD: u16 = 0x00;
const BPF_W: u16 = 0x00;
const BPF_ABS: u16 = 0x20;
const BPF_JMP: u16 = 0x05;
const BPF_JEQ: u16 = 0x10;
const BPF_K: u16 = 0x00;
const BPF_RET: u16 = 0x06;

const SECCOMP_RET_ALLOW: u32 = 0x7fff_0000;
const SECCOMP_RET_ERRNO: u32 = 0x0005_0000;
const SECCOMP_RET_KILL: u32 = 0x0000_0000;

// Offsets into `struct seccomp_data`.
const SECCOMP_DATA_NR: u32 = 0;
const SECCOMP_DATA_ARCH: u32 = 4;
const SECCOMP_DATA_ARGS: u32 = 16;

// =============================================================================
// Architecture
// =============================================================================

/// Filterable architectures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    /// 64-bit x86.
    X86_64,
    /// 32-bit x86.
    X86,
}

impl Arch {
    /// Returns the architecture of the running process.
    #[must_use]
    pub fn native() -> Self {
        #[cfg(target_arch = "x86_64")]
        {
            Self::X86_64
        }
        #[cfg(not(target_arch = "x86_64"))]
        {
            Self::X86
        }
    }

    /// AUDIT_ARCH_* value checked by the architecture guard.
    #[must_use]
    pub fn audit_arch(self) -> u32 {
        match self {
            Self::X86_64 => 0xc000_003e, // AUDIT_ARCH_X86_64
            Self::X86 => 0x4000_0003,    // AUDIT_ARCH_I386
        }
    }

    /// True if per-argument conditions can be emitted for this architecture.
    ///
    /// On x86 the multiplexed socketcall() interface and legacy syscall
    /// layout make argument inspection unreliable, so conditional rules
    /// degrade to unconditional ones there.
    #[must_use]
    pub fn supports_arg_filter(self) -> bool {
        matches!(self, Self::X86_64)
    }
}

// =============================================================================
// Actions
// =============================================================================

/// Action taken when a rule (or the default) fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    /// Let the syscall through.
    Allow,
    /// Fail the syscall with the given errno.
    Errno(u16),
    /// Kill the task.
    Kill,
}

impl Action {
    fn ret_k(self) -> u32 {
        match self {
            Self::Allow => SECCOMP_RET_ALLOW,
            Self::Errno(no) => SECCOMP_RET_ERRNO | u32::from(no),
            Self::Kill => SECCOMP_RET_KILL,
        }
    }
}

// =============================================================================
// Instructions
// =============================================================================

/// One classic-BPF instruction, `struct sock_filter`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SockFilter {
    pub code: u16,
    pub jt: u8,
    pub jf: u8,
    pub k: u32,
}

impl SockFilter {
    const fn stmt(code: u16, k: u32) -> Self {
        Self {
            code,
            jt: 0,
            jf: 0,
            k,
        }
    }

    const fn jump(code: u16, k: u32, jt: u8, jf: u8) -> Self {
        Self { code, jt, jf, k }
    }
}

fn load_abs(off: u32) -> SockFilter {
    SockFilter::stmt(BPF_LD | BPF_W | BPF_ABS, off)
}

fn ret(action: Action) -> SockFilter {
    SockFilter::stmt(BPF_RET | BPF_K, action.ret_k())
}

/// Little-endian offsets of the low and high halves of argument register `n`.
fn arg_offsets(n: u8) -> (u32, u32) {
    let base = SECCOMP_DATA_ARGS + 8 * u32::from(n);
    (base, base + 4)
}

// =============================================================================
// Program Assembly
// =============================================================================

/// A single compiled rule: a syscall number plus ANDed argument equalities.
///
/// OR-alternatives are expressed as multiple `MatchRule`s for the same
/// syscall number; the first rule whose conditions all hold fires.
#[derive(Debug, Clone)]
pub struct MatchRule {
    /// Resolved syscall number.
    pub nr: i64,
    /// `(register, value)` equality conditions, all of which must hold.
    pub conds: Vec<(u8, u64)>,
    /// Action when the rule matches.
    pub action: Action,
}

/// Assembles a full filter program.
///
/// Layout per rule: the syscall number is reloaded at the head of every
/// block, so a failed block always falls through to the next with the
/// accumulator in a known state.
pub fn assemble(arch: Arch, default_action: Action, rules: &[MatchRule]) -> Result<Vec<SockFilter>> {
    let mut prog = Vec::with_capacity(3 + rules.len() * 4);

    // Architecture guard.
    prog.push(load_abs(SECCOMP_DATA_ARCH));
    prog.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        arch.audit_arch(),
        1,
        0,
    ));
    prog.push(ret(Action::Kill));

    for rule in rules {
        emit_rule_block(&mut prog, rule)?;
    }

    prog.push(ret(default_action));

    if prog.len() > BPF_MAX_INSNS {
        return Err(Error::ProgramTooLarge {
            len: prog.len(),
            limit: BPF_MAX_INSNS,
        });
    }
    Ok(prog)
}

fn emit_rule_block(prog: &mut Vec<SockFilter>, rule: &MatchRule) -> Result<()> {
    let start = prog.len();

    prog.push(load_abs(SECCOMP_DATA_NR));
    // jf is patched to the end of the block once its length is known.
    let nr_jump = prog.len();
    prog.push(SockFilter::jump(
        BPF_JMP | BPF_JEQ | BPF_K,
        rule.nr as u32,
        0,
        0,
    ));

    // Argument equalities, 64-bit compares as two 32-bit halves.
    let mut fail_jumps = Vec::new();
    for &(reg, value) in &rule.conds {
        let (lo_off, hi_off) = arg_offsets(reg);
        let lo = (value & 0xffff_ffff) as u32;
        let hi = (value >> 32) as u32;

        prog.push(load_abs(lo_off));
        fail_jumps.push(prog.len());
        prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, lo, 0, 0));
        prog.push(load_abs(hi_off));
        fail_jumps.push(prog.len());
        prog.push(SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, hi, 0, 0));
    }

    prog.push(ret(rule.action));
    let end = prog.len();

    let patch = |idx: usize| -> Result<u8> {
        let dist = end - idx - 1;
        u8::try_from(dist).map_err(|_| Error::ProgramTooLarge {
            len: end - start,
            limit: usize::from(u8::MAX),
        })
    };

    prog[nr_jump].jf = patch(nr_jump)?;
    for idx in fail_jumps {
        prog[idx].jf = patch(idx)?;
    }
    Ok(())
}

/// Writes an assembled program in the kernel's wire format.
///
/// Each record is 8 bytes: `code` (LE u16), `jt`, `jf`, `k` (LE u32).
pub fn write_program<W: Write>(w: &mut W, prog: &[SockFilter]) -> Result<()> {
    for insn in prog {
        w.write_all(&insn.code.to_le_bytes())?;
        w.write_all(&[insn.jt, insn.jf])?;
        w.write_all(&insn.k.to_le_bytes())?;
    }
    Ok(())
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_program_is_guard_plus_default() {
        let prog = assemble(Arch::X86_64, Action::Allow, &[]).unwrap();
        assert_eq!(prog.len(), 4);
        assert_eq!(prog[0], load_abs(SECCOMP_DATA_ARCH));
        assert_eq!(prog[1].k, 0xc000_003e);
        assert_eq!(prog[2].k, SECCOMP_RET_KILL);
        assert_eq!(prog[3].k, SECCOMP_RET_ALLOW);
    }

    #[test]
    fn test_unconditional_rule_block() {
        let rules = [MatchRule {
            nr: 0, // read
            conds: Vec::new(),
            action: Action::Allow,
        }];
        let prog = assemble(Arch::X86_64, Action::Errno(38), &rules).unwrap();
        // guard(3) + [ld nr, jeq, ret](3) + default(1)
        assert_eq!(prog.len(), 7);
        assert_eq!(prog[3], load_abs(SECCOMP_DATA_NR));
        assert_eq!(prog[4].k, 0);
        assert_eq!(prog[4].jf, 1, "miss must skip the ret");
        assert_eq!(prog[5].k, SECCOMP_RET_ALLOW);
        assert_eq!(prog[6].k, SECCOMP_RET_ERRNO | 38);
    }

    #[test]
    fn test_conditional_rule_compares_both_halves() {
        let rules = [MatchRule {
            nr: 157, // prctl
            conds: vec![(0, 15)],
            action: Action::Allow,
        }];
        let prog = assemble(Arch::X86_64, Action::Errno(38), &rules).unwrap();
        // guard(3) + [ld nr, jeq nr, ld lo, jeq lo, ld hi, jeq hi, ret](7) + default(1)
        assert_eq!(prog.len(), 11);
        assert_eq!(prog[5].k, SECCOMP_DATA_ARGS); // arg0 low half
        assert_eq!(prog[6].k, 15);
        assert_eq!(prog[7].k, SECCOMP_DATA_ARGS + 4); // arg0 high half
        assert_eq!(prog[8].k, 0);
        // A failed low-half compare must land on the default action.
        assert_eq!(prog[6].jf, 3);
    }

    #[test]
    fn test_assembly_is_deterministic() {
        let rules = [
            MatchRule {
                nr: 41,
                conds: vec![(0, 1)],
                action: Action::Allow,
            },
            MatchRule {
                nr: 0,
                conds: Vec::new(),
                action: Action::Allow,
            },
        ];
        let a = assemble(Arch::X86_64, Action::Errno(38), &rules).unwrap();
        let b = assemble(Arch::X86_64, Action::Errno(38), &rules).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_wire_format_is_little_endian() {
        let prog = vec![SockFilter::jump(BPF_JMP | BPF_JEQ | BPF_K, 0x0102_0304, 7, 9)];
        let mut buf = Vec::new();
        write_program(&mut buf, &prog).unwrap();
        assert_eq!(buf, vec![0x15, 0x00, 7, 9, 0x04, 0x03, 0x02, 0x01]);
    }
}
