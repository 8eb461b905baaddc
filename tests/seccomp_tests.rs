//! Tests for the seccomp policy compiler.
//!
//! Validates the rule-file grammar end to end: parse, resolve, compile,
//! and check the emitted BPF against the wire format the sandbox helper
//! hands to the kernel.

use orbox::seccomp::{Arch, SeccompEnvironment, SeccompProgram};
use orbox::Error;

// 8-byte little-endian sock_filter records.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Insn {
    code: u16,
    jt: u8,
    jf: u8,
    k: u32,
}

fn decode(buf: &[u8]) -> Vec<Insn> {
    assert_eq!(buf.len() % 8, 0, "program must be whole records");
    buf.chunks_exact(8)
        .map(|rec| Insn {
            code: u16::from_le_bytes([rec[0], rec[1]]),
            jt: rec[2],
            jf: rec[3],
            k: u32::from_le_bytes([rec[4], rec[5], rec[6], rec[7]]),
        })
        .collect()
}

fn compile(src: &str, whitelist: bool) -> Vec<u8> {
    let mut program = if whitelist {
        SeccompProgram::whitelist(Arch::X86_64)
    } else {
        SeccompProgram::blacklist(Arch::X86_64)
    };
    program
        .load_rules(src, &SeccompEnvironment::default())
        .expect("rules should parse");
    let mut buf = Vec::new();
    program.compile(&mut buf).expect("compile should succeed");
    buf
}

const BPF_RET: u16 = 0x06;
const RET_ALLOW: u32 = 0x7fff_0000;
const RET_ENOSYS: u32 = 0x0005_0000 | 38;
const RET_KILL: u32 = 0x0000_0000;

// =============================================================================
// Whitelist Compilation
// =============================================================================

#[test]
fn test_whitelist_compiles_with_conditions() {
    let src = "PR_SET_NAME = 15\nprctl : arg0 == PR_SET_NAME\nread : 1\n";
    let prog = decode(&compile(src, true));

    // Architecture guard up front, bad-arch action is kill.
    assert_eq!(prog[0].k, 4, "arch offset in seccomp_data");
    assert_eq!(prog[1].k, 0xc000_003e, "AUDIT_ARCH_X86_64");
    assert_eq!(prog[2].code, BPF_RET);
    assert_eq!(prog[2].k, RET_KILL);

    // Default action must be ENOSYS.
    let last = prog.last().unwrap();
    assert_eq!(last.code, BPF_RET);
    assert_eq!(last.k, RET_ENOSYS);

    // The prctl block: nr 157, arg0 compared against 15 in both halves.
    assert_eq!(prog[4].k, 157, "prctl syscall number");
    assert_eq!(prog[5].k, 16, "arg0 low half offset");
    assert_eq!(prog[6].k, 15, "PR_SET_NAME");
    assert_eq!(prog[7].k, 20, "arg0 high half offset");
    assert_eq!(prog[8].k, 0, "high half of a small constant");
    assert_eq!(prog[9].code, BPF_RET);
    assert_eq!(prog[9].k, RET_ALLOW);

    // The read block: unconditional allow.
    assert_eq!(prog[11].k, 0, "read syscall number");
    assert_eq!(prog[12].code, BPF_RET);
    assert_eq!(prog[12].k, RET_ALLOW);
}

#[test]
fn test_declaration_only_input_enforces_default_only() {
    let src = "# comments\n\nSOME = 1\nOTHER = 0x2\n";
    let prog = decode(&compile(src, true));
    // Guard (3 instructions) plus the default return, nothing else.
    assert_eq!(prog.len(), 4);
    assert_eq!(prog[3].k, RET_ENOSYS);
}

#[test]
fn test_compilation_is_byte_identical() {
    let src = "flock : arg1 == LOCK_EX|LOCK_NB || arg1 == LOCK_UN\nwrite : 1\n";
    assert_eq!(compile(src, true), compile(src, true));
}

#[test]
fn test_blacklist_defaults_to_allow_and_rules_to_eperm() {
    let src = "ptrace : 1\n";
    let prog = decode(&compile(src, false));

    let last = prog.last().unwrap();
    assert_eq!(last.k, RET_ALLOW, "blacklist default must allow");

    // The ptrace block returns EPERM.
    assert_eq!(prog[4].k, 101, "ptrace syscall number");
    assert_eq!(prog[5].k, 0x0005_0000 | 1, "EPERM errno return");
}

#[test]
fn test_or_values_emit_one_block_per_value() {
    let src = "socket : arg0 == AF_UNIX || arg0 == AF_INET\n";
    let prog = decode(&compile(src, true));
    let socket_blocks = prog.iter().filter(|i| i.k == 41 && i.code != BPF_RET).count();
    assert_eq!(socket_blocks, 2, "one match block per OR value");
}

// =============================================================================
// Failure Modes
// =============================================================================

#[test]
fn test_unknown_constant_is_fatal() {
    let mut program = SeccompProgram::whitelist(Arch::X86_64);
    let err = program
        .load_rules("prctl : arg0 == PR_MADE_UP\n", &SeccompEnvironment::default())
        .unwrap_err();
    assert!(matches!(err, Error::UnknownConstant(name) if name == "PR_MADE_UP"));
}

#[test]
fn test_register_out_of_range_is_rejected() {
    let mut program = SeccompProgram::whitelist(Arch::X86_64);
    let err = program
        .load_rules("read : arg6 == 1\n", &SeccompEnvironment::default())
        .unwrap_err();
    assert!(matches!(err, Error::PolicySyntax { .. }));
}

#[test]
fn test_malformed_rule_line_is_fatal() {
    let mut program = SeccompProgram::whitelist(Arch::X86_64);
    let err = program
        .load_rules("read == 1\nnot even close\n", &SeccompEnvironment::default())
        .unwrap_err();
    assert!(matches!(err, Error::PolicySyntax { .. }));
}

#[test]
fn test_unknown_syscall_does_not_fail_compilation() {
    // Whitelists tolerate syscalls the table cannot name; the output is
    // as if the rule were absent.
    let with = compile("made_up_syscall : 1\nread : 1\n", true);
    let without = compile("read : 1\n", true);
    assert_eq!(with, without);
}

// =============================================================================
// Embedded Profiles
// =============================================================================

#[test]
fn test_embedded_profiles_compile() {
    let env = SeccompEnvironment::default();
    for profile in [
        orbox::seccomp::browser_profile(&env).unwrap(),
        orbox::seccomp::tor_profile(&env, false).unwrap(),
        orbox::seccomp::tor_profile(&env, true).unwrap(),
        orbox::seccomp::update_profile(&env).unwrap(),
        orbox::seccomp::basic_blacklist(),
    ] {
        let mut buf = Vec::new();
        profile.compile(&mut buf).expect("profile must compile");
        let prog = decode(&buf);
        assert!(prog.len() > 4, "profiles are not empty");
        assert!(
            prog.len() < 0xffff,
            "profiles fit the kernel instruction ceiling"
        );
    }
}
