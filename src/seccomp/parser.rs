//! Parser for the declarative seccomp rule-file format.
//!
//! The format is UTF-8 and line-oriented. Blank lines and lines starting
//! with `#` are skipped; an inline `#` trims the rest of the line. The two
//! meaningful line shapes are:
//!
//! ```text
//! PR_SET_NAME = 15            # declaration: bind a named constant
//! prctl : arg0 == PR_SET_NAME # rule: conditional on argument registers
//! read : 1                    # rule: unconditional
//! ```
//!
//! Conditions join with `||`. Values for the same argument register are
//! ORed, conditions on distinct registers are ANDed. A value may be a
//! literal integer (decimal, `0x` hex, or `0` octal), a declared or
//! predefined identifier, or a `|`-joined expression of those, so
//! `flock : arg1 == LOCK_EX|LOCK_NB || arg1 == LOCK_UN` resolves the way
//! the C headers read.

use std::collections::{BTreeMap, HashMap};

use crate::error::{Error, Result};

// =============================================================================
// Constants Environment
// =============================================================================

/// Named constants resolvable from rule-file conditions.
///
/// Seeded once at startup with the identifiers the embedded profiles
/// depend on; rule files can extend it with their own declarations.
#[derive(Debug, Clone)]
pub struct SeccompEnvironment {
    consts: HashMap<String, u64>,
}

impl SeccompEnvironment {
    /// Creates an environment with no predefined identifiers.
    #[must_use]
    pub fn empty() -> Self {
        Self {
            consts: HashMap::new(),
        }
    }

    /// Defines (or redefines) a named constant.
    pub fn define(&mut self, name: &str, value: u64) {
        self.consts.insert(name.to_string(), value);
    }

    /// Looks up a named constant.
    #[must_use]
    pub fn resolve(&self, name: &str) -> Option<u64> {
        self.consts.get(name).copied()
    }
}

impl Default for SeccompEnvironment {
    /// The identifiers every profile may take for granted.
    fn default() -> Self {
        let mut env = Self::empty();

        // prctl(2) operations.
        env.define("PR_SET_PDEATHSIG", 1);
        env.define("PR_SET_DUMPABLE", 4);
        env.define("PR_SET_NAME", 15);
        env.define("PR_GET_NAME", 16);
        env.define("PR_SET_SECCOMP", 22);
        env.define("PR_GET_TIMERSLACK", 30);

        // Address families.
        env.define("AF_UNIX", 1);
        env.define("AF_INET", 2);
        env.define("AF_INET6", 10);
        env.define("AF_NETLINK", 16);

        // epoll_ctl(2) operations.
        env.define("EPOLL_CTL_ADD", 1);
        env.define("EPOLL_CTL_DEL", 2);
        env.define("EPOLL_CTL_MOD", 3);
        env.define("EPOLL_CLOEXEC", 0o2000000);

        // mmap(2)/mprotect(2) protections.
        env.define("PROT_NONE", 0);
        env.define("PROT_READ", 1);
        env.define("PROT_WRITE", 2);

        // flock(2) operations.
        env.define("LOCK_EX", 2);
        env.define("LOCK_NB", 4);
        env.define("LOCK_UN", 8);

        // rt_sigprocmask(2) how values.
        env.define("SIG_BLOCK", 0);
        env.define("SIG_UNBLOCK", 1);
        env.define("SIG_SETMASK", 2);

        // futex(2) operations, private variants included.
        env.define("FUTEX_WAIT", 0);
        env.define("FUTEX_WAKE", 1);
        env.define("FUTEX_PRIVATE_FLAG", 128);
        env.define("FUTEX_CLOCK_REALTIME", 256);
        env.define("FUTEX_WAIT_PRIVATE", 128);
        env.define("FUTEX_WAKE_PRIVATE", 129);
        env.define("FUTEX_CMP_REQUEUE_PRIVATE", 132);
        env.define("FUTEX_WAKE_OP_PRIVATE", 133);
        env.define("FUTEX_WAIT_BITSET_PRIVATE", 137);
        env.define("FUTEX_WAKE_BITSET_PRIVATE", 138);

        env
    }
}

// =============================================================================
// Parsed Rules
// =============================================================================

/// One parsed rule line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParsedRule {
    /// Syscall name as written in the file.
    pub syscall: String,
    /// Per-register allowed values: register → ORed values, registers ANDed.
    /// Empty map means the rule is unconditional.
    pub conds: BTreeMap<u8, Vec<u64>>,
}

impl ParsedRule {
    /// True if this rule matches the syscall regardless of arguments.
    #[must_use]
    pub fn is_unconditional(&self) -> bool {
        self.conds.is_empty()
    }
}

/// Parses a rule file against the given constants environment.
///
/// Declarations inside the file extend a local copy of the environment and
/// are visible to every later line.
///
/// # Errors
///
/// `PolicySyntax` for malformed lines and out-of-range argument registers,
/// `UnknownConstant` for unresolvable identifiers.
pub fn parse_rules(src: &str, env: &SeccompEnvironment) -> Result<Vec<ParsedRule>> {
    let mut env = env.clone();
    let mut rules = Vec::new();

    for (idx, raw) in src.lines().enumerate() {
        let lineno = idx + 1;
        let line = match raw.find('#') {
            Some(pos) => &raw[..pos],
            None => raw,
        };
        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        if let Some((name, cond)) = line.split_once(':') {
            rules.push(parse_rule(lineno, name.trim(), cond.trim(), &env)?);
        } else if let Some((name, value)) = line.split_once('=') {
            let name = name.trim();
            if !is_identifier(name) {
                return Err(syntax(lineno, format!("invalid constant name '{name}'")));
            }
            let value = parse_int(value.trim())
                .ok_or_else(|| syntax(lineno, format!("invalid integer '{}'", value.trim())))?;
            env.define(name, value);
        } else {
            return Err(syntax(lineno, "expected 'name : cond' or 'NAME = value'"));
        }
    }

    Ok(rules)
}

fn parse_rule(
    lineno: usize,
    syscall: &str,
    cond: &str,
    env: &SeccompEnvironment,
) -> Result<ParsedRule> {
    if !is_identifier(syscall) {
        return Err(syntax(lineno, format!("invalid syscall name '{syscall}'")));
    }
    if cond.is_empty() {
        return Err(syntax(lineno, "rule has no condition"));
    }

    let mut conds: BTreeMap<u8, Vec<u64>> = BTreeMap::new();
    if cond != "1" {
        for clause in cond.split("||") {
            let clause = clause.trim();
            let (arg, value) = clause
                .split_once("==")
                .ok_or_else(|| syntax(lineno, format!("expected 'argN == value' in '{clause}'")))?;

            let arg = arg.trim();
            let reg = arg
                .strip_prefix("arg")
                .and_then(|n| n.parse::<u8>().ok())
                .ok_or_else(|| syntax(lineno, format!("invalid argument register '{arg}'")))?;
            if reg > 5 {
                return Err(syntax(
                    lineno,
                    format!("argument register {reg} out of range 0..=5"),
                ));
            }

            let value = resolve_value(value.trim(), env)?;
            conds.entry(reg).or_default().push(value);
        }
    }

    Ok(ParsedRule {
        syscall: syscall.to_string(),
        conds,
    })
}

/// Resolves a value expression: int literal, identifier, or `|`-joined mix.
fn resolve_value(expr: &str, env: &SeccompEnvironment) -> Result<u64> {
    let mut acc = 0u64;
    for part in expr.split('|') {
        let part = part.trim();
        let v = if let Some(v) = parse_int(part) {
            v
        } else {
            env.resolve(part)
                .ok_or_else(|| Error::UnknownConstant(part.to_string()))?
        };
        acc |= v;
    }
    Ok(acc)
}

fn parse_int(s: &str) -> Option<u64> {
    if s.is_empty() || !s.bytes().next().is_some_and(|b| b.is_ascii_digit()) {
        return None;
    }
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        u64::from_str_radix(hex, 16).ok()
    } else if s != "0" && s.starts_with('0') {
        u64::from_str_radix(&s[1..], 8).ok()
    } else {
        s.parse().ok()
    }
}

fn is_identifier(s: &str) -> bool {
    !s.is_empty()
        && s.bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'_')
}

fn syntax(line: usize, reason: impl Into<String>) -> Error {
    Error::PolicySyntax {
        line,
        reason: reason.into(),
    }
}

// =============================================================================
// Tests
// =============================================================================
