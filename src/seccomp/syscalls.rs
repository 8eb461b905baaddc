//! Syscall name → number tables for the filterable architectures.
//!
//! Rule files refer to syscalls by name; the compiler resolves them here at
//! emission time. Names missing from the table for the target architecture
//! are treated like syscalls unknown to the host kernel: whitelists log and
//! skip them, blacklists simply have nothing to deny.

use super::bpf::Arch;

/// Resolves a syscall name for the given architecture.
#[must_use]
pub fn lookup(arch: Arch, name: &str) -> Option<i64> {
    let table = match arch {
        Arch::X86_64 => X86_64,
        Arch::X86 => X86,
    };
    table
        .binary_search_by(|(n, _)| (*n).cmp(name))
        .ok()
        .map(|idx| table[idx].1)
}

// Sorted by name for binary search. Numbers from the kernel's
// arch/x86/entry/syscalls tables.
const X86_64: &[(&str, i64)] = &[
    ("_sysctl", 156),
    ("accept", 43),
    ("accept4", 288),
    ("access", 21),
    ("acct", 163),
    ("add_key", 248),
    ("adjtimex", 159),
    ("alarm", 37),
    ("arch_prctl", 158),
    ("bind", 49),
    ("bpf", 321),
    ("brk", 12),
    ("capget", 125),
    ("capset", 126),
    ("chdir", 80),
    ("chmod", 90),
    ("chown", 92),
    ("chroot", 161),
    ("clock_adjtime", 305),
    ("clock_getres", 229),
    ("clock_gettime", 228),
    ("clock_nanosleep", 230),
    ("clock_settime", 227),
    ("clone", 56),
    ("close", 3),
    ("connect", 42),
    ("copy_file_range", 326),
    ("creat", 85),
    ("create_module", 174),
    ("delete_module", 176),
    ("dup", 32),
    ("dup2", 33),
    ("dup3", 292),
    ("epoll_create", 213),
    ("epoll_create1", 291),
    ("epoll_ctl", 233),
    ("epoll_pwait", 281),
    ("epoll_wait", 232),
    ("eventfd", 284),
    ("eventfd2", 290),
    ("execve", 59),
    ("execveat", 322),
    ("exit", 60),
    ("exit_group", 231),
    ("faccessat", 269),
    ("fadvise64", 221),
    ("fallocate", 285),
    ("fanotify_init", 300),
    ("fanotify_mark", 301),
    ("fchdir", 81),
    ("fchmod", 91),
    ("fchmodat", 268),
    ("fchown", 93),
    ("fchownat", 260),
    ("fcntl", 72),
    ("fdatasync", 75),
    ("fgetxattr", 193),
    ("finit_module", 313),
    ("flistxattr", 196),
    ("flock", 73),
    ("fork", 57),
    ("fremovexattr", 199),
    ("fsetxattr", 190),
    ("fstat", 5),
    ("fstatfs", 138),
    ("fsync", 74),
    ("ftruncate", 77),
    ("futex", 202),
    ("futimesat", 261),
    ("get_kernel_syms", 177),
    ("get_mempolicy", 239),
    ("get_robust_list", 274),
    ("getcpu", 309),
    ("getcwd", 79),
    ("getdents", 78),
    ("getdents64", 217),
    ("getegid", 108),
    ("geteuid", 107),
    ("getgid", 104),
    ("getgroups", 115),
    ("getitimer", 36),
    ("getpeername", 52),
    ("getpgid", 121),
    ("getpgrp", 111),
    ("getpid", 39),
    ("getppid", 110),
    ("getpriority", 140),
    ("getrandom", 318),
    ("getresgid", 120),
    ("getresuid", 118),
    ("getrlimit", 97),
    ("getrusage", 98),
    ("getsid", 124),
    ("getsockname", 51),
    ("getsockopt", 55),
    ("gettid", 186),
    ("gettimeofday", 96),
    ("getuid", 102),
    ("getxattr", 191),
    ("init_module", 175),
    ("inotify_add_watch", 254),
    ("inotify_init", 253),
    ("inotify_init1", 294),
    ("inotify_rm_watch", 255),
    ("io_cancel", 210),
    ("io_destroy", 207),
    ("io_getevents", 208),
    ("io_setup", 206),
    ("io_submit", 209),
    ("ioctl", 16),
    ("ioperm", 173),
    ("iopl", 172),
    ("ioprio_get", 252),
    ("ioprio_set", 251),
    ("kcmp", 312),
    ("kexec_file_load", 320),
    ("kexec_load", 246),
    ("keyctl", 250),
    ("kill", 62),
    ("lchown", 94),
    ("lgetxattr", 192),
    ("link", 86),
    ("linkat", 265),
    ("listen", 50),
    ("listxattr", 194),
    ("llistxattr", 195),
    ("lookup_dcookie", 212),
    ("lremovexattr", 198),
    ("lseek", 8),
    ("lsetxattr", 189),
    ("lstat", 6),
    ("madvise", 28),
    ("mbind", 237),
    ("membarrier", 324),
    ("memfd_create", 319),
    ("migrate_pages", 256),
    ("mincore", 27),
    ("mkdir", 83),
    ("mkdirat", 258),
    ("mknod", 133),
    ("mknodat", 259),
    ("mlock", 149),
    ("mlock2", 325),
    ("mlockall", 151),
    ("mmap", 9),
    ("modify_ldt", 154),
    ("mount", 165),
    ("move_pages", 279),
    ("mprotect", 10),
    ("mq_getsetattr", 245),
    ("mq_notify", 244),
    ("mq_open", 240),
    ("mq_timedreceive", 243),
    ("mq_timedsend", 242),
    ("mq_unlink", 241),
    ("mremap", 25),
    ("msgctl", 71),
    ("msgget", 68),
    ("msgrcv", 70),
    ("msgsnd", 69),
    ("msync", 26),
    ("munlock", 150),
    ("munlockall", 152),
    ("munmap", 11),
    ("name_to_handle_at", 303),
    ("nanosleep", 35),
    ("newfstatat", 262),
    ("nfsservctl", 180),
    ("open", 2),
    ("open_by_handle_at", 304),
    ("openat", 257),
    ("pause", 34),
    ("perf_event_open", 298),
    ("personality", 135),
    ("pipe", 22),
    ("pipe2", 293),
    ("pivot_root", 155),
    ("poll", 7),
    ("ppoll", 271),
    ("prctl", 157),
    ("pread64", 17),
    ("preadv", 295),
    ("prlimit64", 302),
    ("process_vm_readv", 310),
    ("process_vm_writev", 311),
    ("pselect6", 270),
    ("ptrace", 101),
    ("pwrite64", 18),
    ("pwritev", 296),
    ("quotactl", 179),
    ("read", 0),
    ("readahead", 187),
    ("readlink", 89),
    ("readlinkat", 267),
    ("readv", 19),
    ("reboot", 169),
    ("recvfrom", 45),
    ("recvmmsg", 299),
    ("recvmsg", 47),
    ("remap_file_pages", 216),
    ("removexattr", 197),
    ("rename", 82),
    ("renameat", 264),
    ("renameat2", 316),
    ("request_key", 249),
    ("restart_syscall", 219),
    ("rmdir", 84),
    ("rt_sigaction", 13),
    ("rt_sigpending", 127),
    ("rt_sigprocmask", 14),
    ("rt_sigqueueinfo", 129),
    ("rt_sigreturn", 15),
    ("rt_sigsuspend", 130),
    ("rt_sigtimedwait", 128),
    ("sched_get_priority_max", 146),
    ("sched_get_priority_min", 147),
    ("sched_getaffinity", 204),
    ("sched_getattr", 315),
    ("sched_getparam", 143),
    ("sched_getscheduler", 145),
    ("sched_rr_get_interval", 148),
    ("sched_setaffinity", 203),
    ("sched_setattr", 314),
    ("sched_setparam", 142),
    ("sched_setscheduler", 144),
    ("sched_yield", 24),
    ("seccomp", 317),
    ("select", 23),
    ("semctl", 66),
    ("semget", 64),
    ("semop", 65),
    ("sendfile", 40),
    ("sendmmsg", 307),
    ("sendmsg", 46),
    ("sendto", 44),
    ("set_mempolicy", 238),
    ("set_robust_list", 273),
    ("set_tid_address", 218),
    ("setfsgid", 123),
    ("setfsuid", 122),
    ("setgid", 106),
    ("setgroups", 116),
    ("setitimer", 38),
    ("setns", 308),
    ("setpgid", 109),
    ("setpriority", 141),
    ("setregid", 114),
    ("setresgid", 119),
    ("setresuid", 117),
    ("setreuid", 113),
    ("setrlimit", 160),
    ("setsid", 112),
    ("setsockopt", 54),
    ("setuid", 105),
    ("setxattr", 188),
    ("shmat", 30),
    ("shmctl", 31),
    ("shmdt", 67),
    ("shmget", 29),
    ("shutdown", 48),
    ("sigaltstack", 131),
    ("signalfd", 282),
    ("signalfd4", 289),
    ("socket", 41),
    ("socketpair", 53),
    ("splice", 275),
    ("stat", 4),
    ("statfs", 137),
    ("swapoff", 168),
    ("swapon", 167),
    ("symlink", 88),
    ("symlinkat", 266),
    ("sync", 162),
    ("sync_file_range", 277),
    ("syncfs", 306),
    ("sysfs", 139),
    ("sysinfo", 99),
    ("syslog", 103),
    ("tee", 276),
    ("tgkill", 234),
    ("time", 201),
    ("timer_create", 222),
    ("timer_delete", 226),
    ("timer_getoverrun", 225),
    ("timer_gettime", 224),
    ("timer_settime", 223),
    ("timerfd_create", 283),
    ("timerfd_gettime", 287),
    ("timerfd_settime", 286),
    ("tkill", 200),
    ("truncate", 76),
    ("tuxcall", 184),
    ("umask", 95),
    ("umount2", 166),
    ("uname", 63),
    ("unlink", 87),
    ("unlinkat", 263),
    ("unshare", 272),
    ("uselib", 134),
    ("userfaultfd", 323),
    ("ustat", 136),
    ("utime", 132),
    ("utimensat", 280),
    ("utimes", 235),
    ("vfork", 58),
    ("vhangup", 153),
    ("vmsplice", 278),
    ("wait4", 61),
    ("waitid", 247),
    ("write", 1),
    ("writev", 20),
];

// Subset that the embedded profiles reference; the multiplexed
// socketcall() entries make a full table pointless on this architecture.
const X86: &[(&str, i64)] = &[
    ("_llseek", 140),
    ("_newselect", 142),
    ("_sysctl", 149),
    ("access", 33),
    ("acct", 51),
    ("adjtimex", 124),
    ("brk", 45),
    ("chdir", 12),
    ("chmod", 15),
    ("chown", 182),
    ("chroot", 61),
    ("clock_getres", 266),
    ("clock_gettime", 265),
    ("clone", 120),
    ("close", 6),
    ("creat", 8),
    ("delete_module", 129),
    ("dup", 41),
    ("dup2", 63),
    ("epoll_create", 254),
    ("epoll_create1", 329),
    ("epoll_ctl", 255),
    ("epoll_wait", 256),
    ("eventfd2", 328),
    ("execve", 11),
    ("exit", 1),
    ("exit_group", 252),
    ("fcntl", 55),
    ("fcntl64", 221),
    ("fdatasync", 148),
    ("finit_module", 350),
    ("flock", 143),
    ("fork", 2),
    ("fstat", 108),
    ("fstat64", 197),
    ("fstatfs", 100),
    ("fstatfs64", 269),
    ("fsync", 118),
    ("futex", 240),
    ("getcwd", 183),
    ("getdents", 141),
    ("getdents64", 220),
    ("getegid32", 202),
    ("geteuid32", 201),
    ("getgid32", 200),
    ("getpgid", 132),
    ("getpgrp", 65),
    ("getpid", 20),
    ("getppid", 64),
    ("getpriority", 96),
    ("getrandom", 355),
    ("getresgid32", 211),
    ("getresuid32", 209),
    ("getrusage", 77),
    ("gettid", 224),
    ("gettimeofday", 78),
    ("getuid32", 199),
    ("init_module", 128),
    ("ioctl", 54),
    ("ioperm", 101),
    ("iopl", 110),
    ("kexec_load", 283),
    ("kill", 37),
    ("link", 9),
    ("lseek", 19),
    ("lstat", 107),
    ("lstat64", 196),
    ("madvise", 219),
    ("mincore", 218),
    ("mkdir", 39),
    ("mkdirat", 296),
    ("mlock", 150),
    ("mmap2", 192),
    ("modify_ldt", 123),
    ("mount", 21),
    ("mprotect", 125),
    ("mremap", 163),
    ("munmap", 91),
    ("nanosleep", 162),
    ("open", 5),
    ("openat", 295),
    ("perf_event_open", 336),
    ("personality", 136),
    ("pipe", 42),
    ("pipe2", 331),
    ("pivot_root", 217),
    ("poll", 168),
    ("ppoll", 309),
    ("prctl", 172),
    ("pread64", 180),
    ("prlimit64", 340),
    ("process_vm_readv", 347),
    ("process_vm_writev", 348),
    ("ptrace", 26),
    ("pwrite64", 181),
    ("quotactl", 131),
    ("read", 3),
    ("readahead", 225),
    ("readlink", 85),
    ("reboot", 88),
    ("recv", 102), // socketcall
    ("rename", 38),
    ("restart_syscall", 0),
    ("rmdir", 40),
    ("rt_sigaction", 174),
    ("rt_sigprocmask", 175),
    ("rt_sigreturn", 173),
    ("sched_getaffinity", 242),
    ("sched_setscheduler", 156),
    ("sched_yield", 158),
    ("seccomp", 354),
    ("select", 82),
    ("send", 102), // socketcall
    ("set_robust_list", 311),
    ("set_thread_area", 243),
    ("set_tid_address", 258),
    ("setpriority", 97),
    ("setrlimit", 75),
    ("setsid", 66),
    ("sigaltstack", 186),
    ("sigreturn", 119),
    ("socketcall", 102),
    ("splice", 313),
    ("stat", 106),
    ("stat64", 195),
    ("statfs", 99),
    ("statfs64", 268),
    ("swapoff", 115),
    ("swapon", 87),
    ("symlink", 83),
    ("sysinfo", 116),
    ("syslog", 103),
    ("tgkill", 270),
    ("time", 13),
    ("ugetrlimit", 191),
    ("umask", 60),
    ("umount2", 52),
    ("uname", 122),
    ("unlink", 10),
    ("unshare", 310),
    ("uselib", 86),
    ("utime", 30),
    ("utimes", 271),
    ("vfork", 190),
    ("vmsplice", 316),
    ("wait4", 114),
    ("waitpid", 7),
    ("write", 4),
    ("writev", 146),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tables_are_sorted() {
        for table in [X86_64, X86] {
            for w in table.windows(2) {
                assert!(w[0].0 < w[1].0, "table out of order at {}", w[1].0);
            }
        }
    }

    #[test]
    fn test_lookup_known() {
        assert_eq!(lookup(Arch::X86_64, "read"), Some(0));
        assert_eq!(lookup(Arch::X86_64, "prctl"), Some(157));
        assert_eq!(lookup(Arch::X86, "read"), Some(3));
    }

    #[test]
    fn test_lookup_unknown() {
        assert_eq!(lookup(Arch::X86_64, "no_such_syscall"), None);
    }
}
