//! Logical isolation capabilities and their kernel flag values.
//!
//! This is the only place that knows the numeric `CLONE_NEW*` values. They
//! are spelled out rather than taken from the C library headers so that
//! namespaces newer than the installed headers (cgroup, time) still work.

use nix::sched::CloneFlags;
use std::fmt;
use std::os::unix::fs::MetadataExt;
use std::path::PathBuf;
use std::str::FromStr;

/// A kernel resource domain a process can be detached into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Namespace {
    Mount,
    Uts,
    Ipc,
    User,
    Pid,
    Net,
    Cgroup,
    Time,
}

struct NamespaceEntry {
    namespace: Namespace,
    flag: libc::c_int,
    proc_name: &'static str,
}

// Kernel ABI values from include/uapi/linux/sched.h.
const NAMESPACE_TABLE: [NamespaceEntry; 8] = [
    NamespaceEntry { namespace: Namespace::Mount, flag: 0x0002_0000, proc_name: "mnt" },
    NamespaceEntry { namespace: Namespace::Uts, flag: 0x0400_0000, proc_name: "uts" },
    NamespaceEntry { namespace: Namespace::Ipc, flag: 0x0800_0000, proc_name: "ipc" },
    NamespaceEntry { namespace: Namespace::User, flag: 0x1000_0000, proc_name: "user" },
    NamespaceEntry { namespace: Namespace::Pid, flag: 0x2000_0000, proc_name: "pid" },
    NamespaceEntry { namespace: Namespace::Net, flag: 0x4000_0000, proc_name: "net" },
    NamespaceEntry { namespace: Namespace::Cgroup, flag: 0x0200_0000, proc_name: "cgroup" },
    NamespaceEntry { namespace: Namespace::Time, flag: 0x0000_0080, proc_name: "time" },
];

impl Namespace {
    pub const ALL: [Namespace; 8] = [
        Namespace::Mount,
        Namespace::Uts,
        Namespace::Ipc,
        Namespace::User,
        Namespace::Pid,
        Namespace::Net,
        Namespace::Cgroup,
        Namespace::Time,
    ];

    fn entry(self) -> &'static NamespaceEntry {
        // The table lists every variant exactly once, in declaration order.
        &NAMESPACE_TABLE[self as usize]
    }

    pub fn flag(self) -> libc::c_int {
        self.entry().flag
    }

    /// Name used under `/proc/<pid>/ns/`.
    pub fn proc_name(self) -> &'static str {
        self.entry().proc_name
    }

    pub fn proc_path(self) -> PathBuf {
        PathBuf::from(format!("/proc/self/ns/{}", self.proc_name()))
    }

    /// Whether the running kernel exposes this namespace type at all.
    pub fn is_supported(self) -> bool {
        self.proc_path().exists()
    }

    /// Inode identifying the namespace the calling process is currently in.
    pub fn inode(self) -> std::io::Result<u64> {
        Ok(std::fs::metadata(self.proc_path())?.ino())
    }
}

impl fmt::Display for Namespace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.proc_name())
    }
}

impl FromStr for Namespace {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let wanted = s.trim().to_ascii_lowercase();
        let wanted = match wanted.as_str() {
            "mount" | "ns" => "mnt",
            "network" => "net",
            other => other,
        };
        NAMESPACE_TABLE
            .iter()
            .find(|e| e.proc_name == wanted)
            .map(|e| e.namespace)
            .ok_or_else(|| format!("unknown namespace '{}'", s.trim()))
    }
}

/// A set of namespaces, convertible to clone/unshare flags.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NamespaceSet(libc::c_int);

impl NamespaceSet {
    pub const fn empty() -> Self {
        Self(0)
    }

    pub fn with(mut self, namespace: Namespace) -> Self {
        self.insert(namespace);
        self
    }

    pub fn insert(&mut self, namespace: Namespace) {
        self.0 |= namespace.flag();
    }

    pub fn contains(&self, namespace: Namespace) -> bool {
        self.0 & namespace.flag() != 0
    }

    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    pub fn iter(&self) -> impl Iterator<Item = Namespace> + '_ {
        Namespace::ALL.into_iter().filter(|ns| self.contains(*ns))
    }

    pub fn clone_flags(&self) -> CloneFlags {
        CloneFlags::from_bits_retain(self.0)
    }

    /// First member the kernel does not know about, if any.
    pub fn first_unsupported(&self) -> Option<Namespace> {
        self.iter().find(|ns| !ns.is_supported())
    }
}

impl FromIterator<Namespace> for NamespaceSet {
    fn from_iter<I: IntoIterator<Item = Namespace>>(iter: I) -> Self {
        let mut set = NamespaceSet::empty();
        for ns in iter {
            set.insert(ns);
        }
        set
    }
}

impl FromStr for NamespaceSet {
    type Err = String;

    /// Parses a comma separated list such as `uts,net`. Empty input is the
    /// empty set.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.split(',')
            .filter(|part| !part.trim().is_empty())
            .map(str::parse::<Namespace>)
            .collect()
    }
}

impl fmt::Display for NamespaceSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<&str> = self.iter().map(Namespace::proc_name).collect();
        if names.is_empty() {
            f.write_str("none")
        } else {
            f.write_str(&names.join(","))
        }
    }
}
