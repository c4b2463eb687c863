//! Seccomp BPF filter denying network sockets to sandboxed children
//!
//! # How it works
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │  socket(AF_INET, ...)   ──►  rule matches  ──►  EPERM        │
//! │  socket(AF_INET6, ...)  ──►  rule matches  ──►  EPERM        │
//! │  socket(AF_UNIX, ...)   ──►  no match      ──►  Allow        │
//! │  anything else          ──►  no match      ──►  Allow        │
//! └──────────────────────────────────────────────────────────────┘
//! ```
//!
//! The program is compiled in the parent and installed in the child between
//! `fork` and `exec`, where it is inherited by everything the code spawns.
//! Returning `EPERM` instead of killing lets interpreters report a normal
//! "Operation not permitted" error the model can read.

use std::collections::BTreeMap;
use std::convert::TryInto;
use std::io;

use seccompiler::{
    BpfProgram, SeccompAction, SeccompCmpArgLen, SeccompCmpOp, SeccompCondition, SeccompFilter,
    SeccompRule, TargetArch,
};

/// Address families denied to sandboxed code
const DENIED_FAMILIES: [libc::c_int; 2] = [libc::AF_INET, libc::AF_INET6];

fn backend_error(e: seccompiler::BackendError) -> io::Error {
    io::Error::new(io::ErrorKind::Other, e.to_string())
}

/// Builder for the network-deny filter
pub struct NetworkSeccomp {
    denied_families: Vec<libc::c_int>,
}

impl NetworkSeccomp {
    pub fn new() -> Self {
        Self {
            denied_families: DENIED_FAMILIES.to_vec(),
        }
    }

    /// Also deny sockets of `family`
    pub fn deny_family(&mut self, family: libc::c_int) -> &mut Self {
        if !self.denied_families.contains(&family) {
            self.denied_families.push(family);
        }
        self
    }

    pub fn denied_count(&self) -> usize {
        self.denied_families.len()
    }

    /// Compile to BPF bytecode for the running architecture
    pub fn build(&self) -> Result<BpfProgram, io::Error> {
        let mut socket_rules = Vec::with_capacity(self.denied_families.len());
        for &family in &self.denied_families {
            let condition =
                SeccompCondition::new(0, SeccompCmpArgLen::Dword, SeccompCmpOp::Eq, family as u64)
                    .map_err(backend_error)?;
            socket_rules.push(SeccompRule::new(vec![condition]).map_err(backend_error)?);
        }

        let mut rules: BTreeMap<i64, Vec<SeccompRule>> = BTreeMap::new();
        rules.insert(libc::SYS_socket, socket_rules);

        let arch: TargetArch = std::env::consts::ARCH
            .try_into()
            .map_err(backend_error)?;

        let filter = SeccompFilter::new(
            rules,
            SeccompAction::Allow,
            SeccompAction::Errno(libc::EPERM as u32),
            arch,
        )
        .map_err(backend_error)?;

        filter.try_into().map_err(backend_error)
    }
}

impl Default for NetworkSeccomp {
    fn default() -> Self {
        Self::new()
    }
}

/// Install a compiled filter on the calling thread
///
/// Irreversible. Only meant for a freshly forked child.
pub fn apply(program: &BpfProgram) -> Result<(), io::Error> {
    seccompiler::apply_filter(program).map_err(|e| io::Error::new(io::ErrorKind::Other, e.to_string()))
}
