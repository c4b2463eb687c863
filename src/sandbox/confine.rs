//! Namespace confinement for process-sandbox children
//!
//! Every execution enters fresh user, mount and PID namespaces before the
//! interpreter is exec'd:
//!
//! ```text
//! spawned child
//!   ├── unshare(USER | NS | PID)         uid/gid mapped 1:1
//!   ├── tmpfs over /tmp and <root>       sibling sessions disappear
//!   ├── bind <workdir> back in place     same path, same files
//!   └── fork
//!        ├── parent: closes every fd, waits, exits with the child's status
//!        └── child (PID 1): fresh /proc, then rlimits, seccomp, exec
//! ```
//!
//! The workdir is re-attached through the current directory, which still
//! points at the real directory after the tmpfs hides its path. Other
//! sessions' processes live outside the PID namespace, so they can be neither
//! signalled nor inspected through `/proc`.
//!
//! Everything that allocates happens in [`Confinement::prepare`], in the
//! parent. [`Confinement::enter`] only issues syscalls.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::mount::{mount, MsFlags};
use nix::sched::{unshare, CloneFlags};
use nix::sys::wait::{waitpid, WaitStatus};
use nix::unistd::{fork, ForkResult};

/// Size cap of the tmpfs masks
const MASK_OPTIONS: &str = "size=64k,mode=0755";

/// Highest descriptor the waiting parent closes
const MAX_FD: libc::c_int = 4096;

fn cstring(bytes: &[u8]) -> io::Result<CString> {
    CString::new(bytes).map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))
}

fn path_cstring(path: &Path) -> io::Result<CString> {
    cstring(path.as_os_str().as_bytes())
}

/// Pre-built paths and strings for one confined spawn
#[derive(Debug)]
pub struct Confinement {
    root: CString,
    tmp: Option<CString>,
    workdir: CString,
    /// Ancestors of the workdir below `/`, outermost first, then the workdir
    workdir_chain: Vec<CString>,
    uid_map: CString,
    gid_map: CString,
    mask_options: CString,
}

impl Confinement {
    /// Prepare the confinement of a child running in `workdir` under `root`
    pub fn prepare(root: &Path, workdir: &Path) -> io::Result<Self> {
        if !workdir.is_absolute() || !workdir.starts_with(root) {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} is not an absolute path under {}", workdir.display(), root.display()),
            ));
        }

        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };

        let mut workdir_chain: Vec<CString> = workdir
            .ancestors()
            .filter(|p| p.parent().is_some())
            .map(path_cstring)
            .collect::<io::Result<_>>()?;
        workdir_chain.reverse();

        let tmp = Path::new("/tmp");
        Ok(Self {
            root: path_cstring(root)?,
            tmp: tmp.is_dir().then(|| path_cstring(tmp)).transpose()?,
            workdir: path_cstring(workdir)?,
            workdir_chain,
            uid_map: cstring(format!("{} {} 1", uid, uid).as_bytes())?,
            gid_map: cstring(format!("{} {} 1", gid, gid).as_bytes())?,
            mask_options: cstring(MASK_OPTIONS.as_bytes())?,
        })
    }

    /// Enter the namespaces; returns only in the process that goes on to exec
    ///
    /// # Safety
    ///
    /// Must run in a freshly forked, single-threaded child whose current
    /// directory is the workdir, i.e. inside `Command::pre_exec`.
    pub unsafe fn enter(&self) -> io::Result<()> {
        unshare(CloneFlags::CLONE_NEWUSER | CloneFlags::CLONE_NEWNS | CloneFlags::CLONE_NEWPID)
            .map_err(io::Error::from)?;
        write_file(c"/proc/self/setgroups", b"deny")?;
        write_file(c"/proc/self/uid_map", self.uid_map.as_bytes())?;
        write_file(c"/proc/self/gid_map", self.gid_map.as_bytes())?;

        mount(
            None::<&CStr>,
            c"/",
            None::<&CStr>,
            MsFlags::MS_REC | MsFlags::MS_PRIVATE,
            None::<&CStr>,
        )
        .map_err(io::Error::from)?;

        // The root may live under /tmp, so /tmp goes first and the path is
        // rebuilt after each mask. Existing components fail with EEXIST.
        if let Some(tmp) = &self.tmp {
            self.mask(tmp)?;
        }
        self.rebuild_workdir_path();
        self.mask(&self.root)?;
        self.rebuild_workdir_path();
        mount(
            Some(c"."),
            self.workdir.as_c_str(),
            None::<&CStr>,
            MsFlags::MS_BIND | MsFlags::MS_REC,
            None::<&CStr>,
        )
        .map_err(io::Error::from)?;
        if libc::chdir(self.workdir.as_ptr()) != 0 {
            return Err(io::Error::last_os_error());
        }

        // The first child becomes PID 1 of the new namespace
        match fork().map_err(io::Error::from)? {
            ForkResult::Child => {
                // Needs an unobstructed /proc; without it the old view stays
                let _ = mount(
                    Some(c"proc"),
                    c"/proc",
                    Some(c"proc"),
                    MsFlags::MS_NOSUID | MsFlags::MS_NODEV | MsFlags::MS_NOEXEC,
                    None::<&CStr>,
                );
                Ok(())
            }
            ForkResult::Parent { child } => wait_and_exit(child),
        }
    }

    unsafe fn rebuild_workdir_path(&self) {
        for dir in &self.workdir_chain {
            libc::mkdir(dir.as_ptr(), 0o700);
        }
    }

    fn mask(&self, target: &CStr) -> io::Result<()> {
        mount(
            Some(c"tmpfs"),
            target,
            Some(c"tmpfs"),
            MsFlags::MS_NOSUID | MsFlags::MS_NODEV,
            Some(self.mask_options.as_c_str()),
        )
        .map_err(io::Error::from)
    }
}

unsafe fn write_file(path: &CStr, contents: &[u8]) -> io::Result<()> {
    let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    let written = libc::write(fd, contents.as_ptr().cast(), contents.len());
    libc::close(fd);
    if written < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Move the calling process into a cgroup, ignoring failures
///
/// # Safety
///
/// Same contract as [`Confinement::enter`].
pub unsafe fn join_cgroup(procs: &CStr) {
    let _ = write_file(procs, b"0");
}

/// Relay the namespace init's exit status; never returns
///
/// Closing every descriptor releases the output pipes and the spawn error
/// pipe, so the spawning side sees exec succeed once the init execs.
unsafe fn wait_and_exit(child: nix::unistd::Pid) -> ! {
    for fd in 0..MAX_FD {
        libc::close(fd);
    }
    let code = loop {
        match waitpid(child, None) {
            Ok(WaitStatus::Exited(_, code)) => break code,
            Ok(WaitStatus::Signaled(_, signal, _)) => break 128 + signal as i32,
            Ok(_) | Err(nix::errno::Errno::EINTR) => continue,
            Err(_) => break 1,
        }
    };
    libc::_exit(code)
}
