//! Scratch directory and process setup for running untrusted Python.

#[cfg(target_os = "linux")]
use std::ffi::{CStr, CString};
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use anyhow::{Context, Result};
use tempfile::TempDir;
use tokio::process::Command;

use tutorloop_core::config::SandboxLimits;

/// File name the submitted program is written to.
pub const PROGRAM_FILE: &str = "main.py";

/// Variables that must never reach a submitted program, even if a caller
/// re-adds the parent environment.
const SENSITIVE_VARS: &[&str] = &[
    "SSH_AUTH_SOCK",
    "AWS_ACCESS_KEY_ID",
    "AWS_SECRET_ACCESS_KEY",
    "AWS_SESSION_TOKEN",
    "GITHUB_TOKEN",
    "GH_TOKEN",
    "DOCKER_HOST",
    "DOCKER_CONFIG",
    "KUBECONFIG",
    "DATABASE_URL",
    "TUTORLOOP_DATABASE",
    "TUTORLOOP_OLLAMA_URL",
];

/// A private scratch area holding one submitted program.
///
/// The directory is removed when the sandbox is dropped.
pub struct Sandbox {
    work_dir: TempDir,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(limits: SandboxLimits) -> Result<Self> {
        let work_dir = tempfile::Builder::new()
            .prefix("tutorloop-")
            .tempdir()
            .context("failed to create sandbox directory")?;
        Ok(Self { work_dir, limits })
    }

    pub fn work_dir(&self) -> &Path {
        self.work_dir.path()
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    pub fn program_path(&self) -> PathBuf {
        self.work_dir.path().join(PROGRAM_FILE)
    }

    /// Write the submitted program into the scratch area.
    pub fn write_program(&self, code: &str) -> Result<()> {
        std::fs::write(self.program_path(), code)
            .with_context(|| format!("failed to write {PROGRAM_FILE}"))
    }

    /// Environment for child processes. The parent environment is cleared
    /// before these are applied.
    pub fn build_env(&self) -> Vec<(String, String)> {
        let home = self.work_dir.path().to_string_lossy().to_string();
        let mut env = vec![
            (
                "PATH".to_string(),
                "/usr/local/bin:/usr/bin:/bin".to_string(),
            ),
            ("HOME".to_string(), home),
            ("LANG".to_string(), "C.UTF-8".to_string()),
            ("PYTHONIOENCODING".to_string(), "utf-8".to_string()),
        ];

        for var in SENSITIVE_VARS {
            env.push((var.to_string(), String::new()));
        }

        env
    }

    /// A `python3` invocation confined to this sandbox: isolated mode, cwd
    /// in the scratch area, cleared environment, piped stdio, its own
    /// process group and the configured resource limits.
    pub fn python(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new(&self.limits.python);
        cmd.arg("-I")
            .arg("-B")
            .args(args)
            .current_dir(self.work_dir())
            .env_clear()
            .envs(self.build_env())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        #[cfg(unix)]
        {
            cmd.process_group(0);
            confine(&mut cmd, &self.limits, self.work_dir());
        }

        cmd
    }

    pub fn case_timeout(&self) -> Duration {
        self.limits.case_timeout()
    }
}

#[cfg(unix)]
fn confine(cmd: &mut Command, limits: &SandboxLimits, scratch: &Path) {
    let memory = limits.memory_limit_bytes();
    let file_size = limits.file_size_limit_kb * 1024;

    #[cfg(target_os = "linux")]
    let namespaces = Namespaces::new(limits, scratch);
    #[cfg(not(target_os = "linux"))]
    let _ = scratch;

    // SAFETY: the closure runs between fork and exec and only makes
    // async-signal-safe libc calls. Everything it needs is allocated
    // before the fork.
    unsafe {
        cmd.pre_exec(move || {
            set_limit(libc::RLIMIT_AS as _, memory)?;
            set_limit(libc::RLIMIT_FSIZE as _, file_size)?;
            set_limit(libc::RLIMIT_CORE as _, 0)?;

            #[cfg(target_os = "linux")]
            namespaces.enter();

            Ok(())
        });
    }
}

/// Unprivileged namespace setup for one child.
///
/// Every step is best effort. Where the kernel refuses unprivileged user
/// namespaces the program runs with only the rlimits and cleared
/// environment.
#[cfg(target_os = "linux")]
struct Namespaces {
    network: bool,
    filesystem: Option<MountPlan>,
    /// Identity maps for the caller's uid and gid. Without them the child
    /// cannot create files on the tmpfs it mounts.
    uid_map: CString,
    gid_map: CString,
}

/// Mount layout inside the child's mount namespace: `/` read-only and
/// recursive, fresh tmpfs over the shared temp directories, and the
/// scratch area bound back in writable.
#[cfg(target_os = "linux")]
struct MountPlan {
    scratch: CString,
    /// Flags the scratch mount carries on the host. A remount inside a user
    /// namespace must keep them or the kernel refuses it.
    scratch_locked: libc::c_ulong,
    root_locked: libc::c_ulong,
}

#[cfg(target_os = "linux")]
const SHARED_TMP: [&CStr; 2] = [c"/tmp", c"/var/tmp"];

#[cfg(target_os = "linux")]
const TMPFS_OPTIONS: &CStr = c"size=16m,mode=1777";

#[cfg(target_os = "linux")]
const MOUNT_ATTR_RDONLY: u64 = 0x1;

#[cfg(target_os = "linux")]
#[repr(C)]
struct MountAttr {
    attr_set: u64,
    attr_clr: u64,
    propagation: u64,
    userns_fd: u64,
}

#[cfg(target_os = "linux")]
impl Namespaces {
    fn new(limits: &SandboxLimits, scratch: &Path) -> Self {
        let filesystem = if limits.isolate_filesystem {
            MountPlan::new(scratch)
        } else {
            None
        };
        // SAFETY: plain getters with no preconditions.
        let (uid, gid) = unsafe { (libc::getuid(), libc::getgid()) };
        Self {
            network: limits.isolate_network,
            filesystem,
            uid_map: identity_map(uid),
            gid_map: identity_map(gid),
        }
    }

    /// Runs in the forked child.
    fn enter(&self) {
        let mut flags = 0;
        if self.network {
            flags |= libc::CLONE_NEWNET;
        }
        if self.filesystem.is_some() {
            flags |= libc::CLONE_NEWNS;
        }
        if flags == 0 {
            return;
        }

        // SAFETY: unshare only affects the calling process.
        if unsafe { libc::unshare(libc::CLONE_NEWUSER | flags) } != 0 {
            return;
        }
        let mapped = write_proc(c"/proc/self/setgroups", c"deny")
            && write_proc(c"/proc/self/uid_map", &self.uid_map)
            && write_proc(c"/proc/self/gid_map", &self.gid_map);
        if let (true, Some(plan)) = (mapped, &self.filesystem) {
            plan.apply();
        }
    }
}

#[cfg(target_os = "linux")]
impl MountPlan {
    fn new(scratch: &Path) -> Option<Self> {
        use std::os::unix::ffi::OsStrExt;

        let scratch = CString::new(scratch.as_os_str().as_bytes()).ok()?;
        let scratch_locked = locked_flags(&scratch)?;
        let root_locked = locked_flags(c"/")?;
        Some(Self {
            scratch,
            scratch_locked,
            root_locked,
        })
    }

    /// Runs in the forked child after `unshare`. The child's cwd already
    /// points at the scratch directory.
    fn apply(&self) {
        let none = std::ptr::null();

        // SAFETY: every pointer is either null or a NUL-terminated string
        // owned by `self` or a static.
        unsafe {
            // Keep our mounts out of the host's namespace.
            if libc::mount(
                none,
                c"/".as_ptr(),
                none,
                libc::MS_REC | libc::MS_PRIVATE,
                std::ptr::null(),
            ) != 0
            {
                return;
            }

            let attr = MountAttr {
                attr_set: MOUNT_ATTR_RDONLY,
                attr_clr: 0,
                propagation: 0,
                userns_fd: 0,
            };
            let recursive = libc::syscall(
                libc::SYS_mount_setattr,
                libc::AT_FDCWD,
                c"/".as_ptr(),
                libc::AT_RECURSIVE,
                &attr as *const MountAttr,
                std::mem::size_of::<MountAttr>(),
            );
            if recursive != 0 {
                // Kernels before 5.12: only the root mount itself.
                libc::mount(
                    none,
                    c"/".as_ptr(),
                    none,
                    libc::MS_REMOUNT | libc::MS_BIND | libc::MS_RDONLY | self.root_locked,
                    std::ptr::null(),
                );
            }

            for dir in SHARED_TMP {
                libc::mount(
                    c"tmpfs".as_ptr(),
                    dir.as_ptr(),
                    c"tmpfs".as_ptr(),
                    libc::MS_NOSUID | libc::MS_NODEV,
                    TMPFS_OPTIONS.as_ptr().cast(),
                );
            }

            // The scratch path may now sit on a fresh tmpfs. The cwd still
            // reaches the original directory, so bind it back from there.
            libc::mkdir(self.scratch.as_ptr(), 0o700);
            if libc::mount(
                c".".as_ptr(),
                self.scratch.as_ptr(),
                none,
                libc::MS_BIND,
                std::ptr::null(),
            ) != 0
            {
                return;
            }
            libc::mount(
                none,
                self.scratch.as_ptr(),
                none,
                libc::MS_REMOUNT | libc::MS_BIND | self.scratch_locked,
                std::ptr::null(),
            );
            // Drop the old cwd so `..` cannot walk back into the host mount.
            libc::chdir(self.scratch.as_ptr());
        }
    }
}

#[cfg(target_os = "linux")]
fn identity_map(id: u32) -> CString {
    // Digits and spaces never contain a NUL.
    CString::new(format!("{id} {id} 1")).unwrap_or_default()
}

/// Write `contents` to a procfs file. Only syscalls, so safe after fork.
#[cfg(target_os = "linux")]
fn write_proc(path: &CStr, contents: &CStr) -> bool {
    let bytes = contents.to_bytes();
    // SAFETY: `path` is NUL-terminated; the buffer outlives the write.
    unsafe {
        let fd = libc::open(path.as_ptr(), libc::O_WRONLY | libc::O_CLOEXEC);
        if fd < 0 {
            return false;
        }
        let written = libc::write(fd, bytes.as_ptr().cast(), bytes.len());
        libc::close(fd);
        written == bytes.len() as isize
    }
}

/// Per-mount flags an unprivileged remount has to repeat.
#[cfg(target_os = "linux")]
fn locked_flags(path: &CStr) -> Option<libc::c_ulong> {
    // SAFETY: statvfs fills a zeroed plain-data struct.
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(path.as_ptr(), &mut stat) } != 0 {
        return None;
    }
    let mut flags = 0;
    for (st, ms) in [
        (libc::ST_NOSUID, libc::MS_NOSUID),
        (libc::ST_NODEV, libc::MS_NODEV),
        (libc::ST_NOEXEC, libc::MS_NOEXEC),
    ] {
        if stat.f_flag & st != 0 {
            flags |= ms;
        }
    }
    Some(flags)
}

#[cfg(all(unix, target_os = "linux", target_env = "gnu"))]
type Resource = libc::__rlimit_resource_t;
#[cfg(not(all(unix, target_os = "linux", target_env = "gnu")))]
type Resource = libc::c_int;

#[cfg(unix)]
fn set_limit(resource: Resource, value: u64) -> std::io::Result<()> {
    let limit = libc::rlimit {
        rlim_cur: value as libc::rlim_t,
        rlim_max: value as libc::rlim_t,
    };
    // SAFETY: plain syscall on a stack value.
    if unsafe { libc::setrlimit(resource, &limit) } != 0 {
        return Err(std::io::Error::last_os_error());
    }
    Ok(())
}

/// Kill every process in the group led by `pid`.
#[cfg(unix)]
pub fn kill_group(pid: u32) {
    // SAFETY: signalling a process group we created; a stale id only
    // yields ESRCH.
    unsafe {
        libc::killpg(pid as libc::pid_t, libc::SIGKILL);
    }
}

#[cfg(not(unix))]
pub fn kill_group(_pid: u32) {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn program_lands_in_scratch_dir() {
        let sandbox = Sandbox::new(SandboxLimits::default()).unwrap();
        sandbox.write_program("print('hi')").unwrap();

        let content = std::fs::read_to_string(sandbox.work_dir().join("main.py")).unwrap();
        assert_eq!(content, "print('hi')");
    }

    #[test]
    fn scratch_dir_removed_on_drop() {
        let sandbox = Sandbox::new(SandboxLimits::default()).unwrap();
        let path = sandbox.work_dir().to_path_buf();
        assert!(path.exists());
        drop(sandbox);
        assert!(!path.exists());
    }

    #[test]
    fn env_points_home_at_scratch_and_blanks_secrets() {
        let sandbox = Sandbox::new(SandboxLimits::default()).unwrap();
        let env = sandbox.build_env();
        let get = |key: &str| env.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str());

        assert_eq!(
            get("HOME"),
            Some(sandbox.work_dir().to_string_lossy().as_ref())
        );
        assert_eq!(get("PYTHONIOENCODING"), Some("utf-8"));
        assert_eq!(get("AWS_SECRET_ACCESS_KEY"), Some(""));
        assert_eq!(get("TUTORLOOP_DATABASE"), Some(""));
    }
}
