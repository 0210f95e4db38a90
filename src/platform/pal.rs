//! PAL trait and platform-specific implementations.
//!
//! Everything the core needs from the OS goes through [`Platform`]: process
//! memory figures, the address-space rlimit, and file ownership.

#![allow(missing_docs)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::core::errors::{IronDomeError, Result};

const PROC_SELF_STATUS: &str = "/proc/self/status";

/// Memory figures for the current process.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProcessMemory {
    /// Resident set size.
    pub rss_bytes: u64,
    /// Total mapped virtual address space.
    pub vm_size_bytes: u64,
}

/// Current `RLIMIT_AS` values. `None` means unlimited.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AddressSpaceLimit {
    pub soft: Option<u64>,
    pub hard: Option<u64>,
}

/// Owner of a file.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FileOwner {
    pub uid: u32,
    /// Account name, when the uid maps to one.
    pub name: Option<String>,
}

impl FileOwner {
    /// Account name, or the numeric uid when there is no passwd entry.
    pub fn display_name(&self) -> String {
        self.name
            .clone()
            .unwrap_or_else(|| format!("uid:{}", self.uid))
    }
}

/// OS abstraction used by the read monitor and the memory guard.
pub trait Platform: Send + Sync {
    fn process_memory(&self) -> Result<ProcessMemory>;
    fn address_space_limit(&self) -> Result<AddressSpaceLimit>;
    /// Set the soft `RLIMIT_AS`, leaving the hard limit untouched. The
    /// request is clamped to the hard limit; returns the limits now in force.
    fn set_address_space_limit(&self, soft: Option<u64>) -> Result<AddressSpaceLimit>;
    fn file_owner(&self, path: &Path) -> Result<FileOwner>;
}

// ──────────────────── Linux ────────────────────

/// Linux platform implementation using `/proc` + `getrlimit`/`setrlimit`.
#[derive(Debug, Default)]
pub struct LinuxPlatform;

impl LinuxPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self
    }
}

#[cfg(unix)]
impl Platform for LinuxPlatform {
    fn process_memory(&self) -> Result<ProcessMemory> {
        let raw = fs::read_to_string(PROC_SELF_STATUS).map_err(|source| IronDomeError::Io {
            path: PathBuf::from(PROC_SELF_STATUS),
            source,
        })?;
        parse_proc_status(&raw)
    }

    fn address_space_limit(&self) -> Result<AddressSpaceLimit> {
        let (soft, hard) = nix::sys::resource::getrlimit(nix::sys::resource::Resource::RLIMIT_AS)
            .map_err(|errno| IronDomeError::MemoryCap {
                details: format!("getrlimit(RLIMIT_AS) failed: {errno}"),
            })?;
        Ok(AddressSpaceLimit {
            soft: finite_limit(soft),
            hard: finite_limit(hard),
        })
    }

    fn set_address_space_limit(&self, soft: Option<u64>) -> Result<AddressSpaceLimit> {
        use nix::sys::resource::{Resource, getrlimit, setrlimit};

        let (_, hard) = getrlimit(Resource::RLIMIT_AS).map_err(|errno| IronDomeError::MemoryCap {
            details: format!("getrlimit(RLIMIT_AS) failed: {errno}"),
        })?;
        let soft = soft.map_or(hard, |bytes| bytes.min(hard));
        setrlimit(Resource::RLIMIT_AS, soft, hard).map_err(|errno| IronDomeError::MemoryCap {
            details: format!("setrlimit(RLIMIT_AS, {soft}) failed: {errno}"),
        })?;
        Ok(AddressSpaceLimit {
            soft: finite_limit(soft),
            hard: finite_limit(hard),
        })
    }

    fn file_owner(&self, path: &Path) -> Result<FileOwner> {
        use std::os::unix::fs::MetadataExt;

        let metadata = fs::metadata(path).map_err(|err| IronDomeError::OwnerLookup {
            path: path.to_path_buf(),
            details: err.to_string(),
        })?;
        let uid = metadata.uid();
        let name = nix::unistd::User::from_uid(nix::unistd::Uid::from_raw(uid))
            .ok()
            .flatten()
            .map(|user| user.name);
        Ok(FileOwner { uid, name })
    }
}

#[cfg(unix)]
fn finite_limit(raw: libc::rlim_t) -> Option<u64> {
    (raw != libc::RLIM_INFINITY).then_some(raw)
}

// ──────────────────── mock ────────────────────

#[derive(Debug)]
struct MockState {
    memory: std::result::Result<ProcessMemory, String>,
    limit: AddressSpaceLimit,
    owners: HashMap<PathBuf, FileOwner>,
    limit_writes: Vec<Option<u64>>,
}

/// In-memory mock implementation for deterministic tests.
///
/// Clones share state, so a test can keep one clone and adjust memory
/// figures while another is owned by the component under test.
#[derive(Debug, Clone)]
pub struct MockPlatform {
    state: Arc<Mutex<MockState>>,
}

impl Default for MockPlatform {
    fn default() -> Self {
        Self::new()
    }
}

impl MockPlatform {
    #[must_use]
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState {
                memory: Ok(ProcessMemory::default()),
                limit: AddressSpaceLimit::default(),
                owners: HashMap::new(),
                limit_writes: Vec::new(),
            })),
        }
    }

    pub fn set_memory(&self, memory: ProcessMemory) {
        self.state.lock().memory = Ok(memory);
    }

    /// Make every `process_memory` call fail with `reason`.
    pub fn set_memory_unavailable(&self, reason: &str) {
        self.state.lock().memory = Err(reason.to_string());
    }

    pub fn set_address_space_limit_values(&self, limit: AddressSpaceLimit) {
        self.state.lock().limit = limit;
    }

    pub fn set_owner(&self, path: impl Into<PathBuf>, owner: FileOwner) {
        self.state.lock().owners.insert(path.into(), owner);
    }

    /// Soft limits passed to `set_address_space_limit`, in call order.
    pub fn limit_writes(&self) -> Vec<Option<u64>> {
        self.state.lock().limit_writes.clone()
    }
}

impl Platform for MockPlatform {
    fn process_memory(&self) -> Result<ProcessMemory> {
        self.state
            .lock()
            .memory
            .clone()
            .map_err(|details| IronDomeError::MemoryStats { details })
    }

    fn address_space_limit(&self) -> Result<AddressSpaceLimit> {
        Ok(self.state.lock().limit)
    }

    fn set_address_space_limit(&self, soft: Option<u64>) -> Result<AddressSpaceLimit> {
        let mut state = self.state.lock();
        let soft = match (soft, state.limit.hard) {
            (Some(bytes), Some(hard)) => Some(bytes.min(hard)),
            (soft, hard) => soft.or(hard),
        };
        state.limit.soft = soft;
        state.limit_writes.push(soft);
        Ok(state.limit)
    }

    fn file_owner(&self, path: &Path) -> Result<FileOwner> {
        self.state
            .lock()
            .owners
            .get(path)
            .cloned()
            .ok_or_else(|| IronDomeError::OwnerLookup {
                path: path.to_path_buf(),
                details: "no such file".to_string(),
            })
    }
}

/// Detect active platform implementation.
pub fn detect_platform() -> Result<Arc<dyn Platform>> {
    #[cfg(target_os = "linux")]
    {
        Ok(Arc::new(LinuxPlatform::new()))
    }
    #[cfg(not(target_os = "linux"))]
    {
        Err(IronDomeError::UnsupportedPlatform {
            details: "only Linux is currently implemented".to_string(),
        })
    }
}

// ──────────────────── parsing ────────────────────

/// Extract `VmRSS` and `VmSize` from `/proc/<pid>/status` text.
fn parse_proc_status(raw: &str) -> Result<ProcessMemory> {
    let mut rss = None;
    let mut vm_size = None;

    for line in raw.lines() {
        let Some((key, rest)) = line.split_once(':') else {
            continue;
        };
        let slot = match key.trim() {
            "VmRSS" => &mut rss,
            "VmSize" => &mut vm_size,
            _ => continue,
        };
        let mut parts = rest.split_whitespace();
        let value = parts
            .next()
            .and_then(|value| value.parse::<u64>().ok())
            .ok_or_else(|| IronDomeError::MemoryStats {
                details: format!("invalid numeric value in status line {line:?}"),
            })?;
        *slot = Some(match parts.next() {
            None => value,
            Some("kB") => value.saturating_mul(1024),
            Some(unit) => {
                return Err(IronDomeError::MemoryStats {
                    details: format!("unsupported unit in status line {line:?}: {unit}"),
                });
            }
        });
    }

    let required = |value: Option<u64>, key: &str| {
        value.ok_or_else(|| IronDomeError::MemoryStats {
            details: format!("missing {key} in {PROC_SELF_STATUS}"),
        })
    };

    Ok(ProcessMemory {
        rss_bytes: required(rss, "VmRSS")?,
        vm_size_bytes: required(vm_size, "VmSize")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const STATUS_SAMPLE: &str = "Name:\tirondome\n\
                                 Umask:\t0022\n\
                                 State:\tS (sleeping)\n\
                                 VmPeak:\t   20480 kB\n\
                                 VmSize:\t   18432 kB\n\
                                 VmRSS:\t    6144 kB\n\
                                 Threads:\t5\n";

    #[test]
    fn parses_proc_status_memory_lines() {
        let memory = parse_proc_status(STATUS_SAMPLE).unwrap();
        assert_eq!(memory.rss_bytes, 6144 * 1024);
        assert_eq!(memory.vm_size_bytes, 18432 * 1024);
    }

    #[test]
    fn missing_rss_is_an_error() {
        let err = parse_proc_status("Name:\tkthread\nVmSize:\t10 kB\n").unwrap_err();
        assert_eq!(err.code(), "IRD-2101");
        assert!(err.to_string().contains("VmRSS"));
    }

    #[test]
    fn rejects_unknown_unit_suffix() {
        let err = parse_proc_status("VmSize:\t10 pages\nVmRSS:\t1 kB\n").unwrap_err();
        assert!(err.to_string().contains("unsupported unit"));
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn linux_reads_own_memory() {
        let memory = LinuxPlatform::new().process_memory().unwrap();
        assert!(memory.rss_bytes > 0);
        assert!(memory.vm_size_bytes >= memory.rss_bytes);
    }

    #[test]
    #[cfg(target_os = "linux")]
    fn linux_resolves_owner_of_own_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        let owner = LinuxPlatform::new().file_owner(file.path()).unwrap();
        assert_eq!(owner.uid, nix::unistd::getuid().as_raw());
    }

    #[test]
    #[cfg(unix)]
    fn linux_owner_lookup_on_missing_file_fails() {
        let err = LinuxPlatform::new()
            .file_owner(Path::new("/nonexistent_irondome/file"))
            .unwrap_err();
        assert!(matches!(err, IronDomeError::OwnerLookup { .. }));
        assert!(!err.is_fatal());
    }

    #[test]
    fn owner_display_falls_back_to_uid() {
        let owner = FileOwner {
            uid: 4242,
            name: None,
        };
        assert_eq!(owner.display_name(), "uid:4242");
    }

    #[test]
    fn mock_clamps_soft_limit_to_hard() {
        let mock = MockPlatform::new();
        mock.set_address_space_limit_values(AddressSpaceLimit {
            soft: None,
            hard: Some(1_000),
        });
        let applied = mock.set_address_space_limit(Some(5_000)).unwrap();
        assert_eq!(applied.soft, Some(1_000));
        assert_eq!(mock.address_space_limit().unwrap(), applied);
        assert_eq!(mock.limit_writes(), vec![Some(1_000)]);
    }

    #[test]
    fn mock_clones_share_state() {
        let mock = MockPlatform::new();
        let other = mock.clone();
        other.set_memory(ProcessMemory {
            rss_bytes: 7,
            vm_size_bytes: 9,
        });
        assert_eq!(mock.process_memory().unwrap().rss_bytes, 7);
        other.set_memory_unavailable("no procfs");
        assert!(mock.process_memory().is_err());
    }
}
