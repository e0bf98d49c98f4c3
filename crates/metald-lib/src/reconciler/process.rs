//! Firecracker process discovery
//!
//! Scans the OS process table for Firecracker VMM processes. Identification
//! and VM id extraction are string heuristics over the command line, kept in
//! pure functions so they can be tested without a live process table.

use crate::models::FirecrackerProcess;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::debug;

/// Command-line tokens identifying a Firecracker process
const FIRECRACKER_TOKENS: &[&str] = &["firecracker", "fc_vcpu"];

/// Prefix of path segments carrying a VM id, e.g. `/srv/jailer/firecracker/vm-42/root`
const VM_SEGMENT_PREFIX: &str = "vm-";

/// Trait for process table scanning implementations
#[async_trait]
pub trait ProcessScanner: Send + Sync {
    /// List every Firecracker process currently running
    async fn scan(&self) -> Result<Vec<FirecrackerProcess>>;
}

/// Returns true if a command line belongs to a Firecracker process
pub fn is_firecracker_cmdline(cmdline: &str) -> bool {
    FIRECRACKER_TOKENS.iter().any(|token| cmdline.contains(token))
}

/// Best-effort extraction of a VM id from a Firecracker command line
///
/// Tries, in order:
/// - `--id <value>` or `--id=<value>`
/// - the first path segment starting with `vm-`
pub fn extract_vm_id(cmdline: &str) -> Option<String> {
    let args: Vec<&str> = cmdline.split_whitespace().collect();

    for (i, arg) in args.iter().enumerate() {
        if let Some(value) = arg.strip_prefix("--id=") {
            if !value.is_empty() {
                return Some(value.to_string());
            }
        } else if *arg == "--id" {
            if let Some(value) = args.get(i + 1) {
                if !value.starts_with("--") {
                    return Some(value.to_string());
                }
            }
        }
    }

    args.iter()
        .flat_map(|arg| arg.split(|c: char| c == '/' || c == '='))
        .find(|segment| segment.len() > VM_SEGMENT_PREFIX.len() && segment.starts_with(VM_SEGMENT_PREFIX))
        .map(|segment| segment.to_string())
}

/// Build a process record from a raw command line, if it is a Firecracker one
pub fn parse_process(pid: u32, cmdline: &str) -> Option<FirecrackerProcess> {
    if !is_firecracker_cmdline(cmdline) {
        return None;
    }

    Some(FirecrackerProcess {
        pid,
        cmdline: cmdline.to_string(),
        vm_id: extract_vm_id(cmdline).unwrap_or_default(),
    })
}

/// Scanner reading `/proc/<pid>/cmdline`
pub struct ProcFsScanner {
    proc_path: PathBuf,
}

impl ProcFsScanner {
    pub fn new() -> Self {
        Self::with_proc_path("/proc")
    }

    /// Create scanner with custom proc path (for testing)
    pub fn with_proc_path(proc_path: impl Into<PathBuf>) -> Self {
        Self {
            proc_path: proc_path.into(),
        }
    }

    /// Read the command line of one process, NUL separators turned into spaces
    ///
    /// Falls back to `comm` when `cmdline` is empty, which is the case for
    /// kernel threads and some vCPU threads.
    async fn read_cmdline(pid_dir: &Path) -> Result<String> {
        let raw = fs::read(pid_dir.join("cmdline"))
            .await
            .with_context(|| format!("Failed to read cmdline in {}", pid_dir.display()))?;

        let cmdline = String::from_utf8_lossy(&raw)
            .split('\0')
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        if !cmdline.is_empty() {
            return Ok(cmdline);
        }

        let comm = fs::read_to_string(pid_dir.join("comm"))
            .await
            .with_context(|| format!("Failed to read comm in {}", pid_dir.display()))?;
        Ok(comm.trim().to_string())
    }
}

impl Default for ProcFsScanner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ProcessScanner for ProcFsScanner {
    async fn scan(&self) -> Result<Vec<FirecrackerProcess>> {
        let mut entries = fs::read_dir(&self.proc_path)
            .await
            .with_context(|| format!("Failed to list {}", self.proc_path.display()))?;

        let mut processes = Vec::new();

        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("Failed to iterate {}", self.proc_path.display()))?
        {
            let Some(pid) = entry.file_name().to_str().and_then(|n| n.parse::<u32>().ok()) else {
                continue;
            };

            // Processes can exit between listing and reading
            let cmdline = match Self::read_cmdline(&entry.path()).await {
                Ok(cmdline) => cmdline,
                Err(e) => {
                    debug!(pid = pid, error = %e, "Skipping unreadable process");
                    continue;
                }
            };

            if let Some(process) = parse_process(pid, &cmdline) {
                processes.push(process);
            }
        }

        debug!(count = processes.len(), "Scanned firecracker processes");
        Ok(processes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_firecracker_identification() {
        assert!(is_firecracker_cmdline("/usr/bin/firecracker --api-sock /tmp/fc.sock"));
        assert!(is_firecracker_cmdline("fc_vcpu 0"));
        assert!(!is_firecracker_cmdline("/usr/sbin/sshd -D"));
        assert!(!is_firecracker_cmdline(""));
    }

    #[test]
    fn test_extract_id_flag_forms() {
        assert_eq!(
            extract_vm_id("firecracker --id abc123 --api-sock /tmp/x.sock"),
            Some("abc123".to_string())
        );
        assert_eq!(
            extract_vm_id("firecracker --id=abc123"),
            Some("abc123".to_string())
        );
    }

    #[test]
    fn test_id_flag_takes_priority_over_path() {
        assert_eq!(
            extract_vm_id("jailer --id flagged --chroot-base-dir /srv/jailer/firecracker/vm-frompath/root"),
            Some("flagged".to_string())
        );
    }

    #[test]
    fn test_extract_id_from_path_segment() {
        assert_eq!(
            extract_vm_id("/usr/bin/firecracker --api-sock /srv/jailer/firecracker/vm-7f3a/root/run/fc.sock"),
            Some("vm-7f3a".to_string())
        );
        assert_eq!(
            extract_vm_id("firecracker --config-file=/var/lib/metald/vm-99/config.json"),
            Some("vm-99".to_string())
        );
    }

    #[test]
    fn test_extraction_failure_yields_none() {
        assert_eq!(extract_vm_id("firecracker --api-sock /tmp/fc.sock"), None);
        // Dangling flag and bare prefix are not ids
        assert_eq!(extract_vm_id("firecracker --id"), None);
        assert_eq!(extract_vm_id("firecracker --id --no-seccomp"), None);
        assert_eq!(extract_vm_id("firecracker /tmp/vm-/x"), None);
        assert_eq!(extract_vm_id(""), None);
    }

    #[test]
    fn test_parse_process_empty_id_on_failure() {
        let process = parse_process(10, "firecracker --no-api").unwrap();
        assert_eq!(process.pid, 10);
        assert_eq!(process.vm_id, "");

        assert!(parse_process(11, "/bin/bash").is_none());
    }

    async fn write_proc(root: &Path, pid: &str, cmdline: &[u8], comm: &str) {
        let dir = root.join(pid);
        fs::create_dir_all(&dir).await.unwrap();
        fs::write(dir.join("cmdline"), cmdline).await.unwrap();
        fs::write(dir.join("comm"), comm).await.unwrap();
    }

    #[tokio::test]
    async fn test_procfs_scan_finds_firecracker_processes() {
        let temp_dir = TempDir::new().unwrap();
        let root = temp_dir.path();

        write_proc(root, "100", b"/usr/bin/firecracker\0--id\0vm-a\0", "firecracker\n").await;
        write_proc(root, "200", b"/bin/bash\0-l\0", "bash\n").await;
        write_proc(root, "300", b"", "fc_vcpu 0\n").await;
        fs::create_dir_all(root.join("self")).await.unwrap();
        // A process that exited mid-scan has no readable files
        fs::create_dir_all(root.join("400")).await.unwrap();

        let scanner = ProcFsScanner::with_proc_path(root);
        let mut processes = scanner.scan().await.unwrap();
        processes.sort_by_key(|p| p.pid);

        assert_eq!(processes.len(), 2);
        assert_eq!(processes[0].pid, 100);
        assert_eq!(processes[0].vm_id, "vm-a");
        assert_eq!(processes[0].cmdline, "/usr/bin/firecracker --id vm-a");
        assert_eq!(processes[1].pid, 300);
        assert_eq!(processes[1].vm_id, "");
    }

    #[tokio::test]
    async fn test_procfs_scan_missing_root_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let scanner = ProcFsScanner::with_proc_path(temp_dir.path().join("missing"));

        assert!(scanner.scan().await.is_err());
    }
}
