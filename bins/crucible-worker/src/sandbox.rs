/// Hardened Sandbox Profile
///
/// Every container the worker creates, warm or spike, is built from the same
/// `SandboxSpec`. The runtime client only translates it; it never adds or
/// relaxes limits on its own.
///
/// **Limits:**
/// - Memory capped, swap equal to memory (no overcommit)
/// - Process count capped (fork bombs)
/// - No network, all capabilities dropped, no privilege escalation
/// - Read-only root filesystem with one writable, executable scratch tmpfs

use crucible_common::languages::SCRATCH_DIR;
use std::collections::HashMap;

/// Label put on every sandbox so stale ones can be found after a crash.
pub const MANAGED_LABEL: &str = "crucible.sandbox";

const MIB: i64 = 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct SandboxProfile {
    pub memory_mb: u32,
    /// Fractional CPUs, e.g. 0.5 for half a core.
    pub cpus: f64,
    pub pids_limit: u32,
    pub scratch_mb: u32,
}

impl Default for SandboxProfile {
    fn default() -> Self {
        Self {
            memory_mb: 512,
            cpus: 0.5,
            pids_limit: 50,
            scratch_mb: 50,
        }
    }
}

impl SandboxProfile {
    pub fn spec_for(&self, image: &str, language: &str) -> SandboxSpec {
        let memory_bytes = i64::from(self.memory_mb) * MIB;
        SandboxSpec {
            image: image.to_string(),
            memory_bytes,
            memory_swap_bytes: memory_bytes,
            nano_cpus: (self.cpus * 1e9) as i64,
            pids_limit: i64::from(self.pids_limit),
            network_disabled: true,
            cap_drop: vec!["ALL".to_string()],
            security_opt: vec!["no-new-privileges".to_string()],
            readonly_rootfs: true,
            scratch_dir: SCRATCH_DIR.to_string(),
            scratch_options: format!("rw,exec,nosuid,size={}m", self.scratch_mb),
            idle_command: vec![
                "tail".to_string(),
                "-f".to_string(),
                "/dev/null".to_string(),
            ],
            labels: HashMap::from([
                (MANAGED_LABEL.to_string(), "true".to_string()),
                (format!("{}.language", MANAGED_LABEL), language.to_string()),
            ]),
        }
    }
}

/// Fully resolved container configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxSpec {
    pub image: String,
    pub memory_bytes: i64,
    pub memory_swap_bytes: i64,
    pub nano_cpus: i64,
    pub pids_limit: i64,
    pub network_disabled: bool,
    pub cap_drop: Vec<String>,
    pub security_opt: Vec<String>,
    pub readonly_rootfs: bool,
    pub scratch_dir: String,
    pub scratch_options: String,
    pub idle_command: Vec<String>,
    pub labels: HashMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_profile_is_hardened() {
        let spec = SandboxProfile::default().spec_for("gcc:13", "cpp");

        assert_eq!(spec.memory_bytes, 512 * 1024 * 1024);
        assert_eq!(spec.memory_swap_bytes, spec.memory_bytes);
        assert_eq!(spec.nano_cpus, 500_000_000);
        assert_eq!(spec.pids_limit, 50);
        assert!(spec.network_disabled);
        assert_eq!(spec.cap_drop, vec!["ALL"]);
        assert_eq!(spec.security_opt, vec!["no-new-privileges"]);
        assert!(spec.readonly_rootfs);
        assert_eq!(spec.scratch_dir, "/tmp");
        assert!(spec.scratch_options.contains("exec"));
        assert!(spec.scratch_options.contains("size=50m"));
        assert_eq!(spec.labels.get(MANAGED_LABEL).map(String::as_str), Some("true"));
    }

    #[test]
    fn test_spec_is_deterministic() {
        let profile = SandboxProfile {
            memory_mb: 256,
            cpus: 1.5,
            pids_limit: 100,
            scratch_mb: 20,
        };
        assert_eq!(
            profile.spec_for("node:20-alpine", "javascript"),
            profile.spec_for("node:20-alpine", "javascript")
        );
        assert_eq!(profile.spec_for("x", "python").memory_swap_bytes, 256 * 1024 * 1024);
        assert_eq!(profile.spec_for("x", "python").nano_cpus, 1_500_000_000);
    }
}
