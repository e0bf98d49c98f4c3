//! Request validation for lifecycle operations

use crate::error::{VmError, VmResult};
use crate::models::VmConfig;

pub fn validate_vm_id(vm_id: &str) -> VmResult<()> {
    if vm_id.trim().is_empty() {
        return Err(VmError::invalid("vm_id is required"));
    }
    Ok(())
}

/// Validate a VM configuration before it reaches the backend
///
/// Requires CPU, memory and boot sections and at least one storage device
/// with a path. The device at index 0 is the implied root device when none
/// is explicitly marked.
pub fn validate_vm_config(config: &VmConfig) -> VmResult<()> {
    let cpu = config
        .cpu
        .as_ref()
        .ok_or_else(|| VmError::invalid("cpu configuration is required"))?;
    if cpu.vcpu_count == 0 {
        return Err(VmError::invalid("vcpu_count must be greater than 0"));
    }
    if let Some(max) = cpu.max_vcpu_count {
        if max < cpu.vcpu_count {
            return Err(VmError::invalid(format!(
                "max_vcpu_count ({}) must be >= vcpu_count ({})",
                max, cpu.vcpu_count
            )));
        }
    }

    let memory = config
        .memory
        .as_ref()
        .ok_or_else(|| VmError::invalid("memory configuration is required"))?;
    if memory.size_bytes == 0 {
        return Err(VmError::invalid("memory size_bytes must be greater than 0"));
    }

    let boot = config
        .boot
        .as_ref()
        .ok_or_else(|| VmError::invalid("boot configuration is required"))?;
    if boot.kernel_path.trim().is_empty() {
        return Err(VmError::invalid("kernel_path is required"));
    }

    if config.storage.is_empty() {
        return Err(VmError::invalid("at least one storage device is required"));
    }

    let mut has_root = false;
    for (i, disk) in config.storage.iter().enumerate() {
        if disk.path.trim().is_empty() {
            return Err(VmError::invalid(format!(
                "storage device {} path is required",
                i
            )));
        }
        if disk.is_root_device || i == 0 {
            has_root = true;
        }
    }
    if !has_root {
        return Err(VmError::invalid("a root storage device is required"));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{CpuConfig, MemoryConfig, StorageDevice};
    use crate::test_support::valid_vm_config as valid_config;

    #[test]
    fn test_valid_config_accepted() {
        assert!(validate_vm_config(&valid_config()).is_ok());
    }

    #[test]
    fn test_empty_vm_id_rejected() {
        assert!(matches!(
            validate_vm_id(""),
            Err(VmError::InvalidArgument(_))
        ));
        assert!(validate_vm_id("   ").is_err());
        assert!(validate_vm_id("vm-123").is_ok());
    }

    #[test]
    fn test_missing_sections_rejected() {
        let mut config = valid_config();
        config.cpu = None;
        assert!(validate_vm_config(&config).is_err());

        let mut config = valid_config();
        config.memory = None;
        assert!(validate_vm_config(&config).is_err());

        let mut config = valid_config();
        config.boot = None;
        assert!(validate_vm_config(&config).is_err());
    }

    #[test]
    fn test_cpu_bounds() {
        let mut config = valid_config();
        config.cpu = Some(CpuConfig {
            vcpu_count: 0,
            max_vcpu_count: None,
        });
        assert!(validate_vm_config(&config).is_err());

        config.cpu = Some(CpuConfig {
            vcpu_count: 4,
            max_vcpu_count: Some(2),
        });
        let err = validate_vm_config(&config).unwrap_err();
        assert!(err.to_string().contains("max_vcpu_count"));
    }

    #[test]
    fn test_zero_memory_and_empty_kernel_rejected() {
        let mut config = valid_config();
        config.memory = Some(MemoryConfig { size_bytes: 0 });
        assert!(validate_vm_config(&config).is_err());

        let mut config = valid_config();
        config.boot.as_mut().unwrap().kernel_path = String::new();
        assert!(validate_vm_config(&config).is_err());
    }

    #[test]
    fn test_storage_required() {
        let mut config = valid_config();
        config.storage.clear();
        let err = validate_vm_config(&config).unwrap_err();
        assert!(err.to_string().contains("storage"));
    }

    #[test]
    fn test_storage_path_required() {
        let mut config = valid_config();
        config.storage.push(StorageDevice {
            id: "data".to_string(),
            path: String::new(),
            read_only: true,
            is_root_device: false,
        });
        assert!(validate_vm_config(&config).is_err());
    }

    #[test]
    fn test_explicit_root_device_anywhere() {
        let mut config = valid_config();
        config.storage.push(StorageDevice {
            id: "root".to_string(),
            path: "/var/lib/metald/root2.ext4".to_string(),
            read_only: false,
            is_root_device: true,
        });
        assert!(validate_vm_config(&config).is_ok());
    }
}
