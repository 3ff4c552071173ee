use anyhow::{bail, Result};
use uuid::Uuid;

/// Generate a new VM ID
pub fn generate_vm_id() -> String {
    format!("vm-{}", Uuid::new_v4().simple())
}

/// Validate an instance id before it is handed to the jailer.
///
/// The jailer accepts 1-64 characters of ASCII alphanumerics and dashes, and
/// the id becomes a directory name under the chroot base.
pub fn validate_vm_id(id: &str) -> Result<()> {
    if id.is_empty() {
        bail!("VM id cannot be empty");
    }

    if id.len() > 64 {
        bail!("VM id must be 64 characters or less, got {}", id.len());
    }

    if id.starts_with('-') {
        bail!("VM id cannot start with a dash");
    }

    if !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-') {
        bail!(
            "VM id must contain only alphanumeric characters or dashes: {:?}",
            id
        );
    }

    Ok(())
}
