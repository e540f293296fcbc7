//! Contract of the cloud provider.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::CloudResult;

/// Metadata attached to provider resources.
pub type Metadata = BTreeMap<String, String>;

/// Metadata key marking resources created by this system.
pub const CREATED_BY: &str = "Created-By";

/// Metadata key holding the id of the setup a VM was created from.
pub const SETUP_ID: &str = "Setup-Id";

/// Operations the cloud manager needs from an infrastructure provider.
/// Ids returned here are provider ids, not registry ids.
#[async_trait]
pub trait CloudClient: Send + Sync {
    /// Ids of all VMs whose metadata has `Created-By` set to `created_by`.
    async fn list_vms(&self, created_by: &str) -> CloudResult<Vec<String>>;

    async fn get_image_id(&self, image_name: &str) -> CloudResult<String>;

    async fn create_block_device(
        &self,
        image_id: &str,
        size_gb: u32,
        volume_type: Option<&str>,
        availability_zone: &str,
        metadata: &Metadata,
    ) -> CloudResult<String>;

    async fn destroy_block_device(&self, id: &str) -> CloudResult<()>;

    /// Create a VM booting from `block_device_id`.
    async fn create_vm(
        &self,
        name: &str,
        flavor: &str,
        block_device_id: &str,
        availability_zone: &str,
        metadata: &Metadata,
    ) -> CloudResult<String>;

    /// Whether the VM exists and is up. Unknown ids are not active.
    async fn is_vm_active(&self, id: &str) -> CloudResult<bool>;

    /// Wait until the VM has booted.
    async fn wait_for_vm(&self, id: &str, timeout: Option<Duration>) -> CloudResult<()>;

    async fn get_ip_address(&self, id: &str) -> CloudResult<String>;

    /// Destroy the VM together with the block device it boots from.
    async fn destroy_vm(&self, id: &str, timeout: Option<Duration>) -> CloudResult<()>;
}

/// Metadata for resources belonging to a VM of `setup_id`.
pub fn resource_metadata(created_by: &str, setup_id: &str) -> Metadata {
    Metadata::from([
        (CREATED_BY.to_string(), created_by.to_string()),
        (SETUP_ID.to_string(), setup_id.to_string()),
    ])
}
