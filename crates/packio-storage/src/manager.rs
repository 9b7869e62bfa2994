//! Device management
//!
//! Maps `(policy, device name)` to an open [`PackDevice`]. Devices are
//! directories under a common root; with mount checking on, a device whose
//! directory is missing is skipped rather than created on the root
//! filesystem.

use crate::device::PackDevice;
use crate::xattr::XattrBackend;
use packio_common::{EngineConfig, Error, Policy, Result, config::StorageConfig};
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// Open devices by policy and name
#[derive(Debug)]
pub struct DeviceManager {
    devices_root: PathBuf,
    policies: BTreeSet<Policy>,
    devices: BTreeMap<Policy, BTreeMap<String, Arc<PackDevice>>>,
}

fn validate_device_name(name: &str) -> Result<()> {
    if name.is_empty() || name == "." || name == ".." || name.contains('/') {
        return Err(Error::Configuration(format!("invalid device name: {name:?}")));
    }
    Ok(())
}

impl DeviceManager {
    /// Open every configured device for every configured policy
    pub fn new(
        storage: &StorageConfig,
        engine: &EngineConfig,
        xattr: Arc<dyn XattrBackend>,
    ) -> Result<Self> {
        if storage.policies.is_empty() {
            return Err(Error::Configuration("no storage policies configured".into()));
        }
        let policies: BTreeSet<Policy> = storage.policies.iter().copied().map(Policy::new).collect();

        let mut devices: BTreeMap<Policy, BTreeMap<String, Arc<PackDevice>>> = BTreeMap::new();
        for name in &storage.devices {
            validate_device_name(name)?;

            let root = storage.devices_root.join(name);
            if !root.is_dir() {
                if storage.mount_check {
                    warn!("device {name} is not mounted at {}, skipping", root.display());
                    continue;
                }
                std::fs::create_dir_all(&root)?;
            }

            for &policy in &policies {
                let device =
                    PackDevice::open(name.clone(), root.clone(), policy, engine.clone(), Arc::clone(&xattr))?;
                devices
                    .entry(policy)
                    .or_default()
                    .insert(name.clone(), Arc::new(device));
            }
        }

        info!(
            "device manager ready: {} devices under {}, policies {:?}",
            devices.values().map(BTreeMap::len).max().unwrap_or(0),
            storage.devices_root.display(),
            policies
        );

        Ok(Self {
            devices_root: storage.devices_root.clone(),
            policies,
            devices,
        })
    }

    /// Look up the engine for a device under a policy
    pub fn resolve(&self, policy: Policy, device: &str) -> Result<Arc<PackDevice>> {
        if !self.policies.contains(&policy) {
            return Err(Error::PolicyNotFound(policy.index()));
        }
        self.devices
            .get(&policy)
            .and_then(|devices| devices.get(device))
            .cloned()
            .ok_or_else(|| Error::DeviceNotFound(device.to_string()))
    }

    /// Whether this manager serves a policy
    pub fn serves(&self, policy: Policy) -> bool {
        self.policies.contains(&policy)
    }

    pub fn policies(&self) -> impl Iterator<Item = Policy> + '_ {
        self.policies.iter().copied()
    }

    /// Every open device, across policies
    pub fn devices(&self) -> impl Iterator<Item = &Arc<PackDevice>> {
        self.devices.values().flat_map(BTreeMap::values)
    }

    pub fn devices_root(&self) -> &Path {
        &self.devices_root
    }
}
