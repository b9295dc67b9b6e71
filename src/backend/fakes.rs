//! In-memory capability fakes for backend tests.
//!
//! Each fake records the calls it receives so tests can assert on ordering
//! and idempotence without driving real cloud or host tooling.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::attacher::Attacher;
use crate::cloud::provider::VolumeProvider;
use crate::cloud::{CloudAttachment, CloudNode, CloudVolume, VolumeCreate, VolumePage, VolumeState};
use crate::error::CsiError;
use crate::initializer::Initializer;
use crate::metadata::{HostIdentity, MetadataBackend, VolumeMetadata};
use crate::mounter::{BlockInfo, Mounter};
use crate::types::VolumeId;

// ---------------------------------------------------------------------------
// FakeProvider
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeProvider {
    pub volumes: Mutex<Vec<CloudVolume>>,
    pub nodes: Vec<CloudNode>,
    /// Volumes per page; `None` means everything in one page.
    pub page_size: Option<usize>,
    /// State assigned to freshly created volumes.
    pub create_state: Option<VolumeState>,
    /// After this many `get` calls, a queued volume flips to active.
    pub ready_after_gets: Option<u32>,
    pub get_count: AtomicU32,
    pub calls: Mutex<Vec<String>>,
}

impl FakeProvider {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl VolumeProvider for FakeProvider {
    async fn list_volumes(&self, page: Option<u32>) -> Result<VolumePage, CsiError> {
        self.log(format!("list_volumes page={page:?}"));
        let volumes = self.volumes.lock().unwrap().clone();
        match self.page_size {
            None => Ok(VolumePage {
                volumes,
                next_page: None,
            }),
            Some(size) => {
                let page = page.unwrap_or(1).max(1) as usize;
                let start = (page - 1) * size;
                let slice: Vec<_> = volumes.iter().skip(start).take(size).cloned().collect();
                let next_page = (start + size < volumes.len()).then(|| (page + 1) as u32);
                Ok(VolumePage {
                    volumes: slice,
                    next_page,
                })
            }
        }
    }

    async fn get(&self, volume_id: &VolumeId) -> Result<CloudVolume, CsiError> {
        let count = self.get_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.log(format!("get {volume_id}"));
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .iter_mut()
            .find(|v| v.id == volume_id.0)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
        if let Some(after) = self.ready_after_gets
            && count >= after
        {
            volume.state = VolumeState::Active;
        }
        Ok(volume.clone())
    }

    async fn create(&self, request: &VolumeCreate) -> Result<CloudVolume, CsiError> {
        self.log("create");
        let id = uuid::Uuid::new_v4().to_string();
        let volume = CloudVolume {
            name: crate::cloud::volume_id_to_name(&id),
            id,
            description: Some(request.description.clone()),
            size_gib: request.size_gib,
            state: self.create_state.clone().unwrap_or(VolumeState::Active),
            plan_id: request.plan_id.clone(),
            attachments: Vec::new(),
        };
        self.volumes.lock().unwrap().push(volume.clone());
        Ok(volume)
    }

    async fn delete(&self, volume_id: &VolumeId) -> Result<(), CsiError> {
        self.log(format!("delete {volume_id}"));
        self.volumes.lock().unwrap().retain(|v| v.id != volume_id.0);
        Ok(())
    }

    async fn attach(
        &self,
        volume_id: &VolumeId,
        node_id: &str,
    ) -> Result<CloudAttachment, CsiError> {
        self.log(format!("attach {volume_id} {node_id}"));
        let mut volumes = self.volumes.lock().unwrap();
        let volume = volumes
            .iter_mut()
            .find(|v| v.id == volume_id.0)
            .ok_or_else(|| CsiError::VolumeNotFound(volume_id.to_string()))?;
        let attachment = CloudAttachment {
            id: format!("att-{}", volume.attachments.len() + 1),
            volume_id: volume_id.0.clone(),
            node_id: node_id.to_owned(),
        };
        volume.attachments.push(attachment.clone());
        Ok(attachment)
    }

    async fn detach(&self, attachment_id: &str) -> Result<(), CsiError> {
        self.log(format!("detach {attachment_id}"));
        for volume in self.volumes.lock().unwrap().iter_mut() {
            volume.attachments.retain(|a| a.id != attachment_id);
        }
        Ok(())
    }

    async fn nodes(&self) -> Result<Vec<CloudNode>, CsiError> {
        self.log("nodes");
        Ok(self.nodes.clone())
    }
}

// ---------------------------------------------------------------------------
// FakeMetadata
// ---------------------------------------------------------------------------

pub struct FakeMetadata {
    pub identity: HostIdentity,
    pub volumes: HashMap<String, VolumeMetadata>,
}

impl Default for FakeMetadata {
    fn default() -> Self {
        Self {
            identity: HostIdentity {
                facility_code: "ewr1".into(),
                initiator_iqn: "iqn.2018-05.net.example:worker-1".into(),
                node_id: "worker-1".into(),
            },
            volumes: HashMap::new(),
        }
    }
}

impl FakeMetadata {
    pub fn with_volume(mut self, meta: VolumeMetadata) -> Self {
        self.volumes.insert(meta.name.clone(), meta);
        self
    }
}

#[async_trait]
impl MetadataBackend for FakeMetadata {
    async fn host_identity(&self) -> Result<HostIdentity, CsiError> {
        Ok(self.identity.clone())
    }

    async fn volume_metadata(&self, volume_name: &str) -> Result<VolumeMetadata, CsiError> {
        self.volumes
            .get(volume_name)
            .cloned()
            .ok_or_else(|| CsiError::Metadata(format!("volume {volume_name} not found in metadata")))
    }
}

// ---------------------------------------------------------------------------
// FakeAttacher
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeAttacher {
    pub sessions: Mutex<Vec<(String, String)>>,
    pub bindings: Mutex<HashMap<String, String>>,
    pub discards: Mutex<HashMap<String, String>>,
    pub scsi_id: String,
    pub device: PathBuf,
    pub calls: Mutex<Vec<String>>,
}

impl FakeAttacher {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Attacher for FakeAttacher {
    async fn discover(&self, portal: &str) -> Result<(), CsiError> {
        self.log(format!("discover {portal}"));
        Ok(())
    }

    async fn has_session(&self, portal: &str, iqn: &str) -> Result<bool, CsiError> {
        Ok(self
            .sessions
            .lock()
            .unwrap()
            .iter()
            .any(|(p, q)| p == portal && q == iqn))
    }

    async fn login(&self, portal: &str, iqn: &str) -> Result<(), CsiError> {
        if self.has_session(portal, iqn).await? {
            return Ok(());
        }
        self.log(format!("login {portal}"));
        self.sessions
            .lock()
            .unwrap()
            .push((portal.to_owned(), iqn.to_owned()));
        Ok(())
    }

    async fn logout(&self, portal: &str, iqn: &str) -> Result<(), CsiError> {
        if !self.has_session(portal, iqn).await? {
            return Ok(());
        }
        self.log(format!("logout {portal}"));
        self.sessions
            .lock()
            .unwrap()
            .retain(|(p, q)| !(p == portal && q == iqn));
        Ok(())
    }

    async fn scsi_id(&self, device_path: &Path) -> Result<String, CsiError> {
        self.log(format!("scsi_id {}", device_path.display()));
        Ok(self.scsi_id.clone())
    }

    async fn device_path(&self, portal: &str, iqn: &str) -> Result<PathBuf, CsiError> {
        self.log(format!("device_path {portal} {iqn}"));
        Ok(self.device.clone())
    }

    async fn read_bindings(
        &self,
    ) -> Result<(HashMap<String, String>, HashMap<String, String>), CsiError> {
        Ok((
            self.bindings.lock().unwrap().clone(),
            self.discards.lock().unwrap().clone(),
        ))
    }

    async fn write_bindings(&self, bindings: &HashMap<String, String>) -> Result<(), CsiError> {
        self.log("write_bindings");
        *self.bindings.lock().unwrap() = bindings.clone();
        Ok(())
    }

    async fn multipath_flush(&self, alias: &str) -> Result<(), CsiError> {
        self.log(format!("flush {alias}"));
        self.discards.lock().unwrap().remove(alias);
        Ok(())
    }

    async fn multipath_rescan(&self, alias: &str) -> Result<(), CsiError> {
        self.log(format!("rescan {alias}"));
        Ok(())
    }

    async fn multipath_status(&self, device_path: &Path) -> Result<String, CsiError> {
        self.log(format!("status {}", device_path.display()));
        Ok("volume-x dm-0 DATERA,IBLOCK".into())
    }
}

// ---------------------------------------------------------------------------
// FakeMounter
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeMounter {
    /// Filesystem type `lsblk` would report for the mapped device; `None`
    /// models an unformatted device.
    pub fs_type: Mutex<Option<String>>,
    /// Whether the mapped device node exists at all.
    pub device_missing: bool,
    pub calls: Mutex<Vec<String>>,
}

impl FakeMounter {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    fn log(&self, call: impl Into<String>) {
        self.calls.lock().unwrap().push(call.into());
    }
}

#[async_trait]
impl Mounter for FakeMounter {
    async fn bindmount(&self, src: &str, target: &str, read_only: bool) -> Result<(), CsiError> {
        self.log(format!("bindmount {src} {target} ro={read_only}"));
        Ok(())
    }

    async fn unmount(&self, target: &str) -> Result<(), CsiError> {
        self.log(format!("unmount {target}"));
        Ok(())
    }

    async fn mount_mapped_device(&self, alias: &str, target: &str) -> Result<(), CsiError> {
        self.log(format!("mount {alias} {target}"));
        Ok(())
    }

    async fn format_mapped_device(&self, alias: &str) -> Result<(), CsiError> {
        self.log(format!("format {alias}"));
        *self.fs_type.lock().unwrap() = Some("ext4".into());
        Ok(())
    }

    async fn get_mapped_device(&self, alias: &str) -> Result<BlockInfo, CsiError> {
        self.log(format!("inspect {alias}"));
        if self.device_missing {
            return Err(CsiError::DeviceNotFound(alias.to_owned()));
        }
        Ok(BlockInfo {
            name: alias.to_owned(),
            fs_type: self.fs_type.lock().unwrap().clone(),
            ..Default::default()
        })
    }
}

// ---------------------------------------------------------------------------
// FakeInitializer
// ---------------------------------------------------------------------------

#[derive(Default)]
pub struct FakeInitializer {
    pub init_count: AtomicU32,
}

#[async_trait]
impl Initializer for FakeInitializer {
    async fn node_init(&self, _initiator_name: &str) -> Result<(), CsiError> {
        self.init_count.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}
