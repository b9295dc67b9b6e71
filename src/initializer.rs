//! One-time node host configuration.
//!
//! Before the first staging operation a node needs its iSCSI initiator
//! identity written to the host configuration and a multipath configuration
//! that recognizes the provider's storage arrays.  [`Initializer`] is the
//! capability; the backend invokes it lazily, at most once per process, from
//! the first node-info query.

use std::path::PathBuf;

use async_trait::async_trait;
use tracing::info;

use crate::error::CsiError;

/// Host file carrying the iSCSI initiator name.
pub const INITIATOR_NAME_FILE: &str = "/etc/iscsi/initiatorname.iscsi";
/// Host multipath configuration file.
pub const MULTIPATH_CONF_FILE: &str = "/etc/multipath.conf";

/// The multipath configuration written verbatim to the host: friendly names
/// on, local and vendor disks blacklisted, ALUA handling for the provider's
/// storage arrays.
const MULTIPATH_CONF: &str = r#"
defaults {
       polling_interval       3
       fast_io_fail_tmo 5
       path_selector              "round-robin 0"
       rr_min_io                    100
       rr_weight                    priorities
       failback                    immediate
       no_path_retry              queue
       user_friendly_names     yes
}
blacklist {
         devnode "^(ram|raw|loop|fd|md|dm-|sr|scd|st)[0-9]*"
         devnode "^hd[a-z][[0-9]*]"
         devnode "^vd[a-z]"
         devnode "^cciss!c[0-9]d[0-9]*[p[0-9]*]"
         device {
               vendor  "Micron"
               product ".*"
         }
         device {
               vendor  "Intel"
               product ".*"
         }
         device {
               vendor  "DELL"
               product ".*"
         }
}
devices {
        device {
                vendor "DATERA"
                product "IBLOCK"
                path_grouping_policy group_by_prio
                path_checker tur
                hardware_handler "1 alua"
        }
}
"#;

/// Capability for node host configuration.
#[async_trait]
pub trait Initializer: Send + Sync {
    /// Configure the host for iSCSI/multipath under the given initiator
    /// identity.  Must be safe to call again after a partial failure.
    async fn node_init(&self, initiator_name: &str) -> Result<(), CsiError>;
}

/// The production [`Initializer`], writing the host configuration files.
pub struct HostInitializer {
    initiator_name_file: PathBuf,
    multipath_conf_file: PathBuf,
}

impl Default for HostInitializer {
    fn default() -> Self {
        Self {
            initiator_name_file: INITIATOR_NAME_FILE.into(),
            multipath_conf_file: MULTIPATH_CONF_FILE.into(),
        }
    }
}

impl HostInitializer {
    /// Initializer with alternate file locations, for tests.
    pub fn with_paths(
        initiator_name_file: impl Into<PathBuf>,
        multipath_conf_file: impl Into<PathBuf>,
    ) -> Self {
        Self {
            initiator_name_file: initiator_name_file.into(),
            multipath_conf_file: multipath_conf_file.into(),
        }
    }

    async fn set_iscsi_initiator(&self, initiator_name: &str) -> Result<(), CsiError> {
        let contents = format!("InitiatorName={initiator_name}\n");
        tokio::fs::write(&self.initiator_name_file, contents)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "write {}: {e}",
                    self.initiator_name_file.display()
                ))
            })
    }

    async fn configure_multipath(&self) -> Result<(), CsiError> {
        tokio::fs::write(&self.multipath_conf_file, MULTIPATH_CONF)
            .await
            .map_err(|e| {
                CsiError::Internal(format!(
                    "write {}: {e}",
                    self.multipath_conf_file.display()
                ))
            })
    }

    /// Restart the iSCSI and multipath services so the new configuration
    /// takes effect.  There is no supported way to do this from inside the
    /// plugin container yet; the services pick the files up on their next
    /// start.
    async fn restart_services(&self) -> Result<(), CsiError> {
        Ok(())
    }
}

#[async_trait]
impl Initializer for HostInitializer {
    async fn node_init(&self, initiator_name: &str) -> Result<(), CsiError> {
        self.set_iscsi_initiator(initiator_name).await?;
        self.configure_multipath().await?;
        self.restart_services().await?;
        info!(initiator_name, "node initialized");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn node_init_writes_both_files() {
        let dir = tempfile::tempdir().unwrap();
        let initiator = dir.path().join("initiatorname.iscsi");
        let conf = dir.path().join("multipath.conf");
        let init = HostInitializer::with_paths(&initiator, &conf);

        init.node_init("iqn.2018-05.net.example:host-1")
            .await
            .unwrap();

        let written = tokio::fs::read_to_string(&initiator).await.unwrap();
        assert_eq!(written, "InitiatorName=iqn.2018-05.net.example:host-1\n");

        let conf_written = tokio::fs::read_to_string(&conf).await.unwrap();
        assert!(conf_written.contains("user_friendly_names"));
        assert!(conf_written.contains("DATERA"));
    }

    #[tokio::test]
    async fn node_init_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        let initiator = dir.path().join("initiatorname.iscsi");
        let conf = dir.path().join("multipath.conf");
        let init = HostInitializer::with_paths(&initiator, &conf);

        init.node_init("iqn.a").await.unwrap();
        init.node_init("iqn.b").await.unwrap();

        let written = tokio::fs::read_to_string(&initiator).await.unwrap();
        assert_eq!(written, "InitiatorName=iqn.b\n");
    }
}
