//! Bring-up phases
//!
//! Each phase takes the pool by reference and asks it for sessions; none of
//! them opens or closes connections on its own.

pub mod bootstrap;
pub mod cluster;
pub mod edge;
pub mod join;
pub mod prepare;

use crate::error::{Result, SetupError};
use crate::inventory::{HostDescriptor, RoleGroups};
use crate::pool::ConnectionPool;
use crate::utils::exec::{CommandExecutor, Connector};
use std::sync::Arc;
use tracing::debug;

/// Port every control plane serves the API on
pub const API_SERVER_PORT: u16 = 6443;

/// Shape of the control plane
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterMode {
    /// One control plane, addressed directly
    Simple,
    /// Several control planes behind a stable `host:port` endpoint
    Ha { control_plane_endpoint: String },
}

impl ClusterMode {
    /// HA mode with the endpoint taken from `endpoint`, or from the first
    /// load balancer's virtual IP
    pub fn ha(groups: &RoleGroups<'_>, endpoint: Option<&str>) -> Result<Self> {
        let endpoint = match endpoint {
            Some(e) if !e.trim().is_empty() => e.trim().to_string(),
            _ => groups
                .load_balancers()
                .iter()
                .find_map(|lb| lb.virtual_address())
                .map(|vip| format!("{}:{}", vip, API_SERVER_PORT))
                .ok_or_else(|| {
                    SetupError::configuration(
                        "HA mode needs a load balancer with a virtual IP or an explicit control-plane endpoint",
                    )
                })?,
        };
        Ok(ClusterMode::Ha {
            control_plane_endpoint: endpoint,
        })
    }

    pub fn is_ha(&self) -> bool {
        matches!(self, ClusterMode::Ha { .. })
    }
}

/// Pooled session for `host`, opened with the host's own credentials on first use
pub(crate) fn session_for<C: Connector>(
    pool: &ConnectionPool<C>,
    host: &HostDescriptor,
) -> Result<Arc<C::Session>> {
    pool.get(host.address(), Some(&host.credentials()))
}

/// Drop a rendered artifact into `dir` on the host and return its full path
pub(crate) fn upload<E: CommandExecutor + ?Sized>(
    session: &E,
    dir: &str,
    file_name: &str,
    content: &str,
) -> Result<String> {
    let path = format!("{}/{}", dir.trim_end_matches('/'), file_name);
    debug!(host = session.address(), path = %path, bytes = content.len(), "uploading");
    session.write_file(&path, content.as_bytes())?;
    Ok(path)
}
