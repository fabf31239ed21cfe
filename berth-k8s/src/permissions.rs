//! Access self-checks
//!
//! Before creating anything the backend asks the API server whether its
//! identity may perform every verb it is about to use, so a missing RBAC rule
//! fails fast with an actionable message instead of half way through.

use futures::future::try_join_all;
use tracing::debug;

use berth_core::error::{HookError, Result};

use crate::client::ClusterClient;

/// Verbs required on one resource
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Permission {
    pub group: &'static str,
    pub resource: &'static str,
    pub subresource: &'static str,
    pub verbs: &'static [&'static str],
}

impl Permission {
    /// `resource` or `resource/subresource`
    pub fn display_resource(&self) -> String {
        if self.subresource.is_empty() {
            self.resource.to_string()
        } else {
            format!("{}/{}", self.resource, self.subresource)
        }
    }
}

/// Needed for every job
pub const POD_PERMISSIONS: &[Permission] = &[
    Permission {
        group: "",
        resource: "pods",
        subresource: "",
        verbs: &["get", "list", "create", "delete"],
    },
    Permission {
        group: "",
        resource: "pods",
        subresource: "exec",
        verbs: &["get", "create"],
    },
    Permission {
        group: "",
        resource: "pods",
        subresource: "log",
        verbs: &["get", "list", "watch"],
    },
    Permission {
        group: "batch",
        resource: "jobs",
        subresource: "",
        verbs: &["get", "list", "create", "delete"],
    },
];

/// Needed when image pull secrets are created
pub const SECRET_PERMISSIONS: &[Permission] = &[Permission {
    group: "",
    resource: "secrets",
    subresource: "",
    verbs: &["create", "delete", "get", "list"],
}];

/// Fails with [`HookError::Permission`] on the first resource with a denied verb
pub async fn ensure(client: &dyn ClusterClient, permissions: &[Permission]) -> Result<()> {
    for permission in permissions {
        let checks = permission.verbs.iter().map(|verb| async move {
            let allowed = client.access_allowed(permission, verb).await?;
            Ok::<_, HookError>((*verb, allowed))
        });
        let results = try_join_all(checks).await?;

        let denied: Vec<String> = results
            .into_iter()
            .filter(|(_, allowed)| !allowed)
            .map(|(verb, _)| verb.to_string())
            .collect();

        if !denied.is_empty() {
            return Err(HookError::Permission {
                verbs: denied,
                resource: permission.display_resource(),
                namespace: client.namespace().to_string(),
            });
        }
        debug!("Access to {} granted", permission.display_resource());
    }
    Ok(())
}
