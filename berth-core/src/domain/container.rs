//! Container domain types
//!
//! Descriptions of the containers a job asks for. These arrive from the CI
//! runner on every invocation and are consumed read-only by the backends.

use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

use crate::error::{HookError, Result};

/// Environment variable forced to `true` in every job, service and step container
pub const GITHUB_ACTIONS_ENV: &str = "GITHUB_ACTIONS";

/// Environment variable defaulted to `true` unless the caller provides it
pub const CI_ENV: &str = "CI";

/// `sh -c` probe that succeeds only on Alpine based images
pub const ALPINE_PROBE: &str =
    r#"[ $(cat /etc/*release* | grep -i -e "^ID=*alpine*" -c) != 0 ] || exit 1"#;

/// A container requested by the runner
///
/// The same shape describes the job container, service containers and
/// container steps; fields a given use does not need are simply absent.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ContainerSpec {
    pub image: Option<String>,
    pub entry_point: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub entry_point_args: Vec<String>,
    /// Free-form, backend specific create options (e.g. `--cpus 2`)
    pub create_options: Option<String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub environment_variables: BTreeMap<String, String>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub user_mount_volumes: Vec<Mount>,
    #[serde(default, deserialize_with = "null_as_default")]
    pub system_mount_volumes: Vec<Mount>,
    pub registry: Option<Registry>,
    /// Published ports, `hostPort[:containerPort][/proto]`
    #[serde(default, deserialize_with = "null_as_default")]
    pub port_mappings: Vec<String>,
    pub working_directory: Option<String>,
}

impl ContainerSpec {
    /// Returns the image, failing if the caller did not provide one
    pub fn image(&self) -> Result<&str> {
        self.image
            .as_deref()
            .filter(|image| !image.is_empty())
            .ok_or_else(|| HookError::InvalidInput("container image was expected".to_string()))
    }

    /// User mounts followed by system mounts
    pub fn mounts(&self) -> impl Iterator<Item = &Mount> {
        self.user_mount_volumes
            .iter()
            .chain(self.system_mount_volumes.iter())
    }

    /// Caller environment plus the variables every CI container receives
    ///
    /// `GITHUB_ACTIONS` is always `true`; `CI` is only set when the caller
    /// did not set it.
    pub fn effective_env(&self) -> BTreeMap<String, String> {
        let mut env = self.environment_variables.clone();
        env.insert(GITHUB_ACTIONS_ENV.to_string(), "true".to_string());
        env.entry(CI_ENV.to_string())
            .or_insert_with(|| "true".to_string());
        env
    }

    /// Splits `createOptions` into individual arguments
    pub fn create_option_args(&self) -> Vec<String> {
        self.create_options
            .as_deref()
            .map(|opts| opts.split_whitespace().map(str::to_string).collect())
            .unwrap_or_default()
    }
}

/// A service container, reachable from the job under `context_name`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceSpec {
    pub context_name: String,
    #[serde(flatten)]
    pub container: ContainerSpec,
}

/// A bind mount requested by the caller
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Mount {
    pub source_volume_path: String,
    pub target_volume_path: String,
    #[serde(default)]
    pub read_only: bool,
}

/// Registry credentials used for a single login/pull/logout bracket
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Registry {
    pub server_url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

impl Registry {
    /// Username and password, only when both are present
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (self.username.as_deref(), self.password.as_deref()) {
            (Some(user), Some(pass)) if !user.is_empty() && !pass.is_empty() => Some((user, pass)),
            _ => None,
        }
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry")
            .field("server_url", &self.server_url)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "***"))
            .finish()
    }
}

/// Treats an explicit JSON `null` like a missing field
pub(crate) fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}
