//! Operator-supplied pod template
//!
//! A YAML fragment shaped like a pod template (`metadata` + `spec`) that is
//! merged into every pod the hook creates. Containers named `$<name>` extend
//! the container called `<name>` (`$job` is the job container); any other
//! template container is added to the job pod as is.

use k8s_openapi::api::core::v1::Pod;
use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::{Map, Value};
use std::path::Path;
use tracing::{debug, warn};

use berth_core::error::{HookError, Result};

use crate::names::CONTAINER_EXTENSION_PREFIX;

/// Container fields whose lists are appended instead of replaced
const APPENDED_CONTAINER_FIELDS: &[&str] = &["env", "volumeMounts", "ports"];

/// A parsed pod template
#[derive(Debug, Clone, PartialEq)]
pub struct PodTemplate {
    raw: Value,
}

impl PodTemplate {
    /// Reads the template file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            HookError::Configuration(format!(
                "failed to read pod template {}: {}",
                path.display(),
                e
            ))
        })?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: Value = serde_yaml::from_str(content)?;
        if !raw.is_object() {
            return Err(HookError::Configuration(
                "pod template must be a mapping with 'metadata' and 'spec'".to_string(),
            ));
        }
        Ok(Self { raw })
    }

    /// Merges the template into the job pod
    pub fn apply_to_pod(&self, pod: &Pod) -> Result<Pod> {
        self.apply(pod, true)
    }

    /// Merges the template into a step pod template; extra containers are dropped
    pub fn apply_to_step<T>(&self, template: &T) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        self.apply(template, false)
    }

    fn apply<T>(&self, target: &T, append_containers: bool) -> Result<T>
    where
        T: Serialize + DeserializeOwned,
    {
        let mut value = serde_json::to_value(target)?;
        if let Some(metadata) = self.raw.get("metadata") {
            merge_metadata(&mut value, metadata);
        }
        if let Some(spec) = self.raw.get("spec") {
            merge_spec(&mut value, spec, append_containers);
        }
        Ok(serde_json::from_value(value)?)
    }
}

fn object_entry<'a>(value: &'a mut Value, key: &str) -> Option<&'a mut Map<String, Value>> {
    let object = value.as_object_mut()?;
    object
        .entry(key.to_string())
        .or_insert_with(|| Value::Object(Map::new()))
        .as_object_mut()
}

fn merge_metadata(target: &mut Value, template: &Value) {
    let Some(metadata) = object_entry(target, "metadata") else {
        return;
    };
    for field in ["labels", "annotations"] {
        let Some(extra) = template.get(field).and_then(Value::as_object) else {
            continue;
        };
        let existing = metadata
            .entry(field.to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if let Some(existing) = existing.as_object_mut() {
            for (key, value) in extra {
                // Labels the hook relies on for pruning win
                existing.entry(key.clone()).or_insert_with(|| value.clone());
            }
        }
    }
}

fn append(target: &mut Map<String, Value>, key: &str, extra: &Value) {
    let Some(extra) = extra.as_array() else {
        return;
    };
    match target.get_mut(key).and_then(Value::as_array_mut) {
        Some(existing) => existing.extend(extra.iter().cloned()),
        None => {
            target.insert(key.to_string(), Value::Array(extra.clone()));
        }
    }
}

fn merge_container(target: &mut Map<String, Value>, template: &Map<String, Value>) {
    for (key, value) in template {
        if key == "name" {
            warn!("Skipping name override: name can't be overwritten");
        } else if APPENDED_CONTAINER_FIELDS.contains(&key.as_str()) {
            append(target, key, value);
        } else {
            target.insert(key.clone(), value.clone());
        }
    }
}

fn merge_spec(target: &mut Value, template: &Value, append_containers: bool) {
    let Some(template) = template.as_object() else {
        return;
    };
    let Some(spec) = object_entry(target, "spec") else {
        return;
    };

    for (key, value) in template {
        match key.as_str() {
            "containers" => {}
            "volumes" => append(spec, key, value),
            _ => {
                spec.insert(key.clone(), value.clone());
            }
        }
    }

    let extensions = template
        .get("containers")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_object);
    let containers = spec
        .entry("containers".to_string())
        .or_insert_with(|| Value::Array(Vec::new()));
    let Some(containers) = containers.as_array_mut() else {
        return;
    };

    for extension in extensions {
        let name = extension
            .get("name")
            .and_then(Value::as_str)
            .unwrap_or_default();
        match name.strip_prefix(CONTAINER_EXTENSION_PREFIX) {
            Some(extended) => {
                let found = containers.iter_mut().filter_map(Value::as_object_mut).find(|c| {
                    c.get("name").and_then(Value::as_str) == Some(extended)
                });
                match found {
                    Some(container) => {
                        debug!("Extending container {} from the pod template", extended);
                        merge_container(container, extension);
                    }
                    None if append_containers => {
                        warn!("Pod template extends unknown container {}", extended)
                    }
                    None => {}
                }
            }
            None if append_containers => containers.push(Value::Object(extension.clone())),
            None => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{Container, EnvVar, PodSpec, PodTemplateSpec};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
    use pretty_assertions::assert_eq;
    use std::collections::BTreeMap;

    const TEMPLATE: &str = r#"
metadata:
  labels:
    team: ci
    runner-pod: hijacked
  annotations:
    owner: platform
spec:
  serviceAccountName: ci-jobs
  volumes:
    - name: cache
      emptyDir: {}
  containers:
    - name: $job
      image: ignored-image-override
      env:
        - name: FROM_TEMPLATE
          value: "1"
      volumeMounts:
        - name: cache
          mountPath: /cache
    - name: $redis
      imagePullPolicy: Always
    - name: sidecar
      image: busybox
"#;

    fn base_pod() -> Pod {
        let container = |name: &str, image: &str| Container {
            name: name.to_string(),
            image: Some(image.to_string()),
            env: Some(vec![EnvVar {
                name: "CI".to_string(),
                value: Some("true".to_string()),
                ..EnvVar::default()
            }]),
            ..Container::default()
        };
        Pod {
            metadata: ObjectMeta {
                name: Some("runner-workflow".to_string()),
                labels: Some(BTreeMap::from([(
                    "runner-pod".to_string(),
                    "runner".to_string(),
                )])),
                ..ObjectMeta::default()
            },
            spec: Some(PodSpec {
                containers: vec![container("job", "node:20"), container("redis", "redis")],
                restart_policy: Some("Never".to_string()),
                ..PodSpec::default()
            }),
            ..Pod::default()
        }
    }

    #[test]
    fn test_apply_to_pod() {
        let template = PodTemplate::from_yaml(TEMPLATE).unwrap();
        let pod = template.apply_to_pod(&base_pod()).unwrap();

        let labels = pod.metadata.labels.unwrap();
        assert_eq!(labels["runner-pod"], "runner");
        assert_eq!(labels["team"], "ci");
        assert_eq!(pod.metadata.annotations.unwrap()["owner"], "platform");

        let spec = pod.spec.unwrap();
        assert_eq!(spec.service_account_name.as_deref(), Some("ci-jobs"));
        assert_eq!(spec.restart_policy.as_deref(), Some("Never"));
        assert_eq!(spec.volumes.unwrap()[0].name, "cache");

        let names: Vec<&str> = spec.containers.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["job", "redis", "sidecar"]);

        let job = &spec.containers[0];
        assert_eq!(job.image.as_deref(), Some("ignored-image-override"));
        let env: Vec<&str> = job.env.iter().flatten().map(|e| e.name.as_str()).collect();
        assert_eq!(env, vec!["CI", "FROM_TEMPLATE"]);
        assert_eq!(job.volume_mounts.as_ref().unwrap()[0].mount_path, "/cache");

        assert_eq!(
            spec.containers[1].image_pull_policy.as_deref(),
            Some("Always")
        );
    }

    #[test]
    fn test_apply_to_step_skips_extra_containers() {
        let template = PodTemplate::from_yaml(TEMPLATE).unwrap();
        let step = PodTemplateSpec {
            metadata: None,
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "job".to_string(),
                    image: Some("alpine".to_string()),
                    ..Container::default()
                }],
                ..PodSpec::default()
            }),
        };

        let merged = template.apply_to_step(&step).unwrap();
        let spec = merged.spec.unwrap();
        assert_eq!(spec.containers.len(), 1);
        assert_eq!(spec.containers[0].env.as_ref().unwrap()[0].name, "FROM_TEMPLATE");
        assert_eq!(merged.metadata.unwrap().labels.unwrap()["team"], "ci");
    }

    #[test]
    fn test_non_mapping_template_is_rejected() {
        assert!(PodTemplate::from_yaml("- a\n- b\n").is_err());
    }
}
