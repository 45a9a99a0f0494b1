//! Typed envelope over the goal's `data` side channel.
//!
//! The orchestrator and the isolated job only share this JSON document, so
//! the known payloads are parsed into types while everything else written by
//! other features is carried through untouched.

use super::registration::ContainerRegistration;
use crate::error::Result;
use k8s_openapi::api::core::v1::{Container, LocalObjectReference, Volume, VolumeMount};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub const CONTAINER_REGISTRATION_KEY: &str = "@atomist/sdm/container";
pub const SERVICE_REGISTRATION_KEY: &str = "@atomist/sdm/service";
pub const ENVELOPE_VERSION_KEY: &str = "@atomist/sdm/envelope";
pub const ENVELOPE_VERSION: u32 = 1;

/// Service registration type understood by the job spec builder.
pub const K8S_SERVICE_TYPE: &str = "k8s-service";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct GoalData {
    #[serde(
        rename = "@atomist/sdm/envelope",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub version: Option<u32>,

    #[serde(
        rename = "@atomist/sdm/container",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub container: Option<ContainerRegistration>,

    #[serde(
        rename = "@atomist/sdm/service",
        default,
        skip_serializing_if = "BTreeMap::is_empty"
    )]
    pub services: BTreeMap<String, ServiceRegistration>,

    #[serde(flatten)]
    pub other: Map<String, Value>,
}

impl GoalData {
    /// Parse a raw `data` string. Absent or blank data is an empty envelope.
    pub fn parse(raw: Option<&str>) -> Result<Self> {
        match raw.map(str::trim) {
            None | Some("") => Ok(Self::default()),
            Some(raw) => Ok(serde_json::from_str(raw)?),
        }
    }

    pub fn to_json_string(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    /// Merge `self` into a raw data document: the container registration and
    /// version are replaced, services are unioned by name and every other key
    /// is deep-merged, `self` winning on conflicts. The document is never
    /// parsed into types, so entries this crate cannot read survive.
    pub fn merge_into(self, document: &mut Map<String, Value>) -> Result<()> {
        let Value::Object(update) = serde_json::to_value(self)? else {
            return Ok(());
        };
        for (key, value) in update {
            let replaced = key == CONTAINER_REGISTRATION_KEY || key == ENVELOPE_VERSION_KEY;
            match (document.get_mut(&key), value) {
                (Some(Value::Object(services)), Value::Object(added))
                    if key == SERVICE_REGISTRATION_KEY =>
                {
                    services.extend(added);
                }
                (Some(existing), value) if !replaced => deep_merge(existing, value),
                (_, value) => {
                    document.insert(key, value);
                }
            }
        }
        Ok(())
    }

    /// `k8s-service` registrations in name order.
    pub fn k8s_services(&self) -> impl Iterator<Item = (&String, &K8sServiceSpec)> {
        self.services.iter().filter_map(|(name, service)| match service {
            ServiceRegistration::K8sService(spec) => Some((name, spec)),
            ServiceRegistration::Other { .. } => None,
        })
    }
}

fn deep_merge(target: &mut Value, source: Value) {
    match (target, source) {
        (Value::Object(target), Value::Object(source)) => {
            for (key, value) in source {
                match target.get_mut(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => {
                        target.insert(key, value);
                    }
                }
            }
        }
        (target, source) => *target = source,
    }
}

/// Extension record attaching cluster resources to a goal's job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "RawServiceRegistration", into = "RawServiceRegistration")]
pub enum ServiceRegistration {
    K8sService(K8sServiceSpec),
    /// Registration of a type this crate does not interpret.
    Other { service_type: String, spec: Value },
}

#[derive(Serialize, Deserialize)]
struct RawServiceRegistration {
    #[serde(rename = "type")]
    service_type: String,
    #[serde(default)]
    spec: Value,
}

impl TryFrom<RawServiceRegistration> for ServiceRegistration {
    type Error = serde_json::Error;

    fn try_from(raw: RawServiceRegistration) -> std::result::Result<Self, Self::Error> {
        if raw.service_type == K8S_SERVICE_TYPE {
            let spec = if raw.spec.is_null() {
                K8sServiceSpec::default()
            } else {
                serde_json::from_value(raw.spec)?
            };
            Ok(ServiceRegistration::K8sService(spec))
        } else {
            Ok(ServiceRegistration::Other {
                service_type: raw.service_type,
                spec: raw.spec,
            })
        }
    }
}

impl From<ServiceRegistration> for RawServiceRegistration {
    fn from(service: ServiceRegistration) -> Self {
        match service {
            ServiceRegistration::K8sService(spec) => RawServiceRegistration {
                service_type: K8S_SERVICE_TYPE.to_string(),
                spec: serde_json::to_value(spec).unwrap_or(Value::Null),
            },
            ServiceRegistration::Other { service_type, spec } => {
                RawServiceRegistration { service_type, spec }
            }
        }
    }
}

/// Resources a `k8s-service` registration splices into the job's pod.
///
/// Every field accepts either a single object or a list.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct K8sServiceSpec {
    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub container: Vec<Container>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub init_container: Vec<Container>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub volume: Vec<Volume>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub volume_mount: Vec<VolumeMount>,

    #[serde(default, deserialize_with = "one_or_many", skip_serializing_if = "Vec::is_empty")]
    pub image_pull_secret: Vec<LocalObjectReference>,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum OneOrMany<T> {
    Many(Vec<T>),
    One(T),
}

fn one_or_many<'de, D, T>(deserializer: D) -> std::result::Result<Vec<T>, D::Error>
where
    D: Deserializer<'de>,
    T: DeserializeOwned,
{
    Ok(match Option::<OneOrMany<T>>::deserialize(deserializer)? {
        None => Vec::new(),
        Some(OneOrMany::Many(items)) => items,
        Some(OneOrMany::One(item)) => vec![item],
    })
}
