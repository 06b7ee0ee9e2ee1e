use chrono::NaiveDateTime;
use serde::{de::DeserializeOwned, Deserialize, Serialize};

pub mod gpa;
pub mod labels;
pub mod metrics;
pub mod object_reference;
pub mod pod;
pub mod scale;
pub mod webhook;

pub use labels::Labels;

pub trait Object:
    Clone + Serialize + DeserializeOwned + Send + Sync + PartialEq + std::fmt::Debug + 'static
{
    fn kind(&self) -> &'static str;

    fn metadata(&self) -> &Metadata;

    fn name(&self) -> &String {
        &self.metadata().name
    }

    fn namespace(&self) -> &String {
        &self.metadata().namespace
    }

    /// Key of the object in work queues and local stores, `namespace/name`.
    fn key(&self) -> String {
        format!("{}/{}", self.namespace(), self.name())
    }
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq, Default)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    /// Name must be unique within a namespace.
    pub name: String,
    /// Namespace defines the space within which each name must be unique.
    /// Defaults to "default".
    #[serde(default = "default_namespace")]
    pub namespace: String,
    /// UID is the unique in time and space value for this object.
    /// Populated by the system. Read-only.
    pub uid: Option<String>,
    /// Map of string keys and values that can be used
    /// to organize and categorize (scope and select) objects.
    #[serde(default)]
    pub labels: Labels,
    /// Time at which this resource will be deleted.
    /// Set by the server when a graceful deletion is requested. Read-only.
    pub deletion_timestamp: Option<NaiveDateTime>,
}

fn default_namespace() -> String {
    "default".to_string()
}
