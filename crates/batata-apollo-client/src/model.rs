//! Apollo wire models
//!
//! These match the Apollo Config Service response formats consumed by the client.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};

/// Key holding the raw body of non-properties namespaces
pub const CONTENT_KEY: &str = "content";

/// Watermark sent for namespaces that have not been notified yet
pub const INITIAL_NOTIFICATION_ID: i64 = -1;

/// Apollo configuration response
///
/// Returned by `/configs/{appId}/{cluster}/{namespace}` and stored as the backup record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApolloConfig {
    /// Application ID
    pub app_id: String,

    /// Cluster name
    pub cluster: String,

    /// Namespace name
    pub namespace_name: String,

    /// Release key for version tracking
    #[serde(default)]
    pub release_key: String,

    /// Configuration key-value pairs
    #[serde(default)]
    pub configurations: HashMap<String, String>,
}

impl ApolloConfig {
    pub fn new(
        app_id: &str,
        cluster: &str,
        namespace_name: &str,
        release_key: &str,
        configurations: HashMap<String, String>,
    ) -> Self {
        Self {
            app_id: app_id.to_string(),
            cluster: cluster.to_string(),
            namespace_name: namespace_name.to_string(),
            release_key: release_key.to_string(),
            configurations,
        }
    }

    /// The version pointer of this record, without its values
    pub fn connection(&self) -> ApolloConnConfig {
        ApolloConnConfig {
            app_id: self.app_id.clone(),
            cluster: self.cluster.clone(),
            namespace_name: self.namespace_name.clone(),
            release_key: self.release_key.clone(),
        }
    }
}

/// Connection-only projection of a namespace record
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApolloConnConfig {
    pub app_id: String,
    pub cluster: String,
    pub namespace_name: String,
    pub release_key: String,
}

/// Apollo configuration notification
///
/// Sent as the `notifications` query parameter and returned by `/notifications/v2`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApolloConfigNotification {
    /// Namespace name
    pub namespace_name: String,

    /// Notification ID (monotonically increasing on the server)
    pub notification_id: i64,
}

impl ApolloConfigNotification {
    pub fn new(namespace_name: &str, notification_id: i64) -> Self {
        Self {
            namespace_name: namespace_name.to_string(),
            notification_id,
        }
    }
}

/// One config service instance returned by `/services/config`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServiceDto {
    #[serde(default)]
    pub app_name: String,
    #[serde(default)]
    pub instance_id: String,
    pub homepage_url: String,
}

/// Configuration format types supported by Apollo
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum ConfigFormat {
    #[default]
    Properties,
    Xml,
    Json,
    Yaml,
    Yml,
    Txt,
}

impl ConfigFormat {
    /// Parse format from namespace name
    ///
    /// Apollo convention: namespace ending with `.json`, `.yaml`, etc. indicates format
    pub fn from_namespace(namespace: &str) -> Self {
        match namespace.rsplit_once('.') {
            Some((_, ext)) => match ext.to_lowercase().as_str() {
                "json" => ConfigFormat::Json,
                "yaml" => ConfigFormat::Yaml,
                "yml" => ConfigFormat::Yml,
                "xml" => ConfigFormat::Xml,
                "txt" => ConfigFormat::Txt,
                _ => ConfigFormat::Properties,
            },
            None => ConfigFormat::Properties,
        }
    }

    pub fn is_properties(&self) -> bool {
        matches!(self, ConfigFormat::Properties)
    }
}
