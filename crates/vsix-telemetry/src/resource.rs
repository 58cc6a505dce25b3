//! Resource metadata and the host environment collaborator.
//!
//! Resource attributes are assembled in three layers, later layers winning
//! on key collision:
//! 1. Fixed entries (service identity, deployment marker, distro markers)
//! 2. Host application entries from a [`HostEnvironment`]
//! 3. Caller-supplied `resource_attributes` from the configuration

use crate::config::TelemetryConfig;
use opentelemetry::KeyValue;
use opentelemetry_sdk::Resource;
use opentelemetry_semantic_conventions::resource as semconv_res;

/// Deployment environment reported by every extension.
pub const DEPLOYMENT_ENVIRONMENT: &str = "ide-extension";

/// Distribution name reported in `telemetry.distro.name`.
pub const DISTRO_NAME: &str = "vsix-telemetry";

/// Attribute keys not covered by the stable semantic conventions.
pub mod keys {
    /// `deployment.environment.name`
    pub const DEPLOYMENT_ENVIRONMENT_NAME: &str = "deployment.environment.name";
    /// `telemetry.distro.name`
    pub const TELEMETRY_DISTRO_NAME: &str = "telemetry.distro.name";
    /// `telemetry.distro.version`
    pub const TELEMETRY_DISTRO_VERSION: &str = "telemetry.distro.version";
    /// Host application version.
    pub const HOST_VERSION: &str = "vsix.host.version";
    /// Host application edition.
    pub const HOST_EDITION: &str = "vsix.host.edition";
    /// Operating system version.
    pub const OS_VERSION: &str = "os.version";
    /// Operating system family.
    pub const OS_TYPE: &str = "os.type";
    /// Process architecture.
    pub const HOST_ARCH: &str = "host.arch";
}

/// Supplies facts about the host application and process.
///
/// Implementations are provided by the embedding extension; this crate does
/// not introspect the host itself. Every lookup is optional.
pub trait HostEnvironment: Send + Sync {
    /// Host application version.
    fn host_version(&self) -> Option<String>;

    /// Host application edition.
    fn host_edition(&self) -> Option<String>;

    /// Operating system version.
    fn os_version(&self) -> Option<String> {
        None
    }

    /// Operating system family, such as `linux` or `windows`.
    fn os_type(&self) -> Option<String> {
        None
    }

    /// Process architecture.
    fn process_architecture(&self) -> Option<String> {
        None
    }
}

/// Host environment that knows nothing about the host application and
/// reports the operating system family and CPU architecture of the process.
/// The operating system version is left unset.
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessEnvironment;

impl HostEnvironment for ProcessEnvironment {
    fn host_version(&self) -> Option<String> {
        None
    }

    fn host_edition(&self) -> Option<String> {
        None
    }

    fn os_type(&self) -> Option<String> {
        Some(std::env::consts::OS.to_string())
    }

    fn process_architecture(&self) -> Option<String> {
        Some(std::env::consts::ARCH.to_string())
    }
}

/// Builds the merged resource attribute list.
pub fn resource_attributes(config: &TelemetryConfig, host: &dyn HostEnvironment) -> Vec<KeyValue> {
    let mut attributes = vec![
        KeyValue::new(semconv_res::SERVICE_NAME, config.service_name.clone()),
        KeyValue::new(semconv_res::SERVICE_VERSION, config.service_version.clone()),
        KeyValue::new(keys::DEPLOYMENT_ENVIRONMENT_NAME, DEPLOYMENT_ENVIRONMENT),
        KeyValue::new(keys::TELEMETRY_DISTRO_NAME, DISTRO_NAME),
        KeyValue::new(keys::TELEMETRY_DISTRO_VERSION, env!("CARGO_PKG_VERSION")),
    ];

    let host_entries = [
        (keys::HOST_VERSION, host.host_version()),
        (keys::HOST_EDITION, host.host_edition()),
        (keys::OS_VERSION, host.os_version()),
        (keys::OS_TYPE, host.os_type()),
        (keys::HOST_ARCH, host.process_architecture()),
    ];
    for (key, value) in host_entries {
        if let Some(value) = value {
            upsert(&mut attributes, KeyValue::new(key, value));
        }
    }

    for (key, value) in &config.resource_attributes {
        upsert(&mut attributes, KeyValue::new(key.clone(), value.clone()));
    }

    attributes
}

/// Builds the SDK resource shared by all signal providers.
pub fn build_resource(config: &TelemetryConfig, host: &dyn HostEnvironment) -> Resource {
    Resource::builder()
        .with_attributes(resource_attributes(config, host))
        .build()
}

/// Inserts `attribute`, replacing any existing entry with the same key.
pub(crate) fn upsert(attributes: &mut Vec<KeyValue>, attribute: KeyValue) {
    match attributes.iter_mut().find(|kv| kv.key == attribute.key) {
        Some(existing) => *existing = attribute,
        None => attributes.push(attribute),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AttributeValue;
    use opentelemetry::{Key, Value};

    fn find<'a>(attributes: &'a [KeyValue], key: &str) -> Option<&'a Value> {
        let key = Key::from(key.to_string());
        attributes.iter().find(|kv| kv.key == key).map(|kv| &kv.value)
    }

    struct FakeHost;

    impl HostEnvironment for FakeHost {
        fn host_version(&self) -> Option<String> {
            Some("17.9.2".to_string())
        }

        fn host_edition(&self) -> Option<String> {
            Some("Enterprise".to_string())
        }
    }

    #[test]
    fn test_fixed_attributes() {
        let config = TelemetryConfig::new("TestService");
        let attributes = resource_attributes(&config, &FakeHost);

        assert_eq!(
            find(&attributes, "service.name"),
            Some(&Value::from("TestService"))
        );
        assert_eq!(find(&attributes, "service.version"), Some(&Value::from("1.0.0")));
        assert_eq!(
            find(&attributes, keys::DEPLOYMENT_ENVIRONMENT_NAME),
            Some(&Value::from(DEPLOYMENT_ENVIRONMENT))
        );
        assert_eq!(
            find(&attributes, keys::TELEMETRY_DISTRO_NAME),
            Some(&Value::from(DISTRO_NAME))
        );
        assert!(find(&attributes, keys::TELEMETRY_DISTRO_VERSION).is_some());
    }

    #[test]
    fn test_host_attributes_only_when_present() {
        let config = TelemetryConfig::default();
        let attributes = resource_attributes(&config, &FakeHost);

        assert_eq!(find(&attributes, keys::HOST_VERSION), Some(&Value::from("17.9.2")));
        assert_eq!(
            find(&attributes, keys::HOST_EDITION),
            Some(&Value::from("Enterprise"))
        );
        assert!(find(&attributes, keys::OS_VERSION).is_none());
        assert!(find(&attributes, keys::HOST_ARCH).is_none());

        let attributes = resource_attributes(&config, &ProcessEnvironment);
        assert!(find(&attributes, keys::HOST_VERSION).is_none());
        assert_eq!(
            find(&attributes, keys::HOST_ARCH),
            Some(&Value::from(std::env::consts::ARCH))
        );
        assert_eq!(
            find(&attributes, keys::OS_TYPE),
            Some(&Value::from(std::env::consts::OS))
        );
        assert!(find(&attributes, keys::OS_VERSION).is_none());
    }

    #[test]
    fn test_caller_attributes_override_fixed_entries() {
        let mut config = TelemetryConfig::new("TestService");
        config
            .resource_attributes
            .insert("service.name".to_string(), AttributeValue::from("Overridden"));
        config
            .resource_attributes
            .insert("team".to_string(), AttributeValue::from("tools"));

        let attributes = resource_attributes(&config, &ProcessEnvironment);

        assert_eq!(
            find(&attributes, "service.name"),
            Some(&Value::from("Overridden"))
        );
        assert_eq!(find(&attributes, "team"), Some(&Value::from("tools")));
        let service_names = attributes
            .iter()
            .filter(|kv| kv.key.as_str() == "service.name")
            .count();
        assert_eq!(service_names, 1);
    }

    #[test]
    fn test_build_resource_contains_service_name() {
        let config = TelemetryConfig::new("TestService");
        let resource = build_resource(&config, &ProcessEnvironment);

        assert_eq!(
            resource.get(&Key::from_static_str("service.name")),
            Some(Value::from("TestService"))
        );
    }
}
