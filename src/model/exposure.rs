//! Network exposure construction
//!
//! Exposed ports publish a module inside the cluster; host-port bindings
//! additionally publish it outside. Both collapse into one Service per
//! module. A binding for a container port replaces the internal entry for
//! that same port, so a container port is never published twice.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::{Service, ServicePort, ServiceSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use tracing::warn;

use super::{parse_port_key, ModuleContext};

/// Build the Service for one module, if it exposes anything
///
/// Returns `None` when no translatable port exists; a module with no ports
/// gets no Service at all.
pub(crate) fn build_service(ctx: &ModuleContext<'_>) -> Option<Service> {
    let opts = &ctx.settings.create_options;

    // entries are keyed by container port and protocol so a later host-port
    // binding replaces the internal entry publishing the same container port
    let mut entries: BTreeMap<(i32, String), ServicePort> = BTreeMap::new();

    for key in opts.exposed_ports.keys() {
        let Some((port, protocol)) = parse_port_key(ctx.name, key) else {
            continue;
        };
        entries.insert(
            (port, protocol.to_string()),
            service_port(port, port, protocol),
        );
    }

    let mut external = false;
    if let Some(host_config) = opts.host_config.as_ref() {
        for (key, bindings) in &host_config.port_bindings {
            let Some((container_port, protocol)) = parse_port_key(ctx.name, key) else {
                continue;
            };
            for binding in bindings {
                let host_port: u16 = match binding.host_port.parse() {
                    Ok(port) if port > 0 => port,
                    _ => {
                        warn!(
                            module = %ctx.name,
                            key = %key,
                            host_port = %binding.host_port,
                            "unusable host port, skipping binding"
                        );
                        continue;
                    }
                };
                external = true;
                entries.insert(
                    (container_port, protocol.to_string()),
                    service_port(i32::from(host_port), container_port, protocol),
                );
            }
        }
    }

    if entries.is_empty() {
        return None;
    }

    let service_type = if external {
        ctx.config.external_mode.service_type()
    } else {
        "ClusterIP"
    };

    Some(Service {
        metadata: ObjectMeta {
            name: Some(ctx.sanitized.clone()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            annotations: (!ctx.annotations.is_empty()).then(|| ctx.annotations.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(ctx.labels.clone()),
            ports: Some(entries.into_values().collect()),
            type_: Some(service_type.to_string()),
            ..Default::default()
        }),
        ..Default::default()
    })
}

fn service_port(published: i32, target: i32, protocol: &str) -> ServicePort {
    ServicePort {
        name: Some(format!("{}-{}", protocol.to_ascii_lowercase(), published)),
        port: published,
        target_port: Some(IntOrString::Int(target)),
        protocol: Some(protocol.to_string()),
        ..Default::default()
    }
}
