//! Workload template construction
//!
//! One module becomes one Deployment: a single-replica, recreate-strategy
//! workload whose pod runs exactly two containers, the module itself and
//! the proxy sidecar. Host-side state from the module's docker options is
//! translated into volumes; the workload API socket and the sidecar's
//! configuration ride along as fixed infrastructure volumes.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec, DeploymentStrategy};
use k8s_openapi::api::core::v1::{
    ConfigMapVolumeSource, Container, ContainerPort, EmptyDirVolumeSource, EnvVar,
    HostPathVolumeSource, LocalObjectReference, PodSpec, PodTemplateSpec, SecurityContext,
    ServiceAccount, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use tracing::warn;

use crate::crd::DesiredStatus;
use crate::MODULE_ID_ANNOTATION;

use super::{
    image_pull_policy, parse_port_key, ModuleContext, PROXY_CONFIG_VOLUME, SOCKET_VOLUME,
    TRUST_BUNDLE_VOLUME,
};

/// Build the Deployment for one module
pub(crate) fn build_deployment(ctx: &ModuleContext<'_>) -> Deployment {
    let (volumes, module_mounts) = build_volumes(ctx);
    let containers = vec![module_container(ctx, module_mounts), proxy_container(ctx)];

    let image_pull_secrets = ctx
        .settings
        .auth
        .as_ref()
        .and_then(|auth| auth.pull_secret_name())
        .map(|name| vec![LocalObjectReference { name }]);

    let replicas = match ctx.module.desired_status {
        DesiredStatus::Running => 1,
        DesiredStatus::Stopped => 0,
    };

    Deployment {
        metadata: object_meta(ctx),
        spec: Some(DeploymentSpec {
            replicas: Some(replicas),
            strategy: Some(DeploymentStrategy {
                type_: Some("Recreate".to_string()),
                ..Default::default()
            }),
            selector: LabelSelector {
                match_labels: Some(ctx.labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(ctx.labels.clone()),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers,
                    service_account_name: Some(ctx.sanitized.clone()),
                    volumes: Some(volumes),
                    image_pull_secrets,
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Build the ServiceAccount binding the module identity
///
/// The platform offers no in-place update for these; a changed identity
/// changes the fingerprint, and the engine recreates the account.
pub(crate) fn build_service_account(ctx: &ModuleContext<'_>) -> ServiceAccount {
    let mut annotations = ctx.annotations.clone();
    annotations.insert(
        MODULE_ID_ANNOTATION.to_string(),
        ctx.identity.module_id.clone(),
    );
    annotations.insert(
        crate::GENERATION_ID_ANNOTATION.to_string(),
        ctx.identity.generation_id.clone(),
    );

    ServiceAccount {
        metadata: ObjectMeta {
            name: Some(ctx.sanitized.clone()),
            namespace: Some(ctx.config.namespace.clone()),
            labels: Some(ctx.labels.clone()),
            annotations: Some(annotations),
            ..Default::default()
        },
        ..Default::default()
    }
}

fn object_meta(ctx: &ModuleContext<'_>) -> ObjectMeta {
    ObjectMeta {
        name: Some(ctx.sanitized.clone()),
        namespace: Some(ctx.config.namespace.clone()),
        labels: Some(ctx.labels.clone()),
        annotations: (!ctx.annotations.is_empty()).then(|| ctx.annotations.clone()),
        ..Default::default()
    }
}

/// The module's own container
fn module_container(ctx: &ModuleContext<'_>, mut mounts: Vec<VolumeMount>) -> Container {
    let opts = &ctx.settings.create_options;

    let ports: Vec<ContainerPort> = opts
        .exposed_ports
        .keys()
        .filter_map(|key| parse_port_key(ctx.name, key))
        .map(|(port, protocol)| ContainerPort {
            container_port: port,
            protocol: Some(protocol.to_string()),
            ..Default::default()
        })
        .collect();

    let privileged = opts
        .host_config
        .as_ref()
        .and_then(|host| host.privileged)
        .unwrap_or(false);

    mounts.push(socket_mount(ctx));

    Container {
        name: ctx.sanitized.clone(),
        image: Some(ctx.settings.image.clone()),
        image_pull_policy: Some(
            image_pull_policy(ctx.module.image_pull_policy, &ctx.settings.image).to_string(),
        ),
        env: Some(merge_env(ctx)),
        ports: (!ports.is_empty()).then_some(ports),
        security_context: privileged.then(|| SecurityContext {
            privileged: Some(true),
            ..Default::default()
        }),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

/// The fixed proxy sidecar
fn proxy_container(ctx: &ModuleContext<'_>) -> Container {
    let proxy = &ctx.config.proxy;
    let mounts = vec![
        socket_mount(ctx),
        VolumeMount {
            name: PROXY_CONFIG_VOLUME.to_string(),
            mount_path: proxy.config_path.clone(),
            read_only: Some(true),
            ..Default::default()
        },
        VolumeMount {
            name: TRUST_BUNDLE_VOLUME.to_string(),
            mount_path: proxy.trust_bundle_path.clone(),
            read_only: Some(true),
            ..Default::default()
        },
    ];

    Container {
        name: crate::PROXY_CONTAINER_NAME.to_string(),
        image: Some(proxy.image.clone()),
        image_pull_policy: Some(image_pull_policy(None, &proxy.image).to_string()),
        volume_mounts: Some(mounts),
        ..Default::default()
    }
}

fn socket_mount(ctx: &ModuleContext<'_>) -> VolumeMount {
    VolumeMount {
        name: SOCKET_VOLUME.to_string(),
        mount_path: ctx.config.workload_socket_mount_path.clone(),
        ..Default::default()
    }
}

/// Merge the three environment sources into one deterministic list.
///
/// Docker `Env` strings first, then the module's environment map, then the
/// injected orchestration variables. Later sources win on key collision,
/// so nothing in the document can spoof the injected identity.
fn merge_env(ctx: &ModuleContext<'_>) -> Vec<EnvVar> {
    let mut merged: BTreeMap<String, String> = BTreeMap::new();

    for entry in &ctx.settings.create_options.env {
        match entry.split_once('=') {
            Some((key, value)) if !key.is_empty() => {
                merged.insert(key.to_string(), value.to_string());
            }
            _ => {
                warn!(module = %ctx.name, entry = %entry, "malformed environment entry, skipping");
            }
        }
    }
    for (key, value) in &ctx.module.environment {
        merged.insert(key.clone(), value.clone());
    }
    for (key, value) in ctx.config.injected_env(ctx.name, ctx.identity) {
        merged.insert(key, value);
    }

    merged
        .into_iter()
        .map(|(name, value)| EnvVar {
            name,
            value: Some(value),
            ..Default::default()
        })
        .collect()
}

/// Translate docker binds and mounts into volumes, and append the fixed
/// infrastructure volumes.
///
/// Returns the pod volumes and the module container's mounts. Volumes are
/// keyed by sanitized name so two binds of the same host path share one
/// volume.
fn build_volumes(ctx: &ModuleContext<'_>) -> (Vec<Volume>, Vec<VolumeMount>) {
    let mut volumes: BTreeMap<String, Volume> = BTreeMap::new();
    let mut mounts: Vec<VolumeMount> = Vec::new();

    volumes.insert(
        SOCKET_VOLUME.to_string(),
        Volume {
            name: SOCKET_VOLUME.to_string(),
            host_path: Some(HostPathVolumeSource {
                path: ctx.config.workload_socket_host_path.clone(),
                type_: Some("DirectoryOrCreate".to_string()),
            }),
            ..Default::default()
        },
    );
    volumes.insert(
        PROXY_CONFIG_VOLUME.to_string(),
        Volume {
            name: PROXY_CONFIG_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: ctx.config.proxy.config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
    );
    volumes.insert(
        TRUST_BUNDLE_VOLUME.to_string(),
        Volume {
            name: TRUST_BUNDLE_VOLUME.to_string(),
            config_map: Some(ConfigMapVolumeSource {
                name: ctx.config.proxy.trust_bundle_config_map.clone(),
                ..Default::default()
            }),
            ..Default::default()
        },
    );

    let Some(host_config) = ctx
        .settings
        .create_options
        .host_config
        .as_ref()
    else {
        return (volumes.into_values().collect(), mounts);
    };

    for bind in &host_config.binds {
        let parts: Vec<&str> = bind.split(':').collect();
        if !(2..=3).contains(&parts.len()) || parts[0].is_empty() || parts[1].is_empty() {
            warn!(module = %ctx.name, bind = %bind, "malformed bind, skipping");
            continue;
        }
        let host_path = parts[0];
        let container_path = parts[1];
        let read_only = parts
            .get(2)
            .is_some_and(|mode| mode.split(',').any(|flag| flag == "ro"));

        let Some(volume_name) = host_path_volume(&mut volumes, ctx, host_path) else {
            continue;
        };
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: container_path.to_string(),
            read_only: read_only.then_some(true),
            ..Default::default()
        });
    }

    for mount in &host_config.mounts {
        let volume_name = match mount.mount_type.to_ascii_lowercase().as_str() {
            "bind" => host_path_volume(&mut volumes, ctx, &mount.source),
            "volume" => ephemeral_volume(&mut volumes, ctx, &mount.source),
            other => {
                warn!(
                    module = %ctx.name,
                    mount_type = %other,
                    source = %mount.source,
                    "unsupported mount type, skipping"
                );
                None
            }
        };
        let Some(volume_name) = volume_name else {
            continue;
        };
        mounts.push(VolumeMount {
            name: volume_name,
            mount_path: mount.target.clone(),
            read_only: mount.read_only.then_some(true),
            ..Default::default()
        });
    }

    (volumes.into_values().collect(), mounts)
}

fn host_path_volume(
    volumes: &mut BTreeMap<String, Volume>,
    ctx: &ModuleContext<'_>,
    host_path: &str,
) -> Option<String> {
    let name = crate::names::sanitize_dns_label(host_path);
    if name.is_empty() {
        warn!(module = %ctx.name, path = %host_path, "host path sanitizes to nothing, skipping");
        return None;
    }
    volumes.entry(name.clone()).or_insert_with(|| Volume {
        name: name.clone(),
        host_path: Some(HostPathVolumeSource {
            path: host_path.to_string(),
            type_: Some("DirectoryOrCreate".to_string()),
        }),
        ..Default::default()
    });
    Some(name)
}

fn ephemeral_volume(
    volumes: &mut BTreeMap<String, Volume>,
    ctx: &ModuleContext<'_>,
    source: &str,
) -> Option<String> {
    let name = crate::names::sanitize_dns_label(source);
    if name.is_empty() {
        warn!(module = %ctx.name, source = %source, "volume name sanitizes to nothing, skipping");
        return None;
    }
    volumes.entry(name.clone()).or_insert_with(|| Volume {
        name: name.clone(),
        empty_dir: Some(EmptyDirVolumeSource::default()),
        ..Default::default()
    });
    Some(name)
}
