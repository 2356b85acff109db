//! Resolution of Secret and ConfigMap references into bytes
//!
//! The resolver is read-only and fails closed: a missing object or a missing
//! key is always an error, never empty content. Secret values are recorded in
//! the caller's [`Redactor`] as they are read.

use std::collections::BTreeMap;
use std::fmt;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{ConfigMap, Secret};
use kube::api::Api;
use kube::Client;
use tracing::debug;

#[cfg(test)]
use mockall::automock;

use trellis_common::crd::{NodeConfigSpec, ObjectRef};
use trellis_common::redact::Redactor;
use trellis_common::Error;

use crate::compiler::{file_source, FileSourceKind};

/// ConfigMap key holding the kubelet image credential provider config
pub const CREDENTIAL_PROVIDER_CONFIG_KEY: &str = "credential-config.yaml";

/// ConfigMap key holding a resolv.conf
pub const RESOLV_CONF_KEY: &str = "resolv.conf";

/// Kind of object a reference points into
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SourceKind {
    /// A Secret; values are sensitive
    Secret,
    /// A ConfigMap; values are not sensitive
    ConfigMap,
}

impl fmt::Display for SourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Secret => write!(f, "secret"),
            Self::ConfigMap => write!(f, "configmap"),
        }
    }
}

/// Reference to one key of a Secret or ConfigMap
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Reference {
    /// Object kind
    pub kind: SourceKind,
    /// Object namespace
    pub namespace: String,
    /// Object name
    pub name: String,
    /// Key within the object's data
    pub key: String,
}

impl Reference {
    /// Reference a key of a Secret
    pub fn secret(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            kind: SourceKind::Secret,
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }

    /// Reference a key of a ConfigMap
    pub fn config_map(
        namespace: impl Into<String>,
        name: impl Into<String>,
        key: impl Into<String>,
    ) -> Self {
        Self {
            kind: SourceKind::ConfigMap,
            namespace: namespace.into(),
            name: name.into(),
            key: key.into(),
        }
    }

    fn object(&self) -> String {
        format!("{} {}/{}", self.kind, self.namespace, self.name)
    }
}

impl fmt::Display for Reference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} key={}", self.object(), self.key)
    }
}

/// Read access to Secret and ConfigMap data
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ReferenceStore: Send + Sync {
    /// All data of an object, or None if the object does not exist
    async fn get_data(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error>;
}

/// [`ReferenceStore`] backed by the Kubernetes API
pub struct KubeReferenceStore {
    client: Client,
}

impl KubeReferenceStore {
    /// Create a store reading through the given client
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ReferenceStore for KubeReferenceStore {
    async fn get_data(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
    ) -> Result<Option<BTreeMap<String, Vec<u8>>>, Error> {
        match kind {
            SourceKind::Secret => {
                let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
                let Some(secret) = api.get_opt(name).await? else {
                    return Ok(None);
                };
                Ok(Some(
                    secret
                        .data
                        .unwrap_or_default()
                        .into_iter()
                        .map(|(k, v)| (k, v.0))
                        .collect(),
                ))
            }
            SourceKind::ConfigMap => {
                let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
                let Some(cm) = api.get_opt(name).await? else {
                    return Ok(None);
                };
                let mut data: BTreeMap<String, Vec<u8>> = cm
                    .data
                    .unwrap_or_default()
                    .into_iter()
                    .map(|(k, v)| (k, v.into_bytes()))
                    .collect();
                for (k, v) in cm.binary_data.unwrap_or_default() {
                    data.entry(k).or_insert(v.0);
                }
                Ok(Some(data))
            }
        }
    }
}

/// Fail-closed resolver over a [`ReferenceStore`]
pub struct Resolver<'a> {
    store: &'a dyn ReferenceStore,
}

impl<'a> Resolver<'a> {
    /// Create a resolver reading from `store`
    pub fn new(store: &'a dyn ReferenceStore) -> Self {
        Self { store }
    }

    /// Resolve one key to bytes
    pub async fn resolve(
        &self,
        reference: &Reference,
        redactor: &mut Redactor,
    ) -> Result<Vec<u8>, Error> {
        let mut data = self
            .resolve_object(reference.kind, &reference.namespace, &reference.name, redactor)
            .await?;
        data.remove(&reference.key).ok_or_else(|| {
            Error::resolution(
                reference.to_string(),
                format!("key '{}' not found", reference.key),
            )
        })
    }

    /// Resolve every key of an object
    pub async fn resolve_object(
        &self,
        kind: SourceKind,
        namespace: &str,
        name: &str,
        redactor: &mut Redactor,
    ) -> Result<BTreeMap<String, Vec<u8>>, Error> {
        let data = self
            .store
            .get_data(kind, namespace, name)
            .await?
            .ok_or_else(|| {
                Error::resolution(format!("{} {}/{}", kind, namespace, name), "object not found")
            })?;

        if kind == SourceKind::Secret {
            for value in data.values() {
                redactor.add_bytes(value);
            }
        }
        debug!(%kind, namespace = %namespace, name = %name, keys = data.len(), "resolved reference");
        Ok(data)
    }
}

/// Everything a NodeConfig references, resolved to bytes
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ResolvedInputs {
    /// Content of each `spec.files` entry, same order as the spec
    pub files: Vec<Vec<u8>>,
    /// Auth secret data per registry host, as written in the spec
    pub registry_auth: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// TLS secret data per registry host, as written in the spec
    pub registry_tls: BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    /// Image credential provider configuration
    pub credential_provider_config: Option<Vec<u8>>,
    /// resolv.conf content
    pub resolv_conf: Option<Vec<u8>>,
}

/// Resolve every reference in a NodeConfig spec
///
/// References without an explicit namespace resolve in `namespace`.
/// Fails on the first missing object or key.
pub async fn resolve_node_config(
    resource: &str,
    namespace: &str,
    spec: &NodeConfigSpec,
    resolver: &Resolver<'_>,
    redactor: &mut Redactor,
) -> Result<ResolvedInputs, Error> {
    let mut resolved = ResolvedInputs::default();

    for (index, file) in spec.files.iter().enumerate() {
        let content = match file_source(resource, index, file)? {
            FileSourceKind::Inline(content) => content.as_bytes().to_vec(),
            FileSourceKind::Secret(source) => {
                let reference = Reference::secret(namespace, &source.name, &source.key);
                resolver.resolve(&reference, redactor).await?
            }
        };
        resolved.files.push(content);
    }

    let registries = &spec.private_registries_config;
    for (host, config) in &registries.configs {
        if let Some(auth) = &config.auth_secret {
            let data = resolve_ref_object(SourceKind::Secret, auth, namespace, resolver, redactor)
                .await?;
            resolved.registry_auth.insert(host.clone(), data);
        }
        if let Some(secret) = config.tls.as_ref().and_then(|t| t.tls_config_secret.as_ref()) {
            let data =
                resolve_ref_object(SourceKind::Secret, secret, namespace, resolver, redactor)
                    .await?;
            resolved.registry_tls.insert(host.clone(), data);
        }
    }

    let agent = &spec.agent_config;
    if let Some(cm) = &agent.image_credential_provider_config_map {
        let reference = Reference::config_map(
            cm.namespace_or(namespace),
            &cm.name,
            CREDENTIAL_PROVIDER_CONFIG_KEY,
        );
        resolved.credential_provider_config = Some(resolver.resolve(&reference, redactor).await?);
    }
    if let Some(cm) = &agent.resolv_conf {
        let reference = Reference::config_map(cm.namespace_or(namespace), &cm.name, RESOLV_CONF_KEY);
        resolved.resolv_conf = Some(resolver.resolve(&reference, redactor).await?);
    }

    Ok(resolved)
}

async fn resolve_ref_object(
    kind: SourceKind,
    reference: &ObjectRef,
    namespace: &str,
    resolver: &Resolver<'_>,
    redactor: &mut Redactor,
) -> Result<BTreeMap<String, Vec<u8>>, Error> {
    resolver
        .resolve_object(kind, reference.namespace_or(namespace), &reference.name, redactor)
        .await
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::crd::{File, FileSource, RegistryConfig, SecretFileSource, TlsConfig};

    fn store_with(
        objects: Vec<(SourceKind, &'static str, &'static str, Vec<(&'static str, &'static str)>)>,
    ) -> MockReferenceStore {
        let mut store = MockReferenceStore::new();
        store.expect_get_data().returning(move |kind, ns, name| {
            Ok(objects
                .iter()
                .find(|(k, n, o, _)| *k == kind && *n == ns && *o == name)
                .map(|(_, _, _, data)| {
                    data.iter()
                        .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
                        .collect()
                }))
        });
        store
    }

    mod resolve {
        use super::*;

        #[tokio::test]
        async fn secret_key_resolves_and_is_recorded_for_redaction() {
            let store = store_with(vec![(
                SourceKind::Secret,
                "default",
                "creds",
                vec![("password", "hunter22")],
            )]);
            let resolver = Resolver::new(&store);
            let mut redactor = Redactor::new();

            let bytes = resolver
                .resolve(&Reference::secret("default", "creds", "password"), &mut redactor)
                .await
                .expect("secret resolves");

            assert_eq!(bytes, b"hunter22");
            assert_eq!(redactor.redact("pw=hunter22"), "pw=[REDACTED]");
        }

        #[tokio::test]
        async fn config_map_values_are_not_redacted() {
            let store = store_with(vec![(
                SourceKind::ConfigMap,
                "default",
                "dns",
                vec![("resolv.conf", "nameserver 10.0.0.2")],
            )]);
            let resolver = Resolver::new(&store);
            let mut redactor = Redactor::new();

            resolver
                .resolve(&Reference::config_map("default", "dns", "resolv.conf"), &mut redactor)
                .await
                .expect("config map resolves");
            assert!(redactor.is_empty());
        }

        #[tokio::test]
        async fn missing_object_fails_closed() {
            let store = store_with(vec![]);
            let resolver = Resolver::new(&store);
            let err = resolver
                .resolve(&Reference::secret("default", "nope", "k"), &mut Redactor::new())
                .await
                .expect_err("missing object");
            assert!(matches!(err, Error::Resolution { .. }));
            assert!(err.to_string().contains("default/nope"));
            assert!(err.is_retryable());
        }

        #[tokio::test]
        async fn missing_key_fails_closed_rather_than_returning_empty() {
            let store = store_with(vec![(
                SourceKind::Secret,
                "default",
                "creds",
                vec![("username", "admin")],
            )]);
            let resolver = Resolver::new(&store);
            let err = resolver
                .resolve(&Reference::secret("default", "creds", "password"), &mut Redactor::new())
                .await
                .expect_err("missing key");
            assert!(err.to_string().contains("key 'password' not found"));
        }

        #[tokio::test]
        async fn store_errors_propagate() {
            let mut store = MockReferenceStore::new();
            store
                .expect_get_data()
                .returning(|_, _, _| Err(Error::internal("api down")));
            let resolver = Resolver::new(&store);
            let err = resolver
                .resolve(&Reference::secret("default", "creds", "k"), &mut Redactor::new())
                .await
                .expect_err("store error");
            assert!(err.to_string().contains("api down"));
        }
    }

    mod node_config {
        use super::*;

        fn spec_with_everything() -> NodeConfigSpec {
            let mut spec = NodeConfigSpec {
                files: vec![
                    File {
                        path: "/etc/motd".to_string(),
                        content: Some("hello".to_string()),
                        ..Default::default()
                    },
                    File {
                        path: "/etc/app/key".to_string(),
                        content_from: Some(FileSource {
                            secret: SecretFileSource {
                                name: "app".to_string(),
                                key: "key".to_string(),
                            },
                        }),
                        ..Default::default()
                    },
                ],
                ..Default::default()
            };
            spec.private_registries_config.configs.insert(
                "registry.example.com".to_string(),
                RegistryConfig {
                    auth_secret: Some(ObjectRef::named("reg-auth")),
                    tls: Some(TlsConfig {
                        tls_config_secret: Some(ObjectRef {
                            namespace: Some("certs".to_string()),
                            ..ObjectRef::named("reg-tls")
                        }),
                        insecure_skip_verify: false,
                    }),
                },
            );
            spec.agent_config.resolv_conf = Some(ObjectRef::named("dns"));
            spec
        }

        #[tokio::test]
        async fn resolves_files_registries_and_agent_refs() {
            let store = store_with(vec![
                (SourceKind::Secret, "default", "app", vec![("key", "app-secret-key")]),
                (
                    SourceKind::Secret,
                    "default",
                    "reg-auth",
                    vec![("username", "robot"), ("password", "robot-pass")],
                ),
                (SourceKind::Secret, "certs", "reg-tls", vec![("ca.crt", "-----CA-----")]),
                (
                    SourceKind::ConfigMap,
                    "default",
                    "dns",
                    vec![("resolv.conf", "nameserver 1.1.1.1")],
                ),
            ]);
            let resolver = Resolver::new(&store);
            let mut redactor = Redactor::new();

            let resolved =
                resolve_node_config("worker-0", "default", &spec_with_everything(), &resolver, &mut redactor)
                    .await
                    .expect("all references resolve");

            assert_eq!(resolved.files, vec![b"hello".to_vec(), b"app-secret-key".to_vec()]);
            assert_eq!(
                resolved.registry_auth["registry.example.com"]["password"],
                b"robot-pass"
            );
            assert!(resolved.registry_tls["registry.example.com"].contains_key("ca.crt"));
            assert_eq!(resolved.resolv_conf.as_deref(), Some(&b"nameserver 1.1.1.1"[..]));
            assert!(resolved.credential_provider_config.is_none());
            assert_eq!(redactor.redact("robot-pass"), "[REDACTED]");
        }

        #[tokio::test]
        async fn file_with_both_sources_is_a_configuration_error() {
            let store = MockReferenceStore::new();
            let resolver = Resolver::new(&store);
            let spec = NodeConfigSpec {
                files: vec![File {
                    path: "/etc/x".to_string(),
                    content: Some("inline".to_string()),
                    content_from: Some(FileSource::default()),
                    ..Default::default()
                }],
                ..Default::default()
            };
            let err = resolve_node_config("worker-0", "default", &spec, &resolver, &mut Redactor::new())
                .await
                .expect_err("both sources");
            assert!(matches!(err, Error::Configuration { .. }));
        }

        #[tokio::test]
        async fn missing_registry_secret_fails_the_whole_resolution() {
            let store = store_with(vec![(
                SourceKind::Secret,
                "default",
                "app",
                vec![("key", "k")],
            )]);
            let resolver = Resolver::new(&store);
            let err = resolve_node_config(
                "worker-0",
                "default",
                &spec_with_everything(),
                &resolver,
                &mut Redactor::new(),
            )
            .await
            .expect_err("reg-auth missing");
            assert!(err.to_string().contains("reg-auth"));
        }
    }
}
