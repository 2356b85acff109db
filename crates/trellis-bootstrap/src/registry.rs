//! Private registry compilation into RKE2's `registries.yaml`
//!
//! Hosts are normalized before anything else happens, so `https://A.io/`
//! and `a.io` are the same registry. Every map in the output is a BTreeMap,
//! which makes the serialized document byte-identical for identical inputs
//! regardless of the order keys were declared in.

use std::collections::BTreeMap;

use serde::Serialize;

use trellis_common::crd::PrivateRegistriesConfig;
use trellis_common::Error;

use crate::cloud_init::WriteFile;

/// Where RKE2 reads registry configuration
pub const REGISTRIES_PATH: &str = "/etc/rancher/rke2/registries.yaml";

/// Directory holding per-registry TLS material
pub const REGISTRY_TLS_DIR: &str = "/etc/rancher/rke2/tls";

const AUTH_KEYS: [&str; 4] = ["username", "password", "auth", "identity-token"];
const CA_KEY: &str = "ca.crt";
const CERT_KEY: &str = "tls.crt";
const KEY_KEY: &str = "tls.key";

/// Mirror entry in `registries.yaml`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct MirrorEntry {
    /// Endpoints, in declared order
    pub endpoint: Vec<String>,
    /// Rewrite rules
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub rewrite: BTreeMap<String, String>,
}

/// Credentials for a registry host
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct AuthEntry {
    /// Username
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    /// Password
    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    /// Pre-encoded `user:password`
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<String>,
    /// Bearer identity token
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity_token: Option<String>,
}

/// TLS settings for a registry host, as file paths on the node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct TlsEntry {
    /// CA bundle path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    /// Client certificate path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    /// Client key path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    /// Skip verification
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub insecure_skip_verify: bool,
}

/// Per-host config entry in `registries.yaml`
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ConfigEntry {
    /// Credentials
    #[serde(skip_serializing_if = "Option::is_none")]
    pub auth: Option<AuthEntry>,
    /// TLS settings
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TlsEntry>,
}

/// The `registries.yaml` document
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RegistryDocument {
    /// Mirrors keyed by normalized host
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub mirrors: BTreeMap<String, MirrorEntry>,
    /// Configs keyed by normalized host
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub configs: BTreeMap<String, ConfigEntry>,
}

/// Compiled registry document plus the TLS files it references
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct CompiledRegistry {
    /// The document
    pub document: RegistryDocument,
    /// TLS files to write, ordered by host then key
    pub files: Vec<WriteFile>,
}

impl CompiledRegistry {
    /// Check if nothing is configured
    pub fn is_empty(&self) -> bool {
        self.document.mirrors.is_empty() && self.document.configs.is_empty()
    }

    /// Serialize the document to YAML
    pub fn to_yaml(&self) -> Result<String, Error> {
        serde_yaml::to_string(&self.document)
            .map_err(|e| Error::serialization_for_kind("registries.yaml", e.to_string()))
    }
}

/// Normalize a registry host key: trim, lowercase, strip scheme and trailing `/`
pub fn normalize_host(host: &str) -> String {
    let trimmed = host.trim();
    let without_scheme = trimmed
        .strip_prefix("https://")
        .or_else(|| trimmed.strip_prefix("http://"))
        .unwrap_or(trimmed);
    without_scheme.trim_end_matches('/').to_lowercase()
}

/// Compile registry configuration with already-resolved auth and TLS secret data.
///
/// `auth` and `tls` are keyed by host exactly as written in `config`.
pub fn compile_registries(
    resource: &str,
    config: &PrivateRegistriesConfig,
    auth: &BTreeMap<String, BTreeMap<String, Vec<u8>>>,
    tls: &BTreeMap<String, BTreeMap<String, Vec<u8>>>,
) -> Result<CompiledRegistry, Error> {
    let mut compiled = CompiledRegistry::default();

    for (raw_host, mirror) in &config.mirrors {
        let host = checked_host(resource, "mirrors", raw_host)?;
        let entry = MirrorEntry {
            endpoint: mirror.endpoint.clone(),
            rewrite: mirror.rewrite.clone(),
        };
        if compiled.document.mirrors.insert(host.clone(), entry).is_some() {
            return Err(duplicate_host(resource, "mirrors", &host));
        }
    }

    let mut tls_files: BTreeMap<String, Vec<WriteFile>> = BTreeMap::new();
    for (raw_host, registry) in &config.configs {
        let host = checked_host(resource, "configs", raw_host)?;
        if compiled.document.configs.contains_key(&host) {
            return Err(duplicate_host(resource, "configs", &host));
        }

        let auth_entry = match (&registry.auth_secret, auth.get(raw_host)) {
            (Some(secret), Some(data)) => Some(auth_entry(resource, &host, &secret.name, data)?),
            (Some(secret), None) => {
                return Err(Error::resolution(
                    format!("secret {}", secret.name),
                    format!("auth for registry {} was not resolved", host),
                ))
            }
            (None, _) => None,
        };

        let tls_entry = match &registry.tls {
            Some(settings) => {
                let data = match (&settings.tls_config_secret, tls.get(raw_host)) {
                    (Some(_), Some(data)) => Some(data),
                    (Some(secret), None) => {
                        return Err(Error::resolution(
                            format!("secret {}", secret.name),
                            format!("TLS material for registry {} was not resolved", host),
                        ))
                    }
                    (None, _) => None,
                };
                let (entry, files) = tls_entry(&host, settings.insecure_skip_verify, data);
                tls_files.insert(host.clone(), files);
                Some(entry)
            }
            None => None,
        };

        compiled.document.configs.insert(
            host,
            ConfigEntry {
                auth: auth_entry,
                tls: tls_entry,
            },
        );
    }

    compiled.files = tls_files.into_values().flatten().collect();
    Ok(compiled)
}

/// Whether `host` is `hostname[:port]` or `[ipv6][:port]`
///
/// Hosts name directories under the TLS file root, so separators, empty
/// labels and `..` are rejected outright.
pub fn is_registry_host(host: &str) -> bool {
    let (name, port) = match host.strip_prefix('[') {
        Some(rest) => match rest.split_once(']') {
            Some((addr, tail)) => {
                if addr.is_empty() || !addr.chars().all(|c| c.is_ascii_hexdigit() || c == ':') {
                    return false;
                }
                if tail.is_empty() {
                    return true;
                }
                match tail.strip_prefix(':') {
                    Some(port) => (None, Some(port)),
                    None => return false,
                }
            }
            None => return false,
        },
        None => match host.rsplit_once(':') {
            Some((name, port)) => (Some(name), Some(port)),
            None => (Some(host), None),
        },
    };
    let name_ok = name.map_or(true, |name| {
        !name.is_empty()
            && name.split('.').all(|label| {
                !label.is_empty()
                    && !label.starts_with('-')
                    && label
                        .chars()
                        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            })
    });
    let port_ok = port.map_or(true, |port| {
        !port.is_empty() && port.chars().all(|c| c.is_ascii_digit()) && port.parse::<u16>().is_ok()
    });
    name_ok && port_ok
}

fn checked_host(resource: &str, section: &str, raw: &str) -> Result<String, Error> {
    let host = normalize_host(raw);
    // `*` is the default mirror; configs name real hosts with TLS directories
    let wildcard = section == "mirrors" && host == "*";
    if !wildcard && !is_registry_host(&host) {
        return Err(Error::configuration_for_field(
            resource,
            format!("spec.privateRegistriesConfig.{}", section),
            format!("invalid registry host '{}'", raw),
        ));
    }
    Ok(host)
}

fn duplicate_host(resource: &str, section: &str, host: &str) -> Error {
    Error::configuration_for_field(
        resource,
        format!("spec.privateRegistriesConfig.{}", section),
        format!("registry host {} is declared more than once", host),
    )
}

fn auth_entry(
    resource: &str,
    host: &str,
    secret: &str,
    data: &BTreeMap<String, Vec<u8>>,
) -> Result<AuthEntry, Error> {
    let text = |key: &str| -> Result<Option<String>, Error> {
        data.get(key)
            .map(|v| {
                String::from_utf8(v.clone()).map_err(|_| {
                    Error::configuration_for(
                        resource,
                        format!("secret {} key {} is not valid UTF-8", secret, key),
                    )
                })
            })
            .transpose()
    };

    let entry = AuthEntry {
        username: text(AUTH_KEYS[0])?,
        password: text(AUTH_KEYS[1])?,
        auth: text(AUTH_KEYS[2])?,
        identity_token: text(AUTH_KEYS[3])?,
    };
    if entry == AuthEntry::default() {
        return Err(Error::configuration_for(
            resource,
            format!(
                "auth secret {} for registry {} has none of {}",
                secret,
                host,
                AUTH_KEYS.join(", ")
            ),
        ));
    }
    Ok(entry)
}

fn tls_entry(
    host: &str,
    insecure_skip_verify: bool,
    data: Option<&BTreeMap<String, Vec<u8>>>,
) -> (TlsEntry, Vec<WriteFile>) {
    let mut entry = TlsEntry {
        insecure_skip_verify,
        ..Default::default()
    };
    let mut files = Vec::new();
    let dir = format!("{}/{}", REGISTRY_TLS_DIR, host.replace(':', "_"));

    if let Some(data) = data {
        for (key, slot) in [
            (CA_KEY, &mut entry.ca_file),
            (CERT_KEY, &mut entry.cert_file),
            (KEY_KEY, &mut entry.key_file),
        ] {
            if let Some(bytes) = data.get(key) {
                let path = format!("{}/{}", dir, key);
                let mut file = WriteFile::from_bytes(&path, bytes);
                file.permissions = Some("0600".to_string());
                files.push(file);
                *slot = Some(path);
            }
        }
    }
    (entry, files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use trellis_common::crd::{Mirror, ObjectRef, RegistryConfig, TlsConfig};

    fn mirror(endpoints: &[&str]) -> Mirror {
        Mirror {
            endpoint: endpoints.iter().map(|e| e.to_string()).collect(),
            rewrite: BTreeMap::new(),
        }
    }

    fn secret_data(pairs: &[(&str, &str)]) -> BTreeMap<String, Vec<u8>> {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.as_bytes().to_vec()))
            .collect()
    }

    mod normalization {
        use super::*;

        #[test]
        fn scheme_case_and_trailing_slash_are_stripped() {
            assert_eq!(normalize_host("https://Registry.Example.com/"), "registry.example.com");
            assert_eq!(normalize_host("http://a.io"), "a.io");
            assert_eq!(normalize_host("  b.io:5000 "), "b.io:5000");
        }

        #[test]
        fn equivalent_hosts_in_configs_collide() {
            let mut config = PrivateRegistriesConfig::default();
            config.configs.insert("A.io".to_string(), RegistryConfig::default());
            config.configs.insert("https://a.io/".to_string(), RegistryConfig::default());

            let err = compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new())
                .expect_err("two sources for one host");
            assert!(matches!(err, Error::Configuration { .. }));
            assert!(err.to_string().contains("a.io"));
        }

        #[test]
        fn equivalent_hosts_in_mirrors_collide() {
            let mut config = PrivateRegistriesConfig::default();
            config.mirrors.insert("docker.io".to_string(), mirror(&["https://m1"]));
            config.mirrors.insert("DOCKER.IO".to_string(), mirror(&["https://m2"]));
            assert!(compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new()).is_err());
        }

        #[test]
        fn empty_host_is_rejected() {
            let mut config = PrivateRegistriesConfig::default();
            config.mirrors.insert("https://".to_string(), mirror(&[]));
            assert!(compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new()).is_err());
        }

        #[rstest::rstest]
        #[case::plain("registry.example.com")]
        #[case::port("registry.example.com:5000")]
        #[case::single_label("localhost")]
        #[case::ipv4("10.0.0.5:5000")]
        #[case::ipv6("[fd00::1]:5000")]
        #[case::underscore("my_registry.local")]
        fn well_formed_hosts_are_accepted(#[case] host: &str) {
            assert!(is_registry_host(host), "{}", host);
        }

        #[rstest::rstest]
        #[case::traversal("a.io/../../../../root/.ssh")]
        #[case::dot_dot("..")]
        #[case::empty_label("a..io")]
        #[case::path("a.io/library")]
        #[case::backslash("a.io\\x")]
        #[case::whitespace("a io")]
        #[case::bad_port("a.io:http")]
        #[case::port_overflow("a.io:70000")]
        #[case::empty_port("a.io:")]
        #[case::unclosed_ipv6("[fd00::1")]
        fn malformed_hosts_are_rejected(#[case] host: &str) {
            assert!(!is_registry_host(host), "{}", host);
        }

        /// A config host that tries to climb out of the TLS directory is a
        /// configuration error, and no file is emitted for it.
        #[test]
        fn tls_host_cannot_escape_the_tls_directory() {
            let mut config = PrivateRegistriesConfig::default();
            config.configs.insert(
                "a.io/../../../../root/.ssh".to_string(),
                RegistryConfig {
                    tls: Some(TlsConfig {
                        tls_config_secret: Some(ObjectRef::named("tls")),
                        insecure_skip_verify: false,
                    }),
                    ..Default::default()
                },
            );
            let tls = BTreeMap::from([(
                "a.io/../../../../root/.ssh".to_string(),
                secret_data(&[("ca.crt", "CA")]),
            )]);

            let err = compile_registries("nc", &config, &BTreeMap::new(), &tls)
                .expect_err("path separators are not a host");
            assert!(matches!(err, Error::Configuration { .. }));
            assert!(err.to_string().contains("invalid registry host"));
        }

        #[test]
        fn wildcard_mirror_is_allowed() {
            let mut config = PrivateRegistriesConfig::default();
            config.mirrors.insert("*".to_string(), mirror(&["https://m1"]));
            let compiled = compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new())
                .expect("default mirror");
            assert!(compiled.document.mirrors.contains_key("*"));
        }
    }

    mod ordering {
        use super::*;

        #[test]
        fn hosts_are_emitted_in_lexicographic_order() {
            let mut config = PrivateRegistriesConfig::default();
            config.mirrors.insert("https://B.io".to_string(), mirror(&["https://mirror-b"]));
            config.mirrors.insert("a.io".to_string(), mirror(&["https://mirror-a"]));

            let yaml = compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new())
                .and_then(|c| c.to_yaml())
                .expect("compiles");
            let a = yaml.find("a.io:").expect("a.io present");
            let b = yaml.find("b.io:").expect("b.io present");
            assert!(a < b);
        }

        #[test]
        fn endpoints_keep_declared_order() {
            let mut config = PrivateRegistriesConfig::default();
            config
                .mirrors
                .insert("docker.io".to_string(), mirror(&["https://z", "https://a"]));
            let compiled =
                compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new()).expect("ok");
            assert_eq!(
                compiled.document.mirrors["docker.io"].endpoint,
                vec!["https://z", "https://a"]
            );
        }
    }

    mod auth_and_tls {
        use super::*;

        fn config_with_auth_and_tls() -> PrivateRegistriesConfig {
            let mut config = PrivateRegistriesConfig::default();
            config.configs.insert(
                "Registry.example.com:5000".to_string(),
                RegistryConfig {
                    auth_secret: Some(ObjectRef::named("reg-auth")),
                    tls: Some(TlsConfig {
                        tls_config_secret: Some(ObjectRef::named("reg-tls")),
                        insecure_skip_verify: true,
                    }),
                },
            );
            config
        }

        #[test]
        fn auth_and_tls_material_are_embedded() {
            let host = "Registry.example.com:5000".to_string();
            let auth = BTreeMap::from([(
                host.clone(),
                secret_data(&[("username", "robot"), ("password", "pw-123")]),
            )]);
            let tls = BTreeMap::from([(
                host,
                secret_data(&[("ca.crt", "CA"), ("tls.crt", "CERT"), ("tls.key", "KEY")]),
            )]);

            let compiled =
                compile_registries("nc", &config_with_auth_and_tls(), &auth, &tls).expect("ok");
            let entry = &compiled.document.configs["registry.example.com:5000"];
            let auth = entry.auth.as_ref().expect("auth");
            assert_eq!(auth.username.as_deref(), Some("robot"));
            assert_eq!(auth.password.as_deref(), Some("pw-123"));
            let tls = entry.tls.as_ref().expect("tls");
            assert_eq!(
                tls.ca_file.as_deref(),
                Some("/etc/rancher/rke2/tls/registry.example.com_5000/ca.crt")
            );
            assert!(tls.insecure_skip_verify);

            let paths: Vec<&str> = compiled.files.iter().map(|f| f.path.as_str()).collect();
            assert_eq!(paths.len(), 3);
            assert!(compiled.files.iter().all(|f| f.permissions.as_deref() == Some("0600")));

            let yaml = compiled.to_yaml().expect("serializes");
            assert!(yaml.contains("insecure_skip_verify: true"));
            assert!(yaml.contains("ca_file:"));
        }

        #[test]
        fn auth_secret_without_known_keys_is_a_configuration_error() {
            let mut config = config_with_auth_and_tls();
            if let Some(c) = config.configs.values_mut().next() {
                c.tls = None;
            }
            let auth = BTreeMap::from([(
                "Registry.example.com:5000".to_string(),
                secret_data(&[("token", "x")]),
            )]);
            let err = compile_registries("nc", &config, &auth, &BTreeMap::new())
                .expect_err("no usable keys");
            assert!(matches!(err, Error::Configuration { .. }));
        }

        #[test]
        fn unresolved_auth_fails_closed() {
            let err = compile_registries(
                "nc",
                &config_with_auth_and_tls(),
                &BTreeMap::new(),
                &BTreeMap::new(),
            )
            .expect_err("auth not resolved");
            assert!(matches!(err, Error::Resolution { .. }));
        }

        #[test]
        fn tls_without_secret_only_sets_verification_flag() {
            let mut config = PrivateRegistriesConfig::default();
            config.configs.insert(
                "r.io".to_string(),
                RegistryConfig {
                    auth_secret: None,
                    tls: Some(TlsConfig {
                        tls_config_secret: None,
                        insecure_skip_verify: true,
                    }),
                },
            );
            let compiled =
                compile_registries("nc", &config, &BTreeMap::new(), &BTreeMap::new()).expect("ok");
            assert!(compiled.files.is_empty());
            assert_eq!(
                compiled.document.configs["r.io"].tls,
                Some(TlsEntry {
                    insecure_skip_verify: true,
                    ..Default::default()
                })
            );
        }
    }

    #[test]
    fn empty_config_compiles_to_empty_registry() {
        let compiled = compile_registries(
            "nc",
            &PrivateRegistriesConfig::default(),
            &BTreeMap::new(),
            &BTreeMap::new(),
        )
        .expect("ok");
        assert!(compiled.is_empty());
        assert!(compiled.files.is_empty());
    }
}
