//! Certificate authority and leaf credentials for relay communication
//!
//! Credentials are provisioned create-if-absent: an existing CA is always
//! reused as-is, so that clients which already trust it keep working across
//! disable/enable cycles. Creation is a compare-and-create against the API
//! server; when another actor wins the race, the now-existing secret is read
//! back instead of failing.

use crate::{
    gateway::{Gateway, GatewayError},
    manifests,
};
use k8s_openapi::{
    api::core::v1::Secret, apimachinery::pkg::apis::meta::v1::ObjectMeta, ByteString,
};
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose,
};
use std::collections::BTreeMap;

const CA_CERT_KEY: &str = "ca.crt";
const CA_KEY_KEY: &str = "ca.key";
const VALIDITY_DAYS: i64 = 3 * 365;

/// A CA loaded from (or just written to) the cluster.
#[derive(Clone)]
pub struct CaHandle {
    cert_pem: String,
    key_pem: String,
    created: bool,
}

/// Describes a leaf certificate secret signed by the CA.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct LeafSpec {
    /// The `kubernetes.io/tls` secret holding the certificate.
    pub secret_name: String,

    /// The certificate's common name, also used as its only DNS name.
    pub common_name: String,

    /// Whether the certificate authenticates a client or a server.
    pub usage: ExtendedKeyUsagePurpose,
}

/// Indicates that credentials could not be provisioned
#[derive(Debug, thiserror::Error)]
pub enum CredentialError {
    /// No CA exists and creating one was not permitted
    #[error("CA secret {namespace}/{name} does not exist; use --create-ca to generate one")]
    CaMissing {
        /// The namespace that was searched.
        namespace: String,

        /// The secret that was expected.
        name: &'static str,
    },

    /// The CA secret exists but cannot be used
    #[error("CA secret {namespace}/{name} has no valid {key}")]
    Malformed {
        /// The secret's namespace.
        namespace: String,

        /// The secret's name.
        name: &'static str,

        /// The missing or invalid data key.
        key: &'static str,
    },

    /// Key or certificate generation failed
    #[error("failed to generate credentials: {0}")]
    Generate(#[from] rcgen::Error),

    /// The cluster could not be read or written
    #[error(transparent)]
    Gateway(#[from] GatewayError),
}

/// Returns the namespace's CA, generating it if permitted and absent.
pub async fn ensure_ca(
    gateway: &dyn Gateway,
    ns: &str,
    create_if_missing: bool,
) -> Result<CaHandle, CredentialError> {
    if let Some(secret) = gateway.secret(ns, manifests::CA_SECRET_NAME).await? {
        tracing::debug!(%ns, "Using existing CA");
        return CaHandle::from_secret(ns, &secret);
    }

    if !create_if_missing {
        return Err(CredentialError::CaMissing {
            namespace: ns.to_string(),
            name: manifests::CA_SECRET_NAME,
        });
    }

    let ca = CaHandle::generate()?;
    match gateway.create_secret(ns, ca.to_secret(ns)).await {
        Ok(_) => {
            tracing::info!(%ns, secret = manifests::CA_SECRET_NAME, "Created CA");
            Ok(ca)
        }

        Err(error) if error.is_conflict() => {
            // Another process created the CA since it was read; theirs wins.
            tracing::debug!(%ns, "CA created concurrently");
            match gateway.secret(ns, manifests::CA_SECRET_NAME).await? {
                Some(secret) => CaHandle::from_secret(ns, &secret),
                None => Err(error.into()),
            }
        }

        Err(error) => Err(error.into()),
    }
}

/// Ensures a leaf certificate secret signed by `ca` exists.
///
/// Returns true if the secret was created by this call.
pub async fn ensure_leaf(
    gateway: &dyn Gateway,
    ns: &str,
    ca: &CaHandle,
    leaf: &LeafSpec,
) -> Result<bool, CredentialError> {
    if gateway.secret(ns, &leaf.secret_name).await?.is_some() {
        return Ok(false);
    }

    let (cert_pem, key_pem) = ca.issue(leaf)?;
    let secret = Secret {
        metadata: ObjectMeta {
            name: Some(leaf.secret_name.clone()),
            namespace: Some(ns.to_string()),
            labels: Some(manifests::labels(manifests::RELAY_NAME)),
            ..Default::default()
        },
        type_: Some("kubernetes.io/tls".to_string()),
        data: Some(secret_data([
            ("tls.crt", cert_pem),
            ("tls.key", key_pem),
            (CA_CERT_KEY, ca.cert_pem.clone()),
        ])),
        ..Default::default()
    };

    match gateway.create_secret(ns, secret).await {
        Ok(_) => {
            tracing::info!(%ns, secret = %leaf.secret_name, "Created certificate");
            Ok(true)
        }
        Err(error) if error.is_conflict() => Ok(false),
        Err(error) => Err(error.into()),
    }
}

/// The client certificate the relay presents to collectors.
pub fn relay_client_leaf() -> LeafSpec {
    LeafSpec {
        secret_name: manifests::RELAY_CLIENT_CERTS_NAME.to_string(),
        common_name: "*.hubble-relay.cilium.io".to_string(),
        usage: ExtendedKeyUsagePurpose::ClientAuth,
    }
}

// === impl CaHandle ===

impl CaHandle {
    fn generate() -> Result<Self, CredentialError> {
        let mut params = CertificateParams::default();
        params.distinguished_name = distinguished_name("Cilium CA");
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        (params.not_before, params.not_after) = validity();

        let key = KeyPair::generate()?;
        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
            created: true,
        })
    }

    fn from_secret(ns: &str, secret: &Secret) -> Result<Self, CredentialError> {
        let read = |key: &'static str| {
            secret
                .data
                .as_ref()
                .and_then(|data| data.get(key))
                .and_then(|ByteString(bytes)| String::from_utf8(bytes.clone()).ok())
                .ok_or_else(|| CredentialError::Malformed {
                    namespace: ns.to_string(),
                    name: manifests::CA_SECRET_NAME,
                    key,
                })
        };
        let cert_pem = read(CA_CERT_KEY)?;
        let key_pem = read(CA_KEY_KEY)?;
        if KeyPair::from_pem(&key_pem).is_err() {
            return Err(CredentialError::Malformed {
                namespace: ns.to_string(),
                name: manifests::CA_SECRET_NAME,
                key: CA_KEY_KEY,
            });
        }
        Ok(Self {
            cert_pem,
            key_pem,
            created: false,
        })
    }

    fn to_secret(&self, ns: &str) -> Secret {
        Secret {
            metadata: ObjectMeta {
                name: Some(manifests::CA_SECRET_NAME.to_string()),
                namespace: Some(ns.to_string()),
                labels: Some(manifests::labels(manifests::CA_SECRET_NAME)),
                ..Default::default()
            },
            data: Some(secret_data([
                (CA_CERT_KEY, self.cert_pem.clone()),
                (CA_KEY_KEY, self.key_pem.clone()),
            ])),
            ..Default::default()
        }
    }

    /// The PEM-encoded CA certificate.
    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    /// Returns true if this invocation generated the CA.
    pub fn created(&self) -> bool {
        self.created
    }

    /// Signs a new leaf certificate, returning the certificate and key PEMs.
    fn issue(&self, leaf: &LeafSpec) -> Result<(String, String), CredentialError> {
        let mut params = CertificateParams::new(vec![leaf.common_name.clone()])?;
        params.distinguished_name = distinguished_name(&leaf.common_name);
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![leaf.usage.clone()];
        (params.not_before, params.not_after) = validity();

        let ca_key = KeyPair::from_pem(&self.key_pem)?;
        let issuer = Issuer::from_ca_cert_pem(&self.cert_pem, &ca_key)?;
        let key = KeyPair::generate()?;
        let cert = params.signed_by(&key, &issuer)?;
        Ok((cert.pem(), key.serialize_pem()))
    }
}

impl std::fmt::Debug for CaHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never log key material.
        f.debug_struct("CaHandle")
            .field("created", &self.created)
            .finish_non_exhaustive()
    }
}

fn distinguished_name(common_name: &str) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(common_name.to_string()),
    );
    dn
}

fn validity() -> (time::OffsetDateTime, time::OffsetDateTime) {
    let now = time::OffsetDateTime::now_utc();
    (now, now + time::Duration::days(VALIDITY_DAYS))
}

fn secret_data<const N: usize>(entries: [(&str, String); N]) -> BTreeMap<String, ByteString> {
    entries
        .into_iter()
        .map(|(k, v)| (k.to_string(), ByteString(v.into_bytes())))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::{fake::FakeGateway, ResourceKind};

    const NS: &str = "kube-system";

    #[tokio::test]
    async fn missing_ca_is_not_created_without_permission() {
        let gateway = FakeGateway::new();
        let err = ensure_ca(&gateway, NS, false)
            .await
            .expect_err("CA must not be created");
        assert!(matches!(err, CredentialError::CaMissing { .. }), "{err}");
        assert_eq!(gateway.mutations(), 0);
    }

    #[tokio::test]
    async fn creates_missing_ca_once() {
        let gateway = FakeGateway::new();
        let created = ensure_ca(&gateway, NS, true).await.expect("create CA");
        assert!(created.created());
        assert!(gateway.contains(NS, ResourceKind::Secret, manifests::CA_SECRET_NAME));

        let existing = ensure_ca(&gateway, NS, false).await.expect("reuse CA");
        assert!(!existing.created());
        assert_eq!(existing.cert_pem(), created.cert_pem());
        assert_eq!(gateway.mutations(), 1);
    }

    #[tokio::test]
    async fn concurrent_creation_yields_one_ca() {
        let gateway = FakeGateway::new();
        let (a, b) = tokio::join!(ensure_ca(&gateway, NS, true), ensure_ca(&gateway, NS, true));
        let a = a.expect("first enable");
        let b = b.expect("second enable");
        assert_eq!(a.cert_pem(), b.cert_pem());
        assert_eq!(gateway.count(NS, ResourceKind::Secret), 1);
        // Exactly one of the racers wrote the secret.
        assert!(a.created() ^ b.created());
    }

    #[tokio::test]
    async fn malformed_ca_is_reported() {
        let gateway = FakeGateway::new();
        gateway.insert_secret(
            NS,
            Secret {
                metadata: ObjectMeta {
                    name: Some(manifests::CA_SECRET_NAME.to_string()),
                    ..Default::default()
                },
                ..Default::default()
            },
        );
        let err = ensure_ca(&gateway, NS, true).await.expect_err("malformed");
        assert!(
            matches!(err, CredentialError::Malformed { key: "ca.crt", .. }),
            "{err}"
        );
    }

    #[tokio::test]
    async fn leaf_is_signed_and_stored_once() {
        let gateway = FakeGateway::new();
        let ca = ensure_ca(&gateway, NS, true).await.expect("CA");
        let leaf = relay_client_leaf();

        assert!(ensure_leaf(&gateway, NS, &ca, &leaf).await.expect("leaf"));
        assert!(!ensure_leaf(&gateway, NS, &ca, &leaf).await.expect("leaf"));

        let secret = gateway
            .secret(NS, manifests::RELAY_CLIENT_CERTS_NAME)
            .await
            .expect("get")
            .expect("leaf secret");
        assert_eq!(secret.type_.as_deref(), Some("kubernetes.io/tls"));
        let data = secret.data.expect("data");
        assert_eq!(
            data.get("ca.crt").map(|b| b.0.as_slice()),
            Some(ca.cert_pem().as_bytes())
        );
        assert!(data.contains_key("tls.crt"));
        assert!(data.contains_key("tls.key"));
    }
}
