//! cert-manager Certificate resource generation
//!
//! A cluster binds four certificate roles. User-supplied secrets win; roles
//! left empty are issued by cert-manager when an issuer is configured.
//!
//! Reference: https://cert-manager.io/docs/concepts/certificate/

use std::collections::BTreeMap;

use kube::ResourceExt;
use kube::api::ObjectMeta;
use serde::{Deserialize, Serialize};

use crate::crd::{IssuerRef, PostgresCluster};
use crate::resources::common::owned_metadata;
use crate::resources::common::standard_labels;
use crate::resources::inheritance::InheritedMetadata;
use crate::resources::service::{ServiceKind, service_name};

pub const CERT_MANAGER_GROUP: &str = "cert-manager.io";
pub const CERT_MANAGER_VERSION: &str = "v1";
pub const CERTIFICATE_KIND: &str = "Certificate";

pub const ROLE_SERVER_TLS: &str = "serverTLSSecret";
pub const ROLE_SERVER_CA: &str = "serverCASecret";
pub const ROLE_CLIENT_CA: &str = "clientCASecret";
pub const ROLE_REPLICATION_TLS: &str = "replicationTLSSecret";

/// Replication connections authenticate as this user
pub const STREAMING_REPLICA_USER: &str = "streaming_replica";

/// cert-manager Certificate resource
#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Certificate {
    pub api_version: String,
    pub kind: String,
    pub metadata: ObjectMeta,
    pub spec: CertificateSpec,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertificateSpec {
    /// Name of the Secret to store the certificate
    pub secret_name: String,

    pub issuer_ref: CertIssuerRef,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub common_name: Option<String>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dns_names: Vec<String>,

    /// Certificate validity duration (e.g., "2160h" for 90 days)
    #[serde(skip_serializing_if = "Option::is_none")]
    pub duration: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub renew_before: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub secret_template: Option<SecretTemplate>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub private_key: Option<PrivateKeySpec>,

    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub usages: Vec<String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CertIssuerRef {
    pub name: String,
    pub kind: String,
    pub group: String,
}

impl From<&IssuerRef> for CertIssuerRef {
    fn from(issuer: &IssuerRef) -> Self {
        Self {
            name: issuer.name.clone(),
            kind: issuer.kind.to_string(),
            group: issuer.group.clone(),
        }
    }
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SecretTemplate {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub annotations: BTreeMap<String, String>,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PrivateKeySpec {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub algorithm: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub encoding: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rotation_policy: Option<String>,
}

pub fn server_secret_name(cluster_name: &str) -> String {
    format!("{}-server", cluster_name)
}

pub fn replication_secret_name(cluster_name: &str) -> String {
    format!("{}-replication", cluster_name)
}

/// Map each certificate role to the secret bound to it
///
/// CA roles fall back to the issued secret, which carries `ca.crt`.
pub fn resolve_certificate_secrets(cluster: &PostgresCluster) -> BTreeMap<String, String> {
    let mut bound = BTreeMap::new();
    let Some(certs) = &cluster.spec.certificates else {
        return bound;
    };
    let name = cluster.name_any();
    let issued = certs.issuer_ref.is_some();

    let server = certs
        .server_tls_secret
        .clone()
        .or_else(|| issued.then(|| server_secret_name(&name)));
    let replication = certs
        .replication_tls_secret
        .clone()
        .or_else(|| issued.then(|| replication_secret_name(&name)));
    let server_ca = certs.server_ca_secret.clone().or_else(|| server.clone());
    let client_ca = certs.client_ca_secret.clone().or_else(|| replication.clone());

    for (role, secret) in [
        (ROLE_SERVER_TLS, server),
        (ROLE_SERVER_CA, server_ca),
        (ROLE_CLIENT_CA, client_ca),
        (ROLE_REPLICATION_TLS, replication),
    ] {
        if let Some(secret) = secret {
            bound.insert(role.to_string(), secret);
        }
    }
    bound
}

/// DNS names the server certificate must cover
pub fn server_dns_names(cluster_name: &str, namespace: &str) -> Vec<String> {
    let mut dns_names = Vec::new();
    for kind in ServiceKind::ALL {
        let svc = service_name(cluster_name, kind);
        dns_names.push(svc.clone());
        dns_names.push(format!("{}.{}", svc, namespace));
        dns_names.push(format!("{}.{}.svc", svc, namespace));
        dns_names.push(format!("{}.{}.svc.cluster.local", svc, namespace));
    }
    dns_names
}

/// Generate the cert-manager Certificates the cluster needs
///
/// Empty when no issuer is configured or the user supplied every secret.
pub fn generate_certificates(
    cluster: &PostgresCluster,
    inherited: &InheritedMetadata,
) -> Vec<Certificate> {
    let Some(certs) = &cluster.spec.certificates else {
        return Vec::new();
    };
    let Some(issuer) = &certs.issuer_ref else {
        return Vec::new();
    };
    let name = cluster.name_any();
    let namespace = cluster.namespace().unwrap_or_default();
    let mut out = Vec::new();

    if certs.server_tls_secret.is_none() {
        let secret_name = server_secret_name(&name);
        out.push(build_certificate(
            cluster,
            inherited,
            secret_name,
            issuer,
            Some(service_name(&name, ServiceKind::ReadWrite)),
            server_dns_names(&name, &namespace),
            vec!["server auth".to_string()],
        ));
    }

    if certs.replication_tls_secret.is_none() {
        out.push(build_certificate(
            cluster,
            inherited,
            replication_secret_name(&name),
            issuer,
            Some(STREAMING_REPLICA_USER.to_string()),
            Vec::new(),
            vec!["client auth".to_string()],
        ));
    }

    out
}

fn build_certificate(
    cluster: &PostgresCluster,
    inherited: &InheritedMetadata,
    secret_name: String,
    issuer: &IssuerRef,
    common_name: Option<String>,
    dns_names: Vec<String>,
    extra_usages: Vec<String>,
) -> Certificate {
    let labels = standard_labels(&cluster.name_any());
    let mut usages = vec!["digital signature".to_string(), "key encipherment".to_string()];
    usages.extend(extra_usages);

    Certificate {
        api_version: format!("{}/{}", CERT_MANAGER_GROUP, CERT_MANAGER_VERSION),
        kind: CERTIFICATE_KIND.to_string(),
        metadata: owned_metadata(cluster, secret_name.clone(), labels.clone(), inherited, false),
        spec: CertificateSpec {
            secret_name,
            issuer_ref: issuer.into(),
            common_name,
            dns_names,
            duration: Some("2160h".to_string()),
            renew_before: Some("360h".to_string()),
            secret_template: Some(SecretTemplate {
                labels,
                annotations: BTreeMap::new(),
            }),
            private_key: Some(PrivateKeySpec {
                algorithm: Some("ECDSA".to_string()),
                size: Some(256),
                encoding: Some("PKCS8".to_string()),
                rotation_policy: Some("Always".to_string()),
            }),
            usages,
        },
    }
}
