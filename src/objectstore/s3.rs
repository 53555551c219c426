use std::sync::Arc;

use async_trait::async_trait;
use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use k8s_openapi::api::core::v1::Secret;
use kube::{Api, Client};
use tracing::debug;

use super::{ObjectStore, ObjectStoreProvider, parse_destination};
use crate::controller::error::{Error, Result};
use crate::crd::{ObjectStoreConfiguration, SecretKeySelector};

const DEFAULT_REGION: &str = "us-east-1";

/// S3 bucket scoped to one destination prefix
pub struct S3ObjectStore {
    client: aws_sdk_s3::Client,
    bucket: String,
}

#[async_trait]
impl ObjectStore for S3ObjectStore {
    async fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let mut keys = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let output = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| Error::ObjectStoreError(format!("list {}: {}", prefix, e)))?;

            keys.extend(
                output
                    .contents()
                    .iter()
                    .filter_map(|o| o.key().map(str::to_string)),
            );

            match output.next_continuation_token() {
                Some(token) if output.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        debug!(bucket = %self.bucket, prefix, count = keys.len(), "listed objects");
        keys.sort();
        Ok(keys)
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(e) if e.as_service_error().is_some_and(|s| s.is_no_such_key()) => return Ok(None),
            Err(e) => return Err(Error::ObjectStoreError(format!("get {}: {}", key, e))),
        };

        let bytes = output
            .body
            .collect()
            .await
            .map_err(|e| Error::ObjectStoreError(format!("read {}: {}", key, e)))?;
        Ok(Some(bytes.into_bytes().to_vec()))
    }
}

/// Builds S3 clients from the credentials secret named in the cluster spec
#[derive(Clone)]
pub struct S3ObjectStoreProvider {
    client: Client,
}

impl S3ObjectStoreProvider {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn secret_value(&self, namespace: &str, selector: &SecretKeySelector) -> Result<String> {
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = secrets
            .get_opt(&selector.name)
            .await?
            .ok_or_else(|| Error::NotFound(format!("secret {}/{}", namespace, selector.name)))?;
        let value = secret
            .data
            .as_ref()
            .and_then(|d| d.get(&selector.key))
            .ok_or_else(|| {
                Error::InvalidConfig(format!(
                    "secret {} has no key '{}'",
                    selector.name, selector.key
                ))
            })?;
        String::from_utf8(value.0.clone()).map_err(|_| {
            Error::InvalidConfig(format!(
                "secret {} key '{}' is not UTF-8",
                selector.name, selector.key
            ))
        })
    }
}

#[async_trait]
impl ObjectStoreProvider for S3ObjectStoreProvider {
    async fn open(
        &self,
        namespace: &str,
        config: &ObjectStoreConfiguration,
    ) -> Result<Arc<dyn ObjectStore>> {
        let (bucket, _) = parse_destination(&config.destination_path)?;
        let access_key = self
            .secret_value(namespace, &config.s3_credentials.access_key_id)
            .await?;
        let secret_key = self
            .secret_value(namespace, &config.s3_credentials.secret_access_key)
            .await?;

        let credentials = Credentials::new(access_key, secret_key, None, None, "pgha-operator");
        let region = config.region.clone().unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new(region))
            .credentials_provider(credentials);
        if let Some(endpoint) = &config.endpoint_url {
            // MinIO and most S3-compatible stores need path-style addressing
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Ok(Arc::new(S3ObjectStore {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket,
        }))
    }
}
