//! Kubernetes REST adapter. Runs in-cluster with the pod's service account;
//! the pod's role needs get/patch on the shared service and ingress, and
//! create/delete on services and secrets.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use reqwest::header::CONTENT_TYPE;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde_json::{json, Value};
use std::fs;

use super::{
    AuthSecret, DedicatedService, IngressRule, Platform, PlatformError, ServicePort, Versioned,
};

const SERVICE_ACCOUNT_DIR: &str = "/var/run/secrets/kubernetes.io/serviceaccount";
const INGRESS_API: &str = "apis/voyager.appscode.com/v1beta1";
const MERGE_PATCH: &str = "application/merge-patch+json";

pub struct KubePlatform {
    client: Client,
    api_base: String,
    token: String,
    namespace: String,
    shared_service: String,
    ingress: String,
}

impl KubePlatform {
    pub fn in_cluster(
        namespace: Option<String>,
        shared_service: impl Into<String>,
        ingress: impl Into<String>,
    ) -> Result<Self, PlatformError> {
        let host = std::env::var("KUBERNETES_SERVICE_HOST")
            .map_err(|_| PlatformError::Api("KUBERNETES_SERVICE_HOST not set".to_string()))?;
        let port = std::env::var("KUBERNETES_SERVICE_PORT").unwrap_or_else(|_| "443".to_string());

        let token = fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/token"))?
            .trim()
            .to_string();
        let ca = fs::read(format!("{SERVICE_ACCOUNT_DIR}/ca.crt"))?;
        let namespace = match namespace {
            Some(ns) => ns,
            None => fs::read_to_string(format!("{SERVICE_ACCOUNT_DIR}/namespace"))?
                .trim()
                .to_string(),
        };

        let client = Client::builder()
            .add_root_certificate(reqwest::Certificate::from_pem(&ca)?)
            .build()?;

        Ok(Self {
            client,
            api_base: format!("https://{host}:{port}"),
            token,
            namespace,
            shared_service: shared_service.into(),
            ingress: ingress.into(),
        })
    }

    fn core_url(&self, kind: &str, name: Option<&str>) -> String {
        let base = format!("{}/api/v1/namespaces/{}/{}", self.api_base, self.namespace, kind);
        match name {
            Some(name) => format!("{base}/{name}"),
            None => base,
        }
    }

    fn ingress_url(&self) -> String {
        format!(
            "{}/{}/namespaces/{}/ingresses/{}",
            self.api_base, INGRESS_API, self.namespace, self.ingress
        )
    }

    async fn send(&self, req: RequestBuilder, what: &str) -> Result<Response, PlatformError> {
        let resp = req.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if status.is_success() {
            return Ok(resp);
        }
        let body = resp.text().await.unwrap_or_default();
        Err(match status {
            StatusCode::NOT_FOUND => PlatformError::NotFound(what.to_string()),
            StatusCode::CONFLICT if body.contains("AlreadyExists") => {
                PlatformError::AlreadyExists(what.to_string())
            }
            StatusCode::CONFLICT => PlatformError::Conflict(what.to_string()),
            _ => PlatformError::Api(format!("{what}: {status}: {body}")),
        })
    }

    async fn get_object(&self, url: String, what: &str) -> Result<Value, PlatformError> {
        let resp = self.send(self.client.get(url), what).await?;
        Ok(resp.json::<Value>().await?)
    }

    /// Merge-patch carrying the observed resourceVersion; the API server
    /// answers 409 if the object changed since it was read.
    async fn patch_object(&self, url: String, what: &str, body: Value) -> Result<(), PlatformError> {
        let req = self
            .client
            .patch(url)
            .header(CONTENT_TYPE, MERGE_PATCH)
            .body(serde_json::to_vec(&body)?);
        self.send(req, what).await?;
        Ok(())
    }

    async fn delete_object(&self, url: String, what: &str) -> Result<(), PlatformError> {
        self.send(self.client.delete(url), what).await?;
        Ok(())
    }
}

fn resource_version(obj: &Value) -> String {
    obj.pointer("/metadata/resourceVersion")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn list_at<T: serde::de::DeserializeOwned>(obj: &Value, pointer: &str) -> Result<Vec<T>, PlatformError> {
    match obj.pointer(pointer) {
        Some(Value::Null) | None => Ok(Vec::new()),
        Some(list) => Ok(serde_json::from_value(list.clone())?),
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn service_ports(&self) -> Result<Versioned<Vec<ServicePort>>, PlatformError> {
        let what = format!("service/{}", self.shared_service);
        let obj = self
            .get_object(self.core_url("services", Some(&self.shared_service)), &what)
            .await?;
        Ok(Versioned {
            version: resource_version(&obj),
            value: list_at(&obj, "/spec/ports")?,
        })
    }

    async fn replace_service_ports(
        &self,
        version: &str,
        ports: Vec<ServicePort>,
    ) -> Result<(), PlatformError> {
        let what = format!("service/{}", self.shared_service);
        let body = json!({
            "metadata": { "resourceVersion": version },
            "spec": { "ports": ports },
        });
        self.patch_object(self.core_url("services", Some(&self.shared_service)), &what, body)
            .await
    }

    async fn ingress_rules(&self) -> Result<Versioned<Vec<IngressRule>>, PlatformError> {
        let what = format!("ingress/{}", self.ingress);
        let obj = self.get_object(self.ingress_url(), &what).await?;
        Ok(Versioned {
            version: resource_version(&obj),
            value: list_at(&obj, "/spec/rules")?,
        })
    }

    async fn replace_ingress_rules(
        &self,
        version: &str,
        rules: Vec<IngressRule>,
    ) -> Result<(), PlatformError> {
        let what = format!("ingress/{}", self.ingress);
        let body = json!({
            "metadata": { "resourceVersion": version },
            "spec": { "rules": rules },
        });
        self.patch_object(self.ingress_url(), &what, body).await
    }

    async fn create_secret(&self, secret: &AuthSecret) -> Result<(), PlatformError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": secret.name },
            "type": "Opaque",
            "data": { "auth": STANDARD.encode(secret.auth.as_bytes()) },
        });
        let req = self.client.post(self.core_url("secrets", None)).json(&body);
        self.send(req, &format!("secret/{}", secret.name)).await?;
        Ok(())
    }

    async fn delete_secret(&self, name: &str) -> Result<(), PlatformError> {
        self.delete_object(self.core_url("secrets", Some(name)), &format!("secret/{name}"))
            .await
    }

    async fn create_service(&self, service: &DedicatedService) -> Result<(), PlatformError> {
        let body = json!({
            "apiVersion": "v1",
            "kind": "Service",
            "metadata": {
                "name": service.name,
                "annotations": service.annotations,
            },
            "spec": {
                "selector": service.selector,
                "ports": service.ports,
            },
        });
        let req = self.client.post(self.core_url("services", None)).json(&body);
        self.send(req, &format!("service/{}", service.name)).await?;
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), PlatformError> {
        self.delete_object(self.core_url("services", Some(name)), &format!("service/{name}"))
            .await
    }
}
