//! SigV4-signed HTTP client for a vector search collection's data plane.
//!
//! The search service has no typed SDK for index management, so index calls
//! are plain REST requests signed for the `aoss` service.

use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;
use aws_credential_types::provider::{ProvideCredentials, SharedCredentialsProvider};
use aws_sigv4::http_request::{
    PayloadChecksumKind, SignableBody, SignableRequest, SigningSettings, sign,
};
use aws_sigv4::sign::v4;
use aws_smithy_runtime_api::client::identity::Identity;
use reqwest::{Method, StatusCode};
use tracing::{debug, instrument};
use url::Url;

use claimstack_shared::{ClaimStackError, IndexShape, Result, VectorIndexSpec};

use crate::api::{IndexApi, IndexConnector, IndexCreation};

const SERVICE: &str = "opensearch";
const SIGNING_NAME: &str = "aoss";

/// Index client bound to one collection endpoint.
#[derive(Clone)]
pub struct SignedIndexClient {
    http: reqwest::Client,
    endpoint: Url,
    region: String,
    credentials: SharedCredentialsProvider,
}

impl std::fmt::Debug for SignedIndexClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignedIndexClient")
            .field("endpoint", &self.endpoint.as_str())
            .field("region", &self.region)
            .finish()
    }
}

impl SignedIndexClient {
    pub fn new(
        endpoint: &str,
        region: impl Into<String>,
        credentials: SharedCredentialsProvider,
    ) -> Result<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            ClaimStackError::config(format!("invalid collection endpoint '{endpoint}': {e}"))
        })?;
        let http = reqwest::Client::builder()
            .user_agent(concat!("claimstack/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| ClaimStackError::external(SERVICE, e))?;
        Ok(Self {
            http,
            endpoint,
            region: region.into(),
            credentials,
        })
    }

    fn index_url(&self, index: &str) -> Result<Url> {
        let valid = !index.is_empty()
            && index
                .chars()
                .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || "-_.".contains(c));
        if !valid {
            return Err(ClaimStackError::validation(format!(
                "invalid index name '{index}'"
            )));
        }
        self.endpoint
            .join(index)
            .map_err(|e| ClaimStackError::config(format!("invalid index url: {e}")))
    }

    /// Sign and send one request. Non-2xx responses are returned to the caller.
    async fn send(&self, method: Method, url: Url, body: Vec<u8>) -> Result<(StatusCode, String)> {
        let credentials = self
            .credentials
            .provide_credentials()
            .await
            .map_err(|e| ClaimStackError::operator(format!("no AWS credentials available: {e}")))?;
        let identity: Identity = credentials.into();

        let mut settings = SigningSettings::default();
        settings.payload_checksum_kind = PayloadChecksumKind::XAmzSha256;
        let params = v4::SigningParams::builder()
            .identity(&identity)
            .region(&self.region)
            .name(SIGNING_NAME)
            .time(SystemTime::now())
            .settings(settings)
            .build()
            .map_err(|e| ClaimStackError::external(SERVICE, format!("signing params: {e}")))?
            .into();

        let host = match (url.host_str(), url.port()) {
            (Some(host), Some(port)) => format!("{host}:{port}"),
            (Some(host), None) => host.to_string(),
            (None, _) => {
                return Err(ClaimStackError::config(format!("endpoint {url} has no host")));
            }
        };
        let headers = [("host", host.as_str()), ("content-type", "application/json")];
        let signable = SignableRequest::new(
            method.as_str(),
            url.as_str(),
            headers.into_iter(),
            SignableBody::Bytes(&body),
        )
        .map_err(|e| ClaimStackError::external(SERVICE, format!("signing request: {e}")))?;
        let (instructions, _signature) = sign(signable, &params)
            .map_err(|e| ClaimStackError::external(SERVICE, format!("signing request: {e}")))?
            .into_parts();

        let mut request = self
            .http
            .request(method.clone(), url.clone())
            .header("content-type", "application/json")
            .body(body);
        for (name, value) in instructions.headers() {
            request = request.header(name, value);
        }

        let response = request
            .send()
            .await
            .map_err(|e| ClaimStackError::external(SERVICE, format!("{method} {url}: {e}")))?;
        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| ClaimStackError::external(SERVICE, format!("{method} {url}: {e}")))?;
        debug!(%method, %url, status = status.as_u16(), "index request");
        Ok((status, text))
    }
}

fn unexpected(action: &str, index: &str, status: StatusCode, body: &str) -> ClaimStackError {
    ClaimStackError::external(
        SERVICE,
        format!("{action} index {index} returned {status}: {body}"),
    )
}

#[async_trait]
impl IndexApi for SignedIndexClient {
    #[instrument(skip_all, fields(index = %index))]
    async fn index_shape(&self, index: &str, vector_field: &str) -> Result<Option<IndexShape>> {
        let url = self.index_url(index)?;
        let (status, body) = self.send(Method::GET, url, Vec::new()).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(None),
            s if s.is_success() => {
                let json: serde_json::Value = serde_json::from_str(&body)?;
                IndexShape::from_index_response(index, vector_field, &json)
                    .map(Some)
                    .ok_or_else(|| {
                        ClaimStackError::conflict(format!(
                            "index {index} exists but has no '{vector_field}' vector field"
                        ))
                    })
            }
            s => Err(unexpected("describe", index, s, &body)),
        }
    }

    #[instrument(skip_all, fields(index = %spec.name))]
    async fn create_index(&self, spec: &VectorIndexSpec) -> Result<IndexCreation> {
        let url = self.index_url(&spec.name)?;
        let body = serde_json::to_vec(&spec.to_index_body())?;
        let (status, text) = self.send(Method::PUT, url, body).await?;
        if status.is_success() {
            Ok(IndexCreation::Created)
        } else if status == StatusCode::BAD_REQUEST
            && text.contains("resource_already_exists_exception")
        {
            Ok(IndexCreation::AlreadyExists)
        } else {
            Err(unexpected("create", &spec.name, status, &text))
        }
    }

    #[instrument(skip_all, fields(index = %index))]
    async fn delete_index(&self, index: &str) -> Result<bool> {
        let url = self.index_url(index)?;
        let (status, body) = self.send(Method::DELETE, url, Vec::new()).await?;
        match status {
            StatusCode::NOT_FOUND => Ok(false),
            s if s.is_success() => Ok(true),
            s => Err(unexpected("delete", index, s, &body)),
        }
    }
}

/// Builds [`SignedIndexClient`]s sharing one region and credential chain.
#[derive(Clone)]
pub struct SignedIndexConnector {
    region: String,
    credentials: SharedCredentialsProvider,
}

impl SignedIndexConnector {
    pub fn new(region: impl Into<String>, credentials: SharedCredentialsProvider) -> Self {
        Self {
            region: region.into(),
            credentials,
        }
    }
}

impl IndexConnector for SignedIndexConnector {
    fn connect(&self, endpoint: &str) -> Result<Arc<dyn IndexApi>> {
        Ok(Arc::new(SignedIndexClient::new(
            endpoint,
            self.region.clone(),
            self.credentials.clone(),
        )?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aws_credential_types::Credentials;
    use claimstack_shared::{KnnEngine, SpaceType};
    use serde_json::json;
    use wiremock::matchers::{header_exists, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client(server: &MockServer) -> SignedIndexClient {
        let creds = Credentials::new("AKIDEXAMPLE", "secret", None, None, "test");
        SignedIndexClient::new(
            &server.uri(),
            "us-east-1",
            SharedCredentialsProvider::new(creds),
        )
        .expect("client")
    }

    fn spec() -> VectorIndexSpec {
        VectorIndexSpec {
            name: "insurance-policy-index".into(),
            dimension: 1024,
            space_type: SpaceType::L2,
            engine: KnnEngine::Faiss,
            m: 16,
            ef_construction: 512,
            ef_search: 512,
            vector_field: "vector".into(),
            text_field: "text".into(),
            metadata_field: "metadata".into(),
        }
    }

    #[tokio::test]
    async fn missing_index_is_none() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/insurance-policy-index"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let shape = client(&server)
            .index_shape("insurance-policy-index", "vector")
            .await
            .expect("request");
        assert!(shape.is_none());
    }

    #[tokio::test]
    async fn existing_index_shape_is_parsed() {
        let server = MockServer::start().await;
        let body = json!({ "insurance-policy-index": spec().to_index_body() });
        Mock::given(method("GET"))
            .and(path("/insurance-policy-index"))
            .respond_with(ResponseTemplate::new(200).set_body_string(body.to_string()))
            .mount(&server)
            .await;

        let shape = client(&server)
            .index_shape("insurance-policy-index", "vector")
            .await
            .expect("request")
            .expect("exists");
        assert_eq!(shape.dimension, Some(1024));
        assert!(spec().differences(&shape).is_empty());
    }

    #[tokio::test]
    async fn create_sends_signed_request() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .and(path("/insurance-policy-index"))
            .and(header_exists("authorization"))
            .and(header_exists("x-amz-content-sha256"))
            .and(header_exists("x-amz-date"))
            .respond_with(ResponseTemplate::new(200).set_body_string(r#"{"acknowledged":true}"#))
            .expect(1)
            .mount(&server)
            .await;

        let outcome = client(&server).create_index(&spec()).await.expect("create");
        assert_eq!(outcome, IndexCreation::Created);

        let requests = server.received_requests().await.expect("recorded");
        let auth = requests[0]
            .headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .expect("auth header");
        assert!(auth.starts_with("AWS4-HMAC-SHA256"));
        assert!(auth.contains("/us-east-1/aoss/aws4_request"));
        let sent: serde_json::Value = serde_json::from_slice(&requests[0].body).expect("json");
        assert_eq!(sent["mappings"]["properties"]["vector"]["dimension"], 1024);
    }

    #[tokio::test]
    async fn create_race_reports_already_exists() {
        let server = MockServer::start().await;
        Mock::given(method("PUT"))
            .respond_with(ResponseTemplate::new(400).set_body_string(
                r#"{"error":{"type":"resource_already_exists_exception"},"status":400}"#,
            ))
            .mount(&server)
            .await;

        let outcome = client(&server).create_index(&spec()).await.expect("create");
        assert_eq!(outcome, IndexCreation::AlreadyExists);
    }

    #[tokio::test]
    async fn server_errors_surface_as_external_failures() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(500).set_body_string("boom"))
            .mount(&server)
            .await;

        let err = client(&server)
            .delete_index("insurance-policy-index")
            .await
            .unwrap_err();
        assert!(err.is_external());
        assert!(err.to_string().contains("boom"));
    }

    #[tokio::test]
    async fn delete_missing_index_is_false() {
        let server = MockServer::start().await;
        Mock::given(method("DELETE"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;

        let deleted = client(&server)
            .delete_index("insurance-policy-index")
            .await
            .expect("delete");
        assert!(!deleted);
    }

    #[test]
    fn rejects_unsafe_index_names() {
        let creds = Credentials::new("AKIDEXAMPLE", "secret", None, None, "test");
        let client = SignedIndexClient::new(
            "https://abc.us-east-1.aoss.amazonaws.com",
            "us-east-1",
            SharedCredentialsProvider::new(creds),
        )
        .expect("client");
        assert!(client.index_url("../_cluster").is_err());
        assert_eq!(
            client.index_url("insurance-policy-index").expect("url").as_str(),
            "https://abc.us-east-1.aoss.amazonaws.com/insurance-policy-index"
        );
    }
}
