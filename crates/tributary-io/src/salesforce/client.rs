use super::entity::{field_definitions_soql, FieldDefinition};
use super::job::{parse_locator, BulkJob, CreateQueryJob, ResultPage, LOCATOR_HEADER};
use crate::rest::{http_error, DynamicBearerAuth};
use reqwest::{Client, Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;
use tracing::debug;
use tributary_core::spec::SalesForceSourceSpec;
use tributary_core::{StreamError, StreamResult};

/// Sessions are treated as valid for this long after login
const SESSION_LIFETIME: Duration = Duration::from_secs(2 * 60 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct QueryResponse<T> {
    records: Vec<T>,
    #[serde(default)]
    next_records_url: Option<String>,
}

/// REST and Bulk API 2.0 calls against one org
pub struct SalesforceClient {
    http: Client,
    auth: DynamicBearerAuth,
    instance_url: String,
    api_version: String,
}

impl SalesforceClient {
    pub fn new(spec: &SalesForceSourceSpec) -> StreamResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(spec.http_timeout_secs))
            .build()
            .map_err(|e| StreamError::config(format!("failed to build HTTP client: {e}")))?;
        let instance_url = spec.instance_url.trim_end_matches('/').to_string();
        let password = format!("{}{}", spec.password, spec.security_token);
        let auth = DynamicBearerAuth::password_grant(
            format!("{instance_url}/services/oauth2/token"),
            &[
                ("grant_type", "password"),
                ("client_id", &spec.client_id),
                ("client_secret", &spec.client_secret),
                ("username", &spec.username),
                ("password", &password),
            ],
        )
        .with_expiration_period(SESSION_LIFETIME);
        Ok(Self {
            http,
            auth,
            instance_url,
            api_version: spec.api_version.clone(),
        })
    }

    async fn request(&mut self, method: Method, url: &str) -> StreamResult<RequestBuilder> {
        let token = self.auth.token(&self.http).await?;
        let base = self
            .auth
            .last_response()
            .and_then(|r| r.get("instance_url"))
            .and_then(Value::as_str)
            .unwrap_or(&self.instance_url)
            .trim_end_matches('/');
        let url = if url.starts_with('/') {
            format!("{base}{url}")
        } else {
            format!("{base}/services/data/{}/{url}", self.api_version)
        };
        Ok(self.http.request(method, url).bearer_auth(token))
    }

    /// Send a request, logging in again once if the session was rejected
    async fn execute<F>(&mut self, method: Method, url: &str, build: F) -> StreamResult<Response>
    where
        F: Fn(RequestBuilder) -> RequestBuilder + Send,
    {
        let request = build(self.request(method.clone(), url).await?);
        let response = request.send().await.map_err(http_error)?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return checked(response).await;
        }
        debug!(url, "session rejected, logging in again");
        self.auth.invalidate();
        let request = build(self.request(method, url).await?);
        checked(request.send().await.map_err(http_error)?).await
    }

    /// Field metadata of an entity, following `nextRecordsUrl`
    pub async fn field_definitions(&mut self, entity: &str) -> StreamResult<Vec<FieldDefinition>> {
        let soql = field_definitions_soql(entity);
        let mut page: QueryResponse<FieldDefinition> = self
            .execute(Method::GET, "query", |r| r.query(&[("q", &soql)]))
            .await?
            .json()
            .await
            .map_err(http_error)?;
        let mut definitions = std::mem::take(&mut page.records);
        while let Some(next) = page.next_records_url.take() {
            page = self
                .execute(Method::GET, &next, |r| r)
                .await?
                .json()
                .await
                .map_err(http_error)?;
            definitions.append(&mut page.records);
        }
        debug!(entity, fields = definitions.len(), "field definitions read");
        Ok(definitions)
    }

    pub async fn create_query_job(&mut self, soql: &str) -> StreamResult<BulkJob> {
        let body = CreateQueryJob::csv(soql);
        self.execute(Method::POST, "jobs/query", |r| r.json(&body))
            .await?
            .json()
            .await
            .map_err(http_error)
    }

    pub async fn job(&mut self, id: &str) -> StreamResult<BulkJob> {
        self.execute(Method::GET, &format!("jobs/query/{id}"), |r| r)
            .await?
            .json()
            .await
            .map_err(http_error)
    }

    pub async fn results(
        &mut self,
        id: &str,
        locator: Option<&str>,
        max_records: u64,
    ) -> StreamResult<ResultPage> {
        let max_records = max_records.to_string();
        let response = self
            .execute(Method::GET, &format!("jobs/query/{id}/results"), |r| {
                let r = r.query(&[("maxRecords", &max_records)]);
                match locator {
                    Some(locator) => r.query(&[("locator", locator)]),
                    None => r,
                }
            })
            .await?;
        let locator = parse_locator(
            response
                .headers()
                .get(LOCATOR_HEADER)
                .and_then(|v| v.to_str().ok()),
        );
        let csv = response.text().await.map_err(http_error)?;
        Ok(ResultPage { csv, locator })
    }
}

async fn checked(response: Response) -> StreamResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let message = response.text().await.unwrap_or_default();
    Err(StreamError::Http {
        status: status.as_u16(),
        message,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::salesforce::job::JobState;
    use serde_json::json;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn spec(uri: String) -> SalesForceSourceSpec {
        SalesForceSourceSpec {
            instance_url: uri,
            client_id: "cid".into(),
            client_secret: "secret".into(),
            username: "etl@acme.test".into(),
            password: "pw".into(),
            security_token: "tok".into(),
            api_version: "v60.0".into(),
            entity_name: "Account".into(),
            job_poll_interval_secs: 2,
            max_records_per_page: 2,
            http_timeout_secs: 5,
        }
    }

    async fn mount_sessions(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "expired",
                "instance_url": server.uri()
            })))
            .up_to_n_times(1)
            .mount(server)
            .await;
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "fresh",
                "instance_url": server.uri()
            })))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_rejected_session_logs_in_again() {
        let server = MockServer::start().await;
        mount_sessions(&server).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/query/750A"))
            .and(header("authorization", "Bearer expired"))
            .respond_with(ResponseTemplate::new(401).set_body_string("Session expired or invalid"))
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/query/750A"))
            .and(header("authorization", "Bearer fresh"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750A", "state": "JobComplete", "object": "Account"
            })))
            .expect(1)
            .mount(&server)
            .await;

        let mut client = SalesforceClient::new(&spec(server.uri())).unwrap();
        let job = client.job("750A").await.unwrap();
        assert_eq!(job.state, JobState::JobComplete);
    }

    #[tokio::test]
    async fn test_second_rejection_is_fatal() {
        let server = MockServer::start().await;
        mount_sessions(&server).await;
        Mock::given(method("GET"))
            .and(path("/services/data/v60.0/jobs/query/750A"))
            .respond_with(ResponseTemplate::new(401))
            .expect(2)
            .mount(&server)
            .await;

        let mut client = SalesforceClient::new(&spec(server.uri())).unwrap();
        let err = client.job("750A").await.unwrap_err();
        assert!(matches!(err, StreamError::Http { status: 401, .. }));
    }
}
