use super::client::SalesforceClient;
use super::entity::{entity_schema, ID_FIELD};
use super::job::{query_soql, BulkJob, JobState};
use crate::csv::parse_records;
use crate::SchemaDiscovery;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::time::Duration;
use tracing::{debug, info};
use tributary_core::spec::SalesForceSourceSpec;
use tributary_core::{
    CellValue, DataCell, PollingSource, PollingState, Pull, Row, Schema, SourceTags, StreamError,
    StreamResult, MERGE_KEY_FIELD,
};

/// Extracts an entity through bulk query jobs, one job per polling cycle
///
/// Incremental cycles select records modified after the start of the
/// previous job.
pub struct SalesForceSource {
    name: String,
    tags: SourceTags,
    entity: String,
    client: SalesforceClient,
    polling: PollingState,
    poll_interval: Duration,
    max_records: u64,
    schema: Option<Schema>,
    job: Option<BulkJob>,
    locator: Option<String>,
    job_started_at: Option<DateTime<Utc>>,
    modified_since: Option<DateTime<Utc>>,
    // the schema read at start needs no refresh for the first job
    refresh_schema: bool,
    cycle_finished: bool,
}

impl SalesForceSource {
    pub fn new(
        name: impl Into<String>,
        spec: &SalesForceSourceSpec,
        polling: PollingState,
    ) -> StreamResult<Self> {
        let modified_since = (!polling.is_backfilling()).then(Utc::now);
        Ok(Self {
            name: name.into(),
            tags: SourceTags::new(spec.entity_name.clone(), spec.instance_url.clone()),
            entity: spec.entity_name.clone(),
            client: SalesforceClient::new(spec)?,
            polling,
            poll_interval: Duration::from_secs(spec.job_poll_interval_secs),
            max_records: spec.max_records_per_page,
            schema: None,
            job: None,
            locator: None,
            job_started_at: None,
            modified_since,
            refresh_schema: false,
            cycle_finished: false,
        })
    }

    fn selected_fields(schema: &Schema) -> Vec<String> {
        schema
            .fields
            .iter()
            .filter(|f| f.name != MERGE_KEY_FIELD)
            .map(|f| f.name.clone())
            .collect()
    }

    async fn start_job(&mut self) -> StreamResult<Pull<Row>> {
        if self.refresh_schema {
            self.discover_schema().await?;
        }
        let Some(schema) = &self.schema else {
            return Err(StreamError::SchemaNotFound(self.entity.clone()));
        };
        let soql = query_soql(&self.entity, &Self::selected_fields(schema), self.modified_since);
        let started = Utc::now();
        let job = self.client.create_query_job(&soql).await?;
        info!(job = %job.id, entity = %self.entity, since = ?self.modified_since, "bulk query job created");
        self.job_started_at = Some(started);
        self.locator = None;
        self.job = Some(job);
        self.refresh_schema = true;
        Ok(Pull::Wait(self.poll_interval))
    }

    async fn poll_job(&mut self, id: &str) -> StreamResult<Pull<Row>> {
        let job = self.client.job(id).await?;
        debug!(job = %job.id, state = ?job.state, "bulk query job polled");
        if job.state.is_failed() {
            return Err(failed(&job));
        }
        let ready = job.state == JobState::JobComplete;
        self.job = Some(job);
        if ready {
            Ok(Pull::Emit(Vec::new()))
        } else {
            Ok(Pull::Wait(self.poll_interval))
        }
    }

    async fn read_results(&mut self, id: &str) -> StreamResult<Pull<Row>> {
        let page = self
            .client
            .results(id, self.locator.as_deref(), self.max_records)
            .await?;
        let rows = self.to_rows(&page.csv)?;
        debug!(job = %id, rows = rows.len(), more = page.locator.is_some(), "results page read");
        match page.locator {
            Some(locator) => self.locator = Some(locator),
            None => {
                info!(job = %id, "bulk query results drained");
                self.job = None;
                self.locator = None;
                self.modified_since = self.job_started_at.take();
                self.cycle_finished = true;
            }
        }
        Ok(Pull::Emit(rows))
    }

    fn to_rows(&self, csv: &str) -> StreamResult<Vec<Row>> {
        let Some(schema) = &self.schema else {
            return Err(StreamError::SchemaNotFound(self.entity.clone()));
        };
        let mut records = parse_records(csv.trim_start_matches('\u{feff}'), b',')?.into_iter();
        let Some(header) = records.next() else {
            return Ok(Vec::new());
        };
        let positions: HashMap<String, usize> = header
            .iter()
            .enumerate()
            .map(|(i, name)| (name.to_ascii_lowercase(), i))
            .collect();
        let columns = schema
            .fields
            .iter()
            .filter(|f| f.name != MERGE_KEY_FIELD)
            .map(|f| {
                positions
                    .get(&f.name.to_ascii_lowercase())
                    .map(|&i| (f, i))
                    .ok_or_else(|| {
                        StreamError::schema_mismatch(&self.entity, format!("result has no column {}", f.name))
                    })
            })
            .collect::<StreamResult<Vec<_>>>()?;

        let mut rows = Vec::new();
        for record in records {
            if record.len() != header.len() {
                return Err(StreamError::SchemaInconsistent {
                    expected: header.len(),
                    actual: record.len(),
                });
            }
            let mut row: Row = Vec::with_capacity(schema.len());
            let mut key = None;
            for (field, i) in &columns {
                let value = CellValue::parse(&record[*i], &field.field_type)?;
                if field.name == ID_FIELD {
                    key = value.as_text().filter(|k| !k.is_empty());
                }
                row.push(DataCell::new(&field.name, field.field_type.clone(), value));
            }
            let key = key.ok_or_else(|| StreamError::MissingMergeKey {
                entity: self.entity.clone(),
                field: ID_FIELD.into(),
            })?;
            row.push(DataCell::merge_key(key));
            rows.push(row);
        }
        Ok(rows)
    }
}

fn failed(job: &BulkJob) -> StreamError {
    StreamError::JobFailed {
        id: job.id.clone(),
        status: format!("{:?}", job.state),
    }
}

#[async_trait]
impl SchemaDiscovery for SalesForceSource {
    async fn discover_schema(&mut self) -> StreamResult<Schema> {
        let definitions = self.client.field_definitions(&self.entity).await?;
        let fresh = entity_schema(&self.entity, &definitions)?;
        match &self.schema {
            None => {
                info!(entity = %self.entity, fields = fresh.len(), "schema discovered");
                self.schema = Some(fresh.clone());
                Ok(fresh)
            }
            Some(current) if current.structurally_equals(&fresh) => Ok(current.clone()),
            Some(current) => Err(StreamError::schema_mismatch(
                &self.entity,
                current.describe_difference(&fresh),
            )),
        }
    }
}

#[async_trait]
impl PollingSource for SalesForceSource {
    type Item = Row;

    fn name(&self) -> &str {
        &self.name
    }

    fn tags(&self) -> &SourceTags {
        &self.tags
    }

    async fn pre_start(&mut self) -> StreamResult<()> {
        if self.schema.is_none() {
            self.discover_schema().await?;
        }
        Ok(())
    }

    async fn on_pull(&mut self) -> StreamResult<Pull<Row>> {
        if self.cycle_finished {
            self.cycle_finished = false;
            return Ok(self.polling.on_empty());
        }
        let Some(job) = self.job.clone() else {
            return self.start_job().await;
        };
        match job.state {
            state if state.is_failed() => Err(failed(&job)),
            JobState::JobComplete => self.read_results(&job.id).await,
            _ => self.poll_job(&job.id).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tributary_core::BackfillState;
    use wiremock::matchers::{method, path, query_param, query_param_is_missing};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    const API: &str = "/services/data/v60.0";

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

    fn fields(names: &[(&str, &str)]) -> serde_json::Value {
        json!({
            "done": true,
            "records": names.iter().map(|(n, t)| json!({
                "attributes": { "type": "FieldDefinition" },
                "QualifiedApiName": n,
                "ValueTypeId": t,
                "IsNillable": true
            })).collect::<Vec<_>>()
        })
    }

    async fn mount_login(server: &MockServer) {
        Mock::given(method("POST"))
            .and(path("/services/oauth2/token"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "access_token": "session",
                "instance_url": server.uri()
            })))
            .mount(server)
            .await;
    }

    async fn mount_job(server: &MockServer, final_state: &str) {
        Mock::given(method("POST"))
            .and(path(format!("{API}/jobs/query")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750A", "state": "UploadComplete", "object": "Account"
            })))
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/jobs/query/750A")))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({
                "id": "750A", "state": final_state, "object": "Account"
            })))
            .mount(server)
            .await;
    }

    async fn mount_results(server: &MockServer) {
        Mock::given(method("GET"))
            .and(path(format!("{API}/jobs/query/750A/results")))
            .and(query_param_is_missing("locator"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "page2")
                    .set_body_string("\"Id\",\"Name\",\"AnnualRevenue\"\n\"001\",\"Acme\",\"10.5\"\n\"002\",\"Globex, Inc\",\"\"\n"),
            )
            .mount(server)
            .await;
        Mock::given(method("GET"))
            .and(path(format!("{API}/jobs/query/750A/results")))
            .and(query_param("locator", "page2"))
            .respond_with(
                ResponseTemplate::new(200)
                    .insert_header("Sforce-Locator", "null")
                    .set_body_string("\"Id\",\"Name\",\"AnnualRevenue\"\n\"003\",\"Initech\",\"1\"\n"),
            )
            .mount(server)
            .await;
    }

    async fn mount_fields(server: &MockServer, definitions: serde_json::Value, times: Option<u64>) {
        let mock = Mock::given(method("GET"))
            .and(path(format!("{API}/query")))
            .respond_with(ResponseTemplate::new(200).set_body_json(definitions));
        match times {
            Some(n) => mock.up_to_n_times(n).mount(server).await,
            None => mock.mount(server).await,
        }
    }

    fn account_fields() -> serde_json::Value {
        fields(&[("Id", "id"), ("Name", "string"), ("AnnualRevenue", "currency")])
    }

    #[tokio::test]
    async fn test_backfill_job_lifecycle() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_fields(&server, account_fields(), None).await;
        mount_job(&server, "JobComplete").await;
        mount_results(&server).await;

        let polling = PollingState::new(BackfillState::new(true, true).unwrap(), Duration::from_secs(60));
        let mut source = SalesForceSource::new("accounts", &spec(server.uri()), polling).unwrap();
        source.pre_start().await.unwrap();

        assert!(matches!(source.on_pull().await.unwrap(), Pull::Wait(d) if d == Duration::from_secs(2)));
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Emit(rows) if rows.is_empty()));
        match source.on_pull().await.unwrap() {
            Pull::Emit(rows) => {
                assert_eq!(rows.len(), 2);
                assert_eq!(rows[1][1].value, CellValue::String("Globex, Inc".into()));
                assert!(rows[1][2].value.is_null());
                assert_eq!(rows[0][3].field_name, MERGE_KEY_FIELD);
                assert_eq!(rows[0][3].value, CellValue::String("001".into()));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Emit(rows) if rows.len() == 1));
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Complete));
    }

    #[tokio::test]
    async fn test_failed_job_is_fatal() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_fields(&server, account_fields(), None).await;
        mount_job(&server, "Failed").await;

        let polling = PollingState::new(BackfillState::new(true, false).unwrap(), Duration::from_secs(60));
        let mut source = SalesForceSource::new("accounts", &spec(server.uri()), polling).unwrap();
        source.pre_start().await.unwrap();
        source.on_pull().await.unwrap();
        let err = source.on_pull().await.unwrap_err();
        assert!(matches!(err, StreamError::JobFailed { ref status, .. } if status == "Failed"));
        assert_eq!(source.decide(&err), tributary_core::Directive::Stop);
    }

    #[tokio::test]
    async fn test_schema_change_between_cycles_is_mismatch() {
        let server = MockServer::start().await;
        mount_login(&server).await;
        mount_fields(&server, account_fields(), Some(1)).await;
        mount_fields(
            &server,
            fields(&[("Id", "id"), ("Name", "string"), ("Industry", "string")]),
            None,
        )
        .await;
        mount_job(&server, "JobComplete").await;
        mount_results(&server).await;

        let polling = PollingState::new(BackfillState::new(false, false).unwrap(), Duration::from_secs(60));
        let mut source = SalesForceSource::new("accounts", &spec(server.uri()), polling).unwrap();
        source.pre_start().await.unwrap();
        source.on_pull().await.unwrap();
        source.on_pull().await.unwrap();
        source.on_pull().await.unwrap();
        source.on_pull().await.unwrap();
        assert!(matches!(source.on_pull().await.unwrap(), Pull::Wait(d) if d == Duration::from_secs(60)));

        let err = source.on_pull().await.unwrap_err();
        assert!(err.is_schema_mismatch());
    }
}
