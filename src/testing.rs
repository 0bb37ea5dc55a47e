//! In-memory collaborators.
//!
//! Every external service the pipeline talks to has a scriptable fake here.
//! Each fake records the calls it receives so tests can assert on ordering
//! and on which stages ran for which partition.
//!
//! Built for this crate's tests and with the `testing` feature.

use async_trait::async_trait;
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Mutex, MutexGuard, PoisonError};

use crate::discovery::{
    CatalogService, CreateOutcome, DeleteOutcome, DiscoveryJobSpec, JobState, StartOutcome,
};
use crate::error::{DiscoveryError, QueryError, SinkError, SourceError};
use crate::query::{QueryService, QueryStatus, ResultPage};
use crate::sink::relational::{RelationalSink, Statement};
use crate::source::{KeyValueSource, RawItem, ScanPage, TaggedValue};
use crate::table::Cell;

const OFFSET_KEY: &str = "__offset";
const DEFAULT_PAGE_SIZE: usize = 100;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

// ============ Key-value source ============

#[derive(Default)]
struct SourceState {
    tables: HashMap<String, Vec<RawItem>>,
    page_size: Option<usize>,
    requests: HashMap<String, usize>,
    /// Remaining injected failures per table, and whether they are expiries.
    failures: HashMap<String, (usize, bool)>,
}

/// Paged key-value tables held in memory.
#[derive(Default)]
pub struct InMemorySource {
    state: Mutex<SourceState>,
}

impl InMemorySource {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_table(&self, name: &str, items: Vec<RawItem>) {
        lock(&self.state).tables.insert(name.to_string(), items);
    }

    pub fn set_page_size(&self, size: usize) {
        lock(&self.state).page_size = Some(size.max(1));
    }

    /// Fail the next `count` page requests for `table`.
    pub fn fail_next(&self, table: &str, count: usize, expired: bool) {
        lock(&self.state)
            .failures
            .insert(table.to_string(), (count, expired));
    }

    /// Page requests received for `table`, failed ones included.
    pub fn page_requests(&self, table: &str) -> usize {
        lock(&self.state).requests.get(table).copied().unwrap_or(0)
    }
}

fn offset_of(start: Option<&RawItem>) -> usize {
    match start.and_then(|key| key.get(OFFSET_KEY)) {
        Some(TaggedValue::Number(n)) => n.parse().unwrap_or(0),
        _ => 0,
    }
}

#[async_trait]
impl KeyValueSource for InMemorySource {
    async fn scan_page(
        &self,
        table: &str,
        start: Option<RawItem>,
    ) -> Result<ScanPage, SourceError> {
        let mut state = lock(&self.state);
        *state.requests.entry(table.to_string()).or_default() += 1;

        if let Some((remaining, expired)) = state.failures.get_mut(table)
            && *remaining > 0
        {
            *remaining -= 1;
            return Err(if *expired {
                SourceError::CredentialsExpired {
                    table: table.to_string(),
                    message: "ExpiredTokenException: The security token included in the request is expired".to_string(),
                }
            } else {
                SourceError::SourceUnavailable {
                    table: table.to_string(),
                    message: "ProvisionedThroughputExceededException: rate exceeded".to_string(),
                }
            });
        }

        let page_size = state.page_size.unwrap_or(DEFAULT_PAGE_SIZE);
        let Some(items) = state.tables.get(table) else {
            return Err(SourceError::SourceUnavailable {
                table: table.to_string(),
                message: "ResourceNotFoundException: Requested resource not found".to_string(),
            });
        };

        let offset = offset_of(start.as_ref()).min(items.len());
        let end = (offset + page_size).min(items.len());
        let next = (end < items.len()).then(|| {
            HashMap::from([(
                OFFSET_KEY.to_string(),
                TaggedValue::Number(end.to_string()),
            )])
        });

        Ok(ScanPage {
            items: items[offset..end].to_vec(),
            next,
        })
    }
}

// ============ Relational sink ============

#[derive(Default)]
struct SinkState {
    statements: Vec<Statement>,
    fail_at: Option<usize>,
    fail_tables: HashSet<String>,
}

/// A relational sink that records every statement it is asked to run.
#[derive(Default)]
pub struct RecordingSink {
    state: Mutex<SinkState>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the statement with this 0-based position in the log.
    pub fn fail_statement(&self, index: usize) {
        lock(&self.state).fail_at = Some(index);
    }

    /// Fail every statement against `table`.
    pub fn fail_table(&self, table: &str) {
        lock(&self.state).fail_tables.insert(table.to_string());
    }

    /// Every statement attempted, the failing one included.
    pub fn statements(&self) -> Vec<Statement> {
        lock(&self.state).statements.clone()
    }

    /// Distinct tables statements were run against, in first-seen order.
    pub fn tables(&self) -> Vec<String> {
        let state = lock(&self.state);
        let mut seen = HashSet::new();
        state
            .statements
            .iter()
            .filter(|s| seen.insert(s.table.clone()))
            .map(|s| s.table.clone())
            .collect()
    }

    /// Parameters of every INSERT against `table`.
    pub fn inserted_rows(&self, table: &str) -> Vec<Vec<Cell>> {
        lock(&self.state)
            .statements
            .iter()
            .filter(|s| s.table == table && s.sql.starts_with("INSERT"))
            .map(|s| s.params.clone())
            .collect()
    }
}

#[async_trait]
impl RelationalSink for RecordingSink {
    async fn execute(&self, statement: &Statement) -> Result<u64, SinkError> {
        let mut state = lock(&self.state);
        let index = state.statements.len();
        state.statements.push(statement.clone());

        if state.fail_at == Some(index) || state.fail_tables.contains(&statement.table) {
            return Err(SinkError::SinkWrite {
                table: statement.table.clone(),
                message: "connection reset by peer".to_string(),
            });
        }
        Ok(if statement.params.is_empty() { 0 } else { 1 })
    }
}

// ============ Catalog ============

/// A call received by [`InMemoryCatalog`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogCall {
    Create(String),
    Start(String),
    State(String),
    DeleteTable { schema: String, table: String },
    SchemaExists(String),
}

struct JobRecord {
    spec: DiscoveryJobSpec,
    running: bool,
    /// Status checks left that report `Running`.
    polls_left: u32,
    checks: u32,
    last_failure: Option<String>,
}

#[derive(Default)]
struct CatalogState {
    calls: Vec<CatalogCall>,
    jobs: HashMap<String, JobRecord>,
    jobs_created: usize,
    run_polls: u32,
    drop_on_create: bool,
    fail_reason: Option<String>,
    schemas: HashSet<String>,
    tables: HashSet<(String, String)>,
    schema_appears_at: HashMap<String, u32>,
    schema_checks: HashMap<String, u32>,
    expired_schemas: HashSet<String>,
}

/// Discovery jobs, schemas and tables held in memory.
///
/// A started job reports `Running` for the configured number of status
/// checks, then `Ready`, at which point its schema and the table named
/// after its target folder are registered.
#[derive(Default)]
pub struct InMemoryCatalog {
    state: Mutex<CatalogState>,
}

impl InMemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every lookup of `schema` as if the catalog credentials expired.
    pub fn expire_credentials_for(&self, schema: &str) {
        lock(&self.state)
            .expired_schemas
            .insert(schema.to_string());
    }

    /// Status checks a started job spends running before it is ready.
    pub fn set_run_polls(&self, polls: u32) {
        lock(&self.state).run_polls = polls;
    }

    /// Register a job that is already running for `polls` more checks.
    pub fn add_running_job(&self, spec: &DiscoveryJobSpec, polls: u32) {
        lock(&self.state).jobs.insert(
            spec.name.clone(),
            JobRecord {
                spec: spec.clone(),
                running: true,
                polls_left: polls,
                checks: 0,
                last_failure: None,
            },
        );
    }

    /// Acknowledge creates without keeping the job.
    pub fn drop_jobs_on_create(&self) {
        lock(&self.state).drop_on_create = true;
    }

    /// Make every run end in failure with `reason`.
    pub fn fail_runs(&self, reason: &str) {
        lock(&self.state).fail_reason = Some(reason.to_string());
    }

    pub fn add_schema(&self, schema: &str) {
        lock(&self.state).schemas.insert(schema.to_string());
    }

    /// Make `schema` exist from its `check`-th existence check on.
    pub fn schema_appears_on_check(&self, schema: &str, check: u32) {
        lock(&self.state)
            .schema_appears_at
            .insert(schema.to_string(), check);
    }

    pub fn add_table(&self, schema: &str, table: &str) {
        lock(&self.state)
            .tables
            .insert((schema.to_string(), table.to_string()));
    }

    pub fn has_table(&self, schema: &str, table: &str) -> bool {
        lock(&self.state)
            .tables
            .contains(&(schema.to_string(), table.to_string()))
    }

    pub fn schema_registered(&self, schema: &str) -> bool {
        lock(&self.state).schemas.contains(schema)
    }

    pub fn calls(&self) -> Vec<CatalogCall> {
        lock(&self.state).calls.clone()
    }

    pub fn jobs_created(&self) -> usize {
        lock(&self.state).jobs_created
    }

    pub fn state_checks(&self, job: &str) -> u32 {
        lock(&self.state).jobs.get(job).map_or(0, |j| j.checks)
    }

    pub fn schema_checks(&self, schema: &str) -> u32 {
        lock(&self.state)
            .schema_checks
            .get(schema)
            .copied()
            .unwrap_or(0)
    }
}

/// Last folder of a crawl target, as the catalog names tables.
fn target_table(target: &str) -> String {
    target
        .trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or_default()
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_lowercase()
            } else {
                '_'
            }
        })
        .collect()
}

#[async_trait]
impl CatalogService for InMemoryCatalog {
    async fn create_job(&self, job: &DiscoveryJobSpec) -> Result<CreateOutcome, DiscoveryError> {
        let mut state = lock(&self.state);
        state.calls.push(CatalogCall::Create(job.name.clone()));

        if state.jobs.contains_key(&job.name) {
            return Ok(CreateOutcome::AlreadyExists);
        }
        if !state.drop_on_create {
            state.jobs.insert(
                job.name.clone(),
                JobRecord {
                    spec: job.clone(),
                    running: false,
                    polls_left: 0,
                    checks: 0,
                    last_failure: None,
                },
            );
            state.jobs_created += 1;
        }
        Ok(CreateOutcome::Created)
    }

    async fn start_job(&self, name: &str) -> Result<StartOutcome, DiscoveryError> {
        let mut state = lock(&self.state);
        state.calls.push(CatalogCall::Start(name.to_string()));
        let run_polls = state.run_polls;

        let Some(job) = state.jobs.get_mut(name) else {
            return Ok(StartOutcome::NotFound);
        };
        if job.running {
            return Ok(StartOutcome::AlreadyRunning);
        }
        job.running = true;
        job.polls_left = run_polls;
        job.last_failure = None;
        Ok(StartOutcome::Started)
    }

    async fn job_state(&self, name: &str) -> Result<JobState, DiscoveryError> {
        let mut guard = lock(&self.state);
        let state = &mut *guard;
        state.calls.push(CatalogCall::State(name.to_string()));
        let fail_reason = state.fail_reason.clone();

        let Some(job) = state.jobs.get_mut(name) else {
            return Err(DiscoveryError::DiscoveryJobMissing {
                job: name.to_string(),
            });
        };
        job.checks += 1;

        if job.running {
            if job.polls_left > 0 {
                job.polls_left -= 1;
                return Ok(JobState::Running);
            }
            job.running = false;
            job.last_failure = fail_reason;
            if job.last_failure.is_none() {
                let schema = job.spec.schema_name.clone();
                let table = target_table(&job.spec.target);
                state.tables.insert((schema.clone(), table));
                state.schemas.insert(schema);
                return Ok(JobState::Ready);
            }
        }

        Ok(match &job.last_failure {
            Some(reason) => JobState::Failed {
                reason: reason.clone(),
            },
            None => JobState::Ready,
        })
    }

    async fn delete_table(
        &self,
        schema: &str,
        table: &str,
    ) -> Result<DeleteOutcome, DiscoveryError> {
        let mut state = lock(&self.state);
        state.calls.push(CatalogCall::DeleteTable {
            schema: schema.to_string(),
            table: table.to_string(),
        });

        if state.tables.remove(&(schema.to_string(), table.to_string())) {
            Ok(DeleteOutcome::Deleted)
        } else {
            Ok(DeleteOutcome::NotFound)
        }
    }

    async fn schema_exists(&self, schema: &str) -> Result<bool, DiscoveryError> {
        let mut state = lock(&self.state);
        state.calls.push(CatalogCall::SchemaExists(schema.to_string()));
        if state.expired_schemas.contains(schema) {
            return Err(DiscoveryError::CatalogCredentialsExpired {
                operation: "get_database",
                message: "ExpiredTokenException: The security token included in the request is expired".to_string(),
            });
        }

        let checks = state.schema_checks.entry(schema.to_string()).or_default();
        *checks += 1;
        let checks = *checks;

        if state
            .schema_appears_at
            .get(schema)
            .is_some_and(|&at| checks >= at)
        {
            state.schemas.insert(schema.to_string());
        }
        Ok(state.schemas.contains(schema))
    }
}

// ============ Query service ============

/// A call received by [`InMemoryQueryService`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueryCall {
    Submit { query: String, schema: String },
    Status(String),
    Results {
        execution_id: String,
        next_token: Option<String>,
    },
}

#[derive(Clone)]
struct ScriptedQuery {
    statuses: VecDeque<QueryStatus>,
    columns: Vec<String>,
    rows: Vec<Vec<Cell>>,
}

#[derive(Default)]
struct QueryState {
    calls: Vec<QueryCall>,
    scripts: VecDeque<ScriptedQuery>,
    tables: HashMap<String, (Vec<String>, Vec<Vec<Cell>>)>,
    executions: HashMap<String, ScriptedQuery>,
    page_size: Option<usize>,
    submitted: usize,
    expired_schemas: HashSet<String>,
}

/// A query engine answering from scripted executions or per-schema tables.
///
/// A submitted query takes the next scripted execution if one is queued.
/// Otherwise it succeeds at once with the rows registered for its schema,
/// or fails when the schema has none.
#[derive(Default)]
pub struct InMemoryQueryService {
    state: Mutex<QueryState>,
}

impl InMemoryQueryService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue an execution that reports `statuses` in turn, repeating the
    /// last one, and returns `rows` once succeeded.
    pub fn push_result(
        &self,
        statuses: Vec<QueryStatus>,
        columns: Vec<String>,
        rows: Vec<Vec<Cell>>,
    ) {
        lock(&self.state).scripts.push_back(ScriptedQuery {
            statuses: statuses.into(),
            columns,
            rows,
        });
    }

    /// Rows returned by any query against `schema`.
    pub fn add_table(&self, schema: &str, columns: Vec<String>, rows: Vec<Vec<Cell>>) {
        lock(&self.state)
            .tables
            .insert(schema.to_string(), (columns, rows));
    }

    /// Reject submissions against `schema` as if the credentials expired.
    pub fn expire_credentials_for(&self, schema: &str) {
        lock(&self.state)
            .expired_schemas
            .insert(schema.to_string());
    }

    /// Rows per result page.
    pub fn set_page_size(&self, size: usize) {
        lock(&self.state).page_size = Some(size.max(1));
    }

    pub fn calls(&self) -> Vec<QueryCall> {
        lock(&self.state).calls.clone()
    }

    /// Schemas queries were submitted against, in order.
    pub fn queried_schemas(&self) -> Vec<String> {
        lock(&self.state)
            .calls
            .iter()
            .filter_map(|call| match call {
                QueryCall::Submit { schema, .. } => Some(schema.clone()),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl QueryService for InMemoryQueryService {
    async fn submit(
        &self,
        query: &str,
        schema: &str,
        _result_location: &str,
    ) -> Result<String, QueryError> {
        let mut state = lock(&self.state);
        state.calls.push(QueryCall::Submit {
            query: query.to_string(),
            schema: schema.to_string(),
        });
        if state.expired_schemas.contains(schema) {
            return Err(QueryError::QueryCredentialsExpired {
                operation: "start_query_execution",
                message: "ExpiredTokenException: The security token included in the request is expired".to_string(),
            });
        }
        state.submitted += 1;
        let execution_id = format!("query-{}", state.submitted);

        let execution = match state.scripts.pop_front() {
            Some(script) => script,
            None => match state.tables.get(schema) {
                Some((columns, rows)) => ScriptedQuery {
                    statuses: VecDeque::from([QueryStatus::Succeeded]),
                    columns: columns.clone(),
                    rows: rows.clone(),
                },
                None => ScriptedQuery {
                    statuses: VecDeque::from([QueryStatus::Failed {
                        reason: format!("SCHEMA_NOT_FOUND: Schema '{schema}' does not exist"),
                    }]),
                    columns: Vec::new(),
                    rows: Vec::new(),
                },
            },
        };
        state.executions.insert(execution_id.clone(), execution);
        Ok(execution_id)
    }

    async fn status(&self, execution_id: &str) -> Result<QueryStatus, QueryError> {
        let mut state = lock(&self.state);
        state.calls.push(QueryCall::Status(execution_id.to_string()));

        let Some(execution) = state.executions.get_mut(execution_id) else {
            return Err(QueryError::QueryService {
                operation: "status",
                message: format!("unknown execution {execution_id}"),
            });
        };
        let status = if execution.statuses.len() > 1 {
            execution.statuses.pop_front()
        } else {
            execution.statuses.front().cloned()
        };
        Ok(status.unwrap_or(QueryStatus::Succeeded))
    }

    async fn results_page(
        &self,
        execution_id: &str,
        next_token: Option<String>,
    ) -> Result<ResultPage, QueryError> {
        let mut state = lock(&self.state);
        state.calls.push(QueryCall::Results {
            execution_id: execution_id.to_string(),
            next_token: next_token.clone(),
        });
        let page_size = state.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

        let Some(execution) = state.executions.get(execution_id) else {
            return Err(QueryError::QueryService {
                operation: "results_page",
                message: format!("unknown execution {execution_id}"),
            });
        };

        let offset = next_token
            .and_then(|t| t.parse::<usize>().ok())
            .unwrap_or(0)
            .min(execution.rows.len());
        let end = (offset + page_size).min(execution.rows.len());

        Ok(ResultPage {
            columns: execution.columns.clone(),
            rows: execution.rows[offset..end].to_vec(),
            next_token: (end < execution.rows.len()).then(|| end.to_string()),
        })
    }
}
