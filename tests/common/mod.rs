//! Shared helpers for integration tests.
//!
//! [`MockAdapter`] records every call it receives in a journal shared by all
//! adapters of a test, so tests can assert on the exact order of adapter
//! calls across connections. Autocommit calls running under an isolation
//! level are journaled as `name:query@LEVEL sql`.
#![allow(dead_code)]

use async_trait::async_trait;
use query_pipeline::models::{IsolationLevel, QueryParam, ResultSet, Row};
use query_pipeline::{Adapter, AdapterRegistry, DbError, DbResult, Executor, Pipeline, Session};
use serde_json::json;
use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Journal = Arc<Mutex<Vec<String>>>;

#[derive(Default)]
struct MockState {
    /// Open transactions by id, with their current level.
    transactions: Vec<(String, IsolationLevel)>,
    default_isolation: Option<IsolationLevel>,
    query_failures: VecDeque<DbError>,
    statement_failures: VecDeque<DbError>,
    begin_failure: Option<DbError>,
    commit_failure: Option<DbError>,
    rollback_failure: Option<DbError>,
    isolation_failure: Option<DbError>,
    delay: Option<Duration>,
}

/// Scripted adapter. Queries return one row `{"connection": <name>}`,
/// statements report one affected row.
pub struct MockAdapter {
    name: String,
    journal: Journal,
    transactional: bool,
    state: Mutex<MockState>,
}

impl MockAdapter {
    pub fn new(name: &str, journal: &Journal) -> Self {
        Self {
            name: name.to_string(),
            journal: Arc::clone(journal),
            transactional: true,
            state: Mutex::new(MockState {
                default_isolation: Some(IsolationLevel::ReadCommitted),
                ..MockState::default()
            }),
        }
    }

    /// Adapter without transaction or isolation support.
    pub fn plain(name: &str, journal: &Journal) -> Self {
        Self {
            transactional: false,
            state: Mutex::new(MockState::default()),
            ..Self::new(name, journal)
        }
    }

    fn record(&self, entry: impl AsRef<str>) {
        self.journal
            .lock()
            .unwrap()
            .push(format!("{}:{}", self.name, entry.as_ref()));
    }

    fn describe(kind: &str, session: &Session) -> String {
        match session {
            Session::Autocommit { isolation: None } => kind.to_string(),
            Session::Autocommit {
                isolation: Some(level),
            } => format!("{kind}@{}", level.as_sql()),
            Session::Transaction(_) => format!("tx:{kind}"),
        }
    }

    pub fn fail_next_query(&self, error: DbError) {
        self.state.lock().unwrap().query_failures.push_back(error);
    }

    pub fn fail_next_statement(&self, error: DbError) {
        self.state.lock().unwrap().statement_failures.push_back(error);
    }

    pub fn fail_begin(&self, error: DbError) {
        self.state.lock().unwrap().begin_failure = Some(error);
    }

    pub fn fail_commit(&self, error: DbError) {
        self.state.lock().unwrap().commit_failure = Some(error);
    }

    pub fn fail_rollback(&self, error: DbError) {
        self.state.lock().unwrap().rollback_failure = Some(error);
    }

    pub fn fail_set_isolation(&self, error: DbError) {
        self.state.lock().unwrap().isolation_failure = Some(error);
    }

    pub fn set_delay(&self, delay: Duration) {
        self.state.lock().unwrap().delay = Some(delay);
    }

    /// Level of the open transaction `id`.
    pub fn transaction_isolation(&self, id: &str) -> Option<IsolationLevel> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .find(|(open, _)| open == id)
            .map(|(_, level)| *level)
    }

    pub fn is_open(&self) -> bool {
        !self.state.lock().unwrap().transactions.is_empty()
    }

    /// Open a transaction directly on the adapter, outside any logical transaction.
    pub fn force_open(&self, id: &str) {
        let mut state = self.state.lock().unwrap();
        let level = state.default_isolation.unwrap_or(IsolationLevel::ReadCommitted);
        state.transactions.push((id.to_string(), level));
    }

    fn check_session(&self, session: &Session) -> DbResult<()> {
        if let Session::Transaction(id) = session {
            if self.transaction_isolation(id).is_none() {
                return Err(DbError::logic(format!(
                    "transaction '{id}' is not open on '{}'",
                    self.name
                )));
            }
        }
        Ok(())
    }

    fn close_transaction(&self, id: &str) -> DbResult<()> {
        let mut state = self.state.lock().unwrap();
        let before = state.transactions.len();
        state.transactions.retain(|(open, _)| open != id);
        if state.transactions.len() == before {
            return Err(DbError::logic(format!(
                "transaction '{id}' is not open on '{}'",
                self.name
            )));
        }
        Ok(())
    }

    async fn pause(&self) {
        let delay = self.state.lock().unwrap().delay;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
    }
}

#[async_trait]
impl Adapter for MockAdapter {
    async fn query(&self, sql: &str, _params: &[QueryParam], session: &Session) -> DbResult<ResultSet> {
        self.record(format!("{} {sql}", Self::describe("query", session)));
        self.pause().await;
        if let Some(e) = self.state.lock().unwrap().query_failures.pop_front() {
            return Err(e);
        }
        self.check_session(session)?;

        let mut row = Row::new();
        row.insert("connection".to_string(), json!(self.name));
        Ok(ResultSet::new(vec!["connection".to_string()], vec![row]))
    }

    async fn statement(&self, sql: &str, _params: &[QueryParam], session: &Session) -> DbResult<u64> {
        self.record(format!("{} {sql}", Self::describe("statement", session)));
        self.pause().await;
        if let Some(e) = self.state.lock().unwrap().statement_failures.pop_front() {
            return Err(e);
        }
        self.check_session(session)?;
        Ok(1)
    }

    fn supports_transactions(&self) -> bool {
        self.transactional
    }

    async fn open_transactions(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .transactions
            .iter()
            .map(|(id, _)| id.clone())
            .collect()
    }

    async fn begin(&self, id: &str) -> DbResult<()> {
        if !self.transactional {
            return Err(DbError::unsupported("transactions", &self.name));
        }
        self.record("begin");
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.begin_failure.take() {
            return Err(e);
        }
        if state.transactions.iter().any(|(open, _)| open == id) {
            return Err(DbError::logic(format!(
                "transaction '{id}' already open on '{}'",
                self.name
            )));
        }
        let level = state.default_isolation.unwrap_or(IsolationLevel::ReadCommitted);
        state.transactions.push((id.to_string(), level));
        Ok(())
    }

    async fn commit(&self, id: &str) -> DbResult<()> {
        self.record("commit");
        if let Some(e) = self.state.lock().unwrap().commit_failure.take() {
            return Err(e);
        }
        self.close_transaction(id)
    }

    async fn rollback(&self, id: &str) -> DbResult<()> {
        self.record("rollback");
        let closed = self.close_transaction(id);
        match self.state.lock().unwrap().rollback_failure.take() {
            Some(e) => Err(e),
            None => closed,
        }
    }

    async fn isolation_level(&self, session: &Session) -> DbResult<IsolationLevel> {
        let default = self
            .state
            .lock()
            .unwrap()
            .default_isolation
            .ok_or_else(|| DbError::unsupported("isolation levels", &self.name))?;
        match session {
            Session::Autocommit { isolation } => Ok(isolation.unwrap_or(default)),
            Session::Transaction(id) => self
                .transaction_isolation(id)
                .ok_or_else(|| DbError::logic(format!("transaction '{id}' is not open"))),
        }
    }

    async fn set_isolation_level(&self, session: &Session, level: IsolationLevel) -> DbResult<()> {
        if !self.transactional {
            return Err(DbError::unsupported("isolation levels", &self.name));
        }
        self.record(format!("isolation={}", level.as_sql()));
        let mut state = self.state.lock().unwrap();
        if let Some(e) = state.isolation_failure.take() {
            return Err(e);
        }
        if let Session::Transaction(id) = session {
            let open = state
                .transactions
                .iter_mut()
                .find(|(open, _)| open == id)
                .ok_or_else(|| DbError::logic(format!("transaction '{id}' is not open")))?;
            open.1 = level;
        }
        Ok(())
    }

    async fn close(&self) {
        self.record("close");
    }
}

/// A registry of mock adapters sharing one journal. The first name is the
/// default connection.
pub struct Harness {
    pub journal: Journal,
    pub registry: Arc<AdapterRegistry>,
    adapters: HashMap<String, Arc<MockAdapter>>,
}

impl Harness {
    pub fn new(names: &[&str]) -> Self {
        Self::build(names, &[])
    }

    /// Like [`Harness::new`], with `plain` connections lacking transaction support.
    pub fn build(names: &[&str], plain: &[&str]) -> Self {
        let journal: Journal = Arc::new(Mutex::new(Vec::new()));
        let default = names.first().or(plain.first()).copied().unwrap_or("main");
        let mut registry = AdapterRegistry::new(default);
        let mut adapters = HashMap::new();

        let all = names
            .iter()
            .map(|n| (*n, MockAdapter::new(n, &journal)))
            .chain(plain.iter().map(|n| (*n, MockAdapter::plain(n, &journal))));
        for (name, adapter) in all {
            let adapter = Arc::new(adapter);
            registry.register(name, adapter.clone()).unwrap();
            adapters.insert(name.to_string(), adapter);
        }

        Self {
            journal,
            registry: Arc::new(registry),
            adapters,
        }
    }

    pub fn adapter(&self, name: &str) -> &Arc<MockAdapter> {
        &self.adapters[name]
    }

    pub fn executor(&self, pipeline: Pipeline) -> Executor {
        Executor::new(Arc::clone(&self.registry), pipeline)
    }

    pub fn entries(&self) -> Vec<String> {
        self.journal.lock().unwrap().clone()
    }

    pub fn clear(&self) {
        self.journal.lock().unwrap().clear();
    }
}

pub fn connection_of(result: &ResultSet) -> String {
    result
        .scalar("connection")
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}
