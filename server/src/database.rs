//! Asynchronous database engine.
//!
//! Statements are executed by a pool of dedicated worker threads so the
//! simulation thread never blocks on storage. Results come back as callbacks
//! queued onto the main loop, which runs them against the live server state.
//!
//! A [`Transaction`] is an ordered list of statements where any statement may
//! carry a continuation: code that inspects the statement's result and may
//! append further statements before the transaction commits. Any failure
//! rolls the whole transaction back.

use std::collections::VecDeque;
use std::sync::mpsc;
use std::sync::{Arc, Condvar, Mutex};
use std::thread;

use log::{error, info};
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;

use crate::app::{ServerApp, ServerCallback};

/// Prepared statement names understood by every backend.
pub mod statements {
    pub const FIND_ACCOUNT_BY_LOGIN: &str = "FindAccountByLogin";
    pub const LOAD_ACCOUNT: &str = "LoadAccount";
    pub const REGISTER_ACCOUNT: &str = "RegisterAccount";
    pub const UPDATE_LAST_LOGIN_DATE: &str = "UpdateLastLoginDate";
    pub const UPDATE_PERMISSION_LEVEL: &str = "UpdatePermissionLevel";
    pub const UPDATE_SPACESHIP_NAME: &str = "UpdateSpaceshipName";
    pub const CREATE_SPACESHIP: &str = "CreateSpaceship";
}

/// A typed parameter or result cell.
#[derive(Debug, Clone, PartialEq)]
pub enum DatabaseValue {
    Bool(bool),
    Int32(i32),
    Int64(i64),
    Text(String),
}

impl DatabaseValue {
    pub fn as_i32(&self) -> Option<i32> {
        match self {
            DatabaseValue::Int32(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_text(&self) -> Option<&str> {
        match self {
            DatabaseValue::Text(v) => Some(v),
            _ => None,
        }
    }
}

/// Result of one executed statement.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DatabaseResult {
    pub rows: Vec<Vec<DatabaseValue>>,
    pub affected_rows: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DatabaseError {
    #[error("unknown prepared statement {0:?}")]
    UnknownStatement(String),
    #[error("unique constraint {0:?} violated")]
    Duplicate(String),
    #[error("statement received malformed parameters")]
    BadParameters,
    #[error("backend failure: {0}")]
    Backend(String),
}

/// One statement to execute: raw SQL text or a named prepared statement with
/// bound parameters.
#[derive(Debug, Clone, PartialEq)]
pub enum Statement {
    Query(String),
    Prepared {
        name: String,
        params: Vec<DatabaseValue>,
    },
}

/// Runs against a statement's result inside the transaction and may append
/// follow-up statements. Returning an error aborts the transaction.
pub type Continuation =
    Box<dyn FnOnce(&mut Transaction, &DatabaseResult) -> Result<(), DatabaseError> + Send>;

struct Operation {
    statement: Statement,
    continuation: Option<Continuation>,
}

/// An ordered batch of statements committed atomically.
#[derive(Default)]
pub struct Transaction {
    operations: VecDeque<Operation>,
}

impl Transaction {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append_query(&mut self, query: &str) {
        self.operations.push_back(Operation {
            statement: Statement::Query(query.to_string()),
            continuation: None,
        });
    }

    pub fn append_prepared(&mut self, name: &str, params: Vec<DatabaseValue>) {
        self.operations.push_back(Operation {
            statement: Statement::Prepared {
                name: name.to_string(),
                params,
            },
            continuation: None,
        });
    }

    /// Appends a prepared statement whose result is fed to `continuation`
    /// before the next statement runs.
    pub fn append_prepared_with(
        &mut self,
        name: &str,
        params: Vec<DatabaseValue>,
        continuation: Continuation,
    ) {
        self.operations.push_back(Operation {
            statement: Statement::Prepared {
                name: name.to_string(),
                params,
            },
            continuation: Some(continuation),
        });
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }
}

/// One backend connection, owned by a single worker thread.
pub trait DatabaseConnection {
    fn begin(&mut self) -> Result<(), DatabaseError>;
    fn execute(&mut self, statement: &Statement) -> Result<DatabaseResult, DatabaseError>;
    fn commit(&mut self) -> Result<(), DatabaseError>;
    fn rollback(&mut self);
}

/// Produces one connection per worker thread.
pub type ConnectionFactory =
    Box<dyn Fn() -> Box<dyn DatabaseConnection + Send> + Send + Sync>;

/// Called on the main loop with the result of a standalone statement.
pub type QueryCallback =
    Box<dyn FnOnce(&mut ServerApp, Result<DatabaseResult, DatabaseError>) + Send>;

/// Called on the main loop once a transaction commits (with the results of
/// every statement, in order) or rolls back (with the error that aborted it).
pub type TransactionCallback =
    Box<dyn FnOnce(&mut ServerApp, Result<Vec<DatabaseResult>, DatabaseError>) + Send>;

enum Job {
    Query {
        statement: Statement,
        callback: QueryCallback,
    },
    Transaction {
        transaction: Transaction,
        callback: TransactionCallback,
    },
}

/// Handle to the worker pool. Dropping it closes the job queue; workers
/// drain what is left and exit.
pub struct Database {
    job_tx: mpsc::Sender<Job>,
}

impl Database {
    pub fn new(
        worker_count: usize,
        factory: ConnectionFactory,
        callback_tx: UnboundedSender<ServerCallback>,
    ) -> Self {
        let (job_tx, job_rx) = mpsc::channel::<Job>();
        let job_rx = Arc::new(Mutex::new(job_rx));
        let factory = Arc::new(factory);

        for worker_index in 0..worker_count.max(1) {
            let job_rx = Arc::clone(&job_rx);
            let factory = Arc::clone(&factory);
            let callback_tx = callback_tx.clone();

            thread::Builder::new()
                .name(format!("db-worker-{}", worker_index))
                .spawn(move || {
                    let mut connection = factory();
                    info!("database worker {} started", worker_index);
                    worker_loop(&mut *connection, &job_rx, &callback_tx);
                })
                .unwrap_or_else(|err| {
                    panic!("failed to spawn database worker: {}", err);
                });
        }

        Self { job_tx }
    }

    /// Queues a standalone prepared statement.
    pub fn execute_prepared(
        &self,
        name: &str,
        params: Vec<DatabaseValue>,
        callback: QueryCallback,
    ) {
        let job = Job::Query {
            statement: Statement::Prepared {
                name: name.to_string(),
                params,
            },
            callback,
        };
        if self.job_tx.send(job).is_err() {
            error!("database job queue closed; dropping statement {:?}", name);
        }
    }

    /// Queues a transaction.
    pub fn execute_transaction(&self, transaction: Transaction, callback: TransactionCallback) {
        if self
            .job_tx
            .send(Job::Transaction {
                transaction,
                callback,
            })
            .is_err()
        {
            error!("database job queue closed; dropping transaction");
        }
    }
}

fn worker_loop(
    connection: &mut dyn DatabaseConnection,
    job_rx: &Mutex<mpsc::Receiver<Job>>,
    callback_tx: &UnboundedSender<ServerCallback>,
) {
    loop {
        let job = {
            let Ok(guard) = job_rx.lock() else { return };
            guard.recv()
        };

        let Ok(job) = job else { return };

        match job {
            Job::Query {
                statement,
                callback,
            } => {
                let result = connection.execute(&statement);
                if let Err(ref err) = result {
                    error!("statement failed: {}", err);
                }
                let _ = callback_tx
                    .send(Box::new(move |app: &mut ServerApp| callback(app, result)));
            }
            Job::Transaction {
                transaction,
                callback,
            } => {
                let outcome = run_transaction(connection, transaction);
                if let Err(ref err) = outcome {
                    error!("transaction rolled back: {}", err);
                }
                let _ = callback_tx
                    .send(Box::new(move |app: &mut ServerApp| callback(app, outcome)));
            }
        }
    }
}

/// Executes a transaction on a connection: begin, statements in order with
/// their continuations, then commit. Any error rolls back and surfaces to the
/// caller.
pub fn run_transaction(
    connection: &mut dyn DatabaseConnection,
    mut transaction: Transaction,
) -> Result<Vec<DatabaseResult>, DatabaseError> {
    let mut results = Vec::new();

    connection.begin()?;

    while let Some(operation) = transaction.operations.pop_front() {
        let result = match connection.execute(&operation.statement) {
            Ok(result) => result,
            Err(err) => {
                connection.rollback();
                return Err(err);
            }
        };

        if let Some(continuation) = operation.continuation {
            if let Err(err) = continuation(&mut transaction, &result) {
                connection.rollback();
                return Err(err);
            }
        }

        results.push(result);
    }

    if let Err(err) = connection.commit() {
        connection.rollback();
        return Err(err);
    }

    Ok(results)
}

// ---------------------------------------------------------------------------
// In-memory backend
// ---------------------------------------------------------------------------

/// One stored account.
#[derive(Debug, Clone)]
pub struct AccountRow {
    pub id: i32,
    pub login: String,
    pub display_name: String,
    pub email: String,
    pub password: String,
    pub password_salt: String,
    pub permission_level: i32,
    pub last_login: Option<i64>,
}

#[derive(Debug, Clone)]
struct SpaceshipRow {
    id: i32,
    owner_id: i32,
    name: String,
}

/// Backing tables shared by every in-memory connection.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    accounts: Vec<AccountRow>,
    spaceships: Vec<SpaceshipRow>,
    next_account_id: i32,
    next_spaceship_id: i32,
}

impl MemoryStore {
    fn execute(&mut self, statement: &Statement) -> Result<DatabaseResult, DatabaseError> {
        match statement {
            // Raw queries carry no data the in-memory backend models.
            Statement::Query(_) => Ok(DatabaseResult::default()),
            Statement::Prepared { name, params } => self.execute_prepared(name, params),
        }
    }

    fn execute_prepared(
        &mut self,
        name: &str,
        params: &[DatabaseValue],
    ) -> Result<DatabaseResult, DatabaseError> {
        match name {
            statements::FIND_ACCOUNT_BY_LOGIN => {
                let [DatabaseValue::Text(login)] = params else {
                    return Err(DatabaseError::BadParameters);
                };

                let rows = self
                    .accounts
                    .iter()
                    .filter(|a| a.login.eq_ignore_ascii_case(login))
                    .map(|a| {
                        vec![
                            DatabaseValue::Int32(a.id),
                            DatabaseValue::Text(a.password.clone()),
                            DatabaseValue::Text(a.password_salt.clone()),
                        ]
                    })
                    .collect();

                Ok(DatabaseResult {
                    rows,
                    affected_rows: 0,
                })
            }
            statements::LOAD_ACCOUNT => {
                let [DatabaseValue::Int32(id)] = params else {
                    return Err(DatabaseError::BadParameters);
                };

                let rows = self
                    .accounts
                    .iter()
                    .filter(|a| a.id == *id)
                    .map(|a| {
                        vec![
                            DatabaseValue::Text(a.login.clone()),
                            DatabaseValue::Text(a.display_name.clone()),
                            DatabaseValue::Int32(a.permission_level),
                        ]
                    })
                    .collect();

                Ok(DatabaseResult {
                    rows,
                    affected_rows: 0,
                })
            }
            statements::REGISTER_ACCOUNT => {
                let [DatabaseValue::Text(login), DatabaseValue::Text(display_name), DatabaseValue::Text(password), DatabaseValue::Text(salt), DatabaseValue::Text(email)] =
                    params
                else {
                    return Err(DatabaseError::BadParameters);
                };

                let login_key = login.to_lowercase();
                let email_key = email.to_lowercase();

                if self.accounts.iter().any(|a| a.login.to_lowercase() == login_key) {
                    return Err(DatabaseError::Duplicate("account_login_unique".to_string()));
                }
                if self.accounts.iter().any(|a| a.email.to_lowercase() == email_key) {
                    return Err(DatabaseError::Duplicate("account_email_unique".to_string()));
                }

                let id = self.next_account_id;
                self.next_account_id += 1;
                self.accounts.push(AccountRow {
                    id,
                    login: login.clone(),
                    display_name: display_name.clone(),
                    email: email.clone(),
                    password: password.clone(),
                    password_salt: salt.clone(),
                    permission_level: 0,
                    last_login: None,
                });

                Ok(DatabaseResult {
                    rows: vec![vec![DatabaseValue::Int32(id)]],
                    affected_rows: 1,
                })
            }
            statements::UPDATE_LAST_LOGIN_DATE => {
                let [DatabaseValue::Int32(id), DatabaseValue::Int64(when)] = params else {
                    return Err(DatabaseError::BadParameters);
                };

                let mut affected = 0;
                for account in self.accounts.iter_mut().filter(|a| a.id == *id) {
                    account.last_login = Some(*when);
                    affected += 1;
                }

                Ok(DatabaseResult {
                    rows: Vec::new(),
                    affected_rows: affected,
                })
            }
            statements::UPDATE_PERMISSION_LEVEL => {
                let [DatabaseValue::Int32(id), DatabaseValue::Int32(level)] = params else {
                    return Err(DatabaseError::BadParameters);
                };

                let mut affected = 0;
                for account in self.accounts.iter_mut().filter(|a| a.id == *id) {
                    account.permission_level = *level;
                    affected += 1;
                }

                Ok(DatabaseResult {
                    rows: Vec::new(),
                    affected_rows: affected,
                })
            }
            statements::UPDATE_SPACESHIP_NAME => {
                let [DatabaseValue::Int32(owner_id), DatabaseValue::Text(name), DatabaseValue::Text(new_name)] =
                    params
                else {
                    return Err(DatabaseError::BadParameters);
                };

                let mut affected = 0;
                for ship in self
                    .spaceships
                    .iter_mut()
                    .filter(|s| s.owner_id == *owner_id && s.name == *name)
                {
                    ship.name = new_name.clone();
                    affected += 1;
                }

                Ok(DatabaseResult {
                    rows: Vec::new(),
                    affected_rows: affected,
                })
            }
            statements::CREATE_SPACESHIP => {
                let [DatabaseValue::Int32(owner_id), DatabaseValue::Text(name)] = params else {
                    return Err(DatabaseError::BadParameters);
                };

                let id = self.next_spaceship_id;
                self.next_spaceship_id += 1;
                self.spaceships.push(SpaceshipRow {
                    id,
                    owner_id: *owner_id,
                    name: name.clone(),
                });

                Ok(DatabaseResult {
                    rows: vec![vec![DatabaseValue::Int32(id)]],
                    affected_rows: 1,
                })
            }
            other => Err(DatabaseError::UnknownStatement(other.to_string())),
        }
    }
}

/// In-memory database shared by every connection it hands out.
#[derive(Debug, Clone, Default)]
pub struct MemoryDatabase {
    store: Arc<Mutex<MemoryStore>>,
    write_latch: Arc<WriteLatch>,
}

/// Exclusive latch held across a whole transaction. Connections on other
/// worker threads block in `begin` (or in a standalone write) until the
/// holder commits or rolls back, so a commit can never overwrite tables that
/// changed after its snapshot was taken.
#[derive(Debug, Default)]
struct WriteLatch {
    held: Mutex<bool>,
    released: Condvar,
}

impl WriteLatch {
    fn acquire(&self) -> Result<(), DatabaseError> {
        let mut held = self
            .held
            .lock()
            .map_err(|_| DatabaseError::Backend("write latch poisoned".to_string()))?;
        while *held {
            held = self
                .released
                .wait(held)
                .map_err(|_| DatabaseError::Backend("write latch poisoned".to_string()))?;
        }
        *held = true;
        Ok(())
    }

    fn release(&self) {
        if let Ok(mut held) = self.held.lock() {
            *held = false;
            self.released.notify_one();
        }
    }
}

impl MemoryDatabase {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn connection_factory(&self) -> ConnectionFactory {
        let store = Arc::clone(&self.store);
        let write_latch = Arc::clone(&self.write_latch);
        Box::new(move || {
            Box::new(MemoryConnection {
                store: Arc::clone(&store),
                write_latch: Arc::clone(&write_latch),
                working: None,
            })
        })
    }

    pub fn connect(&self) -> MemoryConnection {
        MemoryConnection {
            store: Arc::clone(&self.store),
            write_latch: Arc::clone(&self.write_latch),
            working: None,
        }
    }

    /// Inserts an account directly, bypassing the statement layer.
    pub fn seed_account(&self, account: AccountRow) {
        if let Ok(mut store) = self.store.lock() {
            store.next_account_id = store.next_account_id.max(account.id + 1);
            store.accounts.push(account);
        }
    }

    /// Inserts a spaceship row directly.
    pub fn seed_spaceship(&self, owner_id: i32, name: &str) {
        if let Ok(mut store) = self.store.lock() {
            let id = store.next_spaceship_id;
            store.next_spaceship_id += 1;
            store.spaceships.push(SpaceshipRow {
                id,
                owner_id,
                name: name.to_string(),
            });
        }
    }

    /// Reads an account back, for assertions.
    pub fn find_account(&self, login: &str) -> Option<AccountRow> {
        let store = self.store.lock().ok()?;
        store.accounts.iter().find(|a| a.login == login).cloned()
    }
}

/// Connection over the shared in-memory store. Transactions execute against
/// a working copy that replaces the shared tables on commit; the write latch
/// stays held from `begin` to `commit`/`rollback` so the snapshot cannot go
/// stale underneath the transaction.
pub struct MemoryConnection {
    store: Arc<Mutex<MemoryStore>>,
    write_latch: Arc<WriteLatch>,
    working: Option<MemoryStore>,
}

impl MemoryConnection {
    fn snapshot(&self) -> Result<MemoryStore, DatabaseError> {
        let store = self
            .store
            .lock()
            .map_err(|_| DatabaseError::Backend("store poisoned".to_string()))?;
        Ok(store.clone())
    }
}

impl DatabaseConnection for MemoryConnection {
    fn begin(&mut self) -> Result<(), DatabaseError> {
        self.write_latch.acquire()?;
        match self.snapshot() {
            Ok(snapshot) => {
                self.working = Some(snapshot);
                Ok(())
            }
            Err(err) => {
                self.write_latch.release();
                Err(err)
            }
        }
    }

    fn execute(&mut self, statement: &Statement) -> Result<DatabaseResult, DatabaseError> {
        if let Some(working) = self.working.as_mut() {
            return working.execute(statement);
        }

        // Standalone statement: latch briefly so it cannot land inside
        // another connection's begin/commit window and be lost.
        self.write_latch.acquire()?;
        let result = match self.store.lock() {
            Ok(mut store) => store.execute(statement),
            Err(_) => Err(DatabaseError::Backend("store poisoned".to_string())),
        };
        self.write_latch.release();
        result
    }

    fn commit(&mut self) -> Result<(), DatabaseError> {
        let Some(working) = self.working.take() else {
            return Ok(());
        };

        let result = match self.store.lock() {
            Ok(mut store) => {
                *store = working;
                Ok(())
            }
            Err(_) => Err(DatabaseError::Backend("store poisoned".to_string())),
        };
        self.write_latch.release();
        result
    }

    fn rollback(&mut self) {
        if self.working.take().is_some() {
            self.write_latch.release();
        }
    }
}
