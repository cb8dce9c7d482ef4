//! Credential handling: password digests, salts, and the login and
//! registration pipelines.
//!
//! Clients never send plaintext passwords; they send a client-side hash. The
//! server strengthens that value with a server-wide salt plus a per-account
//! salt through an iterated digest chain, computed off the simulation thread.
//! Comparison against the stored digest is constant-time.

use std::sync::Arc;

use log::{error, warn};
use rand::rngs::OsRng;
use rand::RngCore;
use sha2::{Digest, Sha256};
use thiserror::Error;

use shared::packets::{LoginFailureReason, Packet, RegisterFailureReason};
use shared::{MAX_EMAIL_LENGTH, MAX_LOGIN_LENGTH, MAX_PASSWORD_HASH_LENGTH};

use crate::app::ServerApp;
use crate::database::{
    statements, DatabaseError, DatabaseValue, Transaction,
};
use crate::session::{AuthState, SessionHandle};

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("system randomness unavailable: {0}")]
    Rng(#[from] rand::Error),
}

/// Iterated salted digest over client password hashes.
///
/// The parameters are part of the stored-credential format: changing them
/// invalidates every existing account digest.
#[derive(Debug, Clone)]
pub struct PasswordHasher {
    global_salt: String,
    iterations: u32,
    output_len: usize,
}

impl PasswordHasher {
    pub fn new(global_salt: &str, iterations: u32, output_len: usize) -> Self {
        Self {
            global_salt: global_salt.to_string(),
            iterations: iterations.max(1),
            output_len: output_len.clamp(1, 32),
        }
    }

    /// Computes the stored digest for a client hash and per-account salt,
    /// as lowercase hex.
    pub fn hash(&self, client_hash: &str, account_salt: &str) -> String {
        let mut digest: [u8; 32] = Sha256::new()
            .chain_update(self.global_salt.as_bytes())
            .chain_update(account_salt.as_bytes())
            .chain_update(client_hash.as_bytes())
            .finalize()
            .into();

        for _ in 1..self.iterations {
            digest = Sha256::digest(digest).into();
        }

        hex_encode(&digest[..self.output_len])
    }
}

/// Compares two byte strings without short-circuiting on the first
/// difference.
pub fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut acc = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        acc |= x ^ y;
    }
    acc == 0
}

/// Generates a fresh 32-byte per-account salt, hex encoded.
pub fn generate_salt() -> Result<String, AuthError> {
    let mut bytes = [0u8; 32];
    OsRng.try_fill_bytes(&mut bytes)?;
    Ok(hex_encode(&bytes))
}

pub fn hex_encode(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        out.push(char::from_digit(u32::from(byte >> 4), 16).unwrap_or('0'));
        out.push(char::from_digit(u32::from(byte & 0x0F), 16).unwrap_or('0'));
    }
    out
}

/// Shape check for email addresses: one `@`, a non-empty local part, a
/// dotted domain, and no whitespace.
pub fn is_valid_email(email: &str) -> bool {
    if email.is_empty() || email.len() > MAX_EMAIL_LENGTH {
        return false;
    }
    if email.chars().any(char::is_whitespace) {
        return false;
    }

    let mut parts = email.split('@');
    let (Some(local), Some(domain), None) = (parts.next(), parts.next(), parts.next()) else {
        return false;
    };

    !local.is_empty()
        && !domain.is_empty()
        && domain.contains('.')
        && !domain.starts_with('.')
        && !domain.ends_with('.')
}

pub fn is_valid_login(login: &str) -> bool {
    !login.is_empty()
        && login.len() <= MAX_LOGIN_LENGTH
        && login
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
}

fn is_valid_client_hash(hash: &str) -> bool {
    !hash.is_empty() && hash.len() <= MAX_PASSWORD_HASH_LENGTH
}

fn login_failed(app: &mut ServerApp, handle: SessionHandle, reason: LoginFailureReason) {
    if let Some(session) = app.sessions.resolve_mut(handle) {
        session.auth_state = AuthState::Unauthenticated;
        session.send_packet(&Packet::LoginFailure { reason });
    }
}

fn register_failed(app: &mut ServerApp, handle: SessionHandle, reason: RegisterFailureReason) {
    if let Some(session) = app.sessions.resolve_mut(handle) {
        session.auth_state = AuthState::Unauthenticated;
        session.send_packet(&Packet::RegisterFailure { reason });
    }
}

/// Entry point for a `Login` packet.
pub fn handle_login(app: &mut ServerApp, peer_id: u32, login: String, client_hash: String) {
    let Some(session) = app.sessions.get_mut(peer_id) else {
        return;
    };
    let handle = session.handle();

    if !is_valid_login(&login) || !is_valid_client_hash(&client_hash) {
        warn!("peer {} sent malformed credentials", peer_id);
        session.send_packet(&Packet::LoginFailure {
            reason: LoginFailureReason::AccountNotFound,
        });
        return;
    }

    session.auth_state = AuthState::Authenticating;

    app.database.execute_prepared(
        statements::FIND_ACCOUNT_BY_LOGIN,
        vec![DatabaseValue::Text(login.clone())],
        Box::new(move |app, result| {
            let result = match result {
                Ok(result) => result,
                Err(err) => {
                    error!("account lookup failed for {:?}: {}", login, err);
                    login_failed(app, handle, LoginFailureReason::ServerError);
                    return;
                }
            };

            let Some(row) = result.rows.first() else {
                login_failed(app, handle, LoginFailureReason::AccountNotFound);
                return;
            };

            let parsed = (
                row.first().and_then(DatabaseValue::as_i32),
                row.get(1).and_then(DatabaseValue::as_text),
                row.get(2).and_then(DatabaseValue::as_text),
            );
            let (Some(account_id), Some(stored), Some(salt)) = parsed else {
                error!("account row for {:?} has unexpected shape", login);
                login_failed(app, handle, LoginFailureReason::ServerError);
                return;
            };

            if app.sessions.resolve(handle).is_none() {
                return;
            }

            let stored = stored.to_string();
            let salt = salt.to_string();
            let hasher = Arc::clone(&app.hasher);
            let callback_tx = app.callback_tx.clone();

            tokio::spawn(async move {
                let computed = tokio::task::spawn_blocking(move || {
                    hasher.hash(&client_hash, &salt)
                })
                .await;

                let matched = match computed {
                    Ok(digest) => constant_time_eq(digest.as_bytes(), stored.as_bytes()),
                    Err(err) => {
                        error!("password hashing task failed: {}", err);
                        false
                    }
                };

                let _ = callback_tx.send(Box::new(move |app: &mut ServerApp| {
                    finish_login(app, handle, account_id, login, matched);
                }));
            });
        }),
    );
}

fn finish_login(
    app: &mut ServerApp,
    handle: SessionHandle,
    account_id: i32,
    login: String,
    matched: bool,
) {
    if !matched {
        login_failed(app, handle, LoginFailureReason::PasswordMismatch);
        return;
    }

    let Some(session) = app.sessions.resolve_mut(handle) else {
        return;
    };

    session.auth_state = AuthState::Authenticated;
    session.database_id = Some(account_id);
    session.login = login.clone();
    session.display_name = login.clone();
    session.send_packet(&Packet::LoginSuccess);
    log::info!("peer {} authenticated as {:?}", handle.peer_id, login);

    app.database.execute_prepared(
        statements::LOAD_ACCOUNT,
        vec![DatabaseValue::Int32(account_id)],
        Box::new(move |app, result| {
            let row = match result {
                Ok(result) => result.rows.into_iter().next(),
                Err(err) => {
                    error!("failed to load account {}: {}", account_id, err);
                    return;
                }
            };
            let Some(row) = row else { return };

            if let Some(session) = app.sessions.resolve_mut(handle) {
                if let Some(display_name) = row.get(1).and_then(DatabaseValue::as_text) {
                    session.display_name = display_name.to_string();
                }
                if let Some(level) = row.get(2).and_then(DatabaseValue::as_i32) {
                    session.permission_level = level.clamp(0, i32::from(u16::MAX)) as u16;
                }
            }
        }),
    );

    // Fire and forget; a failed timestamp update must not affect the session.
    let now = unix_timestamp();
    app.database.execute_prepared(
        statements::UPDATE_LAST_LOGIN_DATE,
        vec![
            DatabaseValue::Int32(account_id),
            DatabaseValue::Int64(now),
        ],
        Box::new(move |_, result| {
            if let Err(err) = result {
                error!("failed to update last login date for {}: {}", account_id, err);
            }
        }),
    );
}

/// Entry point for a `Register` packet.
pub fn handle_register(
    app: &mut ServerApp,
    peer_id: u32,
    login: String,
    email: String,
    client_hash: String,
) {
    let Some(session) = app.sessions.get_mut(peer_id) else {
        return;
    };
    let handle = session.handle();

    if !is_valid_login(&login) || !is_valid_email(&email) || !is_valid_client_hash(&client_hash) {
        warn!("peer {} sent malformed registration", peer_id);
        session.send_packet(&Packet::RegisterFailure {
            reason: RegisterFailureReason::ServerError,
        });
        return;
    }

    session.auth_state = AuthState::Authenticating;

    let hasher = Arc::clone(&app.hasher);
    let callback_tx = app.callback_tx.clone();

    tokio::spawn(async move {
        let prepared = tokio::task::spawn_blocking(move || -> Result<(String, String), AuthError> {
            let salt = generate_salt()?;
            let digest = hasher.hash(&client_hash, &salt);
            Ok((salt, digest))
        })
        .await;

        let _ = callback_tx.send(Box::new(move |app: &mut ServerApp| {
            match prepared {
                Ok(Ok((salt, digest))) => {
                    store_account(app, handle, login, email, digest, salt);
                }
                Ok(Err(err)) => {
                    error!("salt generation failed: {}", err);
                    register_failed(app, handle, RegisterFailureReason::ServerError);
                }
                Err(err) => {
                    error!("registration hashing task failed: {}", err);
                    register_failed(app, handle, RegisterFailureReason::ServerError);
                }
            }
        }));
    });
}

fn store_account(
    app: &mut ServerApp,
    handle: SessionHandle,
    login: String,
    email: String,
    digest: String,
    salt: String,
) {
    if app.sessions.resolve(handle).is_none() {
        return;
    }

    let mut tx = Transaction::new();
    tx.append_prepared_with(
        statements::REGISTER_ACCOUNT,
        vec![
            DatabaseValue::Text(login.clone()),
            DatabaseValue::Text(login.clone()),
            DatabaseValue::Text(digest),
            DatabaseValue::Text(salt),
            DatabaseValue::Text(email),
        ],
        Box::new(|tx, result| {
            // New accounts start with a default spaceship tied to their row.
            let account_id = result
                .rows
                .first()
                .and_then(|row| row.first())
                .and_then(DatabaseValue::as_i32)
                .ok_or(DatabaseError::BadParameters)?;

            tx.append_prepared(
                statements::CREATE_SPACESHIP,
                vec![
                    DatabaseValue::Int32(account_id),
                    DatabaseValue::Text("default".to_string()),
                ],
            );
            Ok(())
        }),
    );

    app.database.execute_transaction(
        tx,
        Box::new(move |app, outcome| match outcome {
            Ok(_) => {
                if let Some(session) = app.sessions.resolve_mut(handle) {
                    session.auth_state = AuthState::Unauthenticated;
                    session.send_packet(&Packet::RegisterSuccess);
                }
                log::info!("registered new account {:?}", login);
            }
            Err(DatabaseError::Duplicate(constraint)) => {
                let reason = if constraint.contains("email") {
                    RegisterFailureReason::EmailAlreadyTaken
                } else {
                    RegisterFailureReason::LoginAlreadyTaken
                };
                register_failed(app, handle, reason);
            }
            Err(err) => {
                error!("registration for {:?} failed: {}", login, err);
                register_failed(app, handle, RegisterFailureReason::ServerError);
            }
        }),
    );
}

fn unix_timestamp() -> i64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    match SystemTime::now().duration_since(UNIX_EPOCH) {
        Ok(elapsed) => elapsed.as_secs() as i64,
        Err(_) => 0,
    }
}
