//! Authoritative arena server.
//!
//! The server owns all game state. Clients send inputs and account requests;
//! the server simulates, persists, and broadcasts. Everything mutable lives
//! on one thread inside [`app::ServerApp`]; network I/O, password hashing
//! and database access run elsewhere and report back through channels.

pub mod app;
pub mod arena;
pub mod auth;
pub mod config;
pub mod database;
pub mod entity;
pub mod network;
pub mod physics;
pub mod session;
