//! Beacon real-time server library.
//! This crate exposes internal modules for integration testing and for
//! embedding the delivery manager.
//! The binary entry point is in main.rs.

pub mod auth;
pub mod config;
pub mod db;
pub mod error;
pub mod notify;
pub mod presence;
pub mod push;
pub mod rooms;
pub mod routes;
pub mod state;
pub mod store;
pub mod ws;
