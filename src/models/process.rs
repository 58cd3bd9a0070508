//! # Process Model
//!
//! A persisted instance of a business workflow.
//!
//! ## Database Schema
//!
//! Maps to the `processes` table:
//! ```sql
//! CREATE TABLE processes (
//!   id UUID PRIMARY KEY,
//!   process_type_id INTEGER NOT NULL,
//!   version BIGINT NOT NULL,
//!   lock_expiry_date TIMESTAMPTZ,
//!   date_created TIMESTAMPTZ NOT NULL
//! );
//! ```
//!
//! `version` is the optimistic concurrency token: every persisted change to the process or
//! any of its steps increments it, and every write is conditioned on the last-read value.
//! `lock_expiry_date` is the lease of the worker currently executing one of its steps.

use chrono::{DateTime, Utc};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq)]
pub struct Process<P> {
    pub id: Uuid,
    pub process_type_id: P,
    pub version: i64,
    pub lock_expiry_date: Option<DateTime<Utc>>,
    pub date_created: DateTime<Utc>,
}

impl<P> Process<P> {
    /// Version of a freshly created process
    pub const INITIAL_VERSION: i64 = 1;

    /// Whether a worker lease is still active at `now`
    pub fn is_locked_at(&self, now: DateTime<Utc>) -> bool {
        self.lock_expiry_date.is_some_and(|expiry| expiry > now)
    }

    pub fn is_locked(&self) -> bool {
        self.is_locked_at(Utc::now())
    }
}
