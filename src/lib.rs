//! Leave balance accounting and request adjudication core
//!
//! An append-only ledger of balance transactions per employee and leave
//! type, an accrual engine with carryover handling, entitlement
//! resolution with overrides, a request approval state machine with
//! delegation and SLA escalation, and an at-least-once sync worker
//! toward payroll and time management. Backed by sled, encoded with
//! minicbor.

pub mod accrual;
pub mod audit;
pub mod calendar;
pub mod delegation;
pub mod directory;
pub mod entitlement;
pub mod error;
pub mod ledger;
mod locks;
pub mod notify;
pub mod policy;
pub mod request;
pub mod service;
pub mod sync;
pub mod types;
pub mod utils;
