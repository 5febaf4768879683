//! Ledger Sync Service - keeps a local budgeting ledger in step with an
//! external bank-data provider.

pub mod config;
pub mod dtos;
pub mod handlers;
pub mod middleware;
pub mod models;
pub mod services;
pub mod startup;
pub mod sync;
