//! courtbook — turns reservation commands sent by email into court bookings.

pub mod command;
pub mod config;
pub mod error;
pub mod executor;
pub mod ledger;
pub mod mail;
pub mod poller;
