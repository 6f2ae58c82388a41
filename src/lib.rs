//! # Ticket Corpus
//!
//! Builds a scored text corpus from issue-tracker records stored in SQLite,
//! and keeps going when the database is slow, the input is messy, or the
//! run is interrupted.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────┐   ┌──────────┐   ┌──────────┐   ┌──────────┐
//! │ records  │──▶│ Grouping │──▶│ Batches  │──▶│  Scorer  │
//! │ (SQLite) │   │  Engine  │   │ (packed) │   │          │
//! └──────────┘   └──────────┘   └──────────┘   └────┬─────┘
//!       ▲                                           │
//!       │          ┌──────────────────┐             ▼
//!       └──────────│  ResilientStore  │◀──── RecoveryManager
//!                  │ timeout + retry  │      retries, checkpoints
//!                  └──────────────────┘
//! ```
//!
//! ## Quick Start
//!
//! ```bash
//! tcorp init                    # create database
//! tcorp build                   # group, score and persist every record
//! tcorp build --resume          # continue from the latest checkpoint
//! tcorp stats                   # corpus overview
//! tcorp errors                  # recovery report
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`models`] | Core data types |
//! | [`store`] | Timeout- and retry-wrapped database access |
//! | [`grouping`] | Bounded relation grouping |
//! | [`recovery`] | Error classification, retries, checkpoints |
//! | [`scorer`] | Scorer abstraction |
//! | [`pipeline`] | Build orchestration |
//! | [`progress`] | Build progress on stderr |
//! | [`stats`] | Database statistics |
//! | [`history`] | Checkpoint and error listings |
//! | [`logging`] | Tracing subscriber setup |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |

pub mod config;
pub mod db;
pub mod grouping;
pub mod history;
pub mod logging;
pub mod migrate;
pub mod models;
pub mod pipeline;
pub mod progress;
pub mod recovery;
pub mod scorer;
pub mod stats;
pub mod store;
