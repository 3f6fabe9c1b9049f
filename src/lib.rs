#![warn(
    rust_2018_idioms,
    trivial_casts,
    trivial_numeric_casts,
    unreachable_pub,
    unused_qualifications
)]

mod config;
mod marks;
mod pool;
mod progress;
mod repo;
mod rules;

pub use config::Options;
pub use pool::ProcessPool;
pub use repo::{
    make_repository, EmitError, FastImportRepository, FastImportTransaction, PrefixingRepository,
    PrefixingTransaction, Repository, Transaction,
};
pub use rules::RepoRule;
