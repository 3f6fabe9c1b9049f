use std::collections::HashMap;
use std::io::Read;
use std::path::{Path, PathBuf};

use crate::config::Options;
use crate::pool::ProcessPool;
use crate::rules::RepoRule;

pub(crate) mod fast_import;
pub(crate) mod prefix;

pub use fast_import::{FastImportRepository, FastImportTransaction};
pub use prefix::{PrefixingRepository, PrefixingTransaction};

// some versions of git fast-import are buggy for larger values of maxMark
pub(crate) const MAX_MARK: u32 = (1 << 20) - 1;

#[derive(Debug)]
pub enum EmitError {
    CreateRepoError {
        name: String,
        error: std::io::Error,
    },
    GitInitError {
        name: String,
        error: std::io::Error,
    },
    GitInitFailed {
        name: String,
        status: std::process::ExitStatus,
    },
    CreateMarksFileError {
        path: PathBuf,
        error: std::io::Error,
    },
    OpenLogError {
        path: PathBuf,
        error: std::io::Error,
    },
    ReadLogError {
        path: PathBuf,
        error: std::io::Error,
    },
    RewindLogError {
        path: PathBuf,
        error: std::io::Error,
    },
    RestoreLogError {
        path: PathBuf,
        error: std::io::Error,
    },
    SpawnImporterError {
        name: String,
        error: std::io::Error,
    },
    ImporterCrashed {
        name: String,
    },
    ImporterNotRunning {
        name: String,
    },
    ImporterWriteError {
        name: String,
        error: std::io::Error,
    },
    BlobSizeMismatch {
        path: Vec<u8>,
        expected: u64,
        written: u64,
    },
    UnknownSourceBranch {
        name: String,
        branch: String,
        from_branch: String,
    },
}

impl std::error::Error for EmitError {}

impl std::fmt::Display for EmitError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match *self {
            Self::CreateRepoError {
                ref name,
                ref error,
            } => {
                write!(f, "failed to create repository directory {name:?}: {error}")
            }
            Self::GitInitError {
                ref name,
                ref error,
            } => {
                write!(f, "failed to run \"git --bare init\" in {name:?}: {error}")
            }
            Self::GitInitFailed { ref name, status } => {
                write!(f, "\"git --bare init\" in {name:?} exited with {status}")
            }
            Self::CreateMarksFileError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to create marks file {path:?}: {error}")
            }
            Self::OpenLogError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to open log file {path:?}: {error}")
            }
            Self::ReadLogError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to read log file {path:?}: {error}")
            }
            Self::RewindLogError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to rewind log file {path:?}: {error}")
            }
            Self::RestoreLogError {
                ref path,
                ref error,
            } => {
                write!(f, "failed to restore log file {path:?}: {error}")
            }
            Self::SpawnImporterError {
                ref name,
                ref error,
            } => {
                write!(f, "failed to spawn importer for repository {name:?}: {error}")
            }
            Self::ImporterCrashed { ref name } => {
                write!(
                    f,
                    "importer for repository {name:?} has been started once and crashed",
                )
            }
            Self::ImporterNotRunning { ref name } => {
                write!(f, "importer for repository {name:?} is not running")
            }
            Self::ImporterWriteError {
                ref name,
                ref error,
            } => {
                write!(f, "failed to write to importer for repository {name:?}: {error}")
            }
            Self::BlobSizeMismatch {
                ref path,
                expected,
                written,
            } => {
                write!(
                    f,
                    "blob \"{}\" ended after {written} of {expected} bytes",
                    path.escape_ascii(),
                )
            }
            Self::UnknownSourceBranch {
                ref name,
                ref branch,
                ref from_branch,
            } => {
                write!(
                    f,
                    "{branch:?} in repository {name:?} is branching from unknown branch {from_branch:?}",
                )
            }
        }
    }
}

pub enum Repository {
    Emitting(FastImportRepository),
    Prefixing(PrefixingRepository),
}

impl Repository {
    pub fn create_branch(
        &mut self,
        branch: &str,
        revnum: u32,
        from_branch: &str,
        from_revnum: u32,
    ) -> Result<(), EmitError> {
        match self {
            Self::Emitting(repo) => repo.create_branch(branch, revnum, from_branch, from_revnum),
            Self::Prefixing(repo) => repo.create_branch(branch, revnum, from_branch, from_revnum),
        }
    }

    pub fn delete_branch(&mut self, branch: &str, revnum: u32) -> Result<(), EmitError> {
        match self {
            Self::Emitting(repo) => repo.delete_branch(branch, revnum),
            Self::Prefixing(repo) => repo.delete_branch(branch, revnum),
        }
    }

    pub fn new_transaction(
        &mut self,
        branch: &str,
        svnprefix: &str,
        revnum: u32,
    ) -> Result<Transaction, EmitError> {
        match self {
            Self::Emitting(repo) => repo
                .new_transaction(branch, svnprefix, revnum)
                .map(Transaction::Emitting),
            Self::Prefixing(repo) => repo
                .new_transaction(branch, svnprefix, revnum)
                .map(Transaction::Prefixing),
        }
    }

    pub fn setup_incremental(&mut self, cutoff: &mut u32) -> Result<u32, EmitError> {
        match self {
            Self::Emitting(repo) => repo.setup_incremental(cutoff),
            Self::Prefixing(repo) => repo.setup_incremental(cutoff),
        }
    }

    pub fn restore_log(&mut self) -> Result<(), EmitError> {
        match self {
            Self::Emitting(repo) => repo.restore_log(),
            Self::Prefixing(repo) => repo.restore_log(),
        }
    }

    pub fn create_annotated_tag(
        &mut self,
        ref_name: &str,
        svnprefix: &str,
        revnum: u32,
        author: &[u8],
        timestamp: u64,
        log: &[u8],
    ) {
        match self {
            Self::Emitting(repo) => {
                repo.create_annotated_tag(ref_name, svnprefix, revnum, author, timestamp, log);
            }
            Self::Prefixing(repo) => {
                repo.create_annotated_tag(ref_name, svnprefix, revnum, author, timestamp, log);
            }
        }
    }

    pub fn finalize_tags(&mut self) -> Result<(), EmitError> {
        match self {
            Self::Emitting(repo) => repo.finalize_tags(),
            Self::Prefixing(repo) => repo.finalize_tags(),
        }
    }

    pub fn close(&mut self) {
        match self {
            Self::Emitting(repo) => repo.close(),
            Self::Prefixing(repo) => repo.close(),
        }
    }
}

pub enum Transaction {
    Emitting(FastImportTransaction),
    Prefixing(PrefixingTransaction),
}

impl Transaction {
    pub fn set_author(&mut self, author: &[u8]) {
        match self {
            Self::Emitting(txn) => txn.set_author(author),
            Self::Prefixing(txn) => txn.set_author(author),
        }
    }

    pub fn set_date_time(&mut self, timestamp: u64) {
        match self {
            Self::Emitting(txn) => txn.set_date_time(timestamp),
            Self::Prefixing(txn) => txn.set_date_time(timestamp),
        }
    }

    pub fn set_log(&mut self, log: &[u8]) {
        match self {
            Self::Emitting(txn) => txn.set_log(log),
            Self::Prefixing(txn) => txn.set_log(log),
        }
    }

    pub fn note_copy_from_branch(&mut self, from_branch: &str, from_revnum: u32) {
        match self {
            Self::Emitting(txn) => txn.note_copy_from_branch(from_branch, from_revnum),
            Self::Prefixing(txn) => txn.note_copy_from_branch(from_branch, from_revnum),
        }
    }

    pub fn delete_file(&mut self, path: &[u8]) {
        match self {
            Self::Emitting(txn) => txn.delete_file(path),
            Self::Prefixing(txn) => txn.delete_file(path),
        }
    }

    pub fn add_file(
        &mut self,
        path: &[u8],
        mode: u32,
        length: u64,
        data: &mut dyn Read,
    ) -> Result<(), EmitError> {
        match self {
            Self::Emitting(txn) => txn.add_file(path, mode, length, data),
            Self::Prefixing(txn) => txn.add_file(path, mode, length, data),
        }
    }

    pub fn commit(self, pool: &mut ProcessPool) -> Result<(), EmitError> {
        match self {
            Self::Emitting(txn) => txn.commit(pool),
            Self::Prefixing(txn) => txn.commit(pool),
        }
    }
}

/// Builds the repository a rule targets: an emitting repository, or a
/// prefixing facade over the repository the rule forwards to. An unknown
/// forward target is reported and yields `None`.
pub fn make_repository(
    rule: &RepoRule,
    repositories: &HashMap<String, Repository>,
    options: &Options,
    work_dir: &Path,
) -> Result<Option<Repository>, EmitError> {
    let target = match rule.forward_to.as_deref() {
        None | Some("") => {
            let repo = FastImportRepository::new(rule, options, work_dir)?;
            return Ok(Some(Repository::Emitting(repo)));
        }
        Some(target) => target,
    };

    match repositories.get(target) {
        None => {
            tracing::error!(
                "no repository with name {target:?} found for {:?}",
                rule.name,
            );
            Ok(None)
        }
        Some(Repository::Emitting(inner)) => Ok(Some(Repository::Prefixing(
            PrefixingRepository::new(inner, &rule.prefix),
        ))),
        Some(Repository::Prefixing(inner)) => {
            Ok(Some(Repository::Prefixing(inner.with_prefix(&rule.prefix))))
        }
    }
}
