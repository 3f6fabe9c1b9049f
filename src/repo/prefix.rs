use std::io::Read;

use crate::pool::ProcessPool;
use crate::repo::fast_import::{FastImportRepository, FastImportTransaction};
use crate::repo::EmitError;

/// Rewrites file paths with a fixed prefix and forwards everything else to
/// the underlying repository, so several SVN paths can land in one Git
/// repository.
pub struct PrefixingRepository {
    inner: FastImportRepository,
    prefix: String,
}

impl PrefixingRepository {
    pub fn new(inner: &FastImportRepository, prefix: &str) -> Self {
        Self {
            inner: inner.clone_handle(),
            prefix: prefix.to_string(),
        }
    }

    pub(crate) fn with_prefix(&self, prefix: &str) -> Self {
        Self {
            inner: self.inner.clone_handle(),
            prefix: format!("{}{}", self.prefix, prefix),
        }
    }

    pub fn create_branch(
        &mut self,
        branch: &str,
        revnum: u32,
        from_branch: &str,
        from_revnum: u32,
    ) -> Result<(), EmitError> {
        self.inner
            .create_branch(branch, revnum, from_branch, from_revnum)
    }

    pub fn delete_branch(&mut self, branch: &str, revnum: u32) -> Result<(), EmitError> {
        self.inner.delete_branch(branch, revnum)
    }

    pub fn new_transaction(
        &mut self,
        branch: &str,
        svnprefix: &str,
        revnum: u32,
    ) -> Result<PrefixingTransaction, EmitError> {
        Ok(PrefixingTransaction {
            inner: self.inner.new_transaction(branch, svnprefix, revnum)?,
            prefix: self.prefix.clone(),
        })
    }

    // resuming is the inner repository's responsibility
    pub fn setup_incremental(&mut self, _cutoff: &mut u32) -> Result<u32, EmitError> {
        Ok(1)
    }

    pub fn restore_log(&mut self) -> Result<(), EmitError> {
        Ok(())
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
        self.inner
            .create_annotated_tag(ref_name, svnprefix, revnum, author, timestamp, log);
    }

    // the loop that calls this will also invoke it on the inner repository
    pub fn finalize_tags(&mut self) -> Result<(), EmitError> {
        Ok(())
    }

    pub fn close(&mut self) {
        self.inner.close();
    }
}

pub struct PrefixingTransaction {
    inner: FastImportTransaction,
    prefix: String,
}

impl PrefixingTransaction {
    pub fn set_author(&mut self, author: &[u8]) {
        self.inner.set_author(author);
    }

    pub fn set_date_time(&mut self, timestamp: u64) {
        self.inner.set_date_time(timestamp);
    }

    pub fn set_log(&mut self, log: &[u8]) {
        self.inner.set_log(log);
    }

    pub fn note_copy_from_branch(&mut self, from_branch: &str, from_revnum: u32) {
        self.inner.note_copy_from_branch(from_branch, from_revnum);
    }

    pub fn delete_file(&mut self, path: &[u8]) {
        let path = self.prefixed(path);
        self.inner.delete_file(&path);
    }

    pub fn add_file(
        &mut self,
        path: &[u8],
        mode: u32,
        length: u64,
        data: &mut dyn Read,
    ) -> Result<(), EmitError> {
        let path = self.prefixed(path);
        self.inner.add_file(&path, mode, length, data)
    }

    pub fn commit(self, pool: &mut ProcessPool) -> Result<(), EmitError> {
        self.inner.commit(pool)
    }

    fn prefixed(&self, path: &[u8]) -> Vec<u8> {
        let mut prefixed = Vec::with_capacity(self.prefix.len() + path.len());
        prefixed.extend_from_slice(self.prefix.as_bytes());
        prefixed.extend_from_slice(path);
        prefixed
    }
}
