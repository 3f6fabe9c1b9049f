use std::cell::RefCell;
use std::collections::BTreeMap;
use std::io::{BufRead as _, Read, Write as _};
use std::path::{Path, PathBuf};
use std::rc::Rc;
use std::time::{Duration, Instant};

use crate::config::Options;
use crate::marks;
use crate::pool::ProcessPool;
use crate::progress;
use crate::repo::{EmitError, MAX_MARK};
use crate::rules::RepoRule;

const NULL_SHA: &str = "0000000000000000000000000000000000000000";

fn sanitized_name(name: &str) -> String {
    name.replace('/', "_")
}

fn marks_file_name(name: &str) -> String {
    format!("marks-{}", sanitized_name(name))
}

fn log_file_name(name: &str) -> String {
    format!("log-{}", sanitized_name(name))
}

fn qualified_ref(name: &str) -> String {
    if name.starts_with("refs/") {
        name.to_string()
    } else {
        format!("refs/heads/{name}")
    }
}

#[derive(Default)]
struct Branch {
    created: u32,
    commits: Vec<u32>,
    marks: Vec<u32>,
}

struct AnnotatedTag {
    supporting_ref: String,
    svnprefix: String,
    author: Vec<u8>,
    log: Vec<u8>,
    timestamp: u64,
    revnum: u32,
}

struct Importer {
    child: std::process::Child,
    stdin: std::process::ChildStdin,
}

pub(crate) struct RepoState {
    name: String,
    work_dir: PathBuf,
    options: Options,
    branches: BTreeMap<String, Branch>,
    annotated_tags: BTreeMap<String, AnnotatedTag>,
    commit_count: u32,
    outstanding_transactions: u32,
    // counts up from 0
    last_commit_mark: u32,
    // counts down from MAX_MARK, reset once no transaction is outstanding
    next_file_mark: u32,
    process_has_started: bool,
    importer: Option<Importer>,
}

impl RepoState {
    pub(crate) fn new(rule: &RepoRule, options: &Options, work_dir: &Path) -> Self {
        let mut branches = BTreeMap::new();
        for branch in &rule.branches {
            branches.insert(branch.clone(), Branch::default());
        }
        branches.entry("master".into()).or_default().created = 1;

        Self {
            name: rule.name.clone(),
            work_dir: work_dir.to_path_buf(),
            options: options.clone(),
            branches,
            annotated_tags: BTreeMap::new(),
            commit_count: 0,
            outstanding_transactions: 0,
            last_commit_mark: 0,
            next_file_mark: MAX_MARK,
            process_has_started: false,
            importer: None,
        }
    }

    fn repo_dir(&self) -> PathBuf {
        self.work_dir.join(&self.name)
    }

    fn marks_file_path(&self) -> PathBuf {
        self.repo_dir().join(marks_file_name(&self.name))
    }

    fn log_file_path(&self) -> PathBuf {
        self.work_dir.join(log_file_name(&self.name))
    }

    fn log_backup_path(&self) -> PathBuf {
        self.work_dir.join(format!("{}.old", log_file_name(&self.name)))
    }

    fn start_fast_import(&mut self) -> Result<(), EmitError> {
        if let Some(importer) = self.importer.as_mut() {
            if matches!(importer.child.try_wait(), Ok(None)) {
                return Ok(());
            }
            // the child exited behind our back
            self.importer = None;
        }

        if self.process_has_started {
            tracing::error!(
                "importer for repository {:?} has been started once and crashed?",
                self.name,
            );
            return Err(EmitError::ImporterCrashed {
                name: self.name.clone(),
            });
        }
        self.process_has_started = true;

        let log_path = self.log_file_path();
        let log_file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)
            .map_err(|e| EmitError::OpenLogError {
                path: log_path.clone(),
                error: e,
            })?;
        let log_file_err = log_file.try_clone().map_err(|e| EmitError::OpenLogError {
            path: log_path,
            error: e,
        })?;

        let mut command;
        if self.options.dry_run {
            command = std::process::Command::new("cat");
            command.current_dir(&self.work_dir);
        } else {
            let marks_file = marks_file_name(&self.name);
            command = std::process::Command::new("git");
            command
                .arg("fast-import")
                .arg(format!("--import-marks={marks_file}"))
                .arg(format!("--export-marks={marks_file}"))
                .arg("--force")
                .current_dir(self.repo_dir());
        }

        let mut child = command
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::from(log_file))
            .stderr(std::process::Stdio::from(log_file_err))
            .spawn()
            .map_err(|e| EmitError::SpawnImporterError {
                name: self.name.clone(),
                error: e,
            })?;
        let stdin = child.stdin.take().unwrap();
        self.importer = Some(Importer { child, stdin });

        self.reload_branches()
    }

    /// Re-anchors the freshly started importer to the branch tips replayed
    /// from the progress log.
    fn reload_branches(&mut self) -> Result<(), EmitError> {
        let mut out = String::new();
        for (branch, br) in &self.branches {
            match br.marks.last().copied() {
                None | Some(0) => continue,
                Some(last_mark) => {
                    let branch_ref = qualified_ref(branch);
                    out.push_str(&format!(
                        "reset {branch_ref}\nfrom :{last_mark}\n\n\
                         progress Branch {branch_ref} reloaded\n",
                    ));
                }
            }
        }
        if out.is_empty() {
            return Ok(());
        }
        self.write_import(out.as_bytes())
    }

    pub(crate) fn close_fast_import(&mut self) {
        if let Some(importer) = self.importer.take() {
            let Importer { mut child, mut stdin } = importer;
            let _ = stdin.write_all(b"checkpoint\n");
            let _ = stdin.flush();
            drop(stdin);

            if !wait_for_exit(&mut child, Duration::from_secs(30)) {
                let _ = child.kill();
                if !wait_for_exit(&mut child, Duration::from_millis(200)) {
                    tracing::warn!("importer for repository {:?} did not die", self.name);
                }
            }
        }
        self.process_has_started = false;
    }

    fn write_import(&mut self, data: &[u8]) -> Result<(), EmitError> {
        let Some(importer) = self.importer.as_mut() else {
            return Err(EmitError::ImporterNotRunning {
                name: self.name.clone(),
            });
        };
        importer
            .stdin
            .write_all(data)
            .map_err(|e| EmitError::ImporterWriteError {
                name: self.name.clone(),
                error: e,
            })
    }

    fn flush_import(&mut self) -> Result<(), EmitError> {
        let Some(importer) = self.importer.as_mut() else {
            return Err(EmitError::ImporterNotRunning {
                name: self.name.clone(),
            });
        };
        importer
            .stdin
            .flush()
            .map_err(|e| EmitError::ImporterWriteError {
                name: self.name.clone(),
                error: e,
            })
    }

    fn write_blob_body(
        &mut self,
        path: &[u8],
        length: u64,
        data: &mut dyn Read,
    ) -> Result<(), EmitError> {
        let Some(importer) = self.importer.as_mut() else {
            return Err(EmitError::ImporterNotRunning {
                name: self.name.clone(),
            });
        };
        let mut limited = Read::take(data, length);
        let written = std::io::copy(&mut limited, &mut importer.stdin).map_err(|e| {
            EmitError::ImporterWriteError {
                name: self.name.clone(),
                error: e,
            }
        })?;
        if written != length {
            return Err(EmitError::BlobSizeMismatch {
                path: path.to_vec(),
                expected: length,
                written,
            });
        }
        importer
            .stdin
            .write_all(b"\n")
            .map_err(|e| EmitError::ImporterWriteError {
                name: self.name.clone(),
                error: e,
            })
    }

    /// Resolves the mark of the commit on `from_branch` that covers
    /// `from_revnum`. `None` means the branch is unknown or has no history;
    /// `Some(0)` means the branch exists but has no commit at or before the
    /// revision. A non-empty `desc` gets the resolution appended to it.
    fn mark_from(&self, from_branch: &str, from_revnum: u32, desc: &mut String) -> Option<u32> {
        let br = self.branches.get(from_branch)?;
        if br.created == 0 {
            return None;
        }
        let (last_commit, last_mark) = br
            .commits
            .last()
            .copied()
            .zip(br.marks.last().copied())?;

        let (closest, mark) = if from_revnum == last_commit {
            (last_commit, last_mark)
        } else {
            let pos = br.commits.partition_point(|&commit| commit <= from_revnum);
            if pos == 0 {
                return Some(0);
            }
            (br.commits[pos - 1], br.marks[pos - 1])
        };

        if !desc.is_empty() {
            desc.push_str(&format!(" at r{from_revnum}"));
            if closest != from_revnum {
                desc.push_str(&format!(" => r{closest}"));
            }
        }

        Some(mark)
    }

    fn create_branch(
        &mut self,
        branch: &str,
        revnum: u32,
        from_branch: &str,
        from_revnum: u32,
    ) -> Result<(), EmitError> {
        self.start_fast_import()?;

        let mut desc = format!("from branch {from_branch}");
        let Some(mark) = self.mark_from(from_branch, from_revnum, &mut desc) else {
            tracing::error!(
                "{branch:?} in repository {:?} is branching from branch {from_branch:?} \
                 but the latter doesn't exist; cannot continue",
                self.name,
            );
            return Err(EmitError::UnknownSourceBranch {
                name: self.name.clone(),
                branch: branch.to_string(),
                from_branch: from_branch.to_string(),
            });
        };

        let from_ref;
        if mark == 0 {
            tracing::warn!(
                "{branch:?} in repository {:?} is branching but no exported commits exist \
                 in repository; creating an empty branch",
                self.name,
            );
            from_ref = qualified_ref(from_branch);
            desc.push_str(", deleted/unknown");
        } else {
            from_ref = format!(":{mark}");
        }

        tracing::debug!("creating branch {branch:?} from {from_branch:?} (r{from_revnum} {desc})");

        self.reset_branch(branch, revnum, mark, &from_ref, &desc)
    }

    fn delete_branch(&mut self, branch: &str, revnum: u32) -> Result<(), EmitError> {
        self.start_fast_import()?;
        self.reset_branch(branch, revnum, 0, NULL_SHA, "delete")
    }

    fn reset_branch(
        &mut self,
        branch: &str,
        revnum: u32,
        mark: u32,
        reset_to: &str,
        comment: &str,
    ) -> Result<(), EmitError> {
        let branch_ref = qualified_ref(branch);

        let mut out = String::new();
        {
            let br = self.branches.entry(branch.to_string()).or_default();
            if br.created != 0
                && br.created != revnum
                && br.marks.last().is_some_and(|&last_mark| last_mark != 0)
            {
                let backup_ref = format!("refs/backups/r{revnum}{}", &branch_ref["refs".len()..]);
                tracing::warn!("backing up branch {branch:?} to {backup_ref:?}");
                out.push_str(&format!("reset {backup_ref}\nfrom {branch_ref}\n\n"));
            }

            br.created = revnum;
            br.commits.push(revnum);
            br.marks.push(mark);
        }

        out.push_str(&format!(
            "reset {branch_ref}\nfrom {reset_to}\n\n\
             progress SVN r{revnum} branch {branch} = :{mark} # {comment}\n\n",
        ));

        self.write_import(out.as_bytes())
    }

    fn create_annotated_tag(
        &mut self,
        ref_name: &str,
        svnprefix: &str,
        revnum: u32,
        author: &[u8],
        timestamp: u64,
        log: &[u8],
    ) {
        let tag_name = ref_name.strip_prefix("refs/tags/").unwrap_or(ref_name);

        if self.annotated_tags.contains_key(tag_name) {
            tracing::info!(
                "re-creating annotated tag {tag_name:?} in repository {:?}",
                self.name,
            );
        } else {
            tracing::info!(
                "creating annotated tag {tag_name:?} ({ref_name:?}) in repository {:?}",
                self.name,
            );
        }

        self.annotated_tags.insert(
            tag_name.to_string(),
            AnnotatedTag {
                supporting_ref: ref_name.to_string(),
                svnprefix: svnprefix.to_string(),
                author: author.to_vec(),
                log: log.to_vec(),
                timestamp,
                revnum,
            },
        );
    }

    fn finalize_tags(&mut self) -> Result<(), EmitError> {
        if self.annotated_tags.is_empty() {
            return Ok(());
        }

        tracing::info!("finalizing tags for {:?}", self.name);
        self.start_fast_import()?;

        let mut out = Vec::new();
        for (tag_name, tag) in &self.annotated_tags {
            let mut message = tag.log.clone();
            if !message.ends_with(b"\n") {
                message.push(b'\n');
            }
            if self.options.add_metadata {
                message.extend_from_slice(
                    format!("\nsvn path={}; revision={}\n", tag.svnprefix, tag.revnum).as_bytes(),
                );
            }

            let supporting_ref = qualified_ref(&tag.supporting_ref);
            out.extend_from_slice(
                format!(
                    "progress Creating annotated tag {tag_name} from ref {supporting_ref}\n\
                     tag {tag_name}\nfrom {supporting_ref}\ntagger ",
                )
                .as_bytes(),
            );
            out.extend_from_slice(&tag.author);
            out.extend_from_slice(
                format!(" {} -0000\ndata {}\n", tag.timestamp, message.len()).as_bytes(),
            );
            out.extend_from_slice(&message);
            out.push(b'\n');
        }

        self.write_import(&out)?;
        self.flush_import()
    }

    fn setup_incremental(&mut self, cutoff: &mut u32) -> Result<u32, EmitError> {
        let log_path = self.log_file_path();
        let log_file = match std::fs::File::open(&log_path) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(1),
            Err(e) => {
                return Err(EmitError::ReadLogError {
                    path: log_path,
                    error: e,
                });
            }
        };

        let last_valid_mark = marks::last_valid_mark(&self.marks_file_path());

        let mut reader = std::io::BufReader::new(log_file);
        let mut pos = 0u64;
        let mut last_revnum = 0;
        let mut line = Vec::new();
        loop {
            line.clear();
            let read = reader
                .read_until(b'\n', &mut line)
                .map_err(|e| EmitError::ReadLogError {
                    path: log_path.clone(),
                    error: e,
                })?;
            if read == 0 {
                break;
            }
            let line_pos = pos;
            pos += read as u64;

            let Some((revnum, branch, mark)) = progress::parse_progress_line(&line) else {
                continue;
            };

            if revnum >= *cutoff {
                return self.rewind_log(&log_path, line_pos, *cutoff);
            }

            if revnum < last_revnum {
                tracing::warn!(
                    "{:?}: revision numbers are not monotonic: got r{last_revnum} and then r{revnum}",
                    self.name,
                );
            }

            if mark > last_valid_mark {
                tracing::warn!(
                    "{:?}: unknown commit mark found: rewinding -- did you hit Ctrl-C?",
                    self.name,
                );
                *cutoff = revnum;
                return self.rewind_log(&log_path, line_pos, *cutoff);
            }

            last_revnum = revnum;
            self.last_commit_mark = self.last_commit_mark.max(mark);

            let br = self.branches.entry(branch.to_string()).or_default();
            if br.created == 0 || mark == 0 || br.marks.is_empty() {
                br.created = revnum;
            }
            br.commits.push(revnum);
            br.marks.push(mark);
        }

        let retval = last_revnum + 1;
        if retval == *cutoff {
            // a stale backup would confuse a later restore_log()
            let _ = std::fs::remove_file(self.log_backup_path());
        }
        Ok(retval)
    }

    fn rewind_log(&self, log_path: &Path, pos: u64, cutoff: u32) -> Result<u32, EmitError> {
        let backup_path = self.log_backup_path();
        let _ = std::fs::remove_file(&backup_path);
        std::fs::copy(log_path, &backup_path).map_err(|e| EmitError::RewindLogError {
            path: backup_path,
            error: e,
        })?;

        tracing::debug!("{:?}: truncating history to revision {cutoff}", self.name);
        let log_file = std::fs::OpenOptions::new()
            .write(true)
            .open(log_path)
            .map_err(|e| EmitError::RewindLogError {
                path: log_path.to_path_buf(),
                error: e,
            })?;
        log_file.set_len(pos).map_err(|e| EmitError::RewindLogError {
            path: log_path.to_path_buf(),
            error: e,
        })?;

        Ok(cutoff)
    }

    fn restore_log(&mut self) -> Result<(), EmitError> {
        let log_path = self.log_file_path();
        let backup_path = self.log_backup_path();
        if !backup_path.exists() {
            return Ok(());
        }
        match std::fs::remove_file(&log_path) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(EmitError::RestoreLogError {
                    path: log_path,
                    error: e,
                });
            }
        }
        std::fs::rename(&backup_path, &log_path).map_err(|e| EmitError::RestoreLogError {
            path: log_path,
            error: e,
        })
    }
}

impl Drop for RepoState {
    fn drop(&mut self) {
        debug_assert!(self.outstanding_transactions == 0);
        self.close_fast_import();
    }
}

fn wait_for_exit(child: &mut std::process::Child, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        match child.try_wait() {
            Ok(Some(_)) | Err(_) => return true,
            Ok(None) => {}
        }
        if Instant::now() >= deadline {
            return false;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
}

pub struct FastImportRepository {
    state: Rc<RefCell<RepoState>>,
}

impl FastImportRepository {
    pub fn new(rule: &RepoRule, options: &Options, work_dir: &Path) -> Result<Self, EmitError> {
        let state = RepoState::new(rule, options, work_dir);

        if !options.dry_run {
            let repo_dir = state.repo_dir();
            if !repo_dir.exists() {
                tracing::debug!("creating new repository {:?}", rule.name);
                std::fs::create_dir_all(&repo_dir).map_err(|e| EmitError::CreateRepoError {
                    name: rule.name.clone(),
                    error: e,
                })?;

                let status = std::process::Command::new("git")
                    .arg("--bare")
                    .arg("init")
                    .current_dir(&repo_dir)
                    .stdin(std::process::Stdio::null())
                    .stdout(std::process::Stdio::null())
                    .stderr(std::process::Stdio::inherit())
                    .status()
                    .map_err(|e| EmitError::GitInitError {
                        name: rule.name.clone(),
                        error: e,
                    })?;
                if !status.success() {
                    return Err(EmitError::GitInitFailed {
                        name: rule.name.clone(),
                        status,
                    });
                }

                let marks_path = state.marks_file_path();
                std::fs::File::create(&marks_path).map_err(|e| {
                    EmitError::CreateMarksFileError {
                        path: marks_path.clone(),
                        error: e,
                    }
                })?;
            }
        }

        Ok(Self {
            state: Rc::new(RefCell::new(state)),
        })
    }

    pub(crate) fn clone_handle(&self) -> Self {
        Self {
            state: Rc::clone(&self.state),
        }
    }

    pub fn create_branch(
        &mut self,
        branch: &str,
        revnum: u32,
        from_branch: &str,
        from_revnum: u32,
    ) -> Result<(), EmitError> {
        self.state
            .borrow_mut()
            .create_branch(branch, revnum, from_branch, from_revnum)
    }

    pub fn delete_branch(&mut self, branch: &str, revnum: u32) -> Result<(), EmitError> {
        self.state.borrow_mut().delete_branch(branch, revnum)
    }

    pub fn new_transaction(
        &mut self,
        branch: &str,
        svnprefix: &str,
        revnum: u32,
    ) -> Result<FastImportTransaction, EmitError> {
        {
            let mut state = self.state.borrow_mut();
            state.start_fast_import()?;

            if !state.branches.contains_key(branch) {
                tracing::warn!(
                    "{branch:?} is not a known branch in repository {:?}; creating it automatically",
                    state.name,
                );
            }

            state.commit_count += 1;
            let interval = state.options.commit_interval;
            if interval != 0 && state.commit_count % interval == 0 {
                state.write_import(b"checkpoint\n")?;
                tracing::debug!(
                    "checkpoint after {} transactions in {:?}",
                    state.commit_count,
                    state.name,
                );
            }
            state.outstanding_transactions += 1;
        }

        Ok(FastImportTransaction {
            state: Rc::clone(&self.state),
            branch: branch.to_string(),
            svnprefix: svnprefix.to_string(),
            author: Vec::new(),
            log: Vec::new(),
            datetime: 0,
            revnum,
            merges: Vec::new(),
            deleted_files: Vec::new(),
            modified_files: Vec::new(),
        })
    }

    pub fn setup_incremental(&mut self, cutoff: &mut u32) -> Result<u32, EmitError> {
        self.state.borrow_mut().setup_incremental(cutoff)
    }

    pub fn restore_log(&mut self) -> Result<(), EmitError> {
        self.state.borrow_mut().restore_log()
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
        self.state
            .borrow_mut()
            .create_annotated_tag(ref_name, svnprefix, revnum, author, timestamp, log);
    }

    pub fn finalize_tags(&mut self) -> Result<(), EmitError> {
        self.state.borrow_mut().finalize_tags()
    }

    /// Checkpoints and shuts the importer down cleanly. A closed repository
    /// may be started again by the next operation that needs the importer.
    pub fn close(&mut self) {
        self.state.borrow_mut().close_fast_import();
    }
}

pub struct FastImportTransaction {
    state: Rc<RefCell<RepoState>>,
    branch: String,
    svnprefix: String,
    author: Vec<u8>,
    log: Vec<u8>,
    datetime: u64,
    revnum: u32,
    merges: Vec<u32>,
    deleted_files: Vec<Vec<u8>>,
    modified_files: Vec<u8>,
}

impl Drop for FastImportTransaction {
    fn drop(&mut self) {
        let mut state = self.state.borrow_mut();
        state.outstanding_transactions = state.outstanding_transactions.saturating_sub(1);
        if state.outstanding_transactions == 0 {
            state.next_file_mark = MAX_MARK;
        }
    }
}

impl FastImportTransaction {
    pub fn set_author(&mut self, author: &[u8]) {
        self.author = author.to_vec();
    }

    pub fn set_date_time(&mut self, timestamp: u64) {
        self.datetime = timestamp;
    }

    pub fn set_log(&mut self, log: &[u8]) {
        self.log = log.to_vec();
    }

    pub fn note_copy_from_branch(&mut self, from_branch: &str, from_revnum: u32) {
        if self.branch == from_branch {
            tracing::warn!("cannot merge inside a branch");
            return;
        }

        let mut desc = String::new();
        let mark = self
            .state
            .borrow()
            .mark_from(from_branch, from_revnum, &mut desc);
        debug_assert!(desc.is_empty());

        match mark {
            None => {
                tracing::warn!(
                    "{:?} is copying from branch {from_branch:?} but the latter doesn't exist; \
                     continuing, assuming the files exist",
                    self.branch,
                );
            }
            Some(0) => {
                tracing::warn!(
                    "unknown revision r{from_revnum}; continuing, assuming the files exist",
                );
            }
            Some(mark) => {
                tracing::warn!(
                    "branch {:?} has some files copied from {from_branch}@{from_revnum}",
                    self.branch,
                );
                if !self.merges.contains(&mark) {
                    self.merges.push(mark);
                    tracing::debug!(
                        "adding {from_branch}@{from_revnum} (:{mark}) as a merge point",
                    );
                } else {
                    tracing::debug!("merge point already recorded");
                }
            }
        }
    }

    pub fn delete_file(&mut self, path: &[u8]) {
        let path = path.strip_suffix(b"/").unwrap_or(path);
        self.deleted_files.push(path.to_vec());
    }

    /// Streams one file modification: allocates a blob mark, records the
    /// `M` line for the commit, and copies exactly `length` bytes from
    /// `data` into the importer.
    pub fn add_file(
        &mut self,
        path: &[u8],
        mode: u32,
        length: u64,
        data: &mut dyn Read,
    ) -> Result<(), EmitError> {
        let mut state = self.state.borrow_mut();

        let mark = state.next_file_mark;
        state.next_file_mark -= 1;
        // in case the two mark allocations meet, we might as well just abort
        assert!(
            mark > state.last_commit_mark + 1,
            "file mark {mark} ran into the commit mark space",
        );

        if self.modified_files.capacity() == 0 {
            self.modified_files.reserve(2048);
        }
        self.modified_files
            .extend_from_slice(format!("M {mode:o} :{mark} ").as_bytes());
        self.modified_files.extend_from_slice(path);
        self.modified_files.push(b'\n');

        if !state.options.dry_run {
            state.write_import(format!("blob\nmark :{mark}\ndata {length}\n").as_bytes())?;
        }
        state.write_blob_body(path, length, data)
    }

    pub fn commit(self, pool: &mut ProcessPool) -> Result<(), EmitError> {
        pool.touch(&self.state);

        let mut state_ref = self.state.borrow_mut();
        let state = &mut *state_ref;

        // a single SVN revision can touch multiple branches and produce
        // several commits in the same repository, so the commit mark is a
        // separate counter rather than the revision number
        state.last_commit_mark += 1;
        let mark = state.last_commit_mark;
        assert!(
            mark < state.next_file_mark - 1,
            "commit mark {mark} ran into the file mark space",
        );

        let mut message = self.log.clone();
        if !message.ends_with(b"\n") {
            message.push(b'\n');
        }
        if state.options.add_metadata {
            message.extend_from_slice(
                format!("\nsvn path={}; revision={}\n", self.svnprefix, self.revnum).as_bytes(),
            );
        }

        let parent_mark;
        {
            let br = state.branches.entry(self.branch.clone()).or_default();
            parent_mark = match br.marks.last().copied() {
                Some(last_mark) if br.created != 0 => last_mark,
                _ => {
                    tracing::warn!(
                        "branch {:?} in repository {:?} doesn't exist at revision {}; \
                         did you resume from the wrong revision?",
                        self.branch,
                        state.name,
                        self.revnum,
                    );
                    br.created = self.revnum;
                    0
                }
            };
            br.commits.push(self.revnum);
            br.marks.push(mark);
        }

        let branch_ref = qualified_ref(&self.branch);

        let mut out = Vec::with_capacity(message.len() + self.modified_files.len() + 512);
        out.extend_from_slice(format!("commit {branch_ref}\nmark :{mark}\ncommitter ").as_bytes());
        out.extend_from_slice(&self.author);
        out.extend_from_slice(format!(" {} -0000\ndata {}\n", self.datetime, message.len()).as_bytes());
        out.extend_from_slice(&message);
        out.push(b'\n');

        let mut desc = String::new();
        let mut parents = u32::from(parent_mark != 0);
        for &merge in &self.merges {
            if merge == parent_mark {
                tracing::debug!("skipping merge mark :{merge}: it matches the parent");
                continue;
            }
            parents += 1;
            if parents > 16 {
                tracing::warn!("too many merge parents");
                break;
            }
            out.extend_from_slice(format!("merge :{merge}\n").as_bytes());
            desc.push_str(&format!(" :{merge}"));
        }

        if self.deleted_files.iter().any(|path| path.is_empty()) {
            out.extend_from_slice(b"deleteall\n");
        } else {
            for path in &self.deleted_files {
                out.extend_from_slice(b"D ");
                out.extend_from_slice(path);
                out.push(b'\n');
            }
        }

        out.extend_from_slice(&self.modified_files);

        out.extend_from_slice(
            format!("\nprogress SVN r{} branch {} = :{mark}", self.revnum, self.branch).as_bytes(),
        );
        if !desc.is_empty() {
            out.extend_from_slice(format!(" # merge from{desc}").as_bytes());
        }
        out.extend_from_slice(b"\n\n");

        state.write_import(&out)?;
        state.flush_import()?;

        let modifications = self.modified_files.iter().filter(|&&b| b == b'\n').count();
        tracing::debug!(
            "SVN r{} committed to {}/{}: {} deletions, {modifications} modifications",
            self.revnum,
            state.name,
            self.branch,
            self.deleted_files.len(),
        );

        Ok(())
    }
}

#[cfg(test)]
mod test {
    use std::cell::RefCell;
    use std::path::Path;
    use std::rc::Rc;

    use super::{log_file_name, marks_file_name, qualified_ref, RepoState};
    use crate::config::Options;
    use crate::repo::{EmitError, MAX_MARK};
    use crate::rules::RepoRule;

    fn make_rule(name: &str, branches: &[&str]) -> RepoRule {
        RepoRule {
            name: name.into(),
            branches: branches.iter().map(|b| b.to_string()).collect(),
            forward_to: None,
            prefix: String::new(),
        }
    }

    fn make_state(branches: &[&str]) -> RepoState {
        RepoState::new(
            &make_rule("test-repo", branches),
            &Options::default(),
            Path::new("."),
        )
    }

    #[test]
    fn test_file_names() {
        assert_eq!(marks_file_name("project"), "marks-project");
        assert_eq!(marks_file_name("group/project"), "marks-group_project");
        assert_eq!(log_file_name("group/project"), "log-group_project");
    }

    #[test]
    fn test_qualified_ref() {
        assert_eq!(qualified_ref("master"), "refs/heads/master");
        assert_eq!(qualified_ref("refs/tags/v1"), "refs/tags/v1");
    }

    #[test]
    fn test_master_is_created() {
        let state = make_state(&["stable"]);
        assert_eq!(state.branches["master"].created, 1);
        assert_eq!(state.branches["stable"].created, 0);
    }

    fn seeded_state() -> RepoState {
        let mut state = make_state(&["b"]);
        let br = state.branches.get_mut("b").unwrap();
        br.created = 2;
        br.commits = vec![2, 5, 9];
        br.marks = vec![10, 20, 30];
        state
    }

    #[test]
    fn test_mark_from_last_commit() {
        let state = seeded_state();
        let mut desc = String::new();
        assert_eq!(state.mark_from("b", 9, &mut desc), Some(30));
        assert_eq!(desc, "");

        let mut desc = String::from("from branch b");
        assert_eq!(state.mark_from("b", 9, &mut desc), Some(30));
        assert_eq!(desc, "from branch b at r9");
    }

    #[test]
    fn test_mark_from_exact_match() {
        let state = seeded_state();
        let mut desc = String::from("x");
        assert_eq!(state.mark_from("b", 5, &mut desc), Some(20));
        assert_eq!(desc, "x at r5");
    }

    #[test]
    fn test_mark_from_between_commits() {
        let state = seeded_state();
        let mut desc = String::from("x");
        assert_eq!(state.mark_from("b", 6, &mut desc), Some(20));
        assert_eq!(desc, "x at r6 => r5");
    }

    #[test]
    fn test_mark_from_before_history() {
        let state = seeded_state();
        let mut desc = String::from("x");
        assert_eq!(state.mark_from("b", 1, &mut desc), Some(0));
        assert_eq!(desc, "x");
    }

    #[test]
    fn test_mark_from_unknown_branch() {
        let state = seeded_state();
        let mut desc = String::new();
        assert_eq!(state.mark_from("nope", 5, &mut desc), None);
    }

    #[test]
    fn test_mark_from_uncreated_branch() {
        let mut state = make_state(&["empty"]);
        let mut desc = String::new();
        assert_eq!(state.mark_from("empty", 5, &mut desc), None);

        // created but without history
        state.branches.get_mut("empty").unwrap().created = 3;
        assert_eq!(state.mark_from("empty", 5, &mut desc), None);
    }

    #[test]
    fn test_crash_latch() {
        let mut state = make_state(&[]);
        state.process_has_started = true;
        match state.start_fast_import() {
            Err(EmitError::ImporterCrashed { name }) => assert_eq!(name, "test-repo"),
            _ => panic!("expected ImporterCrashed"),
        }
    }

    #[test]
    #[should_panic(expected = "ran into the commit mark space")]
    fn test_file_mark_collision() {
        let mut state = make_state(&[]);
        state.last_commit_mark = MAX_MARK - 1;
        state.outstanding_transactions = 1;

        let mut txn = super::FastImportTransaction {
            state: Rc::new(RefCell::new(state)),
            branch: "master".into(),
            svnprefix: String::new(),
            author: Vec::new(),
            log: Vec::new(),
            datetime: 0,
            revnum: 1,
            merges: Vec::new(),
            deleted_files: Vec::new(),
            modified_files: Vec::new(),
        };
        let _ = txn.add_file(b"f", 0o100644, 0, &mut std::io::empty());
    }

    fn setup_files(work_dir: &Path, name: &str, log: &str, marks: &str) {
        std::fs::create_dir_all(work_dir.join(name)).unwrap();
        std::fs::write(work_dir.join(log_file_name(name)), log).unwrap();
        std::fs::write(work_dir.join(name).join(marks_file_name(name)), marks).unwrap();
    }

    #[test]
    fn test_setup_incremental_no_log() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RepoState::new(
            &make_rule("repo", &[]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = u32::MAX;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 1);
        assert_eq!(cutoff, u32::MAX);
    }

    #[test]
    fn test_setup_incremental_replays_history() {
        let dir = tempfile::tempdir().unwrap();
        let log = "progress SVN r1 branch master = :1\n\
                   progress Branch refs/heads/master reloaded\n\
                   progress SVN r2 branch master = :2\n\
                   progress SVN r3 branch b = :0 # from branch master at r2\n\
                   progress SVN r4 branch b = :3\n";
        setup_files(dir.path(), "repo", log, ":1 a\n:2 b\n:3 c\n");

        let mut state = RepoState::new(
            &make_rule("repo", &["master", "b"]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = u32::MAX;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 5);
        assert_eq!(cutoff, u32::MAX);
        assert_eq!(state.last_commit_mark, 3);

        let master = &state.branches["master"];
        assert_eq!(master.created, 1);
        assert_eq!(master.commits, [1, 2]);
        assert_eq!(master.marks, [1, 2]);

        let b = &state.branches["b"];
        assert_eq!(b.created, 3);
        assert_eq!(b.commits, [3, 4]);
        assert_eq!(b.marks, [0, 3]);
    }

    #[test]
    fn test_setup_incremental_rewind_on_missing_mark() {
        let dir = tempfile::tempdir().unwrap();
        let line1 = "progress SVN r1 branch master = :1\n";
        let line2 = "progress SVN r2 branch master = :2\n";
        let log = format!("{line1}{line2}");
        setup_files(dir.path(), "repo", &log, ":1 a\n");

        let mut state = RepoState::new(
            &make_rule("repo", &["master"]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = 100;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 2);
        assert_eq!(cutoff, 2);
        assert_eq!(state.last_commit_mark, 1);

        let log_path = dir.path().join(log_file_name("repo"));
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), line1);
        let backup_path = dir.path().join(format!("{}.old", log_file_name("repo")));
        assert_eq!(std::fs::read_to_string(&backup_path).unwrap(), log);

        // restore_log rolls the truncation back
        state.restore_log().unwrap();
        assert_eq!(std::fs::read_to_string(&log_path).unwrap(), log);
        assert!(!backup_path.exists());
    }

    #[test]
    fn test_setup_incremental_rewind_at_cutoff() {
        let dir = tempfile::tempdir().unwrap();
        let log = "progress SVN r1 branch master = :1\n\
                   progress SVN r2 branch master = :2\n\
                   progress SVN r3 branch master = :3\n";
        setup_files(dir.path(), "repo", log, ":1 a\n:2 b\n:3 c\n");

        let mut state = RepoState::new(
            &make_rule("repo", &["master"]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = 3;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 3);
        assert_eq!(cutoff, 3);

        let log_path = dir.path().join(log_file_name("repo"));
        assert_eq!(
            std::fs::read_to_string(&log_path).unwrap(),
            "progress SVN r1 branch master = :1\nprogress SVN r2 branch master = :2\n",
        );
        assert_eq!(state.branches["master"].commits, [1, 2]);
    }

    #[test]
    fn test_setup_incremental_removes_stale_backup() {
        let dir = tempfile::tempdir().unwrap();
        let log = "progress SVN r1 branch master = :1\n\
                   progress SVN r2 branch master = :2\n";
        setup_files(dir.path(), "repo", log, ":1 a\n:2 b\n");
        let backup_path = dir.path().join(format!("{}.old", log_file_name("repo")));
        std::fs::write(&backup_path, "stale").unwrap();

        let mut state = RepoState::new(
            &make_rule("repo", &["master"]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = 3;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 3);
        assert!(!backup_path.exists());
    }

    #[test]
    fn test_setup_incremental_non_monotonic_continues() {
        let dir = tempfile::tempdir().unwrap();
        let log = "progress SVN r5 branch master = :1\n\
                   progress SVN r4 branch other = :2\n";
        setup_files(dir.path(), "repo", log, ":1 a\n:2 b\n");

        let mut state = RepoState::new(
            &make_rule("repo", &["master"]),
            &Options::default(),
            dir.path(),
        );
        let mut cutoff = u32::MAX;
        assert_eq!(state.setup_incremental(&mut cutoff).unwrap(), 5);
        assert_eq!(state.last_commit_mark, 2);
        assert_eq!(state.branches["other"].commits, [4]);
    }

    #[test]
    fn test_restore_log_without_backup() {
        let dir = tempfile::tempdir().unwrap();
        let mut state = RepoState::new(
            &make_rule("repo", &[]),
            &Options::default(),
            dir.path(),
        );
        state.restore_log().unwrap();
    }
}
