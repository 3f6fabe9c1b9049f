use std::cell::RefCell;
use std::collections::VecDeque;
use std::rc::{Rc, Weak};

use crate::repo::fast_import::RepoState;

pub(crate) const MAX_OPEN_PROCESSES: usize = 100;

/// Keeps at most `MAX_OPEN_PROCESSES` importer subprocesses alive, closing
/// the least recently committed-to repository when the limit is reached.
pub struct ProcessPool {
    lru: VecDeque<Weak<RefCell<RepoState>>>,
}

impl ProcessPool {
    pub fn new() -> Self {
        Self {
            lru: VecDeque::new(),
        }
    }

    pub(crate) fn touch(&mut self, repo: &Rc<RefCell<RepoState>>) {
        self.remove(repo);

        while self.lru.len() >= MAX_OPEN_PROCESSES {
            if let Some(evicted) = self.lru.pop_front().and_then(|weak| weak.upgrade()) {
                evicted.borrow_mut().close_fast_import();
            }
        }

        self.lru.push_back(Rc::downgrade(repo));
    }

    pub(crate) fn remove(&mut self, repo: &Rc<RefCell<RepoState>>) {
        self.lru.retain(|weak| {
            weak.upgrade()
                .is_some_and(|state| !Rc::ptr_eq(&state, repo))
        });
    }
}
