// SPDX-License-Identifier: MIT

//! The state machine that realises one store path via substitutes.
//!
//! ```text
//! init ──► references_valid ──► try_next ──► try_to_run ──► finished
//!                                   ▲                           │
//!                                   └────── on failure ─────────┘
//! ```
//!
//! The path's declared references are realised before the path itself, so
//! no committed transaction ever leaves the path valid with an invalid
//! reference.  Substitutes are tried newest-first; a failing candidate is
//! logged and the next one tried, and the goal only fails when the list
//! runs out.  Substituter output is not written to a log file (contrast
//! derivation builds).

use std::collections::VecDeque;
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use tracing::{debug, info, warn};

use quern_store_core::store_path::PathSet;
use quern_store_core::substitute::Substitute;

use crate::archive;
use crate::canonicalise::canonicalise_path_metadata;
use crate::error::{Error, IoContext, Result};
use crate::pathlocks::PathLocks;
use crate::store::delete_path;
use crate::worker::{status_to_string, ChildProcess, Goal, GoalBase, GoalPtr, Worker};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    ReferencesValid,
    TryNext,
    TryToRun,
    Finished,
}

pub struct SubstitutionGoal {
    base: GoalBase,
    state: State,

    /// The store path to be realised.
    store_path: PathBuf,
    /// Remaining candidates, best first.
    subs: VecDeque<Substitute>,
    /// The candidate currently running.
    sub: Option<Substitute>,
    /// The path's declared references.
    references: PathSet,

    child: Option<ChildProcess>,
    output_lock: Option<PathLocks>,
}

impl SubstitutionGoal {
    pub fn new(store_path: PathBuf) -> SubstitutionGoal {
        SubstitutionGoal {
            base: GoalBase::default(),
            state: State::Init,
            store_path,
            subs: VecDeque::new(),
            sub: None,
            references: PathSet::new(),
            child: None,
            output_lock: None,
        }
    }

    // ── States ──────────────────────────────────────────────────────────

    fn init(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let store = worker.store();

        // If the path already exists we're done.
        if store.is_valid_path(&self.store_path) {
            self.am_done(self_rc, worker, true);
            return Ok(());
        }

        self.subs = store.query_substitutes(&self.store_path)?.into();
        self.references = store.query_references(&self.store_path)?;

        // Realise the closure before the path itself.  A self-reference
        // needs no goal (and would deadlock on this one).
        let references: Vec<PathBuf> = self
            .references
            .iter()
            .filter(|r| **r != self.store_path)
            .cloned()
            .collect();
        for reference in references {
            let goal = worker.make_substitution_goal(&reference);
            self.add_waitee(self_rc, &goal);
        }

        if self.base.waitees.is_empty() {
            // No wake-up event will come; advance synchronously.
            self.references_valid(self_rc, worker)
        } else {
            self.state = State::ReferencesValid;
            Ok(())
        }
    }

    fn references_valid(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        if self.base.nr_failed > 0 {
            return Err(Error::other(format!(
                "some references of path '{}' could not be realised",
                self.store_path.display()
            )));
        }
        self.try_next(self_rc, worker)
    }

    fn try_next(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let Some(sub) = self.subs.pop_front() else {
            // None left.  Terminate this goal and let someone else deal
            // with it.
            warn!(
                "path '{}' is required, but it has no (remaining) substitutes",
                self.store_path.display()
            );
            self.am_done(self_rc, worker, false);
            return Ok(());
        };
        self.sub = Some(sub);

        // Wait until we can run the substitute program.
        self.state = State::TryToRun;
        worker.wait_for_build_slot(self_rc, false)
    }

    fn try_to_run(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        if !worker.can_build_more() {
            worker.wait_for_build_slot(self_rc, false)?;
            return Ok(());
        }

        let store = worker.store();

        let mut output_lock = PathLocks::new();
        output_lock.lock_paths(std::slice::from_ref(&self.store_path))?;
        self.output_lock = Some(output_lock);

        // Another process may have produced the path while we were waiting
        // for the lock.
        if store.is_valid_path(&self.store_path) {
            debug!("store path '{}' has become valid", self.store_path.display());
            if let Some(lock) = self.output_lock.as_mut() {
                lock.set_deletion(true);
            }
            self.output_lock = None;
            self.am_done(self_rc, worker, true);
            return Ok(());
        }

        let sub = self.sub.clone().expect("candidate selected");
        info!(
            "substituting path '{}' using substituter '{}'",
            self.store_path.display(),
            sub.program.display()
        );

        // Remove any stale output left behind by a crashed substituter.
        if self.store_path.exists() {
            delete_path(&self.store_path)?;
        }

        let (log_read, log_write) = nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC)
            .io_context(|| "creating the log pipe".to_string())?;

        let argv0 = sub
            .program
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| sub.program.as_os_str().to_owned());

        let mut cmd = Command::new(&sub.program);
        cmd.arg0(argv0)
            .arg(&self.store_path)
            .args(&sub.args)
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log_write
                    .try_clone()
                    .io_context(|| "duplicating the log pipe".to_string())?,
            ))
            .stderr(Stdio::from(log_write))
            .process_group(0);

        let child = match cmd.spawn() {
            Ok(child) => child,
            Err(e) => {
                // Same handling as a substituter that exits non-zero: log
                // and move on to the next candidate.
                info!(
                    "substitution of path '{}' using substituter '{}' failed: {e}",
                    self.store_path.display(),
                    sub.program.display()
                );
                self.output_lock = None;
                self.state = State::TryNext;
                worker.wake_up(self_rc.clone());
                return Ok(());
            }
        };

        drop(cmd);
        let pid = child.id();
        self.child = Some(ChildProcess::new(child));
        worker.child_started(self_rc, pid, log_read, true);

        self.state = State::Finished;
        Ok(())
    }

    fn finished(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        // EOF on the log pipe; the substituter is presumed to have
        // terminated (the wait can in principle block if it only closed
        // its pipe end).
        let mut child = self.child.take().expect("child process running");
        let pid = child.pid();
        let status = child.wait()?;

        worker.child_terminated(pid, true);

        debug!("substitute for '{}' finished", self.store_path.display());

        let sub = self.sub.clone().expect("candidate selected");

        let outcome = if !status.success() {
            Err(Error::subst(format!(
                "substituter for '{}' {}",
                self.store_path.display(),
                status_to_string(status)
            )))
        } else if !self.store_path.exists() {
            Err(Error::subst(format!(
                "substitute did not produce path '{}'",
                self.store_path.display()
            )))
        } else {
            Ok(())
        };

        match outcome {
            Err(Error::Subst(message)) => {
                info!(
                    "substitution of path '{}' using substituter '{}' failed: {message}",
                    self.store_path.display(),
                    sub.program.display()
                );
                // Release the lock (without deleting: the path is not
                // valid) and try the next candidate.
                self.output_lock = None;
                self.state = State::TryNext;
                worker.wake_up(self_rc.clone());
                return Ok(());
            }
            Err(e) => return Err(e),
            Ok(()) => {}
        }

        let store = worker.store();

        canonicalise_path_metadata(&self.store_path)?;

        let content_hash = archive::hash_path(&self.store_path)
            .io_context(|| format!("hashing '{}'", self.store_path.display()))?;

        // The declared references stand; registering path and references
        // in one transaction keeps the closure invariant.
        let deriver = if sub.deriver.as_os_str().is_empty() {
            None
        } else {
            Some(sub.deriver.as_path())
        };
        store.with_txn(|txn| {
            store.register_valid_path(
                txn,
                &self.store_path,
                &content_hash,
                &self.references,
                deriver,
            )
        })?;

        if let Some(lock) = self.output_lock.as_mut() {
            lock.set_deletion(true);
        }
        self.output_lock = None;

        debug!(
            "substitution of path '{}' succeeded",
            self.store_path.display()
        );
        self.am_done(self_rc, worker, true);
        Ok(())
    }
}

impl Goal for SubstitutionGoal {
    fn base(&self) -> &GoalBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut GoalBase {
        &mut self.base
    }

    fn work(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        match self.state {
            State::Init => self.init(self_rc, worker),
            State::ReferencesValid => self.references_valid(self_rc, worker),
            State::TryNext => self.try_next(self_rc, worker),
            State::TryToRun => self.try_to_run(self_rc, worker),
            State::Finished => self.finished(self_rc, worker),
        }
    }

    fn name(&self) -> String {
        format!("substitution of '{}'", self.store_path.display())
    }

    fn write_log(&mut self, _data: &[u8]) {
        // Substituter output is not logged to a file.
    }
}
