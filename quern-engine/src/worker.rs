// SPDX-License-Identifier: MIT

//! The goal scheduler.
//!
//! A single-threaded cooperative loop drives a DAG of goals; concurrency
//! comes from external child processes whose log pipes are multiplexed
//! with `poll(2)`.  Strong ownership flows from the top-level goals (and
//! the pseudo-goal wrapping them) down through `waitees`; the reverse
//! `waiters` edges are weak so that completed subgraphs are freed.  Goals
//! for the same derivation or store path are deduplicated through weak
//! maps; dead entries linger there until the path is requested again.
//!
//! The only suspension points are: a goal with outstanding waitees, a goal
//! parked for a build slot, and a goal whose child process has not yet
//! closed its log pipe.

use std::cell::RefCell;
use std::collections::HashMap;
use std::io::Write as _;
use std::os::fd::{AsRawFd as _, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::process::ExitStatusExt as _;
use std::path::{Path, PathBuf};
use std::process::{Child, ExitStatus};
use std::rc::{Rc, Weak};

use nix::errno::Errno;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use nix::sys::signal::{killpg, Signal};
use nix::unistd::Pid;
use tracing::{debug, trace};

use quern_store_core::store_path::PathSet;

use crate::derivation_goal::DerivationGoal;
use crate::error::{Error, IoContext, Result};
use crate::interrupt::check_interrupt;
use crate::store::Store;
use crate::substitution_goal::SubstitutionGoal;

pub type GoalPtr = Rc<RefCell<dyn Goal>>;
pub type WeakGoal = Weak<RefCell<dyn Goal>>;

/// State shared by every goal kind.
#[derive(Default)]
pub struct GoalBase {
    /// Goals this goal is waiting for (strong edges).
    pub waitees: Vec<GoalPtr>,
    /// Goals waiting for this one (weak, to break cycles).
    pub waiters: Vec<WeakGoal>,
    /// How many waitees have failed.
    pub nr_failed: u32,
    /// Whether `am_done` has run.
    pub done: bool,
}

pub trait Goal {
    fn base(&self) -> &GoalBase;
    fn base_mut(&mut self) -> &mut GoalBase;

    /// Advance the goal's state machine.  Called with the goal's own `Rc`
    /// so it can hook itself into other goals and the worker.
    fn work(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()>;

    fn name(&self) -> String;

    /// Receive a chunk of the child's log output.
    fn write_log(&mut self, data: &[u8]);

    /// Register `waitee` as a prerequisite of this goal.
    fn add_waitee(&mut self, self_rc: &GoalPtr, waitee: &GoalPtr) {
        self.base_mut().waitees.push(waitee.clone());
        waitee
            .borrow_mut()
            .base_mut()
            .waiters
            .push(Rc::downgrade(self_rc));
    }

    /// A waitee has completed.  Wakes this goal once all waitees are done,
    /// or immediately on failure when `keep_going` is off; in that case the
    /// remaining waitees are dropped and this goal unhooks itself from
    /// their waiter lists (orphans die when their last strong holder goes).
    fn waitee_done(
        &mut self,
        self_rc: &GoalPtr,
        worker: &mut Worker<'_>,
        waitee: &GoalPtr,
        success: bool,
    ) {
        let keep_going = worker.keep_going();
        let base = self.base_mut();
        base.waitees.retain(|g| !Rc::ptr_eq(g, waitee));
        if !success {
            base.nr_failed += 1;
        }

        if base.waitees.is_empty() || (!success && !keep_going) {
            let dropped = std::mem::take(&mut base.waitees);
            for goal in &dropped {
                goal.borrow_mut()
                    .base_mut()
                    .waiters
                    .retain(|w| w.upgrade().is_some_and(|p| !Rc::ptr_eq(&p, self_rc)));
            }
            worker.wake_up(self_rc.clone());
        }
    }

    /// Complete this goal, notifying every waiter.
    fn am_done(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>, success: bool) {
        trace!("{}: done", self.name());
        let base = self.base_mut();
        assert!(!base.done, "goal completed twice");
        base.done = true;

        let waiters = std::mem::take(&mut base.waiters);
        for weak in waiters {
            if let Some(goal) = weak.upgrade() {
                let mut waiter = goal.borrow_mut();
                waiter.waitee_done(&goal, worker, self_rc, success);
            }
        }
        worker.remove_goal(self_rc);
    }
}

/// Collects the aggregate result of the caller's top-level goals.
struct PseudoGoal {
    base: GoalBase,
    success: bool,
}

impl Goal for PseudoGoal {
    fn base(&self) -> &GoalBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut GoalBase {
        &mut self.base
    }

    fn work(&mut self, _self_rc: &GoalPtr, _worker: &mut Worker<'_>) -> Result<()> {
        unreachable!("the pseudo-goal is never woken")
    }

    fn name(&self) -> String {
        "pseudo-goal".to_string()
    }

    fn write_log(&mut self, _data: &[u8]) {}

    fn waitee_done(
        &mut self,
        _self_rc: &GoalPtr,
        _worker: &mut Worker<'_>,
        _waitee: &GoalPtr,
        success: bool,
    ) {
        if !success {
            self.success = false;
        }
    }
}

/// A running child process registered with the worker.
struct ChildEntry {
    goal: WeakGoal,
    log_fd: OwnedFd,
    in_build_slot: bool,
}

thread_local! {
    /// Rejects nested workers (one cooperative loop per thread).
    static WORKING: std::cell::Cell<bool> = const { std::cell::Cell::new(false) };
}

/// The scheduler.  Owns the top-level goals strongly, everything else
/// weakly.
pub struct Worker<'s> {
    store: &'s Store,
    top_goals: Vec<GoalPtr>,
    awake: Vec<WeakGoal>,
    wanting_to_build: Vec<WeakGoal>,
    children: HashMap<u32, ChildEntry>,
    /// Slot-occupying children only; build hooks do not count.
    nr_children: u32,
    derivation_goals: HashMap<PathBuf, WeakGoal>,
    substitution_goals: HashMap<PathBuf, WeakGoal>,
}

impl<'s> Worker<'s> {
    pub fn new(store: &'s Store) -> Worker<'s> {
        WORKING.with(|w| {
            assert!(!w.get(), "nested workers are not allowed");
            w.set(true);
        });
        Worker {
            store,
            top_goals: Vec::new(),
            awake: Vec::new(),
            wanting_to_build: Vec::new(),
            children: HashMap::new(),
            nr_children: 0,
            derivation_goals: HashMap::new(),
            substitution_goals: HashMap::new(),
        }
    }

    pub fn store(&self) -> &'s Store {
        self.store
    }

    pub fn keep_going(&self) -> bool {
        self.store.settings().keep_going
    }

    /// Make (or reuse) the goal that builds `drv_path`.
    pub fn make_derivation_goal(&mut self, drv_path: &Path) -> GoalPtr {
        if let Some(goal) = self.derivation_goals.get(drv_path).and_then(Weak::upgrade) {
            return goal;
        }
        let goal: GoalPtr = Rc::new(RefCell::new(DerivationGoal::new(drv_path.to_owned())));
        self.derivation_goals
            .insert(drv_path.to_owned(), Rc::downgrade(&goal));
        self.wake_up(goal.clone());
        goal
    }

    /// Make (or reuse) the goal that realises `store_path` via substitutes.
    pub fn make_substitution_goal(&mut self, store_path: &Path) -> GoalPtr {
        if let Some(goal) = self
            .substitution_goals
            .get(store_path)
            .and_then(Weak::upgrade)
        {
            return goal;
        }
        let goal: GoalPtr = Rc::new(RefCell::new(SubstitutionGoal::new(store_path.to_owned())));
        self.substitution_goals
            .insert(store_path.to_owned(), Rc::downgrade(&goal));
        self.wake_up(goal.clone());
        goal
    }

    pub fn remove_goal(&mut self, goal: &GoalPtr) {
        self.top_goals.retain(|g| !Rc::ptr_eq(g, goal));
        // Dead entries in the dedup maps are left behind; a later request
        // for the same path sweeps them by failing to upgrade.
    }

    /// Enqueue a goal for a `work()` call.  Must not touch the goal's
    /// contents: it is frequently called for the goal currently executing.
    pub fn wake_up(&mut self, goal: GoalPtr) {
        let already = self
            .awake
            .iter()
            .any(|w| w.upgrade().is_some_and(|g| Rc::ptr_eq(&g, &goal)));
        if !already {
            self.awake.push(Rc::downgrade(&goal));
        }
    }

    pub fn can_build_more(&self) -> bool {
        self.nr_children < self.store.settings().max_build_jobs
    }

    /// Register a running child.  Hook children pass `in_build_slot =
    /// false` and do not count against the build budget.
    pub fn child_started(
        &mut self,
        goal: &GoalPtr,
        pid: u32,
        log_fd: OwnedFd,
        in_build_slot: bool,
    ) {
        self.children.insert(
            pid,
            ChildEntry {
                goal: Rc::downgrade(goal),
                log_fd,
                in_build_slot,
            },
        );
        if in_build_slot {
            self.nr_children += 1;
        }
    }

    /// Unregister a child.  When a slot-occupying child goes away, every
    /// goal parked for a slot is woken; they race for the slot and losers
    /// re-park.
    pub fn child_terminated(&mut self, pid: u32, wake_sleepers: bool) {
        let Some(entry) = self.children.remove(&pid) else {
            return;
        };
        if entry.in_build_slot {
            assert!(self.nr_children > 0);
            self.nr_children -= 1;
        }

        if wake_sleepers {
            for weak in std::mem::take(&mut self.wanting_to_build) {
                if let Some(goal) = weak.upgrade() {
                    self.wake_up(goal);
                }
            }
        }
    }

    /// Park `goal` until a build slot is free.  `really_wait` is used after
    /// the build hook said "postpone": it insists on an existing child to
    /// wait for, since otherwise no slot will ever free up.
    pub fn wait_for_build_slot(&mut self, goal: &GoalPtr, really_wait: bool) -> Result<()> {
        debug!("wait for build slot");
        if really_wait && self.children.is_empty() {
            return Err(Error::other(
                "waiting for a build slot, yet there are no children - \
                 maybe the build hook gave an inappropriate 'postpone' reply",
            ));
        }
        if !really_wait && self.can_build_more() {
            self.wake_up(goal.clone());
        } else {
            let already = self
                .wanting_to_build
                .iter()
                .any(|w| w.upgrade().is_some_and(|g| Rc::ptr_eq(&g, goal)));
            if !already {
                self.wanting_to_build.push(Rc::downgrade(goal));
            }
        }
        Ok(())
    }

    /// Loop until the given top-level goals have finished.  Returns whether
    /// all of them succeeded.
    pub fn run(&mut self, goals: Vec<GoalPtr>) -> Result<bool> {
        let pseudo = Rc::new(RefCell::new(PseudoGoal {
            base: GoalBase::default(),
            success: true,
        }));
        {
            let pseudo_ptr: GoalPtr = pseudo.clone();
            let mut p = pseudo.borrow_mut();
            for goal in &goals {
                p.add_waitee(&pseudo_ptr, goal);
                self.top_goals.push(goal.clone());
            }
        }

        let result = self.run_loop();

        // Drop all goal state before reporting; destructors reap any
        // children still in flight.
        self.top_goals.clear();
        self.awake.clear();
        self.wanting_to_build.clear();
        self.children.clear();
        self.nr_children = 0;

        result?;
        let success = pseudo.borrow().success;
        Ok(success)
    }

    fn run_loop(&mut self) -> Result<()> {
        debug!("entered goal loop");
        loop {
            check_interrupt()?;

            while !self.awake.is_empty() {
                let awake = std::mem::take(&mut self.awake);
                for weak in awake {
                    check_interrupt()?;
                    if let Some(goal) = weak.upgrade() {
                        let mut g = goal.borrow_mut();
                        g.work(&goal, self)?;
                    }
                }
            }

            if self.top_goals.is_empty() {
                break;
            }

            // Nothing is awake, so progress can only come from a child.
            assert!(
                !self.children.is_empty(),
                "goal loop is stuck with no running children"
            );
            self.wait_for_input()?;
        }
        Ok(())
    }

    /// Block until a child's log pipe is readable.  EOF wakes the owning
    /// goal (its state machine treats EOF as "child terminated"); data is
    /// forwarded to the goal's log and, at debug verbosity, to our stderr.
    fn wait_for_input(&mut self) -> Result<()> {
        trace!("waiting for children");

        // Children whose goal was cancelled would never be drained; sweep
        // them (their processes were reaped by the goal's destructor).
        let dead: Vec<u32> = self
            .children
            .iter()
            .filter(|(_, c)| c.goal.upgrade().is_none())
            .map(|(pid, _)| *pid)
            .collect();
        for pid in dead {
            self.child_terminated(pid, true);
        }
        if self.children.is_empty() {
            return Ok(());
        }

        let entries: Vec<(u32, RawFd)> = self
            .children
            .iter()
            .map(|(pid, c)| (*pid, c.log_fd.as_raw_fd()))
            .collect();

        {
            // SAFETY: the fds are owned by `self.children`, which is not
            // mutated while the borrows are alive.
            #[allow(unsafe_code)]
            let mut poll_fds: Vec<PollFd> = entries
                .iter()
                .map(|(_, fd)| PollFd::new(unsafe { BorrowedFd::borrow_raw(*fd) }, PollFlags::POLLIN))
                .collect();

            match poll(&mut poll_fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => return Ok(()),
                Err(e) => {
                    return Err(Error::Sys {
                        message: "waiting for input".into(),
                        source: std::io::Error::from_raw_os_error(e as i32),
                    })
                }
            }

            let idle = poll_fds
                .iter()
                .all(|p| p.revents().map_or(true, |f| f.is_empty()));
            if idle {
                return Ok(());
            }

            // Note which fds are ready, then drop the borrows before
            // touching the goals.
            let ready: Vec<bool> = poll_fds
                .iter()
                .map(|p| p.revents().is_some_and(|r| !r.is_empty()))
                .collect();
            drop(poll_fds);

            for ((pid, fd), is_ready) in entries.into_iter().zip(ready) {
                check_interrupt()?;
                if !is_ready {
                    continue;
                }
                let Some(goal) = self.children.get(&pid).and_then(|c| c.goal.upgrade()) else {
                    continue;
                };

                let mut buf = [0u8; 4096];
                match read_raw_fd(fd, &mut buf) {
                    Ok(0) => {
                        debug!("{}: got EOF", goal.borrow().name());
                        self.wake_up(goal);
                    }
                    Ok(n) => {
                        goal.borrow_mut().write_log(&buf[..n]);
                        if tracing::enabled!(tracing::Level::DEBUG) {
                            let _ = std::io::stderr().write_all(&buf[..n]);
                        }
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(Error::Sys {
                            message: format!("reading from {}", goal.borrow().name()),
                            source: e,
                        })
                    }
                }
            }
        }

        Ok(())
    }
}

impl Drop for Worker<'_> {
    fn drop(&mut self) {
        // Release strong goal handles first so goal destructors run while
        // the child registry is still coherent.
        self.top_goals.clear();
        WORKING.with(|w| w.set(false));
    }
}

/// A spawned child process that is guaranteed to be reaped.  Children run
/// in their own process group; if the handle is dropped without a `wait`,
/// the whole group is killed first.
pub struct ChildProcess {
    child: Child,
    reaped: bool,
}

impl ChildProcess {
    pub fn new(child: Child) -> ChildProcess {
        ChildProcess {
            child,
            reaped: false,
        }
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    pub fn wait(&mut self) -> Result<ExitStatus> {
        let status = self
            .child
            .wait()
            .io_context(|| "waiting for child process".to_string())?;
        self.reaped = true;
        Ok(status)
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        if !self.reaped {
            let pid = Pid::from_raw(self.child.id() as i32);
            let _ = killpg(pid, Signal::SIGKILL);
            let _ = self.child.wait();
        }
    }
}

/// Read from a raw fd that stays owned elsewhere (the child registry).
pub(crate) fn read_raw_fd(fd: RawFd, buf: &mut [u8]) -> std::io::Result<usize> {
    use std::io::Read as _;
    use std::os::fd::FromRawFd as _;
    // SAFETY: the fd is owned by the caller's child registry and outlives
    // this call; ManuallyDrop keeps the temporary File from closing it.
    #[allow(unsafe_code)]
    let mut file = std::mem::ManuallyDrop::new(unsafe { std::fs::File::from_raw_fd(fd) });
    file.read(buf)
}

/// Render a child's exit status for error messages.
pub fn status_to_string(status: ExitStatus) -> String {
    match (status.code(), status.signal()) {
        (Some(code), _) => format!("failed with exit code {code}"),
        (None, Some(signal)) => format!("was killed by signal {signal}"),
        (None, None) => "exited abnormally".to_string(),
    }
}

/// Realise the outputs of every derivation in `drv_paths`.
pub fn build_derivations(store: &Store, drv_paths: &PathSet) -> Result<()> {
    debug!("building {} derivation(s)", drv_paths.len());

    let mut worker = Worker::new(store);
    let goals: Vec<GoalPtr> = drv_paths
        .iter()
        .map(|p| worker.make_derivation_goal(p))
        .collect();

    if !worker.run(goals)? {
        return Err(Error::build("build failed"));
    }
    Ok(())
}

/// Ensure that `path` is valid, realising it through substitutes if
/// necessary.
pub fn ensure_path(store: &Store, path: &Path) -> Result<()> {
    if store.is_valid_path(path) {
        return Ok(());
    }

    let mut worker = Worker::new(store);
    let goal = worker.make_substitution_goal(path);
    if !worker.run(vec![goal])? {
        return Err(Error::other(format!(
            "path '{}' does not exist and cannot be created",
            path.display()
        )));
    }
    Ok(())
}
