// SPDX-License-Identifier: MIT

//! The state machine that builds one derivation.
//!
//! ```text
//! init ──► have_derivation ──► outputs_substituted ──► inputs_realised
//!      ──► try_to_build ──► build_done
//! ```
//!
//! Invalid outputs are first attempted through substitutes; only when that
//! fails (and `try_fallback` allows) are the inputs realised and a local
//! build started — unless the build hook accepts the job first.  Build
//! errors complete the goal unsuccessfully without taking down the worker.

use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write as _;
use std::os::fd::{AsFd as _, AsRawFd as _, OwnedFd};
use std::os::unix::fs::PermissionsExt as _;
use std::os::unix::process::CommandExt as _;
use std::path::PathBuf;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::fcntl::OFlag;
use nix::poll::{poll, PollFd, PollFlags, PollTimeout};
use tempfile::TempDir;
use tracing::{debug, error, info};

use quern_store_core::derivation::Derivation;
use quern_store_core::hash::{Algorithm, Hash};
use quern_store_core::store_path::PathSet;

use crate::archive;
use crate::canonicalise::canonicalise_path_metadata;
use crate::config::Settings;
use crate::error::{Error, IoContext, Result};
use crate::pathlocks::PathLocks;
use crate::refscan::RefScanSink;
use crate::store::{delete_path, Store};
use crate::worker::{
    read_raw_fd, status_to_string, ChildProcess, Goal, GoalBase, GoalPtr, Worker,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Init,
    HaveDerivation,
    OutputsSubstituted,
    InputsRealised,
    TryToBuild,
    BuildDone,
}

/// Reply of the build hook to a job offer.
enum HookReply {
    /// The hook is building; wait for EOF on its log pipe.
    Accept,
    /// Try again when a build slot frees up.
    Postpone,
    /// The hook will not take the job; build locally.
    Decline,
    /// Another process already produced the outputs.
    Done,
}

pub struct DerivationGoal {
    base: GoalBase,
    state: State,

    /// The path of the derivation.
    drv_path: PathBuf,
    /// The derivation stored at `drv_path`, once loaded.
    drv: Option<Derivation>,

    /// Locks on the output paths, held from `prepare_build` until the
    /// outputs are registered (or the goal dies).
    output_locks: Option<PathLocks>,
    /// Union of the closures of all immediate input paths.
    input_paths: PathSet,
    /// Referenceable paths: outputs plus inputs, the candidate set for
    /// reference scanning.
    all_paths: PathSet,

    /// The running builder or hook process.
    child: Option<ChildProcess>,
    /// Temporary build directory (or the hook's communication directory).
    tmp_dir: Option<TempDir>,
    /// The per-derivation log file.
    log_file: Option<File>,
    /// Write side of the pipe the accepted hook reads `okay`/`cancel`
    /// from; kept open while the hook builds.
    hook_pipe: Option<OwnedFd>,
}

impl DerivationGoal {
    pub fn new(drv_path: PathBuf) -> DerivationGoal {
        DerivationGoal {
            base: GoalBase::default(),
            state: State::Init,
            drv_path,
            drv: None,
            output_locks: None,
            input_paths: PathSet::new(),
            all_paths: PathSet::new(),
            child: None,
            tmp_dir: None,
            log_file: None,
            hook_pipe: None,
        }
    }

    fn drv(&self) -> &Derivation {
        self.drv.as_ref().expect("derivation loaded")
    }

    // ── States ──────────────────────────────────────────────────────────

    /// Make sure the derivation file itself exists; it may arrive through
    /// a substitute.
    fn init(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let goal = worker.make_substitution_goal(&self.drv_path);
        self.add_waitee(self_rc, &goal);
        self.state = State::HaveDerivation;
        Ok(())
    }

    fn have_derivation(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        if self.base.nr_failed != 0 {
            return Err(Error::build(format!(
                "cannot build missing derivation '{}'",
                self.drv_path.display()
            )));
        }

        let store = worker.store();
        self.drv = Some(store.read_derivation(&self.drv_path)?);

        let invalid_outputs = self.check_path_validity(store, false);
        if invalid_outputs.is_empty() {
            self.am_done(self_rc, worker, true);
            return Ok(());
        }

        // Try substitutes first; don't bother creating a goal for outputs
        // that have none registered.
        for path in &invalid_outputs {
            if !store.query_substitutes(path)?.is_empty() {
                let goal = worker.make_substitution_goal(path);
                self.add_waitee(self_rc, &goal);
            }
        }

        if self.base.waitees.is_empty() {
            // No wake-up event will come; advance synchronously.
            self.outputs_substituted(self_rc, worker)
        } else {
            self.state = State::OutputsSubstituted;
            Ok(())
        }
    }

    fn outputs_substituted(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let store = worker.store();

        if self.base.nr_failed > 0 && !store.settings().try_fallback {
            return Err(Error::other(format!(
                "some substitutes for the outputs of derivation '{}' failed; try '--fallback'",
                self.drv_path.display()
            )));
        }
        self.base.nr_failed = 0;

        if self.check_path_validity(store, false).is_empty() {
            self.am_done(self_rc, worker, true);
            return Ok(());
        }

        // At least one output could not be substituted, so the inputs must
        // be realised before we can build.
        let input_drvs: Vec<PathBuf> = self.drv().input_drvs.keys().cloned().collect();
        for input_drv in input_drvs {
            let goal = worker.make_derivation_goal(&input_drv);
            self.add_waitee(self_rc, &goal);
        }
        let input_srcs: Vec<PathBuf> = self.drv().input_srcs.iter().cloned().collect();
        for input_src in input_srcs {
            let goal = worker.make_substitution_goal(&input_src);
            self.add_waitee(self_rc, &goal);
        }

        if self.base.waitees.is_empty() {
            self.inputs_realised(self_rc, worker)
        } else {
            self.state = State::InputsRealised;
            Ok(())
        }
    }

    fn inputs_realised(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        if self.base.nr_failed != 0 {
            return Err(Error::build(format!(
                "cannot build derivation '{}': {} inputs could not be realised",
                self.drv_path.display(),
                self.base.nr_failed
            )));
        }

        // Don't wait for a build slot here: none is needed if the build
        // hook takes the job.
        self.state = State::TryToBuild;
        worker.wake_up(self_rc.clone());
        Ok(())
    }

    fn try_to_build(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        match self.try_build_hook(self_rc, worker)? {
            HookReply::Accept => {
                // The hook is building; EOF on its log pipe lands us in
                // build_done.
                self.state = State::BuildDone;
                return Ok(());
            }
            HookReply::Postpone => {
                worker.wait_for_build_slot(self_rc, true)?;
                return Ok(());
            }
            HookReply::Done => {
                self.am_done(self_rc, worker, true);
                return Ok(());
            }
            HookReply::Decline => {}
        }

        if !worker.can_build_more() {
            worker.wait_for_build_slot(self_rc, false)?;
            return Ok(());
        }

        if worker.store().read_only() {
            return Err(Error::build(format!(
                "cannot build '{}': the store is read-only",
                self.drv_path.display()
            )));
        }

        // Acquire locks and gather closures.  If somebody else finished the
        // build in the meantime, we're done.
        if !self.prepare_build(worker)? {
            self.am_done(self_rc, worker, true);
            return Ok(());
        }

        self.start_builder(self_rc, worker)?;

        // Reached again when we get EOF on the builder's log pipe.
        self.state = State::BuildDone;
        Ok(())
    }

    fn build_done(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        // EOF on the log pipe means the child is presumed to have exited.
        // The wait below can in principle block if the child merely closed
        // its end of the pipe; we accept that, as the scheduler treats the
        // whole transition as opaque.
        let mut child = self.child.take().expect("child process running");
        let pid = child.pid();
        let status = child.wait()?;

        worker.child_terminated(pid, true);
        self.log_file = None;
        self.hook_pipe = None;

        debug!("builder process for '{}' finished", self.drv_path.display());

        if !status.success() {
            self.delete_tmp_dir(worker.store().settings(), false);
            return Err(Error::build(format!(
                "builder for '{}' {}",
                self.drv_path.display(),
                status_to_string(status)
            )));
        }

        self.delete_tmp_dir(worker.store().settings(), true);

        // Register the outputs and their reference closure; a failure here
        // (missing output, hash mismatch) is an ordinary build failure.
        self.compute_closure(worker)?;

        self.am_done(self_rc, worker, true);
        Ok(())
    }

    // ── Build preparation ───────────────────────────────────────────────

    /// Acquire locks on the output paths and gather the information needed
    /// for the build (input closures, referenceable paths).  Returns
    /// `false` when the outputs turned out to be valid already, which is
    /// not an error.
    fn prepare_build(&mut self, worker: &mut Worker<'_>) -> Result<bool> {
        let store = worker.store();

        // Locking can block on another process building the same
        // derivation; every goal transition is opaque to the scheduler, so
        // the whole worker waits with us.
        let outputs: Vec<PathBuf> = self.drv().output_paths().into_iter().collect();
        let mut output_locks = PathLocks::new();
        output_locks.lock_paths(&outputs)?;
        self.output_locks = Some(output_locks);

        // Check validity again: another process may have built the outputs
        // while we were waiting for the locks, and since we now hold them,
        // nobody else can start.
        let valid = self.check_path_validity(store, true);
        if valid.len() == self.drv().outputs.len() {
            debug!(
                "skipping build of derivation '{}', someone beat us to it",
                self.drv_path.display()
            );
            if let Some(locks) = self.output_locks.as_mut() {
                locks.set_deletion(true);
            }
            self.output_locks = None;
            return Ok(false);
        }
        if !valid.is_empty() {
            return Err(Error::build(format!(
                "derivation '{}' is blocked by its output paths",
                self.drv_path.display()
            )));
        }

        // Leftover output artifacts from a crashed build are unregistered
        // and may be deleted arbitrarily.
        for path in &outputs {
            if path.exists() {
                debug!("removing unregistered path '{}'", path.display());
                delete_path(path)?;
            }
        }

        self.all_paths.extend(outputs.iter().cloned());

        // The relevant output closures of each input derivation, for the
        // outputs that are actually requested.
        let input_drvs: Vec<(PathBuf, Vec<String>)> = self
            .drv()
            .input_drvs
            .iter()
            .map(|(path, wanted)| (path.clone(), wanted.iter().cloned().collect()))
            .collect();
        for (input_drv, wanted) in input_drvs {
            let in_drv = store.read_derivation(&input_drv)?;
            for output_name in wanted {
                match in_drv.outputs.get(&output_name) {
                    Some(output) => {
                        store.compute_fs_closure(&output.path, &mut self.input_paths)?;
                    }
                    None => {
                        return Err(Error::build(format!(
                            "derivation '{}' requires non-existent output '{}' \
                             from input derivation '{}'",
                            self.drv_path.display(),
                            output_name,
                            input_drv.display()
                        )));
                    }
                }
            }
        }

        let input_srcs: Vec<PathBuf> = self.drv().input_srcs.iter().cloned().collect();
        for input_src in input_srcs {
            store.compute_fs_closure(&input_src, &mut self.input_paths)?;
        }

        debug!("added {} input path(s)", self.input_paths.len());
        self.all_paths.extend(self.input_paths.iter().cloned());

        Ok(true)
    }

    // ── Local build ─────────────────────────────────────────────────────

    fn start_builder(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let store = worker.store();
        let settings = store.settings();

        info!(
            "building path(s) {}",
            show_paths(&self.drv().output_paths())
        );

        if self.drv().platform != settings.this_system {
            return Err(Error::build(format!(
                "a '{}' is required to build '{}', but I am a '{}'",
                self.drv().platform,
                self.drv_path.display(),
                settings.this_system
            )));
        }

        // The environment is scrubbed: only what the derivation declares
        // plus a few fixed bindings.  PATH gets a dummy value so shells
        // don't fill in their default; HOME points nowhere so tools treat
        // their dotfiles as absent instead of consulting /etc/passwd.
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        env.insert("PATH".into(), "/path-not-set".into());
        env.insert("HOME".into(), "/homeless-shelter".into());
        env.insert("NIX_STORE".into(), store.store_dir().as_str().into());

        for (key, value) in &self.drv().env {
            env.insert(key.clone(), value.clone());
        }

        let tmp_dir = tempfile::Builder::new()
            .prefix("quern-build-")
            .tempdir()
            .io_context(|| "creating a temporary build directory".to_string())?;
        let tmp = tmp_dir.path().to_string_lossy().into_owned();

        env.insert("NIX_BUILD_TOP".into(), tmp.clone());
        for var in ["TMPDIR", "TEMPDIR", "TMP", "TEMP"] {
            env.insert(var.into(), tmp.clone());
        }

        debug!("executing builder '{}'", self.drv().builder.display());

        let (log_read, log_write) = self.open_log_file(settings)?;

        let builder = self.drv().builder.clone();
        let argv0 = builder
            .file_name()
            .map(|n| n.to_owned())
            .unwrap_or_else(|| builder.as_os_str().to_owned());

        let mut cmd = Command::new(&builder);
        cmd.arg0(argv0)
            .args(&self.drv().args)
            .env_clear()
            .envs(&env)
            .current_dir(tmp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log_write
                    .try_clone()
                    .io_context(|| "duplicating the log pipe".to_string())?,
            ))
            .stderr(Stdio::from(log_write))
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            Error::build(format!(
                "cannot run builder '{}': {e}",
                builder.display()
            ))
        })?;
        // Close our copies of the log pipe's write side, or EOF never
        // arrives.
        drop(cmd);

        let pid = child.id();
        self.child = Some(ChildProcess::new(child));
        self.tmp_dir = Some(tmp_dir);
        worker.child_started(self_rc, pid, log_read, true);

        Ok(())
    }

    // ── Closure computation ─────────────────────────────────────────────

    /// Called after the output paths have become valid on disk: verify
    /// them, scan for references, and register everything in one
    /// transaction so a crash leaves either all outputs registered or
    /// none.
    fn compute_closure(&mut self, worker: &mut Worker<'_>) -> Result<()> {
        let store = worker.store();
        debug!("determining closure for '{}'", self.drv_path.display());

        let mut all_references: BTreeMap<PathBuf, PathSet> = BTreeMap::new();
        let mut content_hashes: BTreeMap<PathBuf, Hash> = BTreeMap::new();

        for output in self.drv().outputs.values() {
            let path = &output.path;
            if !path.exists() {
                return Err(Error::build(format!(
                    "builder for '{}' failed to produce output path '{}'",
                    self.drv_path.display(),
                    path.display()
                )));
            }

            // Fixed-output derivations must produce exactly the declared
            // content: a regular, non-executable file with the declared
            // hash.
            if output.is_fixed() {
                let algorithm: Algorithm = output.hash_algo.parse().map_err(|e| {
                    Error::build(format!("derivation '{}': {e}", self.drv_path.display()))
                })?;
                let declared = Hash::parse_hex(algorithm, &output.hash).map_err(|e| {
                    Error::build(format!("derivation '{}': {e}", self.drv_path.display()))
                })?;
                let actual = archive::hash_file(algorithm, path)
                    .io_context(|| format!("hashing '{}'", path.display()))?;
                if declared != actual {
                    return Err(Error::build(format!(
                        "output path '{}' should have {} hash '{}', instead has '{}'",
                        path.display(),
                        output.hash_algo,
                        declared.to_hex(),
                        actual.to_hex()
                    )));
                }

                let meta = fs::symlink_metadata(path)
                    .io_context(|| format!("getting attributes of '{}'", path.display()))?;
                if !meta.is_file() || meta.permissions().mode() & 0o111 != 0 {
                    return Err(Error::build(format!(
                        "output path '{}' should be a non-executable regular file",
                        path.display()
                    )));
                }
            }

            canonicalise_path_metadata(path)?;

            // One pass over the dump stream yields both the content hash
            // and the embedded references.
            let (references, content_hash) = if path.join("nix-support/no-scan").exists() {
                let hash = archive::hash_path(path)
                    .io_context(|| format!("hashing '{}'", path.display()))?;
                (PathSet::new(), hash)
            } else {
                debug!("scanning for store references in '{}'", path.display());
                let mut scanner = RefScanSink::new(store.store_dir(), &self.all_paths);
                let mut hasher = HashWriter::new();
                {
                    let mut tee = TeeWriter {
                        first: &mut scanner,
                        second: &mut hasher,
                    };
                    archive::dump_path(path, &mut tee)
                        .io_context(|| format!("dumping '{}'", path.display()))?;
                }
                (scanner.found_paths(), hasher.finish())
            };

            for input in &self.input_paths {
                if references.contains(input) {
                    debug!("referenced input: '{}'", input.display());
                } else {
                    debug!("unreferenced input: '{}'", input.display());
                }
            }

            all_references.insert(path.clone(), references);
            content_hashes.insert(path.clone(), content_hash);
        }

        // One transaction for all outputs: hashes first (so outputs may
        // reference each other and themselves), then references and
        // derivers.
        store.with_txn(|txn| {
            for output in self.drv().outputs.values() {
                let path = &output.path;
                store.register_valid_path(
                    txn,
                    path,
                    &content_hashes[path],
                    &PathSet::new(),
                    None,
                )?;
            }
            for output in self.drv().outputs.values() {
                let path = &output.path;
                store.set_references(txn, path, &all_references[path])?;
                store.set_deriver(txn, path, &self.drv_path)?;
            }
            Ok(())
        })?;

        // All future lockers will see valid outputs, so they will not
        // re-create lock files with these names.
        if let Some(locks) = self.output_locks.as_mut() {
            locks.set_deletion(true);
        }
        self.output_locks = None;

        Ok(())
    }

    // ── Build hook ──────────────────────────────────────────────────────

    /// Offer this job to the build hook, if one is configured.
    fn try_build_hook(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<HookReply> {
        let store = worker.store();
        let settings = store.settings();
        let Some(hook_path) = settings.build_hook.clone() else {
            return Ok(HookReply::Decline);
        };

        // Files used for communication with the hook live in a fresh
        // temporary directory.
        let tmp_dir = tempfile::Builder::new()
            .prefix("quern-hook-")
            .tempdir()
            .io_context(|| "creating a hook communication directory".to_string())?;

        let (log_read, log_write) = self.open_log_file(settings)?;
        let (from_hook_read, from_hook_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .io_context(|| "creating the from-hook pipe".to_string())?;
        let (to_hook_read, to_hook_write) = nix::unistd::pipe2(OFlag::O_CLOEXEC)
            .io_context(|| "creating the to-hook pipe".to_string())?;

        let mut cmd = Command::new(&hook_path);
        cmd.arg(if worker.can_build_more() { "1" } else { "0" })
            .arg(&settings.this_system)
            .arg(&self.drv().platform)
            .arg(&self.drv_path)
            .current_dir(tmp_dir.path())
            .stdin(Stdio::null())
            .stdout(Stdio::from(
                log_write
                    .try_clone()
                    .io_context(|| "duplicating the log pipe".to_string())?,
            ))
            .stderr(Stdio::from(log_write))
            .process_group(0);

        // The hook writes replies on fd 3 and reads our go-ahead on fd 4.
        let reply_fd = from_hook_write.as_raw_fd();
        let control_fd = to_hook_read.as_raw_fd();
        // SAFETY: dup2 is async-signal-safe; nothing else runs between
        // fork and exec.
        #[allow(unsafe_code)]
        unsafe {
            cmd.pre_exec(move || {
                if libc::dup2(reply_fd, 3) == -1 || libc::dup2(control_fd, 4) == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd
            .spawn()
            .io_context(|| format!("executing build hook '{}'", hook_path.display()))?;
        let pid = child.id();
        let mut child = ChildProcess::new(child);

        // Close the child's ends in this process (the spawner's copies of
        // the log pipe included, or draining it would never see EOF).
        drop(cmd);
        drop(from_hook_write);
        drop(to_hook_read);

        self.tmp_dir = Some(tmp_dir);

        let reply = self.read_hook_reply(&from_hook_read, &log_read)?;
        debug!("hook reply is '{reply}'");

        match reply.as_str() {
            "decline" | "postpone" => {
                self.drain_log_pipe(&log_read);
                child.wait()?;
                self.log_file = None;
                self.tmp_dir = None;
                if reply == "decline" {
                    Ok(HookReply::Decline)
                } else {
                    Ok(HookReply::Postpone)
                }
            }
            "accept" => {
                // Acquire locks and such.  If the output paths are now
                // valid, tell the hook to stand down.
                if !self.prepare_build(worker)? {
                    write_line(&to_hook_write, "cancel")?;
                    drop(to_hook_write);
                    self.drain_log_pipe(&log_read);
                    child.wait()?;
                    self.log_file = None;
                    self.tmp_dir = None;
                    return Ok(HookReply::Done);
                }

                info!(
                    "running hook to build path(s) {}",
                    show_paths(&self.drv().output_paths())
                );

                self.write_hook_files(store)?;
                write_line(&to_hook_write, "okay")?;

                self.child = Some(child);
                self.hook_pipe = Some(to_hook_write);
                worker.child_started(self_rc, pid, log_read, false);

                Ok(HookReply::Accept)
            }
            other => Err(Error::other(format!("bad hook reply '{other}'"))),
        }
    }

    /// Read the hook's reply line while also draining its log pipe, so a
    /// chatty hook cannot deadlock against us.
    fn read_hook_reply(&mut self, from_hook: &OwnedFd, log_read: &OwnedFd) -> Result<String> {
        let mut reply = Vec::new();
        let mut log_open = true;

        loop {
            let mut poll_fds = Vec::with_capacity(2);
            poll_fds.push(PollFd::new(from_hook.as_fd(), PollFlags::POLLIN));
            if log_open {
                poll_fds.push(PollFd::new(log_read.as_fd(), PollFlags::POLLIN));
            }

            match poll(&mut poll_fds, PollTimeout::NONE) {
                Ok(_) => {}
                Err(Errno::EINTR) => continue,
                Err(e) => {
                    return Err(Error::Sys {
                        message: "waiting for the build hook".into(),
                        source: std::io::Error::from_raw_os_error(e as i32),
                    })
                }
            }

            let reply_ready = poll_fds[0].revents().is_some_and(|r| !r.is_empty());
            let log_ready = log_open && poll_fds[1].revents().is_some_and(|r| !r.is_empty());
            drop(poll_fds);

            if log_ready {
                let mut buf = [0u8; 4096];
                match read_raw_fd(log_read.as_raw_fd(), &mut buf) {
                    Ok(0) => log_open = false,
                    Ok(n) => self.write_log_chunk(&buf[..n]),
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(Error::Sys {
                            message: "reading the hook log".into(),
                            source: e,
                        })
                    }
                }
            }

            if reply_ready {
                let mut byte = [0u8; 1];
                match read_raw_fd(from_hook.as_raw_fd(), &mut byte) {
                    Ok(0) => {
                        return Err(Error::other(
                            "unexpected EOF while reading the build hook's reply",
                        ))
                    }
                    Ok(_) => {
                        if byte[0] == b'\n' {
                            return String::from_utf8(reply)
                                .map_err(|_| Error::other("hook reply is not UTF-8"));
                        }
                        reply.push(byte[0]);
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                    Err(e) => {
                        return Err(Error::Sys {
                            message: "reading the hook reply".into(),
                            source: e,
                        })
                    }
                }
            }
        }
    }

    /// Forward whatever is left in a terminated hook's log pipe.
    fn drain_log_pipe(&mut self, log_read: &OwnedFd) {
        let mut buf = [0u8; 4096];
        loop {
            match read_raw_fd(log_read.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(n) => self.write_log_chunk(&buf[..n]),
                Err(e) if e.kind() == std::io::ErrorKind::Interrupted => {}
                Err(_) => break,
            }
        }
    }

    /// Write the information the hook needs to perform the build: the
    /// input paths, the output paths, and the reference graph of the
    /// inputs.
    fn write_hook_files(&self, store: &Store) -> Result<()> {
        let tmp = self
            .tmp_dir
            .as_ref()
            .expect("hook communication directory present")
            .path();

        let mut inputs = String::new();
        for path in &self.input_paths {
            inputs.push_str(&path.to_string_lossy());
            inputs.push('\n');
        }
        for drv in self.drv().input_drvs.keys() {
            inputs.push_str(&drv.to_string_lossy());
            inputs.push('\n');
        }
        fs::write(tmp.join("inputs"), inputs)
            .io_context(|| "writing the hook's inputs file".to_string())?;

        let mut outputs = String::new();
        for path in self.drv().output_paths() {
            outputs.push_str(&path.to_string_lossy());
            outputs.push('\n');
        }
        fs::write(tmp.join("outputs"), outputs)
            .io_context(|| "writing the hook's outputs file".to_string())?;

        let mut references = String::new();
        for path in &self.input_paths {
            references.push_str(&path.to_string_lossy());
            for reference in store.query_references(path)? {
                references.push(' ');
                references.push_str(&reference.to_string_lossy());
            }
            references.push('\n');
        }
        fs::write(tmp.join("references"), references)
            .io_context(|| "writing the hook's references file".to_string())?;

        Ok(())
    }

    // ── Helpers ─────────────────────────────────────────────────────────

    /// Open the per-derivation log file and a pipe for the child's output.
    /// Returns the (read, write) sides of the pipe.
    fn open_log_file(&mut self, settings: &Settings) -> Result<(OwnedFd, OwnedFd)> {
        fs::create_dir_all(&settings.log_dir)
            .io_context(|| format!("creating log directory '{}'", settings.log_dir.display()))?;

        let base_name = self
            .drv_path
            .file_name()
            .expect("derivation paths have a base name");
        let log_path = settings.log_dir.join(base_name);
        let file = File::create(&log_path)
            .io_context(|| format!("creating log file '{}'", log_path.display()))?;
        self.log_file = Some(file);

        nix::unistd::pipe2(OFlag::O_CLOEXEC).io_context(|| "creating the log pipe".to_string())
    }

    fn write_log_chunk(&mut self, data: &[u8]) {
        if let Some(file) = &mut self.log_file {
            if let Err(e) = file.write_all(data) {
                error!(
                    "cannot write to the log file of '{}': {e}",
                    self.drv_path.display()
                );
                self.log_file = None;
            }
        }
    }

    fn delete_tmp_dir(&mut self, settings: &Settings, force: bool) {
        if let Some(tmp_dir) = self.tmp_dir.take() {
            if settings.keep_failed && !force {
                error!(
                    "builder for '{}' failed; keeping build directory '{}'",
                    self.drv_path.display(),
                    tmp_dir.path().display()
                );
                let _ = tmp_dir.keep();
            }
            // Otherwise dropped here, which removes it.
        }
    }

    /// The set of (in)valid output paths.
    fn check_path_validity(&self, store: &Store, return_valid: bool) -> PathSet {
        self.drv()
            .outputs
            .values()
            .filter(|o| store.is_valid_path(&o.path) == return_valid)
            .map(|o| o.path.clone())
            .collect()
    }
}

impl Goal for DerivationGoal {
    fn base(&self) -> &GoalBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut GoalBase {
        &mut self.base
    }

    fn work(&mut self, self_rc: &GoalPtr, worker: &mut Worker<'_>) -> Result<()> {
        let result = match self.state {
            State::Init => self.init(self_rc, worker),
            State::HaveDerivation => self.have_derivation(self_rc, worker),
            State::OutputsSubstituted => self.outputs_substituted(self_rc, worker),
            State::InputsRealised => self.inputs_realised(self_rc, worker),
            State::TryToBuild => self.try_to_build(self_rc, worker),
            State::BuildDone => self.build_done(self_rc, worker),
        };

        // A build failure completes this goal; everything else unwinds
        // through the scheduler.
        match result {
            Err(Error::Build(message)) => {
                error!("{message}");
                self.am_done(self_rc, worker, false);
                Ok(())
            }
            other => other,
        }
    }

    fn name(&self) -> String {
        format!("building of '{}'", self.drv_path.display())
    }

    fn write_log(&mut self, data: &[u8]) {
        self.write_log_chunk(data);
    }
}

fn write_line(fd: &OwnedFd, line: &str) -> Result<()> {
    let mut data = line.as_bytes().to_vec();
    data.push(b'\n');
    let mut written = 0;
    while written < data.len() {
        match nix::unistd::write(fd.as_fd(), &data[written..]) {
            Ok(n) => written += n,
            Err(Errno::EINTR) => {}
            Err(e) => {
                return Err(Error::Sys {
                    message: "writing to the build hook".into(),
                    source: std::io::Error::from_raw_os_error(e as i32),
                })
            }
        }
    }
    Ok(())
}

fn show_paths(paths: &PathSet) -> String {
    paths
        .iter()
        .map(|p| format!("'{}'", p.display()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Two writers fed by one dump pass: the reference scanner and the
/// content hasher.
struct TeeWriter<'a, A: std::io::Write, B: std::io::Write> {
    first: &'a mut A,
    second: &'a mut B,
}

impl<A: std::io::Write, B: std::io::Write> std::io::Write for TeeWriter<'_, A, B> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.first.write_all(buf)?;
        self.second.write_all(buf)?;
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.first.flush()?;
        self.second.flush()
    }
}

/// `io::Write` adapter over a SHA-256 context.
struct HashWriter {
    ctx: quern_store_core::hash::Context,
}

impl HashWriter {
    fn new() -> HashWriter {
        HashWriter {
            ctx: quern_store_core::hash::Context::new(Algorithm::Sha256),
        }
    }

    fn finish(self) -> Hash {
        self.ctx.finish()
    }
}

impl std::io::Write for HashWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.ctx.update(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}
