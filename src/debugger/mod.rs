//! The tracing engine.
//!
//! One engine owns one traced process. Every ptrace-class call for a target
//! must originate from the OS thread that performed the initial attach, so
//! the whole engine runs on a dedicated thread: it launches the target,
//! services commands while the target is stopped, and polls the thread group
//! for stops while the target runs. The session hub talks to it exclusively
//! through the command/event channels and the end-of-session flag.

pub mod breakpoint;
pub mod code;
pub mod debug_info;
pub mod error;

use crate::debugger::breakpoint::BreakpointTable;
use crate::debugger::code::TRAP_PC_OFFSET;
use crate::debugger::debug_info::DebugInfo;
use crate::debugger::error::Error;
use crate::weak_error;
use log::{debug, error, info, warn};
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::Signal;
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::Pid;
use std::ops::ControlFlow;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command as ProcessCommand;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// Capacity of the hub → engine command channel.
pub const COMMAND_CHANNEL_CAPACITY: usize = 32;
/// Capacity of the engine → hub event channel.
pub const EVENT_CHANNEL_CAPACITY: usize = 256;

/// Poll cadence of the main wait loop when no thread has changed state.
const WAIT_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Typed request serviced by the engine while the target is stopped.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Continue,
    Step,
    SetBreakpoint { file: String, line: u64 },
    ClearBreakpoint { file: String, line: u64 },
    Quit,
}

/// Event published by the engine to its session hub.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Target launched and stopped at its first instruction.
    InitialStop { pid: i32 },
    /// A thread stopped on a trap.
    BreakpointHit {
        pid: i32,
        file: String,
        line: u64,
        function: String,
    },
    /// The engine is done: target exited, was detached, or setup ended it.
    SessionEnded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    Idle,
    AttachedStopped,
    Running,
    TrapStopped,
    Exited,
    Detached,
}

/// Hub-side handles of a freshly created engine.
pub struct EngineLink {
    pub commands: mpsc::Sender<Command>,
    pub events: mpsc::Receiver<Event>,
    pub end_session: Arc<AtomicBool>,
}

struct Target {
    path: PathBuf,
    pid: Pid,
    pgid: Pid,
    debug_info: DebugInfo,
    /// Runtime load address of a position-independent target; zero for
    /// fixed-address objects.
    load_bias: u64,
}

impl Target {
    fn runtime_pc(&self, global: u64) -> u64 {
        global + self.load_bias
    }

    fn global_pc(&self, runtime: u64) -> u64 {
        runtime - self.load_bias
    }
}

pub struct Debugger {
    commands: mpsc::Receiver<Command>,
    events: mpsc::Sender<Event>,
    end_session: Arc<AtomicBool>,
    breakpoints: BreakpointTable,
    state: State,
    target: Option<Target>,
}

impl Debugger {
    pub fn new() -> (Debugger, EngineLink) {
        let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        let end_session = Arc::new(AtomicBool::new(false));
        let debugger = Debugger {
            commands: cmd_rx,
            events: event_tx,
            end_session: end_session.clone(),
            breakpoints: BreakpointTable::new(),
            state: State::Idle,
            target: None,
        };
        let link = EngineLink {
            commands: cmd_tx,
            events: event_rx,
            end_session,
        };
        (debugger, link)
    }

    pub fn state(&self) -> State {
        self.state
    }

    /// Launch `path` under tracing and drive the debug session to its end.
    /// Must be called on the thread that will own every subsequent trace
    /// operation; consumes the engine.
    ///
    /// Path validation failures reject the target before anything is
    /// spawned. Later setup failures abort the session; the trap loop ends
    /// sessions gracefully on its own errors.
    pub fn start(mut self, path: &Path) -> Result<(), Error> {
        let result = self.start_inner(path);
        if let Err(e) = &result {
            if matches!(e, Error::TargetRejected(_)) {
                warn!(target: "debugger", "rejected target {}: {e:#}", path.display());
                return result;
            }
            error!(target: "debugger", "debug session aborted: {e:#}");
        }
        self.stop();
        self.emit(Event::SessionEnded);
        result
    }

    fn start_inner(&mut self, path: &Path) -> Result<(), Error> {
        let target_path = validate_target_path(path)?;

        let mut launch = ProcessCommand::new(&target_path);
        unsafe {
            launch.pre_exec(|| {
                // Own process group: the group wait in the trap loop must see
                // this target's threads and nothing else.
                nix::unistd::setpgid(Pid::from_raw(0), Pid::from_raw(0))
                    .map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))?;
                ptrace::traceme().map_err(|errno| std::io::Error::from_raw_os_error(errno as i32))
            });
        }
        let child = launch.spawn().map_err(Error::LaunchFailed)?;
        let pid = Pid::from_raw(child.id() as i32);

        // The kernel stops the child with SIGTRAP at its first instruction.
        let status = waitpid(pid, None).map_err(Error::AttachFailed)?;
        debug!(target: "debugger", "initial stop of {pid}: {status:?}");

        // Trace threads the target clones, and take the target down with us
        // if this thread dies before an orderly detach.
        ptrace::setoptions(
            pid,
            Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_EXITKILL,
        )
        .map_err(Error::OptionsFailed)?;

        let debug_info =
            DebugInfo::new(&target_path).map_err(|e| Error::DebugInfoUnavailable(Box::new(e)))?;
        let pgid = debug_info.process_group(pid)?;
        let load_bias = if debug_info.is_dynamic() {
            read_load_bias(pid)?
        } else {
            0
        };

        info!(
            target: "debugger",
            "started target {} with pid {pid}, pgid {pgid}",
            target_path.display()
        );
        self.target = Some(Target {
            path: target_path,
            pid,
            pgid,
            debug_info,
            load_bias,
        });
        self.state = State::AttachedStopped;

        if self.initial_stop().is_break() {
            return Ok(());
        }

        debug!(target: "debugger", "entering the trap loop");
        self.run_loop();
        Ok(())
    }

    /// Service commands while the target sits at its launch stop. Stepping is
    /// not available here; continue leaves the handler and enters the loop.
    fn initial_stop(&mut self) -> ControlFlow<()> {
        let pid = self.target.as_ref().expect("target attached").pid;
        info!(target: "debugger", "initial stop, pid {pid}, ready for commands");
        self.emit(Event::InitialStop { pid: pid.as_raw() });

        loop {
            if self.end_session.load(Ordering::SeqCst) {
                debug!(target: "debugger", "session ended during the initial stop");
                return ControlFlow::Break(());
            }
            let Some(cmd) = self.commands.blocking_recv() else {
                return ControlFlow::Break(());
            };
            debug!(target: "debugger", "command at initial stop: {cmd:?}");
            match cmd {
                Command::SetBreakpoint { file, line } => {
                    weak_error!(self.set_breakpoint(&file, line));
                }
                Command::ClearBreakpoint { file, line } => {
                    weak_error!(self.clear_breakpoint(&file, line));
                }
                Command::Continue => {
                    if let Err(e) = ptrace::cont(pid, None) {
                        warn!(target: "debugger", "failed to resume target: {e}");
                        return ControlFlow::Break(());
                    }
                    self.state = State::Running;
                    return ControlFlow::Continue(());
                }
                Command::Step => {
                    warn!(target: "debugger", "single step from the initial stop is not supported")
                }
                Command::Quit => {
                    self.stop();
                    return ControlFlow::Break(());
                }
            }
        }
    }

    /// The main wait loop: poll the whole thread group without blocking so
    /// the end-of-session flag stays responsive, and sleep briefly when
    /// nothing changed. Wait and resume errors end the session gracefully
    /// since the usual cause is a detached or dead target.
    fn run_loop(&mut self) {
        let (pid, pgid, target_path) = {
            let target = self.target.as_ref().expect("target attached");
            (target.pid, target.pgid, target.path.display().to_string())
        };

        loop {
            if self.end_session.load(Ordering::SeqCst) {
                debug!(target: "debugger", "session end signalled, leaving the trap loop");
                return;
            }

            let status = match waitpid(
                Pid::from_raw(-pgid.as_raw()),
                Some(WaitPidFlag::WNOHANG | WaitPidFlag::__WALL),
            ) {
                Ok(status) => status,
                Err(Errno::ECHILD) => {
                    debug!(target: "debugger", "no children left to wait for");
                    return;
                }
                Err(e) => {
                    warn!(target: "debugger", "failed to wait for the thread group: {e}");
                    return;
                }
            };

            match status {
                WaitStatus::StillAlive => std::thread::sleep(WAIT_POLL_INTERVAL),
                WaitStatus::Exited(wpid, exit_code) => {
                    if wpid == pid {
                        info!(
                            target: "debugger",
                            "target {target_path} exited with code {exit_code}"
                        );
                        self.state = State::Exited;
                        return;
                    }
                    debug!(target: "debugger", "thread {wpid} exited");
                }
                WaitStatus::Signaled(wpid, signal, _) if wpid == pid => {
                    info!(target: "debugger", "target killed by {signal}");
                    self.state = State::Exited;
                    return;
                }
                // A plain trap stop: one of our breakpoints or a step.
                WaitStatus::Stopped(wpid, Signal::SIGTRAP) => {
                    self.state = State::TrapStopped;
                    self.handle_trap(wpid);
                }
                // Thread-clone and friends: administrative stops, resume.
                WaitStatus::PtraceEvent(wpid, _, event) => {
                    debug!(target: "debugger", "ptrace event {event} on thread {wpid}");
                    if let Err(e) = ptrace::cont(wpid, None) {
                        warn!(target: "debugger", "failed to resume thread {wpid}: {e}");
                        return;
                    }
                }
                WaitStatus::Stopped(wpid, signal) => {
                    debug!(target: "debugger", "thread {wpid} stopped with {signal}, resuming");
                    if let Err(e) = ptrace::cont(wpid, None) {
                        warn!(target: "debugger", "failed to resume thread {wpid}: {e}");
                        return;
                    }
                }
                other => debug!(target: "debugger", "unexpected wait status: {other:?}"),
            }
        }
    }

    /// A thread stopped on a trap we planted: report the source location and
    /// block on the command channel until told how to proceed.
    fn handle_trap(&mut self, tid: Pid) {
        let regs = match ptrace::getregs(tid) {
            Ok(regs) => regs,
            Err(e) => {
                warn!(target: "debugger", "failed to read registers of {tid}: {e}");
                return;
            }
        };
        let bp_addr = regs.rip - TRAP_PC_OFFSET;

        let (file, line, function) = {
            let target = self.target.as_ref().expect("target attached");
            target.debug_info.pc_to_line(target.global_pc(bp_addr))
        };
        info!(
            target: "debugger",
            "breakpoint hit at {file}:{line} in {function}, thread {tid}, waiting for command"
        );
        self.emit(Event::BreakpointHit {
            pid: tid.as_raw(),
            file,
            line,
            function,
        });

        loop {
            if self.end_session.load(Ordering::SeqCst) {
                debug!(target: "debugger", "session ended while stopped at a breakpoint");
                self.rewind_onto_breakpoint(tid, bp_addr);
                return;
            }
            let Some(cmd) = self.commands.blocking_recv() else {
                self.rewind_onto_breakpoint(tid, bp_addr);
                return;
            };
            debug!(target: "debugger", "command at breakpoint: {cmd:?}");
            match cmd {
                Command::Continue => {
                    self.continue_from_stop(tid);
                    return;
                }
                Command::Step => {
                    self.single_step(tid);
                    return;
                }
                Command::SetBreakpoint { file, line } => {
                    // arm and keep waiting for the next command
                    weak_error!(self.set_breakpoint(&file, line));
                }
                Command::ClearBreakpoint { file, line } => {
                    weak_error!(self.clear_breakpoint(&file, line));
                }
                Command::Quit => {
                    self.rewind_onto_breakpoint(tid, bp_addr);
                    self.stop();
                    return;
                }
            }
        }
    }

    /// The thread sits one byte past our trap. Rewind so it resumes on the
    /// restored original instruction once the breakpoint is disarmed and the
    /// target detached.
    fn rewind_onto_breakpoint(&self, tid: Pid, bp_addr: u64) {
        if !self.breakpoints.contains(bp_addr) {
            return;
        }
        match ptrace::getregs(tid) {
            Ok(mut regs) => {
                regs.rip = bp_addr;
                weak_error!(ptrace::setregs(tid, regs).map_err(|e| Error::Syscall("setregs", e)));
            }
            Err(e) => warn!(target: "debugger", "failed to read registers of {tid}: {e}"),
        }
    }

    /// Resume a thread stopped at one of our traps, stepping over the armed
    /// breakpoint so it stays armed for the next pass.
    fn continue_from_stop(&mut self, tid: Pid) {
        if let Err(e) = self.step_over_breakpoint(tid) {
            warn!(target: "debugger", "failed to step over breakpoint: {e:#}");
        }
    }

    /// The delicate sequence: disarm, rewind the pc onto the restored
    /// instruction, single-step exactly this thread, re-arm, continue. Once
    /// it completes the table lists the address with the same saved byte as
    /// before and execution has advanced one instruction.
    fn step_over_breakpoint(&mut self, tid: Pid) -> Result<(), Error> {
        let mut regs = ptrace::getregs(tid).map_err(|e| Error::Syscall("getregs", e))?;
        let bp_addr = regs.rip - TRAP_PC_OFFSET;

        {
            let target = self.target.as_ref().ok_or(Error::NotStarted)?;
            let (file, line, _) = target.debug_info.pc_to_line(target.global_pc(bp_addr));
            debug!(
                target: "debugger",
                "stepping over breakpoint at {bp_addr:#x} ({file}:{line}), thread {tid}"
            );
        }

        if !self.breakpoints.contains(bp_addr) {
            // not our trap (e.g. a step stop): plain resume
            ptrace::cont(tid, None).map_err(|e| Error::Syscall("cont", e))?;
            self.state = State::Running;
            return Ok(());
        }

        self.breakpoints.disarm(tid, bp_addr)?;
        regs.rip = bp_addr;
        ptrace::setregs(tid, regs).map_err(|e| Error::Syscall("setregs", e))?;

        ptrace::step(tid, None).map_err(|e| Error::Syscall("step", e))?;
        // wait for this thread's step trap specifically
        waitpid(tid, Some(WaitPidFlag::__WALL)).map_err(Error::Waitpid)?;

        self.breakpoints.arm(tid, bp_addr)?;
        ptrace::cont(tid, None).map_err(|e| Error::Syscall("cont", e))?;
        self.state = State::Running;
        Ok(())
    }

    /// One-instruction step; the resulting trap is handled by the main loop
    /// like any other stop.
    fn single_step(&mut self, tid: Pid) {
        match ptrace::step(tid, None) {
            Ok(()) => self.state = State::Running,
            Err(e) => warn!(target: "debugger", "failed to single-step thread {tid}: {e}"),
        }
    }

    /// Arm a breakpoint at the first pc of `file:line`. Re-arming an armed
    /// line preserves the originally saved instruction byte.
    fn set_breakpoint(&mut self, file: &str, line: u64) -> Result<(), Error> {
        let (pid, pc) = {
            let target = self.target.as_ref().ok_or(Error::NotStarted)?;
            let pc = target.debug_info.line_to_pc(file, line)?;
            (target.pid, target.runtime_pc(pc))
        };
        self.breakpoints.arm(pid, pc)?;
        info!(target: "debugger", "breakpoint set at {file}:{line} ({pc:#x})");
        Ok(())
    }

    /// Restore the original instruction at `file:line` and drop the entry.
    fn clear_breakpoint(&mut self, file: &str, line: u64) -> Result<(), Error> {
        let (pid, pc) = {
            let target = self.target.as_ref().ok_or(Error::NotStarted)?;
            let pc = target.debug_info.line_to_pc(file, line)?;
            (target.pid, target.runtime_pc(pc))
        };
        self.breakpoints.disarm(pid, pc)?;
        info!(target: "debugger", "breakpoint cleared at {file}:{line} ({pc:#x})");
        Ok(())
    }

    /// Detach from the target, letting it run, and signal end of session.
    /// Safe to call more than once.
    fn stop(&mut self) {
        if let Some(target) = &self.target {
            if matches!(
                self.state,
                State::AttachedStopped | State::Running | State::TrapStopped
            ) {
                info!(target: "debugger", "detaching from target (pid {})", target.pid);
                self.breakpoints.disarm_all(target.pid);
                match ptrace::detach(target.pid, None) {
                    Ok(()) => self.state = State::Detached,
                    Err(e) => warn!(
                        target: "debugger",
                        "failed to detach from {}: {e} (target may have already exited)",
                        target.pid
                    ),
                }
            }
        }
        self.end_session.store(true, Ordering::SeqCst);
    }

    fn emit(&self, event: Event) {
        if self.events.blocking_send(event).is_err() {
            debug!(target: "debugger", "event channel closed, event dropped");
        }
    }
}

/// Resolve `path` and require it to stay inside the working directory and to
/// be a regular executable file. Rejected targets are never spawned.
pub fn validate_target_path(path: &Path) -> Result<PathBuf, Error> {
    let abs = std::fs::canonicalize(path)
        .map_err(|e| Error::TargetRejected(format!("{} is not accessible: {e}", path.display())))?;

    let cwd = std::env::current_dir().map_err(|e| {
        Error::TargetRejected(format!("could not determine the working directory: {e}"))
    })?;
    if !abs.starts_with(&cwd) {
        return Err(Error::TargetRejected(format!(
            "{} is outside the working directory {}",
            abs.display(),
            cwd.display()
        )));
    }

    let meta = std::fs::metadata(&abs)
        .map_err(|e| Error::TargetRejected(format!("{} is not accessible: {e}", abs.display())))?;
    if !meta.is_file() {
        return Err(Error::TargetRejected(format!(
            "{} is not a regular file",
            abs.display()
        )));
    }
    if meta.permissions().mode() & 0o111 == 0 {
        return Err(Error::TargetRejected(format!(
            "{} is not executable",
            abs.display()
        )));
    }

    Ok(abs)
}

/// Runtime load address of a position-independent target, taken from the
/// first mapping of `/proc/<pid>/maps`: right after launch the executable
/// itself is the lowest mapping.
fn read_load_bias(pid: Pid) -> Result<u64, Error> {
    let maps = std::fs::read_to_string(format!("/proc/{pid}/maps"))?;
    let first_line = maps
        .lines()
        .next()
        .ok_or_else(|| Error::TargetRejected("empty /proc maps".to_string()))?;
    let addr = first_line
        .split('-')
        .next()
        .ok_or_else(|| Error::TargetRejected("unexpected /proc maps format".to_string()))?;
    u64::from_str_radix(addr, 16)
        .map_err(|_| Error::TargetRejected("unexpected /proc maps format".to_string()))
}
