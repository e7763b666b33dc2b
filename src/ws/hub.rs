//! The session multiplexer.
//!
//! One hub per session: it owns the endpoint set and the session's engine,
//! fans controller commands in, fans engine events out, and enforces the
//! idle-shutdown policy. All endpoint-set mutations happen inside the single
//! event loop; broadcasts never wait on an endpoint (slow peers are evicted);
//! shutdown runs exactly once, after which nothing is broadcast.

use crate::debugger::{self, Debugger};
use crate::ws::endpoint::{Endpoint, EndpointId};
use crate::ws::proto::{self, Envelope, SessionState};
use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;

/// Reference tick cadence of the idle check. Sessions configured with a
/// shorter idle timeout tick at that timeout instead.
const HUB_TICK_INTERVAL: Duration = Duration::from_secs(60);

/// Capacity of the hub's own event and command channels.
const EVENT_BUFFER_SIZE: usize = 256;
const COMMAND_BUFFER_SIZE: usize = 32;
const CTL_BUFFER_SIZE: usize = 16;

/// Runs when the session shuts down; the registry uses it to drop the id.
pub type ShutdownCallback = Box<dyn Fn(&str) + Send + Sync>;

pub(crate) enum Ctl {
    Attach(Endpoint),
    Detach(EndpointId),
    Shutdown,
}

/// Cloneable address of a running hub.
#[derive(Clone, Debug)]
pub struct HubHandle {
    session_id: String,
    ctl: mpsc::Sender<Ctl>,
    commands: mpsc::Sender<Envelope>,
}

impl HubHandle {
    pub fn session_id(&self) -> &str {
        &self.session_id
    }

    /// Hand an endpoint to the session. False means the session is gone.
    pub async fn attach(&self, endpoint: Endpoint) -> bool {
        self.ctl.send(Ctl::Attach(endpoint)).await.is_ok()
    }

    /// Deregister an endpoint. Idempotent; a dead session is fine too.
    pub async fn detach(&self, id: EndpointId) {
        let _ = self.ctl.send(Ctl::Detach(id)).await;
    }

    /// Forward a controller envelope to the session's command channel.
    pub async fn forward_command(
        &self,
        envelope: Envelope,
    ) -> Result<(), mpsc::error::SendError<Envelope>> {
        self.commands.send(envelope).await
    }

    /// Ask the session to shut down. Idempotent.
    pub async fn shutdown(&self) {
        let _ = self.ctl.send(Ctl::Shutdown).await;
    }
}

pub struct Hub {
    session_id: String,
    endpoints: HashMap<EndpointId, mpsc::Sender<String>>,

    ctl_rx: mpsc::Receiver<Ctl>,
    ctl_tx: mpsc::Sender<Ctl>,
    events_rx: mpsc::Receiver<proto::Event>,
    events_tx: mpsc::Sender<proto::Event>,
    commands_rx: mpsc::Receiver<Envelope>,

    idle_timeout: Duration,
    last_activity: Instant,

    /// The engine, parked until the first start-debug command; a session
    /// owns at most one engine for its lifetime.
    parked_engine: Option<(Debugger, mpsc::Receiver<debugger::Event>)>,
    engine_cmds: mpsc::Sender<debugger::Command>,
    engine_end: Arc<AtomicBool>,

    on_shutdown: ShutdownCallback,
    pending_shutdown: bool,
}

impl Hub {
    pub fn new(
        session_id: String,
        idle_timeout: Duration,
        on_shutdown: ShutdownCallback,
    ) -> (Hub, HubHandle) {
        let (ctl_tx, ctl_rx) = mpsc::channel(CTL_BUFFER_SIZE);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER_SIZE);
        let (commands_tx, commands_rx) = mpsc::channel(COMMAND_BUFFER_SIZE);
        let (engine, link) = Debugger::new();

        let handle = HubHandle {
            session_id: session_id.clone(),
            ctl: ctl_tx.clone(),
            commands: commands_tx,
        };
        let hub = Hub {
            session_id,
            endpoints: HashMap::new(),
            ctl_rx,
            ctl_tx,
            events_rx,
            events_tx,
            commands_rx,
            idle_timeout,
            last_activity: Instant::now(),
            parked_engine: Some((engine, link.events)),
            engine_cmds: link.commands,
            engine_end: link.end_session,
            on_shutdown,
            pending_shutdown: false,
        };
        (hub, handle)
    }

    /// The session event loop. Selects across the idle tick, endpoint
    /// control messages, outgoing events and incoming commands until one of
    /// them asks for shutdown.
    pub async fn run(mut self) {
        let tick_period = self.idle_timeout.min(HUB_TICK_INTERVAL);
        let mut ticker = tokio::time::interval(tick_period);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        ticker.tick().await; // the immediate first tick

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if self.endpoints.is_empty() && self.last_activity.elapsed() > self.idle_timeout {
                        info!(
                            target: "ws",
                            "session {} idle for more than {:?}, shutting down",
                            self.session_id, self.idle_timeout
                        );
                        self.pending_shutdown = true;
                    }
                }
                Some(ctl) = self.ctl_rx.recv() => self.handle_ctl(ctl),
                Some(event) = self.events_rx.recv() => self.broadcast(&event),
                Some(envelope) = self.commands_rx.recv() => self.handle_command(envelope),
            }
            if self.pending_shutdown {
                break;
            }
        }
        self.shutdown();
    }

    fn handle_ctl(&mut self, ctl: Ctl) {
        match ctl {
            Ctl::Attach(endpoint) => {
                self.last_activity = Instant::now();
                self.endpoints.insert(endpoint.id, endpoint.outbound);
                info!(
                    target: "ws",
                    "endpoint {} attached to session {} ({} total)",
                    endpoint.id,
                    self.session_id,
                    self.endpoints.len()
                );
            }
            Ctl::Detach(id) => {
                if self.detach(id) && self.endpoints.is_empty() {
                    info!(
                        target: "ws",
                        "session {} has no endpoints left, shutting down",
                        self.session_id
                    );
                    self.pending_shutdown = true;
                }
            }
            Ctl::Shutdown => self.pending_shutdown = true,
        }
    }

    /// Remove an endpoint and close its outbound queue (sender drop; exactly
    /// once since the map owns the only sender). Returns whether it was
    /// attached.
    fn detach(&mut self, id: EndpointId) -> bool {
        match self.endpoints.remove(&id) {
            Some(_outbound) => {
                info!(
                    target: "ws",
                    "endpoint {id} detached from session {} ({} remaining)",
                    self.session_id,
                    self.endpoints.len()
                );
                true
            }
            None => false,
        }
    }

    /// Serialize once, push with zero wait everywhere, evict whoever cannot
    /// accept. An eviction that empties the session also shuts it down.
    fn broadcast(&mut self, event: &proto::Event) {
        self.last_activity = Instant::now();
        let frame = match serde_json::to_string(event) {
            Ok(frame) => frame,
            Err(e) => {
                warn!(target: "ws", "failed to serialize event: {e}");
                return;
            }
        };

        let had_endpoints = !self.endpoints.is_empty();
        let mut slow: Vec<EndpointId> = vec![];
        for (&id, outbound) in &self.endpoints {
            if outbound.try_send(frame.clone()).is_err() {
                slow.push(id);
            }
        }
        for id in slow {
            warn!(
                target: "ws",
                "endpoint {id} is slow, detaching from session {}",
                self.session_id
            );
            self.detach(id);
        }
        if had_endpoints && self.endpoints.is_empty() {
            self.pending_shutdown = true;
        }
    }

    fn handle_command(&mut self, envelope: Envelope) {
        debug!(
            target: "ws",
            "session {} command: {}",
            self.session_id, envelope.kind
        );
        match envelope.kind.as_str() {
            proto::CMD_START_DEBUG => match envelope.decode::<proto::StartDebugCmd>() {
                Ok(cmd) => self.start_engine(cmd.target_path),
                Err(e) => warn!(target: "ws", "{e:#}"),
            },
            proto::CMD_CONTINUE => match envelope.decode::<proto::ContinueCmd>() {
                Ok(_) => {
                    let update = self.state_update(SessionState::Executing);
                    self.broadcast(&update);
                    self.send_engine(debugger::Command::Continue);
                }
                Err(e) => warn!(target: "ws", "{e:#}"),
            },
            proto::CMD_STEP_OVER => match envelope.decode::<proto::StepOverCmd>() {
                Ok(_) => {
                    let update = self.state_update(SessionState::Executing);
                    self.broadcast(&update);
                    self.send_engine(debugger::Command::Step);
                }
                Err(e) => warn!(target: "ws", "{e:#}"),
            },
            proto::CMD_SET_BREAKPOINT => match envelope.decode::<proto::SetBreakpointCmd>() {
                Ok(cmd) => self.send_engine(debugger::Command::SetBreakpoint {
                    file: cmd.filename,
                    line: cmd.line,
                }),
                Err(e) => warn!(target: "ws", "{e:#}"),
            },
            proto::CMD_EXIT => match envelope.decode::<proto::ExitCmd>() {
                Ok(_) => self.send_engine(debugger::Command::Quit),
                Err(e) => warn!(target: "ws", "{e:#}"),
            },
            unknown => warn!(
                target: "ws",
                "unknown command type `{unknown}` in session {}, dropping",
                self.session_id
            ),
        }
    }

    /// Launch the parked engine on its dedicated OS thread and start pumping
    /// its events. ptrace requires every trace call to come from the thread
    /// that attached, so the engine never runs on the async scheduler.
    fn start_engine(&mut self, target_path: String) {
        let path = PathBuf::from(&target_path);
        if let Err(e) = debugger::validate_target_path(&path) {
            warn!(target: "ws", "session {}: {e:#}", self.session_id);
            return;
        }
        let Some((engine, engine_events)) = self.parked_engine.take() else {
            warn!(
                target: "ws",
                "session {} already started its debug session, ignoring",
                self.session_id
            );
            return;
        };

        info!(
            target: "ws",
            "session {}: starting debug of {target_path}",
            self.session_id
        );
        tokio::spawn(pump_engine_events(
            self.session_id.clone(),
            engine_events,
            self.events_tx.clone(),
            self.ctl_tx.clone(),
        ));

        let session_id = self.session_id.clone();
        let spawned = std::thread::Builder::new()
            .name(format!("trace-{session_id}"))
            .spawn(move || {
                if let Err(e) = engine.start(&path) {
                    warn!(
                        target: "debugger",
                        "session {session_id}: debug session ended with error: {e:#}"
                    );
                }
            });
        if let Err(e) = spawned {
            warn!(
                target: "ws",
                "session {}: failed to spawn the engine thread: {e}",
                self.session_id
            );
        }
    }

    /// Deliver a typed request to the engine without waiting: the engine
    /// consumes commands only while the target is stopped.
    fn send_engine(&self, command: debugger::Command) {
        if self.engine_cmds.try_send(command).is_err() {
            warn!(
                target: "ws",
                "session {}: engine command dropped (channel full or engine gone)",
                self.session_id
            );
        }
    }

    fn state_update(&self, new_state: SessionState) -> proto::Event {
        proto::Event::StateUpdate {
            session_id: self.session_id.clone(),
            new_state,
        }
    }

    /// Runs exactly once, at event-loop exit: flush events the pump already
    /// queued, close every endpoint queue, release the engine, drop the
    /// session id.
    fn shutdown(&mut self) {
        while let Ok(event) = self.events_rx.try_recv() {
            self.broadcast(&event);
        }
        info!(
            target: "ws",
            "session {} shutting down ({} endpoint(s) attached)",
            self.session_id,
            self.endpoints.len()
        );
        self.engine_end.store(true, Ordering::SeqCst);
        self.endpoints.clear();
        (self.on_shutdown)(&self.session_id);
    }
}

/// Bridge the engine's event stream into the session's broadcast channel,
/// synthesizing the state updates controllers key their UI off.
async fn pump_engine_events(
    session_id: String,
    mut engine_events: mpsc::Receiver<debugger::Event>,
    out: mpsc::Sender<proto::Event>,
    ctl: mpsc::Sender<Ctl>,
) {
    let mut ended_cleanly = false;
    while let Some(event) = engine_events.recv().await {
        let forwarded = match event {
            debugger::Event::InitialStop { pid } => {
                out.send(proto::Event::InitialBreakpoint {
                    session_id: session_id.clone(),
                    pid,
                })
                .await
                .and(
                    out.send(proto::Event::StateUpdate {
                        session_id: session_id.clone(),
                        new_state: SessionState::Breakpoint,
                    })
                    .await,
                )
            }
            debugger::Event::BreakpointHit {
                pid,
                file,
                line,
                function,
            } => {
                out.send(proto::Event::BreakpointHit {
                    session_id: session_id.clone(),
                    pid,
                    filename: file,
                    line,
                    function,
                })
                .await
                .and(
                    out.send(proto::Event::StateUpdate {
                        session_id: session_id.clone(),
                        new_state: SessionState::Breakpoint,
                    })
                    .await,
                )
            }
            debugger::Event::SessionEnded => {
                let _ = out
                    .send(proto::Event::StateUpdate {
                        session_id: session_id.clone(),
                        new_state: SessionState::Ready,
                    })
                    .await;
                ended_cleanly = true;
                break;
            }
        };
        if forwarded.is_err() {
            // hub already gone
            return;
        }
    }
    if !ended_cleanly {
        debug!(
            target: "ws",
            "engine of session {session_id} went away without announcing its end"
        );
    }
    let _ = ctl.send(Ctl::Shutdown).await;
}
