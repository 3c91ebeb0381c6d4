// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! The public ICE agent.
//!
//! An [`Agent`] owns one UDP socket and one worker thread.  The worker
//! alternates between draining the socket and bookkeeping the
//! [`ConnCheckList`](crate::conncheck::ConnCheckList): firing due STUN
//! transmissions, retransmitting, keeping the selected pair alive, and
//! advancing the connection state.  Public methods run on arbitrary
//! threads; they take the agent mutex, mutate, and pulse the interrupt
//! channel so the worker re-evaluates its deadline.  Application callbacks
//! are always invoked from the worker with the mutex released.

use std::error::Error;
use std::fmt::Display;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use rand::prelude::*;

use crate::candidate::Candidate;
use crate::conncheck::{
    CheckListEvent, CheckListPoll, ConnCheckList, ConnectionState, HandleRecv,
    MIN_STUN_RETRANSMISSION_TIMEOUT, MAX_STUN_SERVER_RECORDS_COUNT,
};
use crate::description::{Credentials, Description};
use crate::gathering;
use crate::socket::{UdpSocketChannel, RECV_BUFFER_SIZE};

/// The SOFTWARE attribute value placed in generated error responses.
pub const SOFTWARE_NAME: &str = concat!("floe v", env!("CARGO_PKG_VERSION"));

/// Errors returned by the public agent operations.
#[derive(Debug)]
pub enum AgentError {
    /// Malformed or unacceptable input (bad SDP, oversized payload,
    /// an operation repeated that can only happen once).
    InvalidArgument,
    /// A required resource is unavailable (no usable interface, no
    /// selected pair yet).
    NotAvailable,
    /// The socket cannot take more data right now; retry later.
    WouldBlock,
    /// The agent has reached the terminal failed state.
    Failed,
    /// An operating-system I/O error (socket bind or send), preserved as
    /// reported.
    Io(std::io::Error),
}

impl Error for AgentError {}

impl Display for AgentError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl From<std::io::Error> for AgentError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut => {
                AgentError::WouldBlock
            }
            _ => AgentError::Io(e),
        }
    }
}

type StateCallback = Box<dyn Fn(ConnectionState) + Send + Sync>;
type CandidateCallback = Box<dyn Fn(&str) + Send + Sync>;
type GatheringDoneCallback = Box<dyn Fn() + Send + Sync>;
type RecvCallback = Box<dyn Fn(&[u8]) + Send + Sync>;

#[derive(Default)]
struct Callbacks {
    on_state_change: Option<StateCallback>,
    on_candidate: Option<CandidateCallback>,
    on_gathering_done: Option<GatheringDoneCallback>,
    on_recv: Option<RecvCallback>,
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("Callbacks(..)")
    }
}

/// A builder for an [`Agent`].
#[derive(Debug, Default)]
pub struct AgentBuilder {
    stun_servers: Vec<String>,
    bind_address: Option<IpAddr>,
    port_range: Option<(u16, u16)>,
    controlling: Option<bool>,
    max_message_size: Option<usize>,
    retransmission_timeout: Option<Duration>,
    callbacks: Callbacks,
}

impl AgentBuilder {
    /// Add a STUN server (`host:port`) used for server-reflexive candidate
    /// gathering.  At most [`MAX_STUN_SERVER_RECORDS_COUNT`] resolved
    /// addresses are used.
    pub fn stun_server(mut self, server: &str) -> Self {
        self.stun_servers.push(server.to_owned());
        self
    }

    /// Bind the agent socket to a specific local address instead of the
    /// wildcard.
    pub fn bind_address(mut self, address: IpAddr) -> Self {
        self.bind_address = Some(address);
        self
    }

    /// Restrict the local port to the given inclusive range.
    pub fn port_range(mut self, min: u16, max: u16) -> Self {
        self.port_range = Some((min, max));
        self
    }

    /// Force the initial ICE role.  Without this the agent starts
    /// controlling if it begins gathering before learning about the peer.
    /// The role may still change while repairing role conflicts.
    pub fn controlling(mut self, controlling: bool) -> Self {
        self.controlling = Some(controlling);
        self
    }

    /// The largest application payload accepted by [`Agent::send`].
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// The initial STUN retransmission timeout.  Values below 500 ms are
    /// clamped up, as required by RFC 8445.
    pub fn retransmission_timeout(mut self, rto: Duration) -> Self {
        self.retransmission_timeout = Some(rto);
        self
    }

    /// Invoked from the worker thread on every connection state change.
    pub fn on_state_change(
        mut self,
        f: impl Fn(ConnectionState) + Send + Sync + 'static,
    ) -> Self {
        self.callbacks.on_state_change = Some(Box::new(f));
        self
    }

    /// Invoked from the worker thread with the SDP attribute line of every
    /// gathered local candidate.
    pub fn on_candidate(mut self, f: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.callbacks.on_candidate = Some(Box::new(f));
        self
    }

    /// Invoked from the worker thread once local gathering has finished.
    pub fn on_gathering_done(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.callbacks.on_gathering_done = Some(Box::new(f));
        self
    }

    /// Invoked from the worker thread with every received application
    /// datagram.
    pub fn on_recv(mut self, f: impl Fn(&[u8]) + Send + Sync + 'static) -> Self {
        self.callbacks.on_recv = Some(Box::new(f));
        self
    }

    /// Bind the socket and construct the [`Agent`].
    pub fn build(self) -> Result<Agent, AgentError> {
        let channel = UdpSocketChannel::bind(self.bind_address, self.port_range)?;
        let mut rng = rand::thread_rng();
        let tie_breaker = rng.gen::<u64>();
        let session_id = rng.gen::<u64>();
        let rto = self
            .retransmission_timeout
            .unwrap_or(MIN_STUN_RETRANSMISSION_TIMEOUT);
        let list = ConnCheckList::new(Credentials::generate(), tie_breaker, self.controlling, rto);
        Ok(Agent {
            shared: Arc::new(Shared {
                channel,
                list: Mutex::new(list),
                callbacks: self.callbacks,
                state: AtomicU8::new(ConnectionState::Disconnected.to_u8()),
                selected_remote: Mutex::new(None),
                stopped: AtomicBool::new(false),
                stun_servers: self.stun_servers,
                session_id,
                max_message_size: self.max_message_size.unwrap_or(65536),
            }),
            thread: Mutex::new(None),
        })
    }
}

/// State shared between the public handle and the worker thread.
#[derive(Debug)]
struct Shared {
    channel: UdpSocketChannel,
    list: Mutex<ConnCheckList>,
    callbacks: Callbacks,
    /// Mirror of the connection state, readable without the list mutex.
    state: AtomicU8,
    /// Publish slot for the selected pair's remote address so that
    /// [`Agent::send`] never contends with the worker on the list mutex.
    /// Written only by the worker on nomination.
    selected_remote: Mutex<Option<SocketAddr>>,
    stopped: AtomicBool,
    stun_servers: Vec<String>,
    session_id: u64,
    max_message_size: usize,
}

/// An ICE agent: gathers candidates, performs connectivity checks against
/// one remote peer and relays application data over the selected pair.
pub struct Agent {
    shared: Arc<Shared>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Agent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Agent(state: {})", self.state())
    }
}

impl Agent {
    /// Create a new [`AgentBuilder`].
    pub fn builder() -> AgentBuilder {
        AgentBuilder::default()
    }

    /// The current connection state.
    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.shared.state.load(Ordering::Acquire))
    }

    /// Whether this agent currently has the controlling role.
    pub fn controlling(&self) -> bool {
        self.shared.list.lock().unwrap().mode() == crate::conncheck::AgentMode::Controlling
    }

    /// The local port the agent socket is bound to.
    pub fn local_addr(&self) -> SocketAddr {
        self.shared.channel.local_addr()
    }

    /// Start gathering local candidates and spawn the worker thread.
    /// Candidates are reported through the `on_candidate` callback and
    /// appear in [`Agent::local_description`].
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn gather_candidates(&self) -> Result<(), AgentError> {
        let mut thread = self.thread.lock().unwrap();
        if thread.is_some() {
            return Err(AgentError::InvalidArgument);
        }
        let local_addr = self.shared.channel.local_addr();
        let hosts = gathering::host_addresses(local_addr);
        if hosts.is_empty() {
            return Err(AgentError::NotAvailable);
        }
        let servers: Vec<SocketAddr> = self
            .shared
            .stun_servers
            .iter()
            .flat_map(|server| gathering::resolve_stun_server(server, local_addr.is_ipv4()))
            .take(MAX_STUN_SERVER_RECORDS_COUNT)
            .collect();
        {
            let mut list = self.shared.list.lock().unwrap();
            list.start_gathering(hosts, servers, Instant::now());
        }
        let shared = self.shared.clone();
        let handle = std::thread::Builder::new()
            .name("floe-agent".to_owned())
            .spawn(move || worker_loop(shared))?;
        *thread = Some(handle);
        Ok(())
    }

    /// The local session description as SDP text, including all candidates
    /// gathered so far.
    pub fn local_description(&self) -> String {
        let list = self.shared.list.lock().unwrap();
        list.local_description().to_sdp(self.shared.session_id)
    }

    /// Set the remote session description from SDP text.  May be called
    /// before or after [`Agent::gather_candidates`], but only once.
    pub fn set_remote_description(&self, sdp: &str) -> Result<(), AgentError> {
        if self.state() == ConnectionState::Failed {
            return Err(AgentError::Failed);
        }
        let description =
            Description::from_str(sdp).map_err(|_| AgentError::InvalidArgument)?;
        {
            let mut list = self.shared.list.lock().unwrap();
            if list.remote_description().is_some() {
                return Err(AgentError::InvalidArgument);
            }
            list.set_remote_description(description, Instant::now());
        }
        self.interrupt();
        Ok(())
    }

    /// Add a single trickled remote candidate, as an
    /// `a=candidate:...` (or bare `candidate:...`) line.
    pub fn add_remote_candidate(&self, line: &str) -> Result<(), AgentError> {
        if self.state() == ConnectionState::Failed {
            return Err(AgentError::Failed);
        }
        let candidate =
            Candidate::from_str(line.trim()).map_err(|_| AgentError::InvalidArgument)?;
        {
            let mut list = self.shared.list.lock().unwrap();
            if list.remote_description().is_none() {
                return Err(AgentError::InvalidArgument);
            }
            list.add_remote_candidate(candidate, Instant::now());
        }
        self.interrupt();
        Ok(())
    }

    /// Signal that the remote peer will not trickle any further
    /// candidates.
    pub fn set_remote_gathering_done(&self) -> Result<(), AgentError> {
        {
            let mut list = self.shared.list.lock().unwrap();
            if list.remote_description().is_none() {
                return Err(AgentError::InvalidArgument);
            }
            list.set_remote_gathering_done(Instant::now());
        }
        self.interrupt();
        Ok(())
    }

    /// Send an application payload over the selected pair.  Available once
    /// a pair has been nominated; delivery is UDP semantics.
    pub fn send(&self, data: &[u8]) -> Result<(), AgentError> {
        if data.len() > self.shared.max_message_size {
            return Err(AgentError::InvalidArgument);
        }
        if self.state() == ConnectionState::Failed {
            return Err(AgentError::Failed);
        }
        let to = (*self.shared.selected_remote.lock().unwrap()).ok_or(AgentError::NotAvailable)?;
        self.shared.channel.send_to(data, to)?;
        Ok(())
    }

    /// The nominated (local, remote) candidate pair, if any.
    pub fn selected_pair(&self) -> Option<(Candidate, Candidate)> {
        let list = self.shared.list.lock().unwrap();
        list.selected_pair()
            .map(|pair| (pair.local.clone(), pair.remote.clone()))
    }

    /// Wake the worker so it reconsiders its deadline.
    fn interrupt(&self) {
        if let Err(e) = self.shared.channel.interrupt() {
            warn!("failed to interrupt the agent worker: {e}");
        }
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shared.stopped.store(true, Ordering::Release);
        let _ = self.shared.channel.interrupt();
        if let Some(handle) = self.thread.lock().unwrap().take() {
            let _ = handle.join();
        }
    }
}

/// The worker loop: receive with a deadline-bounded timeout, then
/// bookkeep.
fn worker_loop(shared: Arc<Shared>) {
    debug!("agent worker started");
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let mut events: Vec<CheckListEvent> = vec![];
    loop {
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }
        let now = Instant::now();
        let deadline = {
            let mut list = shared.list.lock().unwrap();
            bookkeep(&shared, &mut list, &mut events, now)
        };
        dispatch_events(&shared, &mut events);
        if shared.stopped.load(Ordering::Acquire) {
            break;
        }

        let timeout = deadline.map(|d| d.saturating_duration_since(Instant::now()));
        match shared.channel.recv_from_timeout(&mut buf, timeout) {
            Ok((len, from)) => {
                handle_datagram(&shared, &buf[..len], from);
                // drain whatever else has queued up behind it; responses
                // and events are produced by the next bookkeeping pass
                loop {
                    match shared.channel.try_recv_from(&mut buf) {
                        Ok(Some((len, from))) => handle_datagram(&shared, &buf[..len], from),
                        Ok(None) => break,
                        Err(e) => {
                            warn!("receive error: {e}");
                            break;
                        }
                    }
                }
            }
            Err(e)
                if e.kind() == std::io::ErrorKind::WouldBlock
                    || e.kind() == std::io::ErrorKind::TimedOut =>
            {
                // deadline reached; the next bookkeeping pass acts on it
            }
            Err(e) => {
                // transient I/O problems are logged and the loop carries on
                warn!("receive error: {e}");
            }
        }
    }
    debug!("agent worker stopped");
}

/// Drive the state machine until it blocks, sending due transmissions and
/// collecting events.  Returns the next wake-up deadline.
fn bookkeep(
    shared: &Shared,
    list: &mut ConnCheckList,
    events: &mut Vec<CheckListEvent>,
    now: Instant,
) -> Option<Instant> {
    loop {
        match list.poll(now) {
            CheckListPoll::Transmit(transmit) => {
                if let Err(e) = shared.channel.send_to(&transmit.data, transmit.to) {
                    if e.kind() == std::io::ErrorKind::WouldBlock {
                        trace!("socket backpressure, transmission dropped");
                    } else {
                        warn!("send to {} failed: {e}", transmit.to);
                    }
                }
            }
            CheckListPoll::Event(event) => events.push(event),
            CheckListPoll::WaitUntil(deadline) => return Some(deadline),
            CheckListPoll::Idle => return None,
        }
    }
}

/// Feed one datagram to the state machine, delivering it to the
/// application if it was not STUN.  Zero-length datagrams are interrupt
/// pulses.
fn handle_datagram(shared: &Shared, data: &[u8], from: SocketAddr) {
    if data.is_empty() {
        trace!("worker interrupted");
        return;
    }
    let handled = {
        let mut list = shared.list.lock().unwrap();
        list.handle_incoming(data, from, Instant::now())
    };
    if handled == HandleRecv::Data {
        if let Some(on_recv) = &shared.callbacks.on_recv {
            on_recv(data);
        }
    }
}

/// Invoke application callbacks for collected events.  Runs without the
/// list mutex so a callback may call back into the agent.
fn dispatch_events(shared: &Shared, events: &mut Vec<CheckListEvent>) {
    for event in events.drain(..) {
        match event {
            CheckListEvent::StateChange(state) => {
                shared.state.store(state.to_u8(), Ordering::Release);
                if let Some(on_state_change) = &shared.callbacks.on_state_change {
                    on_state_change(state);
                }
            }
            CheckListEvent::NewLocalCandidate(candidate) => {
                if let Some(on_candidate) = &shared.callbacks.on_candidate {
                    on_candidate(&format!("a={}", candidate.to_sdp_attribute()));
                }
            }
            CheckListEvent::GatheringDone => {
                if let Some(on_gathering_done) = &shared.callbacks.on_gathering_done {
                    on_gathering_done();
                }
            }
            CheckListEvent::SelectedPair(pair) => {
                *shared.selected_remote.lock().unwrap() = Some(pair.remote.address);
            }
        }
    }
}
