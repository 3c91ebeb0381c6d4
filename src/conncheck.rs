// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE connectivity checks, RFC 8445.
//!
//! [`ConnCheckList`] is the protocol core of an agent: the candidate-pair
//! table, the table of outstanding STUN transactions, the check scheduler
//! with its pacing and retransmission timers, the dispatcher for inbound
//! STUN messages, and the nomination and connection-state machinery.  It
//! performs no I/O of its own: time is passed in, and output is retrieved
//! by polling.

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use crate::candidate::{Candidate, CandidatePair, CandidateType, TransportType};
use crate::description::{Credentials, Description};
use crate::stun::attribute::*;
use crate::stun::message::*;

/// RFC 8445: agents MUST NOT use an RTO value smaller than 500 ms.
pub const MIN_STUN_RETRANSMISSION_TIMEOUT: Duration = Duration::from_millis(500);

/// How many times a transaction is retransmitted before being abandoned.
/// Together with the doubling timeout this gives up after ~30 s.
pub const MAX_STUN_RETRANSMISSION_COUNT: u32 = 5;

/// RFC 8445: agents SHOULD use a default Ta value of 50 ms between any two
/// outbound STUN transmissions.
pub const STUN_PACING_TIME: Duration = Duration::from_millis(50);

/// RFC 8445: agents SHOULD use a Tr value of 15 seconds between keepalives
/// on the selected pair, and MUST NOT use a smaller one.
pub const STUN_KEEPALIVE_PERIOD: Duration = Duration::from_secs(15);

/// How long after connectivity checks begin before the session fails when
/// no pair has succeeded.
pub const ICE_FAIL_TIMEOUT: Duration = Duration::from_secs(30);

pub const MAX_CANDIDATES_COUNT: usize = 20;
pub const MAX_STUN_SERVER_RECORDS_COUNT: usize = 2;
pub const MAX_HOST_CANDIDATES_COUNT: usize =
    MAX_CANDIDATES_COUNT - MAX_STUN_SERVER_RECORDS_COUNT - 2;
pub const MAX_CANDIDATE_PAIRS_COUNT: usize = MAX_CANDIDATES_COUNT * 2;
pub const MAX_STUN_ENTRIES_COUNT: usize =
    MAX_CANDIDATE_PAIRS_COUNT + MAX_STUN_SERVER_RECORDS_COUNT;

/// The connection state of an [`Agent`](crate::agent::Agent).
///
/// Progression is monotonic along `Disconnected -> Gathering -> Connecting
/// -> Connected -> Completed`, with `Failed` reachable from every other
/// state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ConnectionState {
    Disconnected,
    Gathering,
    Connecting,
    Connected,
    Completed,
    Failed,
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            ConnectionState::Disconnected => "disconnected",
            ConnectionState::Gathering => "gathering",
            ConnectionState::Connecting => "connecting",
            ConnectionState::Connected => "connected",
            ConnectionState::Completed => "completed",
            ConnectionState::Failed => "failed",
        })
    }
}

impl ConnectionState {
    pub(crate) fn to_u8(self) -> u8 {
        match self {
            ConnectionState::Disconnected => 0,
            ConnectionState::Gathering => 1,
            ConnectionState::Connecting => 2,
            ConnectionState::Connected => 3,
            ConnectionState::Completed => 4,
            ConnectionState::Failed => 5,
        }
    }

    pub(crate) fn from_u8(val: u8) -> Self {
        match val {
            0 => ConnectionState::Disconnected,
            1 => ConnectionState::Gathering,
            2 => ConnectionState::Connecting,
            3 => ConnectionState::Connected,
            4 => ConnectionState::Completed,
            _ => ConnectionState::Failed,
        }
    }
}

/// The ICE role of an agent.  May change during the negotiation as role
/// conflicts are repaired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AgentMode {
    Unknown,
    Controlled,
    Controlling,
}

impl std::fmt::Display for AgentMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            AgentMode::Unknown => "unknown",
            AgentMode::Controlled => "controlled",
            AgentMode::Controlling => "controlling",
        })
    }
}

/// The state of a single candidate pair.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidatePairState {
    Frozen,
    Waiting,
    InProgress,
    Succeeded,
    Failed,
}

impl std::fmt::Display for CandidatePairState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match self {
            CandidatePairState::Frozen => "frozen",
            CandidatePairState::Waiting => "waiting",
            CandidatePairState::InProgress => "in-progress",
            CandidatePairState::Succeeded => "succeeded",
            CandidatePairState::Failed => "failed",
        })
    }
}

/// A candidate pair together with its check bookkeeping.
#[derive(Debug, Clone)]
pub(crate) struct CheckPair {
    pub(crate) pair: CandidatePair,
    pub(crate) state: CandidatePairState,
    pub(crate) nominated: bool,
    /// Set when USE-CANDIDATE is (to be) attached to this pair's check,
    /// either by us as the controlling agent or as requested by the peer.
    pub(crate) nomination_requested: bool,
    pub(crate) priority: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum EntryKind {
    /// A binding toward a STUN server for server-reflexive gathering.
    Server,
    /// A connectivity check toward the remote candidate of a pair.
    Check(usize),
}

/// One outstanding (or periodically re-armed) STUN transaction.
#[derive(Debug)]
pub(crate) struct StunEntry {
    kind: EntryKind,
    remote: SocketAddr,
    transaction_id: TransactionId,
    next_transmission: Option<Instant>,
    retransmission_timeout: Duration,
    retransmissions: u32,
    /// Whether the current transaction id has been transmitted at least
    /// once and a response is awaited.
    in_flight: bool,
    /// The role attribute the in-flight request was sent with; a 487
    /// response switches to the other role (RFC 8445 §7.2.5.1).
    sent_controlling: Option<bool>,
    finished: bool,
    /// One-shot cross-thread trigger requesting immediate transmission.
    /// Cleared by the scheduler with a single atomic swap.
    armed: AtomicBool,
}

impl StunEntry {
    fn new(kind: EntryKind, remote: SocketAddr, rto: Duration) -> Self {
        Self {
            kind,
            remote,
            transaction_id: Message::generate_transaction(),
            next_transmission: None,
            retransmission_timeout: rto,
            retransmissions: 0,
            in_flight: false,
            sent_controlling: None,
            finished: false,
            armed: AtomicBool::new(false),
        }
    }

    /// Begin a fresh transaction on this entry.
    fn restart(&mut self, rto: Duration, next_transmission: Option<Instant>) {
        self.transaction_id = Message::generate_transaction();
        self.in_flight = false;
        self.sent_controlling = None;
        self.finished = false;
        self.retransmissions = 0;
        self.retransmission_timeout = rto;
        self.next_transmission = next_transmission;
    }
}

/// An outbound datagram produced by the state machine.
#[derive(Debug)]
pub struct Transmit {
    pub data: Vec<u8>,
    pub to: SocketAddr,
}

/// A notification produced by the state machine, delivered to the
/// application from the worker with the agent lock released.
#[derive(Debug)]
pub(crate) enum CheckListEvent {
    StateChange(ConnectionState),
    NewLocalCandidate(Candidate),
    GatheringDone,
    SelectedPair(Box<CandidatePair>),
}

/// What [`ConnCheckList::poll`] wants the caller to do next.
#[derive(Debug)]
pub(crate) enum CheckListPoll {
    /// Send a datagram.
    Transmit(Transmit),
    /// Deliver an event to the application.
    Event(CheckListEvent),
    /// Nothing to do until the provided time (or external input).
    WaitUntil(Instant),
    /// Nothing scheduled at all.
    Idle,
}

/// The result of feeding a received datagram to the state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum HandleRecv {
    /// The datagram was STUN and has been consumed.
    Handled,
    /// Not a STUN datagram; deliver to the application as data.
    Data,
}

/// The connectivity-check core of one agent.
#[derive(Debug)]
pub struct ConnCheckList {
    state: ConnectionState,
    mode: AgentMode,
    controlling_hint: Option<bool>,
    tie_breaker: u64,
    rto: Duration,
    local: Description,
    remote: Option<Description>,
    pairs: Vec<CheckPair>,
    /// Stable priority-sorted view into `pairs`, highest first.
    ordered_pairs: Vec<usize>,
    entries: Vec<StunEntry>,
    /// Entry indices queued by inbound binding requests.
    triggered: VecDeque<usize>,
    selected_entry: Option<usize>,
    last_transmission: Option<Instant>,
    fail_time: Option<Instant>,
    gathering_started: bool,
    events: VecDeque<CheckListEvent>,
    pending_transmits: VecDeque<Transmit>,
    foundation_counter: usize,
    remote_prflx_counter: usize,
}

impl ConnCheckList {
    pub(crate) fn new(
        credentials: Credentials,
        tie_breaker: u64,
        controlling_hint: Option<bool>,
        rto: Duration,
    ) -> Self {
        Self {
            state: ConnectionState::Disconnected,
            mode: AgentMode::Unknown,
            controlling_hint,
            tie_breaker,
            rto: rto.max(MIN_STUN_RETRANSMISSION_TIMEOUT),
            local: Description::new(credentials),
            remote: None,
            pairs: vec![],
            ordered_pairs: vec![],
            entries: vec![],
            triggered: VecDeque::new(),
            selected_entry: None,
            last_transmission: None,
            fail_time: None,
            gathering_started: false,
            events: VecDeque::new(),
            pending_transmits: VecDeque::new(),
            foundation_counter: 0,
            remote_prflx_counter: 0,
        }
    }

    pub(crate) fn state(&self) -> ConnectionState {
        self.state
    }

    pub(crate) fn mode(&self) -> AgentMode {
        self.mode
    }

    pub(crate) fn local_description(&self) -> &Description {
        &self.local
    }

    pub(crate) fn remote_description(&self) -> Option<&Description> {
        self.remote.as_ref()
    }

    /// The currently selected (nominated) candidate pair, if any.
    pub(crate) fn selected_pair(&self) -> Option<&CandidatePair> {
        let entry = &self.entries[self.selected_entry?];
        match entry.kind {
            EntryKind::Check(pair_idx) => Some(&self.pairs[pair_idx].pair),
            EntryKind::Server => None,
        }
    }

    fn set_state(&mut self, state: ConnectionState) {
        if state <= self.state {
            return;
        }
        info!(old = %self.state, new = %state, "connection state change");
        self.state = state;
        self.events.push_back(CheckListEvent::StateChange(state));
    }

    fn set_mode(&mut self, mode: AgentMode, now: Instant) {
        if self.mode == mode {
            return;
        }
        info!(old = %self.mode, new = %mode, "role change");
        self.mode = mode;
        // pair priorities depend on the role
        for p in self.pairs.iter_mut() {
            p.priority = p.pair.priority(mode == AgentMode::Controlling);
        }
        self.update_ordered_pairs();
        match mode {
            AgentMode::Controlled => {
                // withdraw nominations we have not concluded; the next
                // transmission of those checks goes out without
                // USE-CANDIDATE
                for p in self.pairs.iter_mut() {
                    if p.nomination_requested && !p.nominated {
                        p.nomination_requested = false;
                    }
                }
            }
            AgentMode::Controlling => self.try_nominate(now),
            AgentMode::Unknown => (),
        }
    }

    /// Produce the foundation for a local candidate: candidates sharing
    /// (type, base address, transport) collapse to one foundation.
    fn local_foundation(&mut self, ctype: CandidateType, base: SocketAddr) -> String {
        if let Some(existing) = self
            .local
            .candidates
            .iter()
            .find(|c| c.candidate_type == ctype && c.base_address.ip() == base.ip())
        {
            return existing.foundation.clone();
        }
        self.foundation_counter += 1;
        self.foundation_counter.to_string()
    }

    /// Begin gathering: emit the provided host addresses as candidates and
    /// create an armed server entry per STUN server address.
    #[tracing::instrument(level = "debug", skip(self, now))]
    pub(crate) fn start_gathering(
        &mut self,
        hosts: Vec<SocketAddr>,
        stun_servers: Vec<SocketAddr>,
        now: Instant,
    ) {
        if self.gathering_started {
            return;
        }
        self.gathering_started = true;
        if self.mode == AgentMode::Unknown {
            // without an explicit role, the side that starts before
            // learning about the peer is the controlling one
            let controlling = self.controlling_hint.unwrap_or(self.remote.is_none());
            self.set_mode(
                if controlling {
                    AgentMode::Controlling
                } else {
                    AgentMode::Controlled
                },
                now,
            );
        }
        self.set_state(ConnectionState::Gathering);
        for (i, addr) in hosts
            .into_iter()
            .take(MAX_HOST_CANDIDATES_COUNT)
            .enumerate()
        {
            let priority = Candidate::calculate_priority(
                CandidateType::Host,
                crate::gathering::local_preference(addr, i),
                1,
            );
            let foundation = self.local_foundation(CandidateType::Host, addr);
            let candidate =
                Candidate::builder(CandidateType::Host, TransportType::Udp, &foundation, addr)
                    .priority(priority)
                    .build();
            self.add_local_candidate(candidate, now);
        }
        for addr in stun_servers
            .into_iter()
            .take(MAX_STUN_SERVER_RECORDS_COUNT)
        {
            let mut entry = StunEntry::new(EntryKind::Server, addr, self.rto);
            entry.next_transmission = Some(now);
            entry.armed = AtomicBool::new(true);
            self.entries.push(entry);
        }
        self.update_gathering_done();
        self.check_connecting(now);
    }

    fn add_local_candidate(&mut self, candidate: Candidate, now: Instant) {
        if self.local.candidates.len() >= MAX_CANDIDATES_COUNT {
            warn!("local candidate table full, dropping {candidate:?}");
            return;
        }
        // RFC 8445 §5.1.3: drop candidates redundant with an existing one
        if self
            .local
            .candidates
            .iter()
            .any(|c| candidate.redundant_with(c))
        {
            debug!("redundant local candidate {candidate:?}");
            return;
        }
        if !self.local.add_candidate(candidate.clone()) {
            return;
        }
        info!(candidate = %candidate.to_sdp_attribute(), "new local candidate");
        self.events
            .push_back(CheckListEvent::NewLocalCandidate(candidate.clone()));
        let remote_candidates = self
            .remote
            .as_ref()
            .map(|r| r.candidates.clone())
            .unwrap_or_default();
        for remote_candidate in remote_candidates {
            self.add_pair(candidate.clone(), remote_candidate);
        }
        self.check_connecting(now);
    }

    #[tracing::instrument(level = "debug", skip(self, description, now))]
    pub(crate) fn set_remote_description(&mut self, description: Description, now: Instant) {
        if self.mode == AgentMode::Unknown {
            // learning about the peer before starting: the peer moved
            // first, default to the controlled role
            let controlling = self.controlling_hint.unwrap_or(false);
            self.set_mode(
                if controlling {
                    AgentMode::Controlling
                } else {
                    AgentMode::Controlled
                },
                now,
            );
        }
        let candidates = description.candidates;
        self.remote = Some(Description {
            credentials: description.credentials,
            candidates: vec![],
            end_of_candidates: description.end_of_candidates,
        });
        for candidate in candidates {
            self.add_remote_candidate_inner(candidate, false);
        }
        self.check_connecting(now);
    }

    /// Add a remote candidate received through trickle signaling.  The new
    /// pairs are armed for immediate checking.
    pub(crate) fn add_remote_candidate(&mut self, candidate: Candidate, _now: Instant) {
        self.add_remote_candidate_inner(candidate, true);
    }

    fn add_remote_candidate_inner(&mut self, candidate: Candidate, arm: bool) {
        let Some(remote) = self.remote.as_mut() else {
            warn!("remote candidate without a remote description, dropping");
            return;
        };
        if remote.candidates.len() >= MAX_CANDIDATES_COUNT {
            warn!("remote candidate table full, dropping {candidate:?}");
            return;
        }
        if !remote.add_candidate(candidate.clone()) {
            return;
        }
        debug!(candidate = %candidate.to_sdp_attribute(), "new remote candidate");
        for local_candidate in self.local.candidates.clone() {
            if let Some(pair_idx) = self.add_pair(local_candidate, candidate.clone()) {
                if arm {
                    if let Some(entry_idx) = self.entry_for_pair(pair_idx) {
                        self.entries[entry_idx].armed.store(true, Ordering::Release);
                    }
                }
            }
        }
    }

    pub(crate) fn set_remote_gathering_done(&mut self, now: Instant) {
        if let Some(remote) = self.remote.as_mut() {
            remote.end_of_candidates = true;
        }
        self.check_for_failure(now);
    }

    /// Add a candidate pair unless an equivalent one exists.  Returns the
    /// index of the (existing or new) pair, or `None` if the pair is not
    /// viable.
    fn add_pair(&mut self, local: Candidate, remote: Candidate) -> Option<usize> {
        if local.transport_type != remote.transport_type {
            return None;
        }
        if local.address.is_ipv4() != remote.address.is_ipv4() {
            return None;
        }
        // RFC 8445 §6.1.2.4: pairs are deduplicated on (local base, remote)
        let local_key = local.pair_prune_address();
        if let Some(existing) = self.pairs.iter().position(|p| {
            p.pair.local.pair_prune_address() == local_key
                && p.pair.remote.address == remote.address
        }) {
            return Some(existing);
        }
        if self.pairs.len() >= MAX_CANDIDATE_PAIRS_COUNT
            || self.entries.len() >= MAX_STUN_ENTRIES_COUNT
        {
            warn!("pair table full, dropping pair");
            return None;
        }
        let pair = CandidatePair::new(local, remote);
        let priority = pair.priority(self.mode == AgentMode::Controlling);
        let remote_addr = pair.remote.address;
        trace!(foundation = %pair.foundation(), priority, "new candidate pair");
        self.pairs.push(CheckPair {
            pair,
            state: CandidatePairState::Frozen,
            nominated: false,
            nomination_requested: false,
            priority,
        });
        let pair_idx = self.pairs.len() - 1;
        self.entries.push(StunEntry::new(
            EntryKind::Check(pair_idx),
            remote_addr,
            self.rto,
        ));
        self.update_ordered_pairs();
        self.unfreeze_pairs();
        Some(pair_idx)
    }

    fn entry_for_pair(&self, pair_idx: usize) -> Option<usize> {
        self.entries
            .iter()
            .position(|e| e.kind == EntryKind::Check(pair_idx))
    }

    fn update_ordered_pairs(&mut self) {
        let mut ordered: Vec<usize> = (0..self.pairs.len()).collect();
        ordered.sort_by(|&a, &b| self.pairs[b].priority.cmp(&self.pairs[a].priority));
        self.ordered_pairs = ordered;
    }

    /// RFC 8445 §6.1.2.6: a Frozen pair whose foundation has no Waiting or
    /// InProgress sibling moves to Waiting.
    fn unfreeze_pairs(&mut self) {
        for i in 0..self.ordered_pairs.len() {
            let idx = self.ordered_pairs[i];
            if self.pairs[idx].state != CandidatePairState::Frozen {
                continue;
            }
            let foundation = self.pairs[idx].pair.foundation();
            let blocked = self.pairs.iter().any(|p| {
                p.pair.foundation() == foundation
                    && matches!(
                        p.state,
                        CandidatePairState::Waiting | CandidatePairState::InProgress
                    )
            });
            if !blocked {
                self.pairs[idx].state = CandidatePairState::Waiting;
            }
        }
    }

    /// Unfreeze all pairs sharing a foundation with a just-succeeded pair.
    fn unfreeze_foundation(&mut self, foundation: &str) {
        for p in self.pairs.iter_mut() {
            if p.state == CandidatePairState::Frozen && p.pair.foundation() == foundation {
                p.state = CandidatePairState::Waiting;
            }
        }
    }

    fn check_connecting(&mut self, now: Instant) {
        if self.state == ConnectionState::Gathering
            && self.remote.is_some()
            && !self.local.candidates.is_empty()
        {
            self.set_state(ConnectionState::Connecting);
            self.fail_time = Some(now + ICE_FAIL_TIMEOUT);
        }
    }

    /// Fail early once both sides have finished gathering and every pair
    /// has failed.
    fn check_for_failure(&mut self, _now: Instant) {
        if self.state >= ConnectionState::Completed {
            return;
        }
        let remote_done = self.remote.as_ref().map_or(false, |r| r.end_of_candidates);
        if !remote_done || !self.local.end_of_candidates {
            return;
        }
        if !self.pairs.is_empty()
            && self
                .pairs
                .iter()
                .all(|p| p.state == CandidatePairState::Failed)
        {
            warn!("all candidate pairs failed");
            self.set_state(ConnectionState::Failed);
        }
    }

    fn update_gathering_done(&mut self) {
        if !self.gathering_started || self.local.end_of_candidates {
            return;
        }
        if self
            .entries
            .iter()
            .any(|e| e.kind == EntryKind::Server && !e.finished)
        {
            return;
        }
        info!("candidate gathering done");
        self.local.end_of_candidates = true;
        self.events.push_back(CheckListEvent::GatheringDone);
    }

    /// Feed a received datagram into the state machine.
    pub(crate) fn handle_incoming(
        &mut self,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) -> HandleRecv {
        if !Message::is_stun(data) {
            return HandleRecv::Data;
        }
        let msg = match Message::from_bytes(data) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("dropping malformed STUN datagram from {from}: {e}");
                return HandleRecv::Handled;
            }
        };
        trace!(from = %from, msg = %msg, "received STUN");
        match msg.class() {
            MessageClass::Request => {
                if msg.has_method(BINDING) {
                    self.handle_binding_request(&msg, data, from, now);
                } else if let Ok(mut response) = Message::bad_request(&msg) {
                    let _ = response.add_fingerprint();
                    self.pending_transmits.push_back(Transmit {
                        data: response.to_bytes(),
                        to: from,
                    });
                }
            }
            MessageClass::Success | MessageClass::Error => {
                self.handle_binding_response(&msg, data, from, now)
            }
            MessageClass::Indication => {
                // consent/keepalive; nothing to answer
                trace!("consumed binding indication from {from}");
            }
        }
        HandleRecv::Handled
    }

    fn queue_error_response(&mut self, msg: &Message, code: u16, to: SocketAddr, sign: bool) {
        let Ok(mut response) = Message::error_response(msg, code) else {
            return;
        };
        if sign {
            let credentials = ShortTermCredentials::new(&self.local.credentials.passwd);
            if response.add_message_integrity(&credentials).is_err() {
                return;
            }
        }
        if response.add_fingerprint().is_err() {
            return;
        }
        self.pending_transmits.push_back(Transmit {
            data: response.to_bytes(),
            to,
        });
    }

    #[tracing::instrument(level = "debug", skip(self, msg, data, now), fields(from = %from))]
    fn handle_binding_request(
        &mut self,
        msg: &Message,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) {
        // required attributes for a connectivity check
        if !msg.has_attribute(USERNAME)
            || !msg.has_attribute(MESSAGE_INTEGRITY)
            || !msg.has_attribute(PRIORITY)
        {
            debug!("binding request missing required attributes");
            self.queue_error_response(msg, ErrorCode::BAD_REQUEST, from, false);
            return;
        }
        // authenticate before acting on anything else; a mismatch is
        // dropped without a response
        let local_credentials = ShortTermCredentials::new(&self.local.credentials.passwd);
        if msg.validate_integrity(data, &local_credentials).is_err() {
            debug!("binding request failed the integrity check, dropping");
            return;
        }
        let username_valid = msg
            .get_attribute(USERNAME)
            .and_then(|raw| Username::from_raw(raw).ok())
            .map_or(false, |u| {
                u.username()
                    .starts_with(&format!("{}:", self.local.credentials.ufrag))
            });
        if !username_valid {
            debug!("binding request failed username validation");
            self.queue_error_response(msg, ErrorCode::UNAUTHORIZED, from, false);
            return;
        }
        let Some(priority) = msg
            .get_attribute(PRIORITY)
            .and_then(|raw| Priority::from_raw(raw).ok())
            .map(|p| p.priority())
        else {
            self.queue_error_response(msg, ErrorCode::BAD_REQUEST, from, false);
            return;
        };
        let peer_nominating = msg.has_attribute(USE_CANDIDATE);
        let ice_controlling = msg
            .get_attribute(ICE_CONTROLLING)
            .and_then(|raw| IceControlling::from_raw(raw).ok());
        let ice_controlled = msg
            .get_attribute(ICE_CONTROLLED)
            .and_then(|raw| IceControlled::from_raw(raw).ok());

        if self.mode == AgentMode::Unknown {
            // adopt the role complementing the peer's
            if ice_controlling.is_some() {
                self.set_mode(AgentMode::Controlled, now);
            } else if ice_controlled.is_some() {
                self.set_mode(AgentMode::Controlling, now);
            }
        }

        // RFC 8445 §7.3.1.1: detecting and repairing role conflicts.  The
        // tie breaker comparison is on the full unsigned 64-bit values.
        if let Some(ice_controlling) = ice_controlling {
            if self.mode == AgentMode::Controlling {
                if self.tie_breaker >= ice_controlling.tie_breaker() {
                    debug!("role conflict: both controlling, keeping role");
                    self.queue_error_response(msg, ErrorCode::ROLE_CONFLICT, from, true);
                    return;
                }
                debug!("role conflict: both controlling, switching to controlled");
                self.set_mode(AgentMode::Controlled, now);
            }
        }
        if let Some(ice_controlled) = ice_controlled {
            if self.mode == AgentMode::Controlled {
                if self.tie_breaker >= ice_controlled.tie_breaker() {
                    debug!("role conflict: both controlled, switching to controlling");
                    self.set_mode(AgentMode::Controlling, now);
                } else {
                    debug!("role conflict: both controlled, keeping role");
                    self.queue_error_response(msg, ErrorCode::ROLE_CONFLICT, from, true);
                    return;
                }
            }
        }

        // answer with the reflexive transport address of the source
        let mut response = Message::new_success(msg);
        let mapped = XorMappedAddress::new(from, response.transaction_id());
        if response.add_attribute(mapped.to_raw()).is_ok()
            && response.add_message_integrity(&local_credentials).is_ok()
            && response.add_fingerprint().is_ok()
        {
            self.pending_transmits.push_back(Transmit {
                data: response.to_bytes(),
                to: from,
            });
        }

        // checks toward the peer need the remote credentials; without a
        // remote description we can only answer
        if self.remote.is_none() {
            debug!("no remote description yet, answered without pairing");
            return;
        }

        let known_source = self
            .remote
            .as_ref()
            .map_or(false, |r| r.has_candidate_address(from));
        let remote_candidate = if known_source {
            self.remote
                .as_ref()
                .unwrap()
                .candidates
                .iter()
                .find(|c| c.address == from)
                .unwrap()
                .clone()
        } else {
            // RFC 8445 §7.3.1.3: a source not matching any remote candidate
            // becomes a peer-reflexive remote candidate with the priority
            // signalled in the request
            self.remote_prflx_counter += 1;
            let foundation = format!("rflx{}", self.remote_prflx_counter);
            let candidate = Candidate::builder(
                CandidateType::PeerReflexive,
                TransportType::Udp,
                &foundation,
                from,
            )
            .priority(priority)
            .build();
            info!(candidate = %candidate.to_sdp_attribute(), "new peer-reflexive remote candidate");
            self.add_remote_candidate_inner(candidate.clone(), false);
            candidate
        };

        let Some(local_candidate) = self
            .local
            .candidates
            .iter()
            .find(|c| {
                c.candidate_type == CandidateType::Host && c.address.is_ipv4() == from.is_ipv4()
            })
            .cloned()
        else {
            debug!("no local base for {from}, answered without pairing");
            return;
        };

        // RFC 8445 §7.3.1.4: triggered checks
        let Some(pair_idx) = self.add_pair(local_candidate, remote_candidate) else {
            return;
        };
        let accept_nomination = peer_nominating && self.mode == AgentMode::Controlled;
        match self.pairs[pair_idx].state {
            CandidatePairState::Succeeded => {
                if accept_nomination && !self.pairs[pair_idx].nominated {
                    self.pairs[pair_idx].nomination_requested = true;
                    self.nominate_pair(pair_idx, now);
                }
            }
            CandidatePairState::InProgress => {
                // the in-flight transaction will conclude the check; only
                // remember the peer's nomination request
                if accept_nomination {
                    self.pairs[pair_idx].nomination_requested = true;
                }
            }
            CandidatePairState::Waiting
            | CandidatePairState::Frozen
            | CandidatePairState::Failed => {
                if accept_nomination {
                    self.pairs[pair_idx].nomination_requested = true;
                }
                self.pairs[pair_idx].state = CandidatePairState::Waiting;
                if let Some(entry_idx) = self.entry_for_pair(pair_idx) {
                    if self.entries[entry_idx].finished {
                        let rto = self.rto;
                        self.entries[entry_idx].restart(rto, None);
                    }
                    if !self.triggered.contains(&entry_idx) {
                        trace!("queueing triggered check for pair {pair_idx}");
                        self.triggered.push_back(entry_idx);
                    }
                }
            }
        }
    }

    fn handle_binding_response(
        &mut self,
        msg: &Message,
        data: &[u8],
        from: SocketAddr,
        now: Instant,
    ) {
        // a response must match the in-flight transaction of an entry
        let transaction_id = msg.transaction_id();
        let Some(entry_idx) = self
            .entries
            .iter()
            .position(|e| e.in_flight && !e.finished && e.transaction_id == transaction_id)
        else {
            debug!("response from {from} does not match any transaction, dropping");
            return;
        };
        match self.entries[entry_idx].kind {
            EntryKind::Server => self.handle_server_response(msg, entry_idx, now),
            EntryKind::Check(pair_idx) => {
                // responses to checks are authenticated with the remote
                // password; an unsigned error response is tolerated
                let Some(remote) = self.remote.as_ref() else {
                    return;
                };
                let credentials = ShortTermCredentials::new(&remote.credentials.passwd);
                let must_verify = msg.has_class(MessageClass::Success)
                    || msg.has_attribute(MESSAGE_INTEGRITY);
                if must_verify && msg.validate_integrity(data, &credentials).is_err() {
                    debug!("response failed the integrity check, dropping");
                    return;
                }
                self.handle_check_response(msg, entry_idx, pair_idx, now);
            }
        }
    }

    /// A response from a STUN server carrying our server-reflexive address.
    fn handle_server_response(&mut self, msg: &Message, entry_idx: usize, now: Instant) {
        let server = self.entries[entry_idx].remote;
        {
            let entry = &mut self.entries[entry_idx];
            entry.finished = true;
            entry.in_flight = false;
            entry.next_transmission = None;
        }
        if msg.has_class(MessageClass::Error) {
            warn!("binding to STUN server {server} failed");
            self.update_gathering_done();
            return;
        }
        let Some(mapped) = msg
            .get_attribute(XOR_MAPPED_ADDRESS)
            .and_then(|raw| XorMappedAddress::from_raw(raw).ok())
            .map(|xor| xor.addr(msg.transaction_id()))
        else {
            warn!("server response without XOR-MAPPED-ADDRESS");
            self.update_gathering_done();
            return;
        };
        debug!(mapped = %mapped, "server-reflexive address discovered");
        if let Some(base) = self
            .local
            .candidates
            .iter()
            .find(|c| {
                c.candidate_type == CandidateType::Host && c.address.is_ipv4() == mapped.is_ipv4()
            })
            .map(|c| c.address)
        {
            let priority = Candidate::calculate_priority(
                CandidateType::ServerReflexive,
                crate::gathering::local_preference(base, 0),
                1,
            );
            let foundation = self.local_foundation(CandidateType::ServerReflexive, base);
            let candidate = Candidate::builder(
                CandidateType::ServerReflexive,
                TransportType::Udp,
                &foundation,
                mapped,
            )
            .priority(priority)
            .base_address(base)
            .related_address(base)
            .build();
            self.add_local_candidate(candidate, now);
        }
        self.update_gathering_done();
    }

    /// A response concluding (one transmission of) a connectivity check.
    fn handle_check_response(
        &mut self,
        msg: &Message,
        entry_idx: usize,
        pair_idx: usize,
        now: Instant,
    ) {
        if msg.has_class(MessageClass::Error) {
            let code = msg
                .get_attribute(ERROR_CODE)
                .and_then(|raw| ErrorCode::from_raw(raw).ok())
                .map(|e| e.code());
            if code == Some(ErrorCode::ROLE_CONFLICT) {
                // RFC 8445 §7.2.5.1: switch away from the role the request
                // was sent with, and repeat the check with a fresh
                // transaction under the new role
                let sent_controlling = self.entries[entry_idx]
                    .sent_controlling
                    .unwrap_or(self.mode == AgentMode::Controlling);
                let new_mode = if sent_controlling {
                    AgentMode::Controlled
                } else {
                    AgentMode::Controlling
                };
                info!("role conflict response, retrying as {new_mode}");
                self.set_mode(new_mode, now);
                self.pairs[pair_idx].state = CandidatePairState::Waiting;
                let rto = self.rto;
                self.entries[entry_idx].restart(rto, None);
                self.entries[entry_idx].armed.store(true, Ordering::Release);
                return;
            }
            warn!(code = ?code, "check failed with an error response");
            self.entries[entry_idx].finished = true;
            self.entries[entry_idx].in_flight = false;
            self.entries[entry_idx].next_transmission = None;
            self.pairs[pair_idx].state = CandidatePairState::Failed;
            self.check_for_failure(now);
            return;
        }

        let foundation = self.pairs[pair_idx].pair.foundation();
        info!(
            foundation = %foundation,
            local.address = %self.pairs[pair_idx].pair.local.address,
            remote.address = %self.pairs[pair_idx].pair.remote.address,
            nominating = self.pairs[pair_idx].nomination_requested,
            "connectivity check succeeded"
        );
        self.pairs[pair_idx].state = CandidatePairState::Succeeded;
        // forward progress; the fail deadline no longer applies
        self.fail_time = None;
        self.set_state(ConnectionState::Connected);
        self.unfreeze_foundation(&foundation);

        // a mapped address differing from every local candidate reveals a
        // peer-reflexive local candidate (e.g. behind a rewriting NAT)
        if let Some(mapped) = msg
            .get_attribute(XOR_MAPPED_ADDRESS)
            .and_then(|raw| XorMappedAddress::from_raw(raw).ok())
            .map(|xor| xor.addr(msg.transaction_id()))
        {
            if !self.local.has_candidate_address(mapped) {
                let base = self.pairs[pair_idx].pair.local.base_address;
                let priority = self.pairs[pair_idx].pair.local.peer_reflexive_priority();
                let foundation = self.local_foundation(CandidateType::PeerReflexive, base);
                let candidate = Candidate::builder(
                    CandidateType::PeerReflexive,
                    TransportType::Udp,
                    &foundation,
                    mapped,
                )
                .priority(priority)
                .base_address(base)
                .related_address(base)
                .build();
                self.add_local_candidate(candidate, now);
            }
        }

        if Some(entry_idx) == self.selected_entry {
            // keepalive answered; schedule the next one as a fresh
            // transaction
            let rto = self.rto;
            let entry = &mut self.entries[entry_idx];
            entry.restart(rto, Some(now + STUN_KEEPALIVE_PERIOD));
        } else if self.pairs[pair_idx].nomination_requested {
            self.nominate_pair(pair_idx, now);
        } else {
            let entry = &mut self.entries[entry_idx];
            entry.finished = true;
            entry.in_flight = false;
            entry.next_transmission = None;
            if self.mode == AgentMode::Controlling {
                self.try_nominate(now);
            }
        }
    }

    /// As the controlling agent, pick the highest-priority succeeded pair
    /// and re-issue its check with USE-CANDIDATE.
    fn try_nominate(&mut self, _now: Instant) {
        if self.mode != AgentMode::Controlling {
            return;
        }
        if self
            .pairs
            .iter()
            .any(|p| p.nominated || p.nomination_requested)
        {
            return;
        }
        let mut nominate_idx = None;
        for &pair_idx in self.ordered_pairs.iter() {
            if self.pairs[pair_idx].state == CandidatePairState::Succeeded {
                nominate_idx = Some(pair_idx);
                break;
            }
        }
        let Some(pair_idx) = nominate_idx else {
            return;
        };
        let Some(entry_idx) = self.entry_for_pair(pair_idx) else {
            return;
        };
        debug!(
            foundation = %self.pairs[pair_idx].pair.foundation(),
            "attempting nomination"
        );
        self.pairs[pair_idx].nomination_requested = true;
        let rto = self.rto;
        self.entries[entry_idx].restart(rto, None);
        self.entries[entry_idx].armed.store(true, Ordering::Release);
        if !self.triggered.contains(&entry_idx) {
            self.triggered.push_back(entry_idx);
        }
    }

    /// Conclude a nomination: publish the selected pair, keep its entry
    /// alive for keepalives, and drop every other pair.
    fn nominate_pair(&mut self, pair_idx: usize, now: Instant) {
        if self.pairs[pair_idx].state != CandidatePairState::Succeeded {
            return;
        }
        if self.pairs[pair_idx].nominated {
            return;
        }
        self.pairs[pair_idx].nominated = true;
        info!(
            foundation = %self.pairs[pair_idx].pair.foundation(),
            local.address = %self.pairs[pair_idx].pair.local.address,
            remote.address = %self.pairs[pair_idx].pair.remote.address,
            "pair nominated"
        );
        self.fail_time = None;
        self.events.push_back(CheckListEvent::SelectedPair(Box::new(
            self.pairs[pair_idx].pair.clone(),
        )));
        self.prune_pairs_except(pair_idx);
        // the selected entry stays alive, sending a keepalive every
        // STUN_KEEPALIVE_PERIOD as a fresh transaction
        if let Some(entry_idx) = self.selected_entry {
            let rto = self.rto;
            self.entries[entry_idx].restart(rto, Some(now + STUN_KEEPALIVE_PERIOD));
        }
        self.set_state(ConnectionState::Completed);
    }

    /// Drop every pair other than `keep` and every entry referencing them,
    /// compacting both tables and re-resolving indices.
    fn prune_pairs_except(&mut self, keep: usize) {
        let old_pairs = std::mem::take(&mut self.pairs);
        let mut remap: Vec<Option<usize>> = vec![None; old_pairs.len()];
        for (i, p) in old_pairs.into_iter().enumerate() {
            if i == keep {
                remap[i] = Some(self.pairs.len());
                self.pairs.push(p);
            }
        }
        let old_entries = std::mem::take(&mut self.entries);
        self.selected_entry = None;
        for e in old_entries.into_iter() {
            match e.kind {
                EntryKind::Server => self.entries.push(e),
                EntryKind::Check(pair_idx) => {
                    if let Some(new_idx) = remap[pair_idx] {
                        let mut e = e;
                        e.kind = EntryKind::Check(new_idx);
                        self.selected_entry = Some(self.entries.len());
                        self.entries.push(e);
                    }
                }
            }
        }
        self.triggered.clear();
        self.update_ordered_pairs();
    }

    /// Whether any STUN transmission wants to go out, now or once the
    /// pacer allows.
    fn transmission_due(&self, now: Instant) -> bool {
        if !self.pending_transmits.is_empty() || !self.triggered.is_empty() {
            return true;
        }
        if self
            .entries
            .iter()
            .any(|e| !e.finished && e.armed.load(Ordering::Acquire))
        {
            return true;
        }
        if self.remote.is_some()
            && self
                .pairs
                .iter()
                .any(|p| p.state == CandidatePairState::Waiting)
        {
            return true;
        }
        self.entries
            .iter()
            .any(|e| !e.finished && e.next_transmission.map_or(false, |t| t <= now))
    }

    /// Advance the state machine.  Call repeatedly until
    /// [`CheckListPoll::WaitUntil`] or [`CheckListPoll::Idle`] is returned.
    pub(crate) fn poll(&mut self, now: Instant) -> CheckListPoll {
        loop {
            if let Some(event) = self.events.pop_front() {
                return CheckListPoll::Event(event);
            }

            if self.state == ConnectionState::Failed {
                return CheckListPoll::Idle;
            }

            if let Some(fail_time) = self.fail_time {
                if now >= fail_time {
                    self.fail_time = None;
                    if !self
                        .pairs
                        .iter()
                        .any(|p| p.state == CandidatePairState::Succeeded)
                    {
                        warn!("no connectivity within the fail timeout");
                        self.set_state(ConnectionState::Failed);
                        continue;
                    }
                }
            }

            // expire overdue transactions even while the pacer is blocked
            self.expire_overdue_entries(now);
            if !self.events.is_empty() {
                continue;
            }

            // outbound STUN is paced: at least STUN_PACING_TIME between any
            // two transmissions from this agent
            let pace_release = self
                .last_transmission
                .map(|last| last + STUN_PACING_TIME)
                .filter(|&release| release > now);
            if let Some(release) = pace_release {
                if self.transmission_due(now) {
                    return CheckListPoll::WaitUntil(release);
                }
            } else {
                if let Some(transmit) = self.pending_transmits.pop_front() {
                    self.last_transmission = Some(now);
                    return CheckListPoll::Transmit(transmit);
                }
                if let Some(transmit) = self.fire_next_entry(now) {
                    self.last_transmission = Some(now);
                    return CheckListPoll::Transmit(transmit);
                }
                if !self.events.is_empty() {
                    continue;
                }
            }

            return match self.next_deadline(now) {
                Some(deadline) => CheckListPoll::WaitUntil(deadline.max(now)),
                None => CheckListPoll::Idle,
            };
        }
    }

    /// Mark entries whose retransmissions are exhausted as failed.
    fn expire_overdue_entries(&mut self, now: Instant) {
        for idx in 0..self.entries.len() {
            let expired = {
                let e = &self.entries[idx];
                !e.finished
                    && e.in_flight
                    && e.retransmissions >= MAX_STUN_RETRANSMISSION_COUNT
                    && e.next_transmission.map_or(false, |t| t <= now)
            };
            if expired {
                self.expire_entry(idx, now);
            }
        }
    }

    fn expire_entry(&mut self, idx: usize, now: Instant) {
        let kind = self.entries[idx].kind;
        let server = self.entries[idx].remote;
        {
            let entry = &mut self.entries[idx];
            entry.finished = true;
            entry.in_flight = false;
            entry.next_transmission = None;
        }
        match kind {
            EntryKind::Server => {
                warn!("STUN server {server} did not answer, skipping");
                self.update_gathering_done();
            }
            EntryKind::Check(pair_idx) => {
                warn!(
                    foundation = %self.pairs[pair_idx].pair.foundation(),
                    "connectivity check timed out"
                );
                if self.pairs[pair_idx].state != CandidatePairState::Succeeded
                    || Some(idx) == self.selected_entry
                {
                    self.pairs[pair_idx].state = CandidatePairState::Failed;
                }
                if Some(idx) == self.selected_entry {
                    // losing the selected pair is fatal
                    warn!("selected pair lost");
                    self.set_state(ConnectionState::Failed);
                } else {
                    self.check_for_failure(now);
                }
            }
        }
    }

    /// Pick and fire the next due transmission in scheduler order: armed
    /// triggers first, then triggered checks, then Waiting pairs by
    /// priority, then due retransmissions (which include the keepalive on
    /// the selected entry).
    fn fire_next_entry(&mut self, now: Instant) -> Option<Transmit> {
        for idx in 0..self.entries.len() {
            if self.entries[idx].finished {
                continue;
            }
            if self.entries[idx].armed.swap(false, Ordering::AcqRel) {
                if let Some(transmit) = self.fire_entry(idx, now) {
                    return Some(transmit);
                }
            }
        }
        while let Some(idx) = self.triggered.pop_front() {
            if idx >= self.entries.len() || self.entries[idx].finished {
                continue;
            }
            if let Some(transmit) = self.fire_entry(idx, now) {
                return Some(transmit);
            }
        }
        let ordered = self.ordered_pairs.clone();
        for pair_idx in ordered {
            if self.pairs[pair_idx].state != CandidatePairState::Waiting {
                continue;
            }
            if let Some(entry_idx) = self.entry_for_pair(pair_idx) {
                if let Some(transmit) = self.fire_entry(entry_idx, now) {
                    return Some(transmit);
                }
            }
        }
        for idx in 0..self.entries.len() {
            let due = {
                let e = &self.entries[idx];
                !e.finished && e.next_transmission.map_or(false, |t| t <= now)
            };
            if !due {
                continue;
            }
            if self.entries[idx].in_flight
                && self.entries[idx].retransmissions >= MAX_STUN_RETRANSMISSION_COUNT
            {
                self.expire_entry(idx, now);
                continue;
            }
            if let Some(transmit) = self.fire_entry(idx, now) {
                return Some(transmit);
            }
        }
        None
    }

    /// Transmit (or retransmit) an entry's transaction and push its next
    /// deadline out by the current retransmission timeout.
    fn fire_entry(&mut self, idx: usize, now: Instant) -> Option<Transmit> {
        let data = self.build_entry_request(idx)?;
        if let EntryKind::Check(pair_idx) = self.entries[idx].kind {
            if matches!(
                self.pairs[pair_idx].state,
                CandidatePairState::Waiting | CandidatePairState::Frozen
            ) {
                self.pairs[pair_idx].state = CandidatePairState::InProgress;
            }
        }
        let sent_controlling = self.mode == AgentMode::Controlling;
        let entry = &mut self.entries[idx];
        if entry.in_flight {
            entry.retransmissions += 1;
            entry.retransmission_timeout *= 2;
            trace!(
                transaction = ?entry.transaction_id,
                retransmissions = entry.retransmissions,
                "retransmitting"
            );
        } else {
            entry.in_flight = true;
            entry.sent_controlling = Some(sent_controlling);
        }
        entry.next_transmission = Some(now + entry.retransmission_timeout);
        Some(Transmit {
            data,
            to: entry.remote,
        })
    }

    fn build_entry_request(&self, idx: usize) -> Option<Vec<u8>> {
        let entry = &self.entries[idx];
        let mtype = MessageType::from_class_method(MessageClass::Request, BINDING);
        let mut msg = Message::new(mtype, entry.transaction_id);
        match entry.kind {
            EntryKind::Server => {
                msg.add_fingerprint().ok()?;
            }
            EntryKind::Check(pair_idx) => {
                let remote = self.remote.as_ref()?;
                let pair = &self.pairs[pair_idx];
                let username = format!(
                    "{}:{}",
                    remote.credentials.ufrag, self.local.credentials.ufrag
                );
                msg.add_attribute(Username::new(&username).ok()?.to_raw())
                    .ok()?;
                msg.add_attribute(
                    Priority::new(pair.pair.local.peer_reflexive_priority()).to_raw(),
                )
                .ok()?;
                match self.mode {
                    AgentMode::Controlling => {
                        msg.add_attribute(IceControlling::new(self.tie_breaker).to_raw())
                            .ok()?;
                        if pair.nomination_requested {
                            msg.add_attribute(UseCandidate::new().to_raw()).ok()?;
                        }
                    }
                    _ => {
                        msg.add_attribute(IceControlled::new(self.tie_breaker).to_raw())
                            .ok()?;
                    }
                }
                msg.add_message_integrity(&ShortTermCredentials::new(&remote.credentials.passwd))
                    .ok()?;
                msg.add_fingerprint().ok()?;
            }
        }
        Some(msg.to_bytes())
    }

    /// The next instant the worker has to wake up at, or `None` when fully
    /// idle.
    fn next_deadline(&self, now: Instant) -> Option<Instant> {
        let mut deadline: Option<Instant> = None;
        let mut fold = |t: Instant, deadline: &mut Option<Instant>| match *deadline {
            Some(d) if d <= t => (),
            _ => *deadline = Some(t),
        };
        if self.transmission_due(now) {
            let release = self
                .last_transmission
                .map(|last| last + STUN_PACING_TIME)
                .unwrap_or(now);
            fold(release.max(now), &mut deadline);
        }
        if let Some(fail_time) = self.fail_time {
            fold(fail_time, &mut deadline);
        }
        for e in self.entries.iter() {
            if e.finished {
                continue;
            }
            if let Some(t) = e.next_transmission {
                fold(t, &mut deadline);
            }
        }
        deadline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::str::FromStr;

    fn init() {
        crate::tests::test_init_log();
    }

    fn addr_a() -> SocketAddr {
        "10.0.0.1:4000".parse().unwrap()
    }

    fn addr_b() -> SocketAddr {
        "10.0.0.2:5000".parse().unwrap()
    }

    fn list_with_credentials(
        name: &str,
        tie_breaker: u64,
        controlling: Option<bool>,
    ) -> ConnCheckList {
        ConnCheckList::new(
            Credentials::new(format!("{name}frag"), format!("{name}password")),
            tie_breaker,
            controlling,
            MIN_STUN_RETRANSMISSION_TIMEOUT,
        )
    }

    /// Poll one side until it blocks, recording transmits and state
    /// changes.  Returns the wait deadline, if any.
    fn poll_side(
        list: &mut ConnCheckList,
        now: Instant,
        from: SocketAddr,
        to: SocketAddr,
        sent: &mut Vec<(SocketAddr, SocketAddr, Vec<u8>)>,
        states: &mut Vec<ConnectionState>,
    ) -> Option<Instant> {
        loop {
            match list.poll(now) {
                CheckListPoll::Transmit(transmit) => {
                    assert_eq!(transmit.to, to);
                    sent.push((from, to, transmit.data));
                }
                CheckListPoll::Event(CheckListEvent::StateChange(state)) => states.push(state),
                CheckListPoll::Event(_) => (),
                CheckListPoll::WaitUntil(t) => return Some(t),
                CheckListPoll::Idle => return None,
            }
        }
    }

    /// Two fully-wired in-memory agents exchanging datagrams under
    /// synthetic time.
    struct TestPeers {
        a: ConnCheckList,
        b: ConnCheckList,
        now: Instant,
        sent: Vec<(SocketAddr, SocketAddr, Vec<u8>)>,
        states_a: Vec<ConnectionState>,
        states_b: Vec<ConnectionState>,
    }

    impl TestPeers {
        fn new(tie_a: u64, tie_b: u64, hint_a: Option<bool>, hint_b: Option<bool>) -> Self {
            let now = Instant::now();
            let mut a = list_with_credentials("a", tie_a, hint_a);
            let mut b = list_with_credentials("b", tie_b, hint_b);
            a.start_gathering(vec![addr_a()], vec![], now);
            b.start_gathering(vec![addr_b()], vec![], now);
            let desc_a = a.local_description().clone();
            let desc_b = b.local_description().clone();
            a.set_remote_description(desc_b, now);
            b.set_remote_description(desc_a, now);
            Self {
                a,
                b,
                now,
                sent: vec![],
                states_a: vec![],
                states_b: vec![],
            }
        }

        /// Run both state machines, deliver pending datagrams, and advance
        /// the clock when nothing was exchanged.  Returns false once both
        /// sides are fully idle.
        fn step(&mut self) -> bool {
            let deadline_a = poll_side(
                &mut self.a,
                self.now,
                addr_a(),
                addr_b(),
                &mut self.sent,
                &mut self.states_a,
            );
            let deadline_b = poll_side(
                &mut self.b,
                self.now,
                addr_b(),
                addr_a(),
                &mut self.sent,
                &mut self.states_b,
            );

            let sent: Vec<_> = self.sent.drain(..).collect();
            let delivered = !sent.is_empty();
            for (from, to, data) in sent {
                let list = if to == addr_a() { &mut self.a } else { &mut self.b };
                list.handle_incoming(&data, from, self.now);
            }
            if delivered {
                return true;
            }
            let deadline = match (deadline_a, deadline_b) {
                (Some(a), Some(b)) => Some(a.min(b)),
                (Some(a), None) => Some(a),
                (None, Some(b)) => Some(b),
                (None, None) => None,
            };
            match deadline {
                Some(deadline) => {
                    self.now = deadline.max(self.now + Duration::from_millis(1));
                    true
                }
                None => false,
            }
        }

        fn run_until_completed(&mut self, max_steps: usize) {
            for _ in 0..max_steps {
                if self.a.state() == ConnectionState::Completed
                    && self.b.state() == ConnectionState::Completed
                {
                    return;
                }
                assert!(self.step(), "both agents idle before completion");
                assert_ne!(self.a.state(), ConnectionState::Failed);
                assert_ne!(self.b.state(), ConnectionState::Failed);
            }
            panic!(
                "no completion after {max_steps} steps: a={} b={}",
                self.a.state(),
                self.b.state()
            );
        }
    }

    fn peer_check_request(
        list: &ConnCheckList,
        peer_credentials: &Credentials,
        peer_tie_breaker: u64,
        peer_controlling: bool,
        use_candidate: bool,
    ) -> Vec<u8> {
        let mut msg = Message::new_request(BINDING);
        let username = format!(
            "{}:{}",
            list.local_description().credentials.ufrag,
            peer_credentials.ufrag
        );
        msg.add_attribute(Username::new(&username).unwrap().to_raw())
            .unwrap();
        msg.add_attribute(Priority::new(12345).to_raw()).unwrap();
        if peer_controlling {
            msg.add_attribute(IceControlling::new(peer_tie_breaker).to_raw())
                .unwrap();
        } else {
            msg.add_attribute(IceControlled::new(peer_tie_breaker).to_raw())
                .unwrap();
        }
        if use_candidate {
            msg.add_attribute(UseCandidate::new().to_raw()).unwrap();
        }
        msg.add_message_integrity(&ShortTermCredentials::new(
            &list.local_description().credentials.passwd,
        ))
        .unwrap();
        msg.add_fingerprint().unwrap();
        msg.to_bytes()
    }

    /// Poll at a fixed instant, returning the transmits available without
    /// advancing time.
    fn drain_transmits(list: &mut ConnCheckList, now: Instant) -> Vec<Transmit> {
        let mut out = vec![];
        loop {
            match list.poll(now) {
                CheckListPoll::Transmit(t) => out.push(t),
                CheckListPoll::Event(_) => (),
                CheckListPoll::WaitUntil(_) | CheckListPoll::Idle => break,
            }
        }
        out
    }

    /// Poll while advancing synthetic time up to `horizon`.
    fn drain_transmits_stepped(
        list: &mut ConnCheckList,
        now: &mut Instant,
        horizon: Duration,
    ) -> Vec<Transmit> {
        let limit = *now + horizon;
        let mut out = vec![];
        loop {
            match list.poll(*now) {
                CheckListPoll::Transmit(t) => out.push(t),
                CheckListPoll::Event(_) => (),
                CheckListPoll::WaitUntil(t) => {
                    if t >= limit {
                        break;
                    }
                    *now = t.max(*now + Duration::from_millis(1));
                }
                CheckListPoll::Idle => break,
            }
        }
        out
    }

    #[test]
    fn gathering_without_servers_is_done_immediately() {
        init();
        let now = Instant::now();
        let mut list = list_with_credentials("a", 1, Some(true));
        list.start_gathering(vec![addr_a()], vec![], now);
        let mut saw_candidate = false;
        let mut saw_done = false;
        loop {
            match list.poll(now) {
                CheckListPoll::Event(CheckListEvent::NewLocalCandidate(c)) => {
                    assert_eq!(c.address, addr_a());
                    saw_candidate = true;
                }
                CheckListPoll::Event(CheckListEvent::GatheringDone) => saw_done = true,
                CheckListPoll::Event(_) => (),
                _ => break,
            }
        }
        assert!(saw_candidate);
        assert!(saw_done);
        assert!(list.local_description().end_of_candidates);
    }

    #[test]
    fn ordered_pairs_non_increasing() {
        init();
        let now = Instant::now();
        let mut list = list_with_credentials("a", 1, Some(true));
        list.start_gathering(vec![addr_a()], vec![], now);
        let mut remote = Description::new(Credentials::new("bfrag".into(), "bpassword".into()));
        for i in 0..5u32 {
            remote.add_candidate(
                Candidate::builder(
                    CandidateType::Host,
                    TransportType::Udp,
                    &i.to_string(),
                    format!("10.0.0.{}:1000", i + 2).parse().unwrap(),
                )
                .priority(1000 + 100 * i)
                .build(),
            );
        }
        list.set_remote_description(remote, now);
        assert_eq!(list.pairs.len(), 5);
        let priorities: Vec<u64> = list
            .ordered_pairs
            .iter()
            .map(|&i| list.pairs[i].priority)
            .collect();
        for window in priorities.windows(2) {
            assert!(window[0] >= window[1]);
        }
        // every ordered element points into the pair table
        assert!(list.ordered_pairs.iter().all(|&i| i < list.pairs.len()));
        assert_eq!(list.ordered_pairs.len(), list.pairs.len());
    }

    #[test]
    fn pacing_between_transmissions() {
        init();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        // a second remote candidate so two checks are due at once
        peers.a.add_remote_candidate(
            Candidate::from_str("candidate:9 1 udp 1000 10.0.0.9 9000 typ host").unwrap(),
            peers.now,
        );
        let _first = loop {
            match peers.a.poll(peers.now) {
                CheckListPoll::Transmit(t) => break t,
                CheckListPoll::Event(_) => (),
                other => panic!("expected transmit, got {other:?}"),
            }
        };
        // the second transmission is held back by the pacer
        match peers.a.poll(peers.now) {
            CheckListPoll::WaitUntil(t) => assert_eq!(t, peers.now + STUN_PACING_TIME),
            other => panic!("expected pacing wait, got {other:?}"),
        }
        // and released exactly at the pacing deadline
        match peers.a.poll(peers.now + STUN_PACING_TIME) {
            CheckListPoll::Transmit(_) => (),
            other => panic!("expected transmit, got {other:?}"),
        }
    }

    #[test]
    fn retransmission_backoff_bounds() {
        init();
        let mut now = Instant::now();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        // drive only A; B stays silent so A's check retransmits until
        // exhaustion
        let mut transmit_times = vec![];
        for _ in 0..100 {
            loop {
                match peers.a.poll(now) {
                    CheckListPoll::Transmit(_) => transmit_times.push(now),
                    CheckListPoll::Event(_) => (),
                    CheckListPoll::WaitUntil(t) => {
                        assert!(t > now);
                        now = t;
                        break;
                    }
                    CheckListPoll::Idle => break,
                }
            }
            let e = &peers.a.entries[0];
            assert!(e.retransmissions <= MAX_STUN_RETRANSMISSION_COUNT);
            assert!(e.retransmission_timeout >= MIN_STUN_RETRANSMISSION_TIMEOUT);
            assert!(e.retransmission_timeout <= MIN_STUN_RETRANSMISSION_TIMEOUT * 32);
            if peers.a.state() == ConnectionState::Failed {
                break;
            }
        }
        // 1 initial transmission + 5 retransmissions
        assert_eq!(transmit_times.len(), 6);
        // doubling gaps: 500ms, 1s, 2s, 4s, 8s
        for (i, pair) in transmit_times.windows(2).enumerate() {
            let gap = pair[1] - pair[0];
            let expected = MIN_STUN_RETRANSMISSION_TIMEOUT * 2u32.pow(i as u32);
            assert_eq!(gap, expected);
        }
    }

    #[test]
    fn silent_peer_fails_after_timeout() {
        init();
        let start = Instant::now();
        let mut now = start;
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        let mut failed_events = 0;
        for _ in 0..100 {
            loop {
                match peers.a.poll(now) {
                    CheckListPoll::Transmit(_) => (),
                    CheckListPoll::Event(CheckListEvent::StateChange(ConnectionState::Failed)) => {
                        failed_events += 1
                    }
                    CheckListPoll::Event(_) => (),
                    CheckListPoll::WaitUntil(t) => {
                        now = t;
                        break;
                    }
                    CheckListPoll::Idle => break,
                }
            }
            if peers.a.state() == ConnectionState::Failed {
                break;
            }
        }
        assert_eq!(peers.a.state(), ConnectionState::Failed);
        assert_eq!(failed_events, 1);
        // ICE_FAIL_TIMEOUT after checks began, within a second of slack
        let elapsed = now - start;
        assert!(elapsed >= ICE_FAIL_TIMEOUT);
        assert!(elapsed <= ICE_FAIL_TIMEOUT + Duration::from_secs(1));
        // terminal: nothing further is scheduled
        assert!(matches!(peers.a.poll(now), CheckListPoll::Idle));
    }

    #[test]
    fn loopback_pair_completes() {
        init();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        peers.run_until_completed(200);
        let selected_a = peers.a.selected_pair().unwrap().clone();
        let selected_b = peers.b.selected_pair().unwrap().clone();
        assert_eq!(selected_a.local.address, addr_a());
        assert_eq!(selected_a.remote.address, addr_b());
        assert_eq!(selected_b.local.address, addr_b());
        assert_eq!(selected_b.remote.address, addr_a());
        // after completion the selected entry's pair is succeeded and
        // nominated
        for list in [&peers.a, &peers.b] {
            let entry_idx = list.selected_entry.unwrap();
            let EntryKind::Check(pair_idx) = list.entries[entry_idx].kind else {
                panic!("selected entry is not a check");
            };
            assert_eq!(list.pairs[pair_idx].state, CandidatePairState::Succeeded);
            assert!(list.pairs[pair_idx].nominated);
        }
    }

    #[test]
    fn state_progression_monotonic() {
        init();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        peers.run_until_completed(200);
        for states in [&peers.states_a, &peers.states_b] {
            for window in states.windows(2) {
                assert!(window[1] > window[0], "backward transition {window:?}");
            }
            assert_eq!(*states.last().unwrap(), ConnectionState::Completed);
            assert!(!states.contains(&ConnectionState::Failed));
        }
    }

    #[test]
    fn both_controlling_resolves_by_tie_breaker() {
        init();
        // S2: both sides believe they are controlling; exactly one must
        // switch and both complete
        let mut peers = TestPeers::new(100, 50, Some(true), Some(true));
        peers.run_until_completed(400);
        // the higher tie breaker keeps the controlling role
        assert_eq!(peers.a.mode(), AgentMode::Controlling);
        assert_eq!(peers.b.mode(), AgentMode::Controlled);
    }

    #[test]
    fn role_conflict_response_when_higher_tie_breaker() {
        init();
        let now = Instant::now();
        let mut list = list_with_credentials("a", 100, Some(true));
        list.start_gathering(vec![addr_a()], vec![], now);
        let peer_credentials = Credentials::new("bfrag".into(), "bpassword".into());
        let mut remote = Description::new(peer_credentials.clone());
        remote.add_candidate(
            Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr_b())
                .priority(2000)
                .build(),
        );
        list.set_remote_description(remote, now);

        // the peer claims controlling with a lower tie breaker: we keep
        // our role and answer 487
        let request = peer_check_request(&list, &peer_credentials, 50, true, false);
        list.handle_incoming(&request, addr_b(), now);
        assert_eq!(list.mode(), AgentMode::Controlling);
        let transmits = drain_transmits(&mut list, now);
        let response = transmits
            .iter()
            .find_map(|t| {
                let msg = Message::from_bytes(&t.data).ok()?;
                msg.has_class(MessageClass::Error).then_some(msg)
            })
            .expect("no error response sent");
        let code = ErrorCode::from_raw(response.get_attribute(ERROR_CODE).unwrap()).unwrap();
        assert_eq!(code.code(), ErrorCode::ROLE_CONFLICT);
    }

    #[test]
    fn role_conflict_switches_when_lower_tie_breaker() {
        init();
        let now = Instant::now();
        let mut list = list_with_credentials("a", 50, Some(true));
        list.start_gathering(vec![addr_a()], vec![], now);
        let peer_credentials = Credentials::new("bfrag".into(), "bpassword".into());
        let mut remote = Description::new(peer_credentials.clone());
        remote.add_candidate(
            Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr_b())
                .priority(2000)
                .build(),
        );
        list.set_remote_description(remote, now);

        let request = peer_check_request(&list, &peer_credentials, 100, true, false);
        list.handle_incoming(&request, addr_b(), now);
        assert_eq!(list.mode(), AgentMode::Controlled);
        // and a success response still goes out
        let transmits = drain_transmits(&mut list, now);
        assert!(transmits.iter().any(|t| {
            Message::from_bytes(&t.data)
                .map(|m| m.has_class(MessageClass::Success))
                .unwrap_or(false)
        }));
    }

    #[test]
    fn unknown_source_creates_peer_reflexive_candidate() {
        init();
        // S3: the peer's packets arrive from a rewritten source port
        let now = Instant::now();
        let mut list = list_with_credentials("a", 100, Some(false));
        list.start_gathering(vec![addr_a()], vec![], now);
        let peer_credentials = Credentials::new("bfrag".into(), "bpassword".into());
        let mut remote = Description::new(peer_credentials.clone());
        remote.add_candidate(
            Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr_b())
                .priority(2000)
                .build(),
        );
        list.set_remote_description(remote, now);
        assert_eq!(list.pairs.len(), 1);

        let rewritten: SocketAddr = "10.0.0.2:6666".parse().unwrap();
        let request = peer_check_request(&list, &peer_credentials, 1, true, false);
        list.handle_incoming(&request, rewritten, now);

        // a new remote candidate matching the observed source, and a new
        // pair queued for a triggered check
        let remote_desc = list.remote_description().unwrap();
        let prflx = remote_desc
            .candidates
            .iter()
            .find(|c| c.address == rewritten)
            .expect("no peer-reflexive remote candidate");
        assert_eq!(prflx.candidate_type, CandidateType::PeerReflexive);
        assert_eq!(prflx.priority, 12345);
        let pair_idx = list
            .pairs
            .iter()
            .position(|p| p.pair.remote.address == rewritten)
            .expect("no pair for the new candidate");
        assert_eq!(list.pairs[pair_idx].state, CandidatePairState::Waiting);
        assert!(!list.triggered.is_empty());

        // the triggered check goes out to the rewritten address
        let mut t = now;
        let transmits = drain_transmits_stepped(&mut list, &mut t, Duration::from_secs(1));
        assert!(transmits.iter().any(|t| t.to == rewritten
            && Message::from_bytes(&t.data)
                .map(|m| m.has_class(MessageClass::Request))
                .unwrap_or(false)));
    }

    #[test]
    fn keepalive_on_selected_pair() {
        init();
        // S6: after completion the selected pair is refreshed within every
        // keepalive period and stays selected
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        peers.run_until_completed(200);
        let selected_before = peers.a.selected_pair().unwrap().clone();

        let mut keepalives = 0;
        let mut now = peers.now;
        let horizon = now + Duration::from_secs(40);
        'outer: while now < horizon {
            loop {
                match peers.a.poll(now) {
                    CheckListPoll::Transmit(t) => {
                        let msg = Message::from_bytes(&t.data).unwrap();
                        if msg.has_class(MessageClass::Request) {
                            assert_eq!(t.to, addr_b());
                            keepalives += 1;
                            // answer like the peer would
                            peers.b.handle_incoming(&t.data, addr_a(), now);
                            for reply in drain_transmits(&mut peers.b, now) {
                                peers.a.handle_incoming(&reply.data, addr_b(), now);
                            }
                        }
                    }
                    CheckListPoll::Event(_) => (),
                    CheckListPoll::WaitUntil(t) => {
                        now = t.max(now + Duration::from_millis(1));
                        break;
                    }
                    CheckListPoll::Idle => break 'outer,
                }
            }
            if keepalives >= 2 {
                break;
            }
        }
        // at least one keepalive per period
        assert!(keepalives >= 2, "selected pair not kept alive");
        assert_eq!(peers.a.state(), ConnectionState::Completed);
        assert_eq!(peers.a.selected_pair().unwrap().clone(), selected_before);
    }

    #[test]
    fn server_entry_produces_server_reflexive_candidate() {
        init();
        // S4 at the core level: answer the server entry's request with a
        // mapped address and expect a srflx candidate in the SDP
        let now = Instant::now();
        let server: SocketAddr = "198.51.100.1:3478".parse().unwrap();
        let mut list = list_with_credentials("a", 1, Some(true));
        list.start_gathering(vec![addr_a()], vec![server], now);
        assert!(!list.local_description().end_of_candidates);

        let transmits = drain_transmits(&mut list, now);
        let request = transmits
            .iter()
            .find(|t| t.to == server)
            .expect("no server binding sent");
        let msg = Message::from_bytes(&request.data).unwrap();
        assert!(msg.has_class(MessageClass::Request));

        let mapped: SocketAddr = "203.0.113.5:40000".parse().unwrap();
        let mut response = Message::new_success(&msg);
        response
            .add_attribute(XorMappedAddress::new(mapped, msg.transaction_id()).to_raw())
            .unwrap();
        response.add_fingerprint().unwrap();
        list.handle_incoming(&response.to_bytes(), server, now);

        let srflx = list
            .local_description()
            .candidates
            .iter()
            .find(|c| c.candidate_type == CandidateType::ServerReflexive)
            .expect("no server-reflexive candidate");
        assert_eq!(srflx.address, mapped);
        assert_eq!(srflx.base_address, addr_a());
        assert_eq!(srflx.related_address, Some(addr_a()));
        assert!(list.local_description().end_of_candidates);
        let sdp = list.local_description().to_sdp(1);
        assert!(sdp.contains("typ srflx"));
        assert!(sdp.contains("203.0.113.5 40000"));
    }

    #[test]
    fn response_with_unknown_transaction_dropped() {
        init();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        let pairs_before = peers.a.pairs.len();
        let mut bogus = Message::new_success(&Message::new_request(BINDING));
        bogus
            .add_attribute(XorMappedAddress::new(addr_a(), bogus.transaction_id()).to_raw())
            .unwrap();
        bogus.add_fingerprint().unwrap();
        assert_eq!(
            peers.a.handle_incoming(&bogus.to_bytes(), addr_b(), peers.now),
            HandleRecv::Handled
        );
        assert_eq!(peers.a.pairs.len(), pairs_before);
        assert!(peers
            .a
            .pairs
            .iter()
            .all(|p| p.state != CandidatePairState::Succeeded));
    }

    #[test]
    fn non_stun_data_is_application_data() {
        init();
        let mut peers = TestPeers::new(100, 50, Some(true), Some(false));
        assert_eq!(
            peers.a.handle_incoming(b"ping", addr_b(), peers.now),
            HandleRecv::Data
        );
    }

    #[test]
    fn bad_integrity_is_dropped_silently() {
        init();
        let now = Instant::now();
        let mut list = list_with_credentials("a", 100, Some(false));
        list.start_gathering(vec![addr_a()], vec![], now);
        // the peer signs with the wrong password
        let mut msg = Message::new_request(BINDING);
        msg.add_attribute(Username::new("afrag:bfrag").unwrap().to_raw())
            .unwrap();
        msg.add_attribute(Priority::new(1).to_raw()).unwrap();
        msg.add_attribute(IceControlling::new(1).to_raw()).unwrap();
        msg.add_message_integrity(&ShortTermCredentials::new("wrongpassword"))
            .unwrap();
        msg.add_fingerprint().unwrap();
        assert_eq!(
            list.handle_incoming(&msg.to_bytes(), addr_b(), now),
            HandleRecv::Handled
        );
        // dropped silently: no response of any kind
        assert!(drain_transmits(&mut list, now).is_empty());
    }
}
