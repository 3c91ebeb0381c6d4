// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! An ICE agent as specified in RFC 8445, restricted to a single UDP
//! component per session.
//!
//! An [`Agent`](agent::Agent) gathers local candidates, exchanges them with a
//! remote peer through an out-of-band signaling channel as SDP text, performs
//! STUN connectivity checks, nominates a working candidate pair and then
//! carries application data over that pair while keeping it alive.
//!
//! ```no_run
//! use floe::agent::Agent;
//!
//! let agent = Agent::builder()
//!     .stun_server("stun.example.org:3478")
//!     .on_candidate(|line| println!("signal this: {line}"))
//!     .on_state_change(|state| println!("now {state}"))
//!     .build()
//!     .unwrap();
//! agent.gather_candidates().unwrap();
//! ```

#[macro_use]
extern crate tracing;

pub mod agent;
pub mod candidate;
pub mod conncheck;
pub mod description;
pub mod gathering;
pub mod socket;
pub mod stun;
