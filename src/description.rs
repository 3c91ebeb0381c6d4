// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE session descriptions: per-session credentials, the candidate list,
//! and the SDP text form the two agents exchange over signaling.

use std::error::Error;
use std::str::FromStr;

use rand::prelude::*;

use crate::candidate::Candidate;

const ICE_UFRAG_LEN: usize = 4;
const ICE_PWD_LEN: usize = 22;

// the base64-url alphabet, the characters allowed in ufrag/pwd values
const ICE_CHARSET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789-_";

/// The username fragment and password authenticating a session's STUN
/// exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    pub ufrag: String,
    pub passwd: String,
}

impl Credentials {
    pub fn new(ufrag: String, passwd: String) -> Self {
        Self { ufrag, passwd }
    }

    /// Generate a fresh random ufrag/pwd.
    pub(crate) fn generate() -> Self {
        let mut rng = rand::thread_rng();
        let mut random_chars = |len: usize| -> String {
            (0..len)
                .map(|_| ICE_CHARSET[rng.gen_range(0..ICE_CHARSET.len())] as char)
                .collect()
        };
        Self {
            ufrag: random_chars(ICE_UFRAG_LEN),
            passwd: random_chars(ICE_PWD_LEN),
        }
    }
}

/// One side's view of an ICE session: credentials, candidates, and whether
/// candidate gathering has finished.
#[derive(Debug, Clone)]
pub struct Description {
    pub credentials: Credentials,
    pub candidates: Vec<Candidate>,
    pub end_of_candidates: bool,
}

#[derive(Debug)]
pub enum ParseSdpError {
    MissingUfrag,
    MissingPassword,
}

impl Error for ParseSdpError {}

impl std::fmt::Display for ParseSdpError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Description {
    pub fn new(credentials: Credentials) -> Self {
        Self {
            credentials,
            candidates: vec![],
            end_of_candidates: false,
        }
    }

    /// Add a candidate unless an equivalent one (same type and address) is
    /// already present.  Returns whether the candidate was added.
    pub fn add_candidate(&mut self, candidate: Candidate) -> bool {
        if self.candidates.iter().any(|c| {
            c.candidate_type == candidate.candidate_type && c.address == candidate.address
        }) {
            return false;
        }
        self.candidates.push(candidate);
        true
    }

    pub fn has_candidate_address(&self, addr: std::net::SocketAddr) -> bool {
        self.candidates.iter().any(|c| c.address == addr)
    }

    /// Serialize to SDP text.  `session_id` is the value used in the
    /// session origin line.
    pub fn to_sdp(&self, session_id: u64) -> String {
        let mut out = String::new();
        out.push_str("v=0\r\n");
        out.push_str(&format!("o=- {} 0 IN IP4 0.0.0.0\r\n", session_id));
        out.push_str("s=-\r\n");
        out.push_str("t=0 0\r\n");
        out.push_str(&format!("a=ice-ufrag:{}\r\n", self.credentials.ufrag));
        out.push_str(&format!("a=ice-pwd:{}\r\n", self.credentials.passwd));
        out.push_str("a=ice-options:trickle\r\n");
        for candidate in self.candidates.iter() {
            out.push_str(&format!("a={}\r\n", candidate.to_sdp_attribute()));
        }
        if self.end_of_candidates {
            out.push_str("a=end-of-candidates\r\n");
        }
        out
    }
}

impl FromStr for Description {
    type Err = ParseSdpError;

    /// Parse SDP text into a description.  The parser is deliberately
    /// tolerant: line order does not matter, session-level lines may be
    /// absent, unknown attributes and unparsable candidate lines are
    /// skipped.  Only `ice-ufrag` and `ice-pwd` are required; candidates
    /// may trickle in later.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut ufrag = None;
        let mut passwd = None;
        let mut candidates: Vec<Candidate> = vec![];
        let mut end_of_candidates = false;

        for line in s.lines() {
            let line = line.trim_end_matches('\r');
            let attr = line.strip_prefix("a=").unwrap_or(line);
            if let Some(value) = attr.strip_prefix("ice-ufrag:") {
                ufrag = Some(value.to_owned());
            } else if let Some(value) = attr.strip_prefix("ice-pwd:") {
                passwd = Some(value.to_owned());
            } else if attr.starts_with("candidate:") {
                match Candidate::from_str(attr) {
                    Ok(candidate) => {
                        if !candidates.iter().any(|c: &Candidate| {
                            c.candidate_type == candidate.candidate_type
                                && c.address == candidate.address
                        }) {
                            candidates.push(candidate);
                        }
                    }
                    Err(e) => debug!("skipping unparsable candidate line {line:?}: {e}"),
                }
            } else if attr == "end-of-candidates" {
                end_of_candidates = true;
            }
        }

        let ufrag = ufrag.ok_or(ParseSdpError::MissingUfrag)?;
        let passwd = passwd.ok_or(ParseSdpError::MissingPassword)?;
        Ok(Description {
            credentials: Credentials::new(ufrag, passwd),
            candidates,
            end_of_candidates,
        })
    }
}
