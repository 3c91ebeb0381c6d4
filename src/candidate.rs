// Copyright (C) 2026 the floe authors
//
// Licensed under the Apache License, Version 2.0 <LICENSE-APACHE or
// http://www.apache.org/licenses/LICENSE-2.0> or the MIT license
// <LICENSE-MIT or http://opensource.org/licenses/MIT>, at your
// option. This file may not be copied, modified, or distributed
// except according to those terms.

//! ICE candidates and candidate pairs.

pub use crate::stun::TransportType;

use std::error::Error;
use std::net::SocketAddr;
use std::str::FromStr;

/// An ICE transport candidate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub component_id: usize,
    pub candidate_type: CandidateType,
    pub transport_type: TransportType,
    pub foundation: String,
    pub priority: u32,
    pub address: SocketAddr,
    pub base_address: SocketAddr,
    pub related_address: Option<SocketAddr>,
    pub extensions: Vec<(String, String)>,
}

/// The type of an ICE candidate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CandidateType {
    Host,
    PeerReflexive,
    ServerReflexive,
    Relayed,
}

#[derive(Debug)]
pub enum ParseCandidateTypeError {
    UnknownCandidateType,
}

impl Error for ParseCandidateTypeError {}

impl std::fmt::Display for ParseCandidateTypeError {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.pad(&format!("{:?}", self))
    }
}

impl FromStr for CandidateType {
    type Err = ParseCandidateTypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "host" => Ok(CandidateType::Host),
            "prflx" => Ok(CandidateType::PeerReflexive),
            "srflx" => Ok(CandidateType::ServerReflexive),
            "relay" => Ok(CandidateType::Relayed),
            _ => Err(ParseCandidateTypeError::UnknownCandidateType),
        }
    }
}

impl std::fmt::Display for CandidateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(match &self {
            CandidateType::Host => "host",
            CandidateType::PeerReflexive => "prflx",
            CandidateType::ServerReflexive => "srflx",
            CandidateType::Relayed => "relay",
        })
    }
}

pub struct CandidateBuilder {
    ctype: CandidateType,
    ttype: TransportType,
    foundation: String,
    address: SocketAddr,
    priority: Option<u32>,
    base_address: Option<SocketAddr>,
    related_address: Option<SocketAddr>,
    extensions: Vec<(String, String)>,
}

impl CandidateBuilder {
    pub fn build(self) -> Candidate {
        let base_address = self.base_address.unwrap_or(self.address);
        Candidate {
            component_id: 1,
            candidate_type: self.ctype,
            transport_type: self.ttype,
            foundation: self.foundation,
            priority: self
                .priority
                .unwrap_or_else(|| Candidate::calculate_priority(self.ctype, 0, 1)),
            address: self.address,
            base_address,
            related_address: self.related_address,
            extensions: self.extensions,
        }
    }

    /// Specify the priority of the to be built candidate
    pub fn priority(mut self, priority: u32) -> Self {
        self.priority = Some(priority);
        self
    }

    /// Specify the base address of the to be built candidate
    pub fn base_address(mut self, base_address: SocketAddr) -> Self {
        self.base_address = Some(base_address);
        self
    }

    /// Specify the related address of the to be built candidate
    pub fn related_address(mut self, related_address: SocketAddr) -> Self {
        self.related_address = Some(related_address);
        self
    }

    /// Add an extension attribute to the candidate
    pub fn extension(mut self, key: &str, val: &str) -> Self {
        self.extensions.push((key.to_string(), val.to_string()));
        self
    }
}

impl Candidate {
    /// Construct a builder for building a new candidate
    ///
    /// # Examples
    ///
    /// ```
    /// # use floe::candidate::*;
    /// # use std::net::SocketAddr;
    /// let addr: SocketAddr = "127.0.0.1:2345".parse().unwrap();
    /// let candidate = Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr)
    ///     .priority(1234)
    ///     .build();
    /// assert_eq!(
    ///     candidate.to_sdp_attribute(),
    ///     "candidate:0 1 udp 1234 127.0.0.1 2345 typ host"
    /// );
    /// ```
    pub fn builder(
        ctype: CandidateType,
        ttype: TransportType,
        foundation: &str,
        address: SocketAddr,
    ) -> CandidateBuilder {
        CandidateBuilder {
            ctype,
            ttype,
            foundation: foundation.to_owned(),
            address,
            priority: None,
            base_address: None,
            related_address: None,
            extensions: vec![],
        }
    }

    /// Serialize this candidate to the value of an SDP `a=candidate`
    /// attribute (without the `a=` prefix).
    pub fn to_sdp_attribute(&self) -> String {
        let mut ret = String::from("candidate:")
            + &self.foundation
            + " "
            + &self.component_id.to_string()
            + " "
            + &self.transport_type.to_string()
            + " "
            + &self.priority.to_string()
            + " "
            + &self.address.ip().to_string()
            + " "
            + &self.address.port().to_string()
            + " typ "
            + &self.candidate_type.to_string();

        if let Some(related_address) = self.related_address {
            ret = ret
                + " raddr "
                + &related_address.ip().to_string()
                + " rport "
                + &related_address.port().to_string();
        }
        for (key, val) in self.extensions.iter() {
            ret = ret + " " + key + " " + val;
        }
        ret
    }

    fn priority_type_preference(ctype: CandidateType) -> u32 {
        match ctype {
            CandidateType::Host => 126,
            CandidateType::PeerReflexive => 110,
            CandidateType::ServerReflexive => 100,
            CandidateType::Relayed => 0,
        }
    }

    /// RFC 8445 §5.1.2.1 candidate priority.
    pub(crate) fn calculate_priority(
        ctype: CandidateType,
        local_preference: u32,
        component_id: usize,
    ) -> u32 {
        ((1 << 24) * Self::priority_type_preference(ctype))
            + ((1 << 8) * local_preference)
            + 256
            - component_id as u32
    }

    /// The priority this candidate would have as a peer-reflexive
    /// candidate, used as the value of the PRIORITY attribute in
    /// connectivity checks.
    pub(crate) fn peer_reflexive_priority(&self) -> u32 {
        (Self::priority_type_preference(CandidateType::PeerReflexive) << 24)
            | (self.priority & 0x00ff_ffff)
    }

    /// RFC 8445 §5.1.3 "Eliminating Redundant Candidates"
    pub(crate) fn redundant_with(&self, other: &Candidate) -> bool {
        self.address.ip() == other.address.ip() && self.base_address.ip() == other.base_address.ip()
    }

    /// RFC 8445 §6.1.2.4: the address pairs are deduplicated on.
    pub(crate) fn pair_prune_address(&self) -> SocketAddr {
        match self.candidate_type {
            CandidateType::Host => self.address,
            _ => self.base_address,
        }
    }
}

pub mod parse {
    use std::{net::SocketAddr, str::FromStr};

    use nom::bytes::complete::{tag, take_while1, take_while_m_n};
    use nom::combinator::map_res;

    use super::{Candidate, CandidateType, ParseCandidateTypeError};
    use crate::stun::{ParseTransportTypeError, TransportType};

    #[derive(Debug)]
    pub enum ParseCandidateError {
        NotCandidate,
        BadFoundation,
        BadComponentId,
        BadTransportType,
        BadPriority,
        BadAddress,
        BadCandidateType,
        BadExtension,
        Malformed,
    }

    impl std::error::Error for ParseCandidateError {}

    impl std::fmt::Display for ParseCandidateError {
        fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
            write!(f, "{:?}", self)
        }
    }

    impl From<ParseTransportTypeError> for ParseCandidateError {
        fn from(_: ParseTransportTypeError) -> Self {
            ParseCandidateError::BadTransportType
        }
    }
    impl From<ParseCandidateTypeError> for ParseCandidateError {
        fn from(_: ParseCandidateTypeError) -> Self {
            ParseCandidateError::BadCandidateType
        }
    }

    fn is_alphabetic(c: char) -> bool {
        c.is_alphabetic()
    }

    fn is_digit(c: char) -> bool {
        c.is_ascii_digit()
    }

    fn is_ice_char(c: char) -> bool {
        c.is_alphanumeric() || c == '+' || c == '/'
    }

    fn skip_spaces(s: &str) -> Result<&str, ParseCandidateError> {
        let (s, _) = take_while1::<_, _, nom::error::Error<_>>(|c| c == ' ')(s)
            .map_err(|_| ParseCandidateError::Malformed)?;
        Ok(s)
    }

    fn is_part_of_socket_addr(c: char) -> bool {
        c.is_ascii_hexdigit() || c == '.' || c == ':'
    }

    fn is_part_of_byte_string(c: char) -> bool {
        // not nul, cr, lf (or SP, the separator)
        c != '\0' && c != '\x0a' && c != '\x0d' && c != ' '
    }

    // https://datatracker.ietf.org/doc/html/rfc8839#section-5.1
    fn parse_candidate(s: &str) -> Result<Candidate, ParseCandidateError> {
        let s = s.strip_prefix("a=").unwrap_or(s);
        let (s, _) = tag::<_, _, nom::error::Error<_>>("candidate:")(s)
            .map_err(|_| ParseCandidateError::NotCandidate)?;
        let (s, foundation) = take_while_m_n::<_, _, nom::error::Error<_>>(1, 32, is_ice_char)(s)
            .map_err(|_| ParseCandidateError::BadFoundation)?;
        let s = skip_spaces(s)?;
        let (s, component_id): (_, usize) = map_res(
            take_while_m_n::<_, _, nom::error::Error<_>>(1, 3, is_digit),
            str::parse,
        )(s)
        .map_err(|_| ParseCandidateError::BadComponentId)?;
        let s = skip_spaces(s)?;
        let (s, transport_type) = take_while1::<_, _, nom::error::Error<_>>(is_alphabetic)(s)
            .map_err(|_| ParseCandidateError::BadTransportType)?;
        let transport_type = TransportType::from_str(transport_type)?;
        let s = skip_spaces(s)?;
        let (s, priority) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_digit),
            str::parse,
        )(s)
        .map_err(|_| ParseCandidateError::BadPriority)?;
        let s = skip_spaces(s)?;
        let (s, connection_address) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_part_of_socket_addr),
            |s: &str| s.parse(),
        )(s)
        .map_err(|_| ParseCandidateError::BadAddress)?;
        let s = skip_spaces(s)?;
        let (s, port) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_digit),
            str::parse,
        )(s)
        .map_err(|_| ParseCandidateError::BadAddress)?;
        let address = SocketAddr::new(connection_address, port);
        let s = skip_spaces(s)?;
        let (s, _) = tag::<_, _, nom::error::Error<_>>("typ")(s)
            .map_err(|_| ParseCandidateError::Malformed)?;
        let s = skip_spaces(s)?;
        let (s, candidate_type) = map_res(
            take_while1::<_, _, nom::error::Error<_>>(is_alphabetic),
            CandidateType::from_str,
        )(s)
        .map_err(|_| ParseCandidateError::BadCandidateType)?;

        if component_id != 1 {
            return Err(ParseCandidateError::BadComponentId);
        }

        let mut builder = Candidate::builder(candidate_type, transport_type, foundation, address)
            .priority(priority)
            .base_address(address);

        let mut iter_s = s;
        let mut expected_next = None;
        let mut raddr = None;
        while !iter_s.is_empty() {
            let s = skip_spaces(iter_s)?;
            let (s, ext_key) = take_while1::<_, _, nom::error::Error<_>>(is_part_of_byte_string)(s)
                .map_err(|_| ParseCandidateError::BadExtension)?;
            let s = skip_spaces(s)?;
            let (s, ext_value) =
                take_while1::<_, _, nom::error::Error<_>>(is_part_of_byte_string)(s)
                    .map_err(|_| ParseCandidateError::BadExtension)?;

            if let Some(expected_next) = expected_next.take() {
                if ext_key != expected_next {
                    return Err(ParseCandidateError::BadExtension);
                }
                // only "rport" is ever expected here, after "raddr"
                let raddr = raddr.take().ok_or(ParseCandidateError::BadAddress)?;
                let port = str::parse(ext_value).map_err(|_| ParseCandidateError::BadAddress)?;
                builder = builder.related_address(SocketAddr::new(raddr, port));
            } else if ext_key == "raddr" {
                raddr = Some(
                    ext_value
                        .parse()
                        .map_err(|_| ParseCandidateError::BadAddress)?,
                );
                expected_next = Some("rport");
            } else {
                builder = builder.extension(ext_key, ext_value);
            }

            iter_s = s;
        }
        if expected_next.is_some() {
            return Err(ParseCandidateError::BadExtension);
        }

        Ok(builder.build())
    }

    impl FromStr for Candidate {
        type Err = ParseCandidateError;

        fn from_str(s: &str) -> Result<Self, Self::Err> {
            parse_candidate(s)
        }
    }
}

/// A pairing of a local and a remote [`Candidate`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidatePair {
    pub local: Candidate,
    pub remote: Candidate,
}

impl CandidatePair {
    pub fn new(local: Candidate, remote: Candidate) -> Self {
        Self { local, remote }
    }

    pub(crate) fn foundation(&self) -> String {
        self.local.foundation.to_string() + ":" + &self.remote.foundation
    }

    /// RFC 8445 §6.1.2.3 pair priority.  `G` is the candidate priority of
    /// the controlling agent, `D` of the controlled agent.
    pub(crate) fn priority(&self, are_controlling: bool) -> u64 {
        let (controlling_priority, controlled_priority) = if are_controlling {
            (self.local.priority as u64, self.remote.priority as u64)
        } else {
            (self.remote.priority as u64, self.local.priority as u64)
        };
        let extra = if controlled_priority > controlling_priority {
            1u64
        } else {
            0u64
        };
        (1 << 32) * controlling_priority.min(controlled_priority)
            + 2 * controlling_priority.max(controlled_priority)
            + extra
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn init() {
        crate::tests::test_init_log();
    }

    #[test]
    fn priority_type_ordering() {
        init();
        let host = Candidate::calculate_priority(CandidateType::Host, 100, 1);
        let prflx = Candidate::calculate_priority(CandidateType::PeerReflexive, 100, 1);
        let srflx = Candidate::calculate_priority(CandidateType::ServerReflexive, 100, 1);
        let relay = Candidate::calculate_priority(CandidateType::Relayed, 100, 1);
        assert!(host > prflx);
        assert!(prflx > srflx);
        assert!(srflx > relay);
    }

    #[test]
    fn peer_reflexive_priority_replaces_type_preference() {
        init();
        let addr: SocketAddr = "10.0.0.1:1000".parse().unwrap();
        let cand = Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr)
            .priority(Candidate::calculate_priority(CandidateType::Host, 42, 1))
            .build();
        assert_eq!(
            cand.peer_reflexive_priority(),
            Candidate::calculate_priority(CandidateType::PeerReflexive, 42, 1)
        );
    }

    #[test]
    fn pair_priority_symmetric() {
        init();
        let local_addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
        let remote_addr: SocketAddr = "127.0.0.1:9100".parse().unwrap();
        let local = Candidate::builder(CandidateType::Host, TransportType::Udp, "0", local_addr)
            .priority(1234)
            .build();
        let remote = Candidate::builder(CandidateType::Host, TransportType::Udp, "0", remote_addr)
            .priority(5678)
            .build();
        let pair = CandidatePair::new(local.clone(), remote.clone());
        let mirrored = CandidatePair::new(remote, local);
        // both agents must compute the same pair priority from their own
        // perspective
        assert_eq!(pair.priority(true), mirrored.priority(false));
        assert_eq!(pair.priority(false), mirrored.priority(true));
    }

    mod parse {
        use super::*;
        use crate::candidate::parse::ParseCandidateError;

        #[test]
        fn udp_candidate() {
            init();
            let s = "candidate:0 1 udp 1234 127.0.0.1 2345 typ host";
            let cand = Candidate::from_str(s).unwrap();
            let addr = "127.0.0.1:2345".parse().unwrap();
            assert_eq!(
                cand,
                Candidate::builder(CandidateType::Host, TransportType::Udp, "0", addr)
                    .priority(1234)
                    .build()
            );
        }

        #[test]
        fn upper_case_transport() {
            init();
            let s = "candidate:0 1 UDP 1234 127.0.0.1 2345 typ host";
            let cand = Candidate::from_str(s).unwrap();
            assert_eq!(cand.transport_type, TransportType::Udp);
        }

        #[test]
        fn sdp_attribute_prefix() {
            init();
            let s = "a=candidate:0 1 udp 1234 127.0.0.1 2345 typ host";
            assert!(Candidate::from_str(s).is_ok());
        }

        #[test]
        fn not_candidate() {
            init();
            assert!(matches!(
                Candidate::from_str("a"),
                Err(ParseCandidateError::NotCandidate)
            ));
        }

        #[test]
        fn tcp_rejected() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 1 tcp 1234 127.0.0.1 2345 typ host"),
                Err(ParseCandidateError::BadTransportType)
            ));
        }

        #[test]
        fn bad_component_id() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 component-id udp 1234 127.0.0.1 2345 typ host"),
                Err(ParseCandidateError::BadComponentId)
            ));
        }

        #[test]
        fn bad_priority() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 1 udp priority 127.0.0.1 2345 typ host"),
                Err(ParseCandidateError::BadPriority)
            ));
        }

        #[test]
        fn bad_address() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 1 udp 1234 address 2345 typ host"),
                Err(ParseCandidateError::BadAddress)
            ));
        }

        #[test]
        fn missing_typ() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 1 udp 1234 127.0.0.1 2345 host"),
                Err(ParseCandidateError::Malformed)
            ));
        }

        #[test]
        fn bad_candidate_type() {
            init();
            assert!(matches!(
                Candidate::from_str("candidate:0 1 udp 1234 127.0.0.1 2345 typ candidate-type"),
                Err(ParseCandidateError::BadCandidateType)
            ));
        }

        #[test]
        fn host_candidate_roundtrip() {
            init();
            let addr: SocketAddr = "127.0.0.1:9000".parse().unwrap();
            let cand_sdp_str = "candidate:foundation 1 udp 1234 127.0.0.1 9000 typ host";
            let cand =
                Candidate::builder(CandidateType::Host, TransportType::Udp, "foundation", addr)
                    .priority(1234)
                    .build();
            assert_eq!(cand.to_sdp_attribute(), cand_sdp_str);
            let parsed_cand = Candidate::from_str(cand_sdp_str).unwrap();
            assert_eq!(cand, parsed_cand);
        }

        #[test]
        fn server_reflexive_related_address() {
            init();
            let addr: SocketAddr = "203.0.113.5:40000".parse().unwrap();
            let related_addr: SocketAddr = "192.168.0.1:9876".parse().unwrap();
            let cand = Candidate::builder(
                CandidateType::ServerReflexive,
                TransportType::Udp,
                "foundation",
                addr,
            )
            .priority(1234)
            .base_address(addr)
            .related_address(related_addr)
            .build();
            let cand_str = "candidate:foundation 1 udp 1234 203.0.113.5 40000 typ srflx raddr 192.168.0.1 rport 9876";
            let parsed_cand = Candidate::from_str(cand_str).unwrap();
            assert_eq!(cand, parsed_cand);
            assert_eq!(cand_str, cand.to_sdp_attribute());
        }

        #[test]
        fn ipv6_candidate() {
            init();
            let s = "candidate:0 1 udp 1234 2001:db8::1 2345 typ host";
            let cand = Candidate::from_str(s).unwrap();
            assert_eq!(cand.address, "[2001:db8::1]:2345".parse().unwrap());
        }

        #[test]
        fn extension_attributes() {
            init();
            let addr: SocketAddr = "127.0.0.1:2345".parse().unwrap();
            let cand = Candidate::builder(CandidateType::Host, TransportType::Udp, "f", addr)
                .priority(1234)
                .extension("generation", "0")
                .build();
            let cand_str = "candidate:f 1 udp 1234 127.0.0.1 2345 typ host generation 0";
            let parsed_cand = Candidate::from_str(cand_str).unwrap();
            assert_eq!(cand, parsed_cand);
            assert_eq!(cand_str, cand.to_sdp_attribute());
        }

        #[test]
        fn truncated_raddr() {
            init();
            assert!(Candidate::from_str(
                "candidate:0 1 udp 1234 127.0.0.1 2345 typ srflx raddr 192.168.0.1"
            )
            .is_err());
        }
    }
}
