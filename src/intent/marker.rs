//! Finalizer marker codec
//!
//! Markers live in `metadata.finalizers` next to finalizers owned by other
//! controllers. A marker token is `<kind prefix>-<escaped local IP>`. Finalizer
//! names may not contain `:`, so IPv4 octets are joined with `-` and IPv6
//! addresses are written as their eight hex groups joined with `_`.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use tracing::{debug, warn};

use crate::{Error, Result, BIND_MARKER_PREFIX, RULE_MARKER_PREFIX};

/// The two kinds of intent marker
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum MarkerKind {
    /// A cloud binding for the named local IP may exist
    Bind,
    /// A NAT rule for the named local IP may exist
    Rule,
}

impl MarkerKind {
    fn prefix(self) -> &'static str {
        match self {
            MarkerKind::Bind => BIND_MARKER_PREFIX,
            MarkerKind::Rule => RULE_MARKER_PREFIX,
        }
    }
}

impl fmt::Display for MarkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MarkerKind::Bind => f.write_str("bind"),
            MarkerKind::Rule => f.write_str("rule"),
        }
    }
}

/// A single typed marker
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Marker {
    /// Marker kind
    pub kind: MarkerKind,
    /// Local IP the guarded action refers to
    pub local_ip: IpAddr,
}

impl Marker {
    /// Create a marker
    pub fn new(kind: MarkerKind, local_ip: IpAddr) -> Self {
        Self { kind, local_ip }
    }

    /// Encode as a finalizer token
    pub fn encode(&self) -> String {
        format!("{}-{}", self.kind.prefix(), escape_ip(self.local_ip))
    }

    /// Decode a finalizer token
    ///
    /// Returns `None` for tokens that are not ours, and `Some(Err(_))` for
    /// tokens that carry one of our prefixes but an unreadable payload.
    pub fn decode(token: &str) -> Option<Result<Self>> {
        [MarkerKind::Bind, MarkerKind::Rule]
            .into_iter()
            .find_map(|kind| {
                token
                    .strip_prefix(kind.prefix())
                    .and_then(|rest| rest.strip_prefix('-'))
                    .map(|payload| (kind, payload))
            })
            .map(|(kind, payload)| unescape_ip(payload).map(|ip| Marker::new(kind, ip)))
    }
}

fn escape_ip(ip: IpAddr) -> String {
    match ip {
        IpAddr::V4(v4) => v4
            .octets()
            .iter()
            .map(|o| o.to_string())
            .collect::<Vec<_>>()
            .join("-"),
        IpAddr::V6(v6) => v6
            .segments()
            .iter()
            .map(|s| format!("{s:x}"))
            .collect::<Vec<_>>()
            .join("_"),
    }
}

fn unescape_ip(payload: &str) -> Result<IpAddr> {
    let invalid = || Error::validation(format!("marker payload '{payload}' is not an escaped IP"));

    if payload.contains('_') {
        let segments = payload
            .split('_')
            .map(|s| u16::from_str_radix(s, 16).map_err(|_| invalid()))
            .collect::<Result<Vec<_>>>()?;
        let segments: [u16; 8] = segments.try_into().map_err(|_| invalid())?;
        let [a, b, c, d, e, f, g, h] = segments;
        return Ok(IpAddr::V6(Ipv6Addr::new(a, b, c, d, e, f, g, h)));
    }

    let octets = payload
        .split('-')
        .map(|s| s.parse::<u8>().map_err(|_| invalid()))
        .collect::<Result<Vec<_>>>()?;
    let octets: [u8; 4] = octets.try_into().map_err(|_| invalid())?;
    Ok(IpAddr::V4(Ipv4Addr::from(octets)))
}

/// The bind and rule markers recorded on a workload
///
/// One marker of each kind is primary. Setting a kind replaces whatever it
/// named before; callers unwind the old value first. Further markers of a kind
/// that name a different local IP are kept as surplus until their action has
/// been rolled back, since each one may still guard a live rule or binding.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct IntentMarkers {
    bind: Option<IpAddr>,
    rule: Option<IpAddr>,
    surplus: Vec<Marker>,
}

impl IntentMarkers {
    /// Local IP named by the marker of `kind`
    pub fn get(&self, kind: MarkerKind) -> Option<IpAddr> {
        match kind {
            MarkerKind::Bind => self.bind,
            MarkerKind::Rule => self.rule,
        }
    }

    /// Record a marker of `kind` for `local_ip`
    pub fn set(&mut self, kind: MarkerKind, local_ip: IpAddr) {
        *self.slot(kind) = Some(local_ip);
    }

    /// Drop the marker of `kind`, returning the IP it named
    pub fn clear(&mut self, kind: MarkerKind) -> Option<IpAddr> {
        self.slot(kind).take()
    }

    /// True when no marker of either kind is held, surplus included
    pub fn is_empty(&self) -> bool {
        self.bind.is_none() && self.rule.is_none() && self.surplus.is_empty()
    }

    /// Extra markers found next to the primary marker of their kind
    pub fn surplus(&self) -> &[Marker] {
        &self.surplus
    }

    /// Drop one surplus marker once its action has been rolled back
    pub fn remove_surplus(&mut self, marker: &Marker) -> bool {
        let before = self.surplus.len();
        self.surplus.retain(|m| m != marker);
        self.surplus.len() != before
    }

    fn slot(&mut self, kind: MarkerKind) -> &mut Option<IpAddr> {
        match kind {
            MarkerKind::Bind => &mut self.bind,
            MarkerKind::Rule => &mut self.rule,
        }
    }

    /// Split a finalizer list into our markers and everyone else's finalizers
    ///
    /// The first well-formed marker of each kind is primary. Markers of the
    /// same kind naming another local IP become surplus. Malformed tokens and
    /// exact repeats are dropped (and therefore removed on the next write).
    pub fn from_finalizers(finalizers: &[String]) -> (Self, Vec<String>) {
        let mut markers = Self::default();
        let mut foreign = Vec::new();

        for token in finalizers {
            match Marker::decode(token) {
                None => foreign.push(token.clone()),
                Some(Err(e)) => warn!(token = %token, error = %e, "dropping malformed marker"),
                Some(Ok(marker)) => {
                    let primary = markers.get(marker.kind);
                    match primary {
                        None => *markers.slot(marker.kind) = Some(marker.local_ip),
                        Some(ip) if ip == marker.local_ip || markers.surplus.contains(&marker) => {
                            debug!(token = %token, "dropping repeated marker");
                        }
                        Some(ip) => {
                            warn!(token = %token, primary = %ip, "keeping extra marker until rolled back");
                            markers.surplus.push(marker);
                        }
                    }
                }
            }
        }

        (markers, foreign)
    }

    /// Rebuild the full finalizer list: foreign entries first, then rule, then
    /// bind, then any surplus
    pub fn to_finalizers(&self, foreign: &[String]) -> Vec<String> {
        let mut out = foreign.to_vec();
        if let Some(ip) = self.rule {
            out.push(Marker::new(MarkerKind::Rule, ip).encode());
        }
        if let Some(ip) = self.bind {
            out.push(Marker::new(MarkerKind::Bind, ip).encode());
        }
        out.extend(self.surplus.iter().map(Marker::encode));
        out
    }
}
