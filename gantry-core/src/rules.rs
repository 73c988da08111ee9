//! TCP inspection rules.
//!
//! Two rule stages gate every session. Layer-4 *connection* rules run at
//! accept time against the peer address alone. *Content* rules run once
//! request bytes start arriving; a condition that cannot be decided yet
//! (not enough payload) reports a miss, the session re-arms its
//! inspect-delay timer and suspends. When the delay expires, or when no
//! more input can arrive, evaluation is forced: undecidable conditions
//! count as non-matching.
//!
//! The first matching rule wins. An empty list or no match accepts.

use std::net::{IpAddr, SocketAddr};

// ============================================================================
// Address Matching
// ============================================================================

/// CIDR block, v4 or v6.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IpNet {
    pub addr: IpAddr,
    pub prefix: u8,
}

impl IpNet {
    pub fn new(addr: IpAddr, prefix: u8) -> Self {
        let max = match addr {
            IpAddr::V4(_) => 32,
            IpAddr::V6(_) => 128,
        };
        Self {
            addr,
            prefix: prefix.min(max),
        }
    }

    /// Exact-host block.
    pub fn host(addr: IpAddr) -> Self {
        match addr {
            IpAddr::V4(_) => Self::new(addr, 32),
            IpAddr::V6(_) => Self::new(addr, 128),
        }
    }

    pub fn contains(&self, ip: &IpAddr) -> bool {
        match (self.addr, ip) {
            (IpAddr::V4(net), IpAddr::V4(ip)) => {
                let shift = 32 - self.prefix as u32;
                if shift >= 32 {
                    return true;
                }
                (u32::from(net) >> shift) == (u32::from(*ip) >> shift)
            }
            (IpAddr::V6(net), IpAddr::V6(ip)) => {
                let shift = 128 - self.prefix as u32;
                if shift >= 128 {
                    return true;
                }
                (u128::from(net) >> shift) == (u128::from(*ip) >> shift)
            }
            _ => false,
        }
    }
}

// ============================================================================
// Conditions
// ============================================================================

/// What a rule matches on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RuleCond {
    /// Matches unconditionally.
    Always,
    /// Peer source address within any of the blocks.
    SrcIp(Vec<IpNet>),
    /// At least this many request bytes buffered.
    PayloadLenAtLeast(usize),
    /// Request payload starts with the given bytes.
    PayloadPrefix(Vec<u8>),
}

impl RuleCond {
    /// True when the condition can be decided from the address alone.
    pub fn is_l4(&self) -> bool {
        matches!(self, RuleCond::Always | RuleCond::SrcIp(_))
    }

    /// Evaluate against the connection and whatever payload is buffered.
    ///
    /// `None` means the payload so far is insufficient to decide.
    pub fn eval(&self, peer: Option<&SocketAddr>, payload: &[u8]) -> Option<bool> {
        match self {
            RuleCond::Always => Some(true),
            RuleCond::SrcIp(nets) => {
                let ip = peer?.ip();
                Some(nets.iter().any(|n| n.contains(&ip)))
            }
            RuleCond::PayloadLenAtLeast(n) => {
                if payload.len() >= *n {
                    Some(true)
                } else {
                    None
                }
            }
            RuleCond::PayloadPrefix(prefix) => {
                if payload.len() >= prefix.len() {
                    Some(payload.starts_with(prefix))
                } else if prefix.starts_with(payload) {
                    // Could still match once more bytes arrive.
                    None
                } else {
                    Some(false)
                }
            }
        }
    }
}

// ============================================================================
// Rules
// ============================================================================

/// What a matching rule does to the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleAction {
    Accept,
    Reject,
    /// Hold the client for the tarpit timeout, then close.
    Tarpit,
}

#[derive(Debug, Clone)]
pub struct TcpRule {
    pub cond: RuleCond,
    pub action: RuleAction,
}

/// Content-switching rule: route to a backend when the condition matches.
#[derive(Debug, Clone)]
pub struct SwitchRule {
    pub cond: RuleCond,
    /// Backend index in the worker's table.
    pub backend: usize,
}

/// Outcome of one evaluation pass.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RuleVerdict {
    Accept,
    Reject,
    Tarpit,
    /// Undecidable yet: wait for more payload.
    Miss,
}

/// Evaluate layer-4 connection rules. Address-only, never misses.
pub fn eval_connection_rules(rules: &[TcpRule], peer: Option<&SocketAddr>) -> RuleVerdict {
    for rule in rules {
        match rule.cond.eval(peer, &[]) {
            Some(true) => return action_verdict(rule.action),
            // Content conditions in a connection list cannot be decided
            // at accept time; treat as non-matching.
            Some(false) | None => continue,
        }
    }
    RuleVerdict::Accept
}

/// Evaluate content rules over the buffered request payload.
///
/// With `forced` unset, the first undecidable condition suspends the whole
/// pass (rules are ordered, a later rule must not fire before an earlier
/// one is decided). With `forced` set (inspect-delay expired, buffer full
/// or input finished), undecidable conditions are non-matching.
pub fn eval_content_rules(
    rules: &[TcpRule],
    peer: Option<&SocketAddr>,
    payload: &[u8],
    forced: bool,
) -> RuleVerdict {
    for rule in rules {
        match rule.cond.eval(peer, payload) {
            Some(true) => return action_verdict(rule.action),
            Some(false) => continue,
            None if forced => continue,
            None => return RuleVerdict::Miss,
        }
    }
    RuleVerdict::Accept
}

/// Pick a backend from switching rules, falling back to `default`.
///
/// Runs after content inspection settled, so evaluation is always forced.
pub fn eval_switch_rules(
    rules: &[SwitchRule],
    peer: Option<&SocketAddr>,
    payload: &[u8],
    default: Option<usize>,
) -> Option<usize> {
    for rule in rules {
        if rule.cond.eval(peer, payload) == Some(true) {
            return Some(rule.backend);
        }
    }
    default
}

fn action_verdict(action: RuleAction) -> RuleVerdict {
    match action {
        RuleAction::Accept => RuleVerdict::Accept,
        RuleAction::Reject => RuleVerdict::Reject,
        RuleAction::Tarpit => RuleVerdict::Tarpit,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn peer(s: &str) -> SocketAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_ipnet_v4() {
        let net = IpNet::new("10.0.0.0".parse().unwrap(), 8);
        assert!(net.contains(&"10.200.3.4".parse().unwrap()));
        assert!(!net.contains(&"11.0.0.1".parse().unwrap()));
        // Prefix zero matches everything in-family.
        let any = IpNet::new("0.0.0.0".parse().unwrap(), 0);
        assert!(any.contains(&"203.0.113.9".parse().unwrap()));
        assert!(!any.contains(&"::1".parse().unwrap()));
    }

    #[test]
    fn test_ipnet_v6() {
        let net = IpNet::new("2001:db8::".parse().unwrap(), 32);
        assert!(net.contains(&"2001:db8::42".parse().unwrap()));
        assert!(!net.contains(&"2001:db9::1".parse().unwrap()));
    }

    #[test]
    fn test_connection_rules_reject_by_src() {
        let rules = vec![
            TcpRule {
                cond: RuleCond::SrcIp(vec![IpNet::new("192.0.2.0".parse().unwrap(), 24)]),
                action: RuleAction::Reject,
            },
            TcpRule {
                cond: RuleCond::Always,
                action: RuleAction::Accept,
            },
        ];
        let bad = peer("192.0.2.7:1234");
        let good = peer("198.51.100.1:1234");
        assert_eq!(eval_connection_rules(&rules, Some(&bad)), RuleVerdict::Reject);
        assert_eq!(eval_connection_rules(&rules, Some(&good)), RuleVerdict::Accept);
    }

    #[test]
    fn test_empty_rules_accept() {
        assert_eq!(eval_connection_rules(&[], None), RuleVerdict::Accept);
        assert_eq!(eval_content_rules(&[], None, b"", true), RuleVerdict::Accept);
    }

    #[test]
    fn test_content_miss_until_enough_payload() {
        let rules = vec![TcpRule {
            cond: RuleCond::PayloadPrefix(b"HELLO".to_vec()),
            action: RuleAction::Reject,
        }];
        assert_eq!(
            eval_content_rules(&rules, None, b"HE", false),
            RuleVerdict::Miss
        );
        assert_eq!(
            eval_content_rules(&rules, None, b"HELLO world", false),
            RuleVerdict::Reject
        );
        assert_eq!(
            eval_content_rules(&rules, None, b"GOODBYE", false),
            RuleVerdict::Accept
        );
    }

    #[test]
    fn test_forced_eval_treats_miss_as_nonmatch() {
        let rules = vec![TcpRule {
            cond: RuleCond::PayloadLenAtLeast(100),
            action: RuleAction::Reject,
        }];
        assert_eq!(
            eval_content_rules(&rules, None, b"short", false),
            RuleVerdict::Miss
        );
        assert_eq!(
            eval_content_rules(&rules, None, b"short", true),
            RuleVerdict::Accept
        );
    }

    #[test]
    fn test_accept_terminates_evaluation() {
        // A matching accept must stop the scan before the reject below it.
        let rules = vec![
            TcpRule {
                cond: RuleCond::PayloadPrefix(b"OK".to_vec()),
                action: RuleAction::Accept,
            },
            TcpRule {
                cond: RuleCond::Always,
                action: RuleAction::Reject,
            },
        ];
        assert_eq!(
            eval_content_rules(&rules, None, b"OK then", false),
            RuleVerdict::Accept
        );
        assert_eq!(
            eval_content_rules(&rules, None, b"NOPE", false),
            RuleVerdict::Reject
        );
    }

    #[test]
    fn test_tarpit_action() {
        let rules = vec![TcpRule {
            cond: RuleCond::PayloadPrefix(b"EVIL".to_vec()),
            action: RuleAction::Tarpit,
        }];
        assert_eq!(
            eval_content_rules(&rules, None, b"EVIL payload", false),
            RuleVerdict::Tarpit
        );
    }

    #[test]
    fn test_switch_rules_pick_backend() {
        let rules = vec![
            SwitchRule {
                cond: RuleCond::PayloadPrefix(b"GET ".to_vec()),
                backend: 1,
            },
            SwitchRule {
                cond: RuleCond::PayloadPrefix(b"POST ".to_vec()),
                backend: 2,
            },
        ];
        assert_eq!(
            eval_switch_rules(&rules, None, b"GET /index", Some(0)),
            Some(1)
        );
        assert_eq!(
            eval_switch_rules(&rules, None, b"POST /form", Some(0)),
            Some(2)
        );
        assert_eq!(eval_switch_rules(&rules, None, b"PUT /x", Some(0)), Some(0));
        assert_eq!(eval_switch_rules(&rules, None, b"PUT /x", None), None);
    }
}
