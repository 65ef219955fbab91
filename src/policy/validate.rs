//! Policy and rule validation

use std::collections::HashSet;
use std::net::{IpAddr, SocketAddr};

use super::{Policy, PolicyError, PolicyKind, Rule, ANY_PORT};

/// Parse an `ip:port` mirror target
pub fn parse_mirror_target(target: &str) -> Result<SocketAddr, PolicyError> {
    let mut parts = target.split(':');
    let (Some(ip), Some(port), None) = (parts.next(), parts.next(), parts.next()) else {
        return Err(PolicyError::MissingPortSeparator(target.to_string()));
    };
    let ip: IpAddr = ip
        .parse()
        .map_err(|_| PolicyError::InvalidIp(ip.to_string()))?;
    if port.is_empty() || !port.bytes().all(|b| b.is_ascii_digit()) {
        return Err(PolicyError::InvalidTargetPort(port.to_string()));
    }
    let port: u16 = port
        .parse()
        .map_err(|_| PolicyError::InvalidTargetPort(port.to_string()))?;
    Ok(SocketAddr::new(ip, port))
}

/// Queue names are word characters only
pub fn check_queue_name(name: &str) -> Result<(), PolicyError> {
    if name.is_empty() || !name.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'_') {
        return Err(PolicyError::InvalidQueueName(name.to_string()));
    }
    Ok(())
}

pub fn check_target(kind: PolicyKind, target: &str) -> Result<(), PolicyError> {
    match kind {
        PolicyKind::Mirror => parse_mirror_target(target).map(|_| ()),
        PolicyKind::Queue => check_queue_name(target),
    }
}

pub fn check_rule(rule: &Rule) -> Result<(), PolicyError> {
    if rule.source.parse::<IpAddr>().is_err() {
        return Err(PolicyError::InvalidIp(rule.source.clone()));
    }
    if rule.port < ANY_PORT || rule.port > i32::from(u16::MAX) {
        return Err(PolicyError::PortOutOfRange(rule.port));
    }
    Ok(())
}

/// Checks a policy's identity and targets only; rules are checked separately
pub fn check_policy_header(kind: PolicyKind, policy: &Policy) -> Result<(), PolicyError> {
    if policy.policy_id.trim().is_empty() {
        return Err(PolicyError::BlankPolicyId);
    }
    for target in &policy.targets {
        check_target(kind, target)?;
    }
    Ok(())
}

pub fn check_policy(kind: PolicyKind, policy: &Policy) -> Result<(), PolicyError> {
    check_policy_header(kind, policy)?;
    let mut seen = HashSet::with_capacity(policy.rules.len());
    for rule in &policy.rules {
        check_rule(rule)?;
        if !seen.insert(rule.key()) {
            return Err(PolicyError::DuplicateRule);
        }
    }
    Ok(())
}
