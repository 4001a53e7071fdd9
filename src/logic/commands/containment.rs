//! Network Containment
//!
//! Host isolation via Windows Firewall: a single named outbound block rule
//! covering every address except the manager's.
//!
//! Uses netsh advfirewall commands

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use super::Command;
use crate::constants::CONTAIN_RULE_NAME;

const NETSH: &str = "netsh.exe";

// ============================================================================
// ADDRESS RANGES
// ============================================================================

/// Previous adjacent address, `None` at the bottom of the address space
pub fn prev_ip(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_sub(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_sub(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

/// Next adjacent address, `None` at the top of the address space
pub fn next_ip(ip: IpAddr) -> Option<IpAddr> {
    match ip {
        IpAddr::V4(v4) => u32::from(v4)
            .checked_add(1)
            .map(|n| IpAddr::V4(Ipv4Addr::from(n))),
        IpAddr::V6(v6) => u128::from(v6)
            .checked_add(1)
            .map(|n| IpAddr::V6(Ipv6Addr::from(n))),
    }
}

/// Address ranges to block so that only `ip` stays reachable
pub fn blocked_ranges(ip: IpAddr) -> String {
    let (first, last): (IpAddr, IpAddr) = match ip {
        IpAddr::V4(_) => (Ipv4Addr::UNSPECIFIED.into(), Ipv4Addr::BROADCAST.into()),
        IpAddr::V6(_) => (Ipv6Addr::UNSPECIFIED.into(), Ipv6Addr::from(u128::MAX).into()),
    };

    let mut ranges = Vec::with_capacity(2);
    if let Some(prev) = prev_ip(ip) {
        ranges.push(format!("{}-{}", first, prev));
    }
    if let Some(next) = next_ip(ip) {
        ranges.push(format!("{}-{}", next, last));
    }
    ranges.join(",")
}

// ============================================================================
// COMMANDS
// ============================================================================

fn rule_name_arg() -> String {
    format!("name={}", CONTAIN_RULE_NAME)
}

fn contain_args(ip: IpAddr) -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "add".to_string(),
        "rule".to_string(),
        rule_name_arg(),
        "dir=out".to_string(),
        format!("remoteip={}", blocked_ranges(ip)),
        "action=block".to_string(),
    ]
}

fn uncontain_args() -> Vec<String> {
    vec![
        "advfirewall".to_string(),
        "firewall".to_string(),
        "delete".to_string(),
        "rule".to_string(),
        rule_name_arg(),
    ]
}

/// Bind `cmd` to the firewall invocation isolating the host
pub fn contain(cmd: &mut Command, ip: IpAddr) {
    cmd.from_exec(NETSH, contain_args(ip));
}

/// Bind `cmd` to the firewall invocation removing isolation
pub fn uncontain(cmd: &mut Command) {
    cmd.from_exec(NETSH, uncontain_args());
}

/// Standalone containment command, used by the `contain` rule action
pub fn contain_command(ip: IpAddr) -> Command {
    let mut cmd = Command::new("contain", &[]);
    contain(&mut cmd, ip);
    cmd
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ipv4_ranges() {
        let ip: IpAddr = "10.0.0.1".parse().unwrap();
        assert_eq!(blocked_ranges(ip), "0.0.0.0-10.0.0.0,10.0.0.2-255.255.255.255");
    }

    #[test]
    fn test_ipv4_ranges_at_bounds() {
        assert_eq!(blocked_ranges("0.0.0.0".parse().unwrap()), "0.0.0.1-255.255.255.255");
        assert_eq!(blocked_ranges("255.255.255.255".parse().unwrap()), "0.0.0.0-255.255.255.254");
    }

    #[test]
    fn test_ipv6_ranges() {
        let ip: IpAddr = "fe80::10".parse().unwrap();
        assert_eq!(
            blocked_ranges(ip),
            "::-fe80::f,fe80::11-ffff:ffff:ffff:ffff:ffff:ffff:ffff:ffff"
        );
    }

    #[test]
    fn test_contain_command() {
        let cmd = contain_command("192.168.1.10".parse().unwrap());
        assert_eq!(cmd.name, NETSH);
        assert!(!cmd.unrunnable);
        assert!(cmd.args.contains(&"name=EDR containment".to_string()));
        assert!(cmd
            .args
            .contains(&"remoteip=0.0.0.0-192.168.1.9,192.168.1.11-255.255.255.255".to_string()));
        assert_eq!(cmd.args.last().map(String::as_str), Some("action=block"));
    }

    #[test]
    fn test_uncontain_command() {
        let mut cmd = Command::new("uncontain", &[]);
        uncontain(&mut cmd);
        assert_eq!(cmd.to_string(), "netsh.exe advfirewall firewall delete rule name=EDR containment");
    }
}
