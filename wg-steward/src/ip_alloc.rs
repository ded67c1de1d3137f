// Address allocation from configured subnets

//! IP address allocation
//!
//! Pure functions over a configuration's subnets and the allowed-IP entries
//! already handed out to its peers. Taken entries are normalized to
//! networks, clipped to each subnet's host range and merged, so counting
//! and enumeration agree and never go negative.

use crate::error::{Error, Result};
use ipnetwork::IpNetwork;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

/// Default cap for enumeration mode
pub const DEFAULT_ADDRESS_LIMIT: usize = 255;

/// Parse a comma separated CIDR list, rejecting any malformed entry
pub fn parse_cidr_list(list: &str) -> Result<Vec<IpNetwork>> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| {
            s.parse::<IpNetwork>()
                .map_err(|e| Error::validation(format!("invalid address range '{}': {}", s, e)))
        })
        .collect()
}

/// Parse a peer's allowed-IP list, skipping malformed entries with a warning
///
/// `owner` only appears in the log line.
pub fn parse_allowed_ips_lenient(owner: &str, list: &str) -> Vec<IpNetwork> {
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty() && *s != "N/A")
        .filter_map(|s| match s.parse::<IpNetwork>() {
            Ok(net) => Some(normalize(net)),
            Err(e) => {
                log::warn!("Skipping invalid allowed IP '{}' of {}: {}", s, owner, e);
                None
            }
        })
        .collect()
}

/// A true network (`10.0.0.0/24`) stays as is; an address written with a
/// prefix (`10.0.0.2/24`) only claims the address itself.
fn normalize(net: IpNetwork) -> IpNetwork {
    if net.ip() == net.network() {
        net
    } else {
        host_network(net.ip())
    }
}

/// Single-address network for `ip` (/32 or /128)
pub fn host_network(ip: IpAddr) -> IpNetwork {
    let prefix = if ip.is_ipv4() { 32 } else { 128 };
    // prefix always matches the family
    IpNetwork::new(ip, prefix).unwrap_or_else(|_| IpNetwork::from(ip))
}

/// Subnets declared by an interface `Address` value and the address the
/// interface itself occupies in each
///
/// When an entry names the network address itself, the interface is taken
/// to sit on the first host. Malformed entries are skipped with a warning.
pub fn interface_networks(address: &str) -> Vec<(String, IpNetwork, IpAddr)> {
    let mut result = Vec::new();
    for entry in address.split(',').map(str::trim).filter(|s| !s.is_empty()) {
        let net = match entry.parse::<IpNetwork>() {
            Ok(net) => net,
            Err(e) => {
                log::warn!("Failed to parse interface address {}: {}", entry, e);
                continue;
            }
        };
        let subnet = match IpNetwork::new(net.network(), net.prefix()) {
            Ok(subnet) => subnet,
            Err(e) => {
                log::warn!("Failed to normalize interface address {}: {}", entry, e);
                continue;
            }
        };
        let own = if net.ip() == subnet.network() {
            let (first, _) = host_range(subnet);
            to_addr(first, subnet.is_ipv4())
        } else {
            net.ip()
        };
        result.push((entry.to_string(), subnet, own));
    }
    result
}

/// Number of assignable addresses left in each subnet
pub fn available_counts(subnets: &[IpNetwork], taken: &[IpNetwork]) -> Vec<u128> {
    subnets
        .iter()
        .map(|subnet| {
            let (start, end) = host_range(*subnet);
            if start > end {
                return 0;
            }
            let total = end - start + 1;
            let used: u128 = taken_intervals(*subnet, taken)
                .iter()
                .map(|(lo, hi)| hi - lo + 1)
                .sum();
            total.saturating_sub(used)
        })
        .collect()
}

/// Lazily enumerate free host addresses of `subnet` in ascending order
pub fn available_addresses(subnet: IpNetwork, taken: &[IpNetwork]) -> AvailableIter {
    let (start, end) = host_range(subnet);
    AvailableIter {
        cursor: start,
        end,
        exhausted: start > end,
        v4: subnet.is_ipv4(),
        intervals: taken_intervals(subnet, taken),
        idx: 0,
    }
}

/// Iterator over free addresses of one subnet
#[derive(Debug, Clone)]
pub struct AvailableIter {
    cursor: u128,
    end: u128,
    exhausted: bool,
    v4: bool,
    intervals: Vec<(u128, u128)>,
    idx: usize,
}

impl Iterator for AvailableIter {
    type Item = IpAddr;

    fn next(&mut self) -> Option<IpAddr> {
        loop {
            if self.exhausted || self.cursor > self.end {
                return None;
            }

            while self.idx < self.intervals.len() && self.intervals[self.idx].1 < self.cursor {
                self.idx += 1;
            }

            if let Some(&(lo, hi)) = self.intervals.get(self.idx) {
                if lo <= self.cursor {
                    if hi >= self.end {
                        self.exhausted = true;
                        return None;
                    }
                    self.cursor = hi + 1;
                    continue;
                }
            }

            let addr = to_addr(self.cursor, self.v4);
            if self.cursor == self.end {
                self.exhausted = true;
            } else {
                self.cursor += 1;
            }
            return Some(addr);
        }
    }
}

/// Inclusive host range of a subnet as integers
///
/// IPv4 excludes network and broadcast below /31; IPv6 excludes the
/// subnet-router anycast address below /127.
fn host_range(subnet: IpNetwork) -> (u128, u128) {
    let (lo, hi) = span(subnet);
    let point_to_point = match subnet {
        IpNetwork::V4(_) => subnet.prefix() >= 31,
        IpNetwork::V6(_) => subnet.prefix() >= 127,
    };
    if point_to_point {
        (lo, hi)
    } else if subnet.is_ipv4() {
        (lo + 1, hi - 1)
    } else {
        (lo + 1, hi)
    }
}

/// Full inclusive range covered by a network
fn span(net: IpNetwork) -> (u128, u128) {
    match net {
        IpNetwork::V4(v4) => (
            u128::from(u32::from(v4.network())),
            u128::from(u32::from(v4.broadcast())),
        ),
        IpNetwork::V6(v6) => {
            let lo = u128::from(v6.network());
            let host_bits = if v6.prefix() == 0 {
                u128::MAX
            } else {
                u128::MAX >> v6.prefix()
            };
            (lo, lo | host_bits)
        }
    }
}

/// Taken ranges of the same family, clipped to the host range, sorted and merged
fn taken_intervals(subnet: IpNetwork, taken: &[IpNetwork]) -> Vec<(u128, u128)> {
    let (start, end) = host_range(subnet);
    let mut clipped: Vec<(u128, u128)> = taken
        .iter()
        .filter(|t| t.is_ipv4() == subnet.is_ipv4())
        .map(|t| span(*t))
        .filter(|(lo, hi)| *hi >= start && *lo <= end)
        .map(|(lo, hi)| (lo.max(start), hi.min(end)))
        .collect();
    clipped.sort_unstable();

    let mut merged: Vec<(u128, u128)> = Vec::with_capacity(clipped.len());
    for (lo, hi) in clipped {
        match merged.last_mut() {
            Some(last) if lo <= last.1.saturating_add(1) => last.1 = last.1.max(hi),
            _ => merged.push((lo, hi)),
        }
    }
    merged
}

fn to_addr(value: u128, v4: bool) -> IpAddr {
    if v4 {
        IpAddr::V4(Ipv4Addr::from(value as u32))
    } else {
        IpAddr::V6(Ipv6Addr::from(value))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn net(s: &str) -> IpNetwork {
        s.parse().unwrap()
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_count_empty_subnet_is_full_host_count() {
        let counts = available_counts(&[net("10.0.0.0/24")], &[]);
        assert_eq!(counts, vec![254]);
    }

    #[test]
    fn test_count_subtracts_taken_addresses() {
        let taken = vec![net("10.0.0.2/32"), net("10.0.0.3/32"), net("10.0.0.9/32")];
        assert_eq!(available_counts(&[net("10.0.0.0/24")], &taken), vec![251]);
    }

    #[test]
    fn test_count_ignores_duplicates_and_other_families() {
        let taken = vec![
            net("10.0.0.2/32"),
            net("10.0.0.2/32"),
            net("fd00::2/128"),
            net("192.168.1.5/32"),
        ];
        assert_eq!(available_counts(&[net("10.0.0.0/24")], &taken), vec![253]);
    }

    #[test]
    fn test_count_never_negative_when_full() {
        let subnet = net("10.0.0.0/30");
        let taken = vec![net("10.0.0.1/32"), net("10.0.0.2/32"), net("10.0.0.0/24")];
        assert_eq!(available_counts(&[subnet], &taken), vec![0]);
    }

    #[test]
    fn test_count_contained_network() {
        // A /30 at .16 claims four addresses
        let taken = vec![net("10.0.0.16/30")];
        assert_eq!(available_counts(&[net("10.0.0.0/24")], &taken), vec![250]);
    }

    #[test]
    fn test_enumerate_skips_taken_in_order() {
        let taken = vec![net("10.0.0.1/32"), net("10.0.0.2/32"), net("10.0.0.3/32")];
        let got: Vec<IpAddr> = available_addresses(net("10.0.0.0/24"), &taken)
            .take(5)
            .collect();
        assert_eq!(
            got,
            vec![
                ip("10.0.0.4"),
                ip("10.0.0.5"),
                ip("10.0.0.6"),
                ip("10.0.0.7"),
                ip("10.0.0.8")
            ]
        );
    }

    #[test]
    fn test_enumerate_excludes_network_and_broadcast() {
        let got: Vec<IpAddr> = available_addresses(net("192.168.5.0/30"), &[]).collect();
        assert_eq!(got, vec![ip("192.168.5.1"), ip("192.168.5.2")]);
    }

    #[test]
    fn test_enumerate_point_to_point() {
        let got: Vec<IpAddr> = available_addresses(net("10.1.1.0/31"), &[]).collect();
        assert_eq!(got, vec![ip("10.1.1.0"), ip("10.1.1.1")]);
        let got: Vec<IpAddr> = available_addresses(net("10.1.1.7/32"), &[]).collect();
        assert_eq!(got, vec![ip("10.1.1.7")]);
    }

    #[test]
    fn test_enumerate_matches_count() {
        let subnet = net("172.16.0.0/27");
        let taken = vec![net("172.16.0.4/30"), net("172.16.0.30/32"), net("172.16.0.1/32")];
        let listed = available_addresses(subnet, &taken).count() as u128;
        assert_eq!(available_counts(&[subnet], &taken), vec![listed]);
        assert!(available_addresses(subnet, &taken)
            .all(|a| !taken.iter().any(|t| t.contains(a))));
    }

    #[test]
    fn test_enumerate_fully_taken_is_empty() {
        let mut iter = available_addresses(net("10.0.0.0/29"), &[net("10.0.0.0/29")]);
        assert_eq!(iter.next(), None);
    }

    #[test]
    fn test_enumerate_ipv6_lazily() {
        let subnet = net("fd00::/64");
        let taken = vec![net("fd00::1/128")];
        let got: Vec<IpAddr> = available_addresses(subnet, &taken).take(2).collect();
        assert_eq!(got, vec![ip("fd00::2"), ip("fd00::3")]);
        assert_eq!(
            available_counts(&[subnet], &taken),
            vec![(1u128 << 64) - 2]
        );
    }

    #[test]
    fn test_parse_allowed_ips_lenient_skips_garbage() {
        let parsed = parse_allowed_ips_lenient("peer", "10.0.0.2/32, bogus, N/A, ,10.0.0.3");
        assert_eq!(parsed, vec![net("10.0.0.2/32"), net("10.0.0.3/32")]);
    }

    #[test]
    fn test_parse_allowed_ips_normalizes_address_with_prefix() {
        let parsed = parse_allowed_ips_lenient("peer", "10.0.0.2/24");
        assert_eq!(parsed, vec![net("10.0.0.2/32")]);
    }

    #[test]
    fn test_parse_cidr_list_strict() {
        assert_eq!(
            parse_cidr_list("0.0.0.0/0, ::/0").unwrap(),
            vec![net("0.0.0.0/0"), net("::/0")]
        );
        assert!(parse_cidr_list("10.0.0.0/33").is_err());
        assert!(parse_cidr_list("10.0.0.0/24, nope").is_err());
        assert!(parse_cidr_list("").unwrap().is_empty());
    }

    #[test]
    fn test_interface_networks() {
        let nets = interface_networks("10.0.0.1/24, fd00::1/64");
        assert_eq!(nets.len(), 2);
        assert_eq!(nets[0].1, net("10.0.0.0/24"));
        assert_eq!(nets[0].2, ip("10.0.0.1"));
        assert_eq!(nets[1].1, net("fd00::/64"));
        assert_eq!(nets[1].2, ip("fd00::1"));
    }

    #[test]
    fn test_interface_network_address_reserves_first_host() {
        let nets = interface_networks("10.0.0.0/24");
        assert_eq!(nets[0].0, "10.0.0.0/24");
        assert_eq!(nets[0].2, ip("10.0.0.1"));
    }

    #[test]
    fn test_interface_networks_skips_garbage() {
        assert!(interface_networks("not-an-address").is_empty());
    }
}
