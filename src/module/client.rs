//! classifies clients into named groups by source address
//!
//! Groups are declared as lists of exact IPs and CIDR blocks with an integer
//! priority. Classification walks groups in ascending priority order and
//! tests exact addresses before network membership, so a host entry always
//! beats a block that contains it.

use std::collections::HashMap;
use std::error::Error;
use std::fmt;
use std::net::{IpAddr, SocketAddr};

use ipnetwork::IpNetwork;
use serde_derive::{Deserialize, Serialize};

/// A named set of client sources with a matching priority. Lower priority
/// numbers are evaluated first.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientGroup {
    #[serde(default)]
    pub sources: Vec<String>,
    #[serde(default)]
    pub priority: i64,
}

#[derive(Debug)]
pub enum ClassifierError {
    /// No groups were configured at all
    NoGroups,
    /// A group was declared without any sources
    EmptyGroup(String),
    /// A group priority was negative
    NegativePriority { group: String, priority: i64 },
    /// A source string parsed neither as an IP nor as a CIDR block
    InvalidSource { group: String, source: String },
}

impl fmt::Display for ClassifierError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ClassifierError::NoGroups => write!(f, "no client groups defined"),
            ClassifierError::EmptyGroup(group) => {
                write!(f, "client group {} must have at least one source", group)
            }
            ClassifierError::NegativePriority { group, priority } => write!(
                f,
                "client group {} priority must be non-negative, got {}",
                group, priority
            ),
            ClassifierError::InvalidSource { group, source } => {
                write!(f, "invalid source {} in client group {}", source, group)
            }
        }
    }
}

impl Error for ClassifierError {}

type Result<T> = std::result::Result<T, ClassifierError>;

/// One group after source compilation.
struct CompiledGroup {
    name: String,
    priority: i64,
    ips: Vec<IpAddr>,
    networks: Vec<IpNetwork>,
}

/// Priority ordered matcher compiled from a set of client groups.
///
/// Compilation happens once at provisioning; classification reads the
/// compiled tables only, so concurrent lookups need no synchronization.
pub struct ClientClassifier {
    // ascending priority; the relative order of equal priorities is
    // unspecified
    groups: Vec<CompiledGroup>,
}

impl ClientClassifier {
    /// Compile the configured groups into a matcher. Fails on an empty
    /// group set, empty groups, negative priorities and unparseable
    /// sources.
    pub fn compile(groups: &HashMap<String, ClientGroup>) -> Result<ClientClassifier> {
        if groups.is_empty() {
            return Err(ClassifierError::NoGroups);
        }

        let mut compiled = Vec::with_capacity(groups.len());

        for (name, group) in groups {
            if group.sources.is_empty() {
                return Err(ClassifierError::EmptyGroup(name.clone()));
            }
            if group.priority < 0 {
                return Err(ClassifierError::NegativePriority {
                    group: name.clone(),
                    priority: group.priority,
                });
            }

            let mut entry = CompiledGroup {
                name: name.clone(),
                priority: group.priority,
                ips: Vec::new(),
                networks: Vec::new(),
            };

            for source in &group.sources {
                parse_source(source, name, &mut entry)?;
            }

            log::debug!(
                "compiled client group name={} priority={} networks={} individual_ips={}",
                name,
                group.priority,
                entry.networks.len(),
                entry.ips.len()
            );

            compiled.push(entry);
        }

        compiled.sort_by_key(|g| g.priority);

        Ok(ClientClassifier { groups: compiled })
    }

    /// Classify the remote endpoint of a request. Works for datagram and
    /// stream transports alike since both carry a socket address.
    pub fn classify(&self, remote: SocketAddr) -> Option<&str> {
        self.classify_ip(remote.ip())
    }

    /// Classify an IP address into the highest precedence matching group.
    /// Returns `None` when no group matches.
    pub fn classify_ip(&self, client_ip: IpAddr) -> Option<&str> {
        for group in &self.groups {
            for ip in &group.ips {
                if *ip == client_ip {
                    log::debug!(
                        "client ip {} matched individual ip in group {}",
                        client_ip,
                        group.name
                    );
                    return Some(&group.name);
                }
            }

            for network in &group.networks {
                if network.contains(client_ip) {
                    log::debug!(
                        "client ip {} matched network {} in group {}",
                        client_ip,
                        network,
                        group.name
                    );
                    return Some(&group.name);
                }
            }
        }

        log::debug!("client ip {} did not match any group", client_ip);
        None
    }

    /// Names of all compiled groups, in evaluation order.
    pub fn group_names(&self) -> Vec<&str> {
        self.groups.iter().map(|g| g.name.as_str()).collect()
    }
}

fn parse_source(source: &str, group: &str, entry: &mut CompiledGroup) -> Result<()> {
    if source.is_empty() {
        return Err(ClassifierError::InvalidSource {
            group: group.to_string(),
            source: source.to_string(),
        });
    }

    if source.contains('/') {
        let network: IpNetwork =
            source
                .parse()
                .map_err(|_| ClassifierError::InvalidSource {
                    group: group.to_string(),
                    source: source.to_string(),
                })?;
        entry.networks.push(network);
    } else {
        let ip: IpAddr = source
            .parse()
            .map_err(|_| ClassifierError::InvalidSource {
                group: group.to_string(),
                source: source.to_string(),
            })?;
        entry.ips.push(ip);
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn groups(entries: &[(&str, &[&str], i64)]) -> HashMap<String, ClientGroup> {
        entries
            .iter()
            .map(|(name, sources, priority)| {
                (
                    name.to_string(),
                    ClientGroup {
                        sources: sources.iter().map(|s| s.to_string()).collect(),
                        priority: *priority,
                    },
                )
            })
            .collect()
    }

    #[test]
    fn test_priority_ordering() {
        let classifier = ClientClassifier::compile(&groups(&[
            ("internal", &["192.168.0.0/16", "10.0.0.0/8"], 10),
            ("external", &["0.0.0.0/0"], 100),
        ]))
        .unwrap();

        // 10.0.0.1 matches both groups; internal has the lower priority
        assert_eq!(
            Some("internal"),
            classifier.classify_ip("10.0.0.1".parse().unwrap())
        );
        assert_eq!(
            Some("external"),
            classifier.classify_ip("8.8.8.8".parse().unwrap())
        );
    }

    #[test]
    fn test_exact_ip_beats_containing_cidr() {
        let classifier = ClientClassifier::compile(&groups(&[(
            "mixed",
            &["192.168.1.0/24", "192.168.1.77"],
            5,
        )]))
        .unwrap();

        // single group: exact entry and block both match, the exact entry
        // is checked first
        assert_eq!(
            Some("mixed"),
            classifier.classify_ip("192.168.1.77".parse().unwrap())
        );
    }

    #[test]
    fn test_priority_tie_yields_some_match() {
        let classifier = ClientClassifier::compile(&groups(&[
            ("alpha", &["172.16.0.0/12"], 20),
            ("beta", &["172.16.5.0/24"], 20),
        ]))
        .unwrap();

        let matched = classifier.classify_ip("172.16.5.9".parse().unwrap());
        assert!(matched == Some("alpha") || matched == Some("beta"));
    }

    #[test]
    fn test_no_match_returns_none() {
        let classifier =
            ClientClassifier::compile(&groups(&[("internal", &["192.168.0.0/16"], 10)])).unwrap();

        assert_eq!(None, classifier.classify_ip("203.0.113.5".parse().unwrap()));
    }

    #[test]
    fn test_classify_socket_addrs() {
        let classifier =
            ClientClassifier::compile(&groups(&[("internal", &["192.168.0.0/16"], 10)])).unwrap();

        let addr: SocketAddr = "192.168.1.100:12345".parse().unwrap();
        assert_eq!(Some("internal"), classifier.classify(addr));
    }

    #[test]
    fn test_ipv6_sources() {
        let classifier = ClientClassifier::compile(&groups(&[(
            "lan6",
            &["2001:db8::/32", "::1"],
            1,
        )]))
        .unwrap();

        assert_eq!(
            Some("lan6"),
            classifier.classify_ip("2001:db8::42".parse().unwrap())
        );
        assert_eq!(Some("lan6"), classifier.classify_ip("::1".parse().unwrap()));
    }

    #[test]
    fn test_compile_errors() {
        match ClientClassifier::compile(&HashMap::new()) {
            Err(ClassifierError::NoGroups) => {}
            other => panic!("expected NoGroups, got {:?}", other.err()),
        }

        match ClientClassifier::compile(&groups(&[("empty", &[], 0)])) {
            Err(ClassifierError::EmptyGroup(name)) => assert_eq!("empty", name),
            other => panic!("expected EmptyGroup, got {:?}", other.err()),
        }

        match ClientClassifier::compile(&groups(&[("neg", &["10.0.0.0/8"], -1)])) {
            Err(ClassifierError::NegativePriority { priority, .. }) => assert_eq!(-1, priority),
            other => panic!("expected NegativePriority, got {:?}", other.err()),
        }

        match ClientClassifier::compile(&groups(&[("bad", &["not-an-ip"], 0)])) {
            Err(ClassifierError::InvalidSource { source, .. }) => {
                assert_eq!("not-an-ip", source)
            }
            other => panic!("expected InvalidSource, got {:?}", other.err()),
        }

        match ClientClassifier::compile(&groups(&[("badcidr", &["10.0.0.0/40"], 0)])) {
            Err(ClassifierError::InvalidSource { source, .. }) => {
                assert_eq!("10.0.0.0/40", source)
            }
            other => panic!("expected InvalidSource, got {:?}", other.err()),
        }
    }
}
