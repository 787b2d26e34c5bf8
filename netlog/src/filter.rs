//! Connection filtering.
//!
//! Rules are compiled once from configuration into prefix tables and port
//! sets; each dimension carries an include list and an exclude list. A rule
//! that fails to compile surfaces as a [`ConfigError::FilterRule`], which the
//! caller downgrades to "run unfiltered" rather than aborting capture.

use std::{
    collections::HashSet,
    net::IpAddr,
    sync::RwLock,
};

use fxhash::FxHashMap;
use ip_network::IpNetwork;
use ip_network_table::IpNetworkTable;
use netlog_types::ip::IpProto;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;

/// Filterable facts about one connection's first packet.
#[derive(Debug, Clone, Copy)]
pub struct FilterFields {
    pub src_addr: IpAddr,
    pub dst_addr: IpAddr,
    pub src_port: u16,
    pub dst_port: u16,
    pub transport: IpProto,
}

/// Decides whether a connection is tracked at all.
pub trait FilterPredicate: Send + Sync {
    fn excludes(&self, fields: &FilterFields) -> bool;
}

/// Filtering section of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct FilterConf {
    /// CIDRs; a connection matches when either endpoint falls inside.
    #[serde(default)]
    pub match_address: Vec<String>,
    #[serde(default)]
    pub not_match_address: Vec<String>,
    /// Exact ports, matched against either endpoint.
    #[serde(default)]
    pub match_port: Vec<u16>,
    #[serde(default)]
    pub not_match_port: Vec<u16>,
}

impl FilterConf {
    pub fn is_empty(&self) -> bool {
        self.match_address.is_empty()
            && self.not_match_address.is_empty()
            && self.match_port.is_empty()
            && self.not_match_port.is_empty()
    }
}

struct CompiledRuleSet<T> {
    match_rules: T,
    not_match_rules: T,
}

/// Longest-prefix address table with a memo of per-address outcomes, so hot
/// connections pay the trie walk once.
pub struct CidrCache {
    networks: IpNetworkTable<()>,
    resolved: RwLock<FxHashMap<IpAddr, bool>>,
}

impl std::fmt::Debug for CidrCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CidrCache")
            .field("networks", &self.networks.len())
            .finish_non_exhaustive()
    }
}

impl CidrCache {
    pub fn compile(cidrs: &[String]) -> Result<Self, ConfigError> {
        let mut networks = IpNetworkTable::new();
        for cidr in cidrs {
            let net: IpNetwork = cidr.parse().map_err(|e| ConfigError::FilterRule {
                rule: cidr.clone(),
                reason: format!("{e}"),
            })?;
            networks.insert(net, ());
        }
        Ok(Self {
            networks,
            resolved: RwLock::new(FxHashMap::default()),
        })
    }

    pub fn is_empty(&self) -> bool {
        let (v4, v6) = self.networks.len();
        v4 == 0 && v6 == 0
    }

    pub fn contains(&self, addr: IpAddr) -> bool {
        if let Some(hit) = self.resolved.read().expect("lock poisoned").get(&addr) {
            return *hit;
        }
        let hit = self.networks.longest_match(addr).is_some();
        self.resolved
            .write()
            .expect("lock poisoned")
            .insert(addr, hit);
        hit
    }
}

/// Compiled filter rules for one capture interface.
#[derive(Debug)]
pub struct RuleSet {
    address: Option<CompiledRuleSet<CidrCache>>,
    port: Option<CompiledRuleSet<HashSet<u16>>>,
}

impl std::fmt::Debug for CompiledRuleSet<CidrCache> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRuleSet").finish_non_exhaustive()
    }
}

impl std::fmt::Debug for CompiledRuleSet<HashSet<u16>> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompiledRuleSet").finish_non_exhaustive()
    }
}

impl RuleSet {
    pub fn compile(conf: &FilterConf) -> Result<Self, ConfigError> {
        let address = if conf.match_address.is_empty() && conf.not_match_address.is_empty() {
            None
        } else {
            Some(CompiledRuleSet {
                match_rules: CidrCache::compile(&conf.match_address)?,
                not_match_rules: CidrCache::compile(&conf.not_match_address)?,
            })
        };
        let port = if conf.match_port.is_empty() && conf.not_match_port.is_empty() {
            None
        } else {
            Some(CompiledRuleSet {
                match_rules: conf.match_port.iter().copied().collect(),
                not_match_rules: conf.not_match_port.iter().copied().collect(),
            })
        };
        Ok(Self { address, port })
    }
}

impl FilterPredicate for RuleSet {
    fn excludes(&self, fields: &FilterFields) -> bool {
        if let Some(rules) = &self.address {
            let hit = |cache: &CidrCache| {
                cache.contains(fields.src_addr) || cache.contains(fields.dst_addr)
            };
            if !rules.match_rules.is_empty() && !hit(&rules.match_rules) {
                return true;
            }
            if hit(&rules.not_match_rules) {
                return true;
            }
        }
        if let Some(rules) = &self.port {
            let hit = |set: &HashSet<u16>| {
                set.contains(&fields.src_port) || set.contains(&fields.dst_port)
            };
            if !rules.match_rules.is_empty() && !hit(&rules.match_rules) {
                return true;
            }
            if hit(&rules.not_match_rules) {
                return true;
            }
        }
        false
    }
}

/// Tracks everything.
#[derive(Debug, Default)]
pub struct AllowAll;

impl FilterPredicate for AllowAll {
    fn excludes(&self, _fields: &FilterFields) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields(src: &str, dst: &str, dst_port: u16) -> FilterFields {
        FilterFields {
            src_addr: src.parse().unwrap(),
            dst_addr: dst.parse().unwrap(),
            src_port: 41000,
            dst_port,
            transport: IpProto::Tcp,
        }
    }

    #[test]
    fn empty_ruleset_excludes_nothing() {
        let rules = RuleSet::compile(&FilterConf::default()).unwrap();
        assert!(!rules.excludes(&fields("10.0.0.1", "10.0.0.2", 80)));
    }

    #[test]
    fn match_address_is_an_allowlist() {
        let conf = FilterConf {
            match_address: vec!["10.0.0.0/8".to_owned()],
            ..FilterConf::default()
        };
        let rules = RuleSet::compile(&conf).unwrap();
        assert!(!rules.excludes(&fields("10.1.2.3", "192.168.0.1", 80)));
        assert!(rules.excludes(&fields("172.16.0.1", "192.168.0.1", 80)));
    }

    #[test]
    fn not_match_address_is_a_denylist() {
        let conf = FilterConf {
            not_match_address: vec!["192.168.0.0/16".to_owned()],
            ..FilterConf::default()
        };
        let rules = RuleSet::compile(&conf).unwrap();
        assert!(rules.excludes(&fields("10.0.0.1", "192.168.5.5", 80)));
        assert!(!rules.excludes(&fields("10.0.0.1", "10.0.0.2", 80)));
    }

    #[test]
    fn port_rules_check_both_endpoints() {
        let conf = FilterConf {
            match_port: vec![80, 443],
            ..FilterConf::default()
        };
        let rules = RuleSet::compile(&conf).unwrap();
        assert!(!rules.excludes(&fields("10.0.0.1", "10.0.0.2", 443)));
        assert!(rules.excludes(&fields("10.0.0.1", "10.0.0.2", 8080)));
    }

    #[test]
    fn invalid_cidr_reports_the_rule() {
        let conf = FilterConf {
            match_address: vec!["10.0.0.0/40".to_owned()],
            ..FilterConf::default()
        };
        match RuleSet::compile(&conf) {
            Err(ConfigError::FilterRule { rule, .. }) => assert_eq!(rule, "10.0.0.0/40"),
            other => panic!("expected FilterRule error, got {other:?}"),
        }
    }

    #[test]
    fn cidr_cache_memoizes() {
        let cache = CidrCache::compile(&["10.0.0.0/8".to_owned()]).unwrap();
        assert!(cache.contains("10.9.9.9".parse().unwrap()));
        assert!(cache.contains("10.9.9.9".parse().unwrap()));
        assert_eq!(cache.resolved.read().unwrap().len(), 1);
    }
}
