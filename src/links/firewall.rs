//! Ingress firewall chain emission
//!
//! The broker does not program iptables itself; it emits chain requests
//! that the external router component applies. Per link there is one chain
//! named by a stable hash of the link name; a top-level branch chain
//! selects the per-link chain by packet source.

use base64::Engine;
use sha2::{Digest, Sha256};

use super::{Link, Links};
use crate::net::host_net;

pub const CHAIN_PREFIX: &str = "MESHBR-";

pub const LINKS_CHAIN: &str = "MESHBR-LINKS";
pub const TABLE_LINKS_CHAIN: &str = "mangle";

pub const FIREWALL_CHAIN: &str = "MESHBR-FIREWALL";
pub const TABLE_FIREWALL_CHAIN: &str = "filter";

pub const DROP_CHAIN: &str = "MESHBR-DROP";
pub const TABLE_DROP_CHAIN: &str = TABLE_FIREWALL_CHAIN;

pub const MARK_DROP_CHAIN: &str = "MESHBR-MARK-DROP";
pub const TABLE_MARK_DROP_CHAIN: &str = TABLE_LINKS_CHAIN;

pub const FW_LINK_CHAIN_PREFIX: &str = "MESHBR-FW-";
pub const TABLE_LINK_CHAIN: &str = TABLE_MARK_DROP_CHAIN;

/// One iptables rule, a flat argument list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Rule {
    pub args: Vec<String>,
}

impl Rule {
    pub fn new<I, S>(args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            args: args.into_iter().map(Into::into).collect(),
        }
    }
}

/// A chain with its rules, addressed to a table. `cleanup` asks the router
/// to flush rules the request no longer contains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainRequest {
    pub table: String,
    pub chain: String,
    pub rules: Vec<Rule>,
    pub cleanup: bool,
}

impl ChainRequest {
    pub fn new(table: &str, chain: String, rules: Vec<Rule>, cleanup: bool) -> Self {
        Self {
            table: table.into(),
            chain,
            rules,
            cleanup,
        }
    }
}

/// An embedding rule hooked into a predefined chain, optionally ordered
/// before another jump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RuleDef {
    pub table: String,
    pub chain: String,
    pub rule: Rule,
    pub before: String,
}

/// Stable chain-name suffix for a link.
fn encode_name(name: &str) -> String {
    let sum = Sha256::digest(name.as_bytes());
    base64::engine::general_purpose::STANDARD
        .encode(&sum[..12])
        .to_uppercase()
}

impl Link {
    /// The per-link ingress chain, or `None` when no policy is declared.
    ///
    /// Denied destinations jump to the mark-drop chain, allowed ones
    /// return, and the catch-all marks everything else for dropping.
    pub fn ingress_chain(&self) -> Option<ChainRequest> {
        let ingress = self.ingress.as_ref().filter(|r| r.is_set())?;
        let comment = format!("firewall settings for link {}", self.name);
        let mut rules = vec![Rule::new(["-m", "comment", "--comment", comment.as_str()])];
        for denied in ingress.denied.iter() {
            let dst = denied.to_string();
            rules.push(Rule::new(["-d", dst.as_str(), "-j", MARK_DROP_CHAIN]));
        }
        for allowed in ingress.allowed.iter() {
            let dst = allowed.to_string();
            rules.push(Rule::new(["-d", dst.as_str(), "-j", "RETURN"]));
        }
        rules.push(Rule::new(["-j", MARK_DROP_CHAIN]));
        Some(ChainRequest::new(
            TABLE_LINK_CHAIN,
            format!("{}{}", FW_LINK_CHAIN_PREFIX, encode_name(&self.name)),
            rules,
            true,
        ))
    }
}

impl Links {
    /// The full chain set for the current registry content, empty when no
    /// link declares a policy.
    pub fn firewall_chains(&self) -> Vec<ChainRequest> {
        let mut branch_rules = Vec::new();
        let mut link_chains = Vec::new();
        self.visit(|link| {
            if let Some(chain) = link.ingress_chain() {
                let src = host_net(link.cluster_address.addr()).to_string();
                branch_rules.push(Rule::new(["-s", src.as_str(), "-j", chain.chain.as_str()]));
                link_chains.push(chain);
            }
            true
        });

        let mut chains = Vec::new();
        if branch_rules.is_empty() {
            return chains;
        }
        chains.push(ChainRequest::new(
            TABLE_DROP_CHAIN,
            DROP_CHAIN.into(),
            vec![
                Rule::new(["-j", "MARK", "--set-xmark", "0x0/0x2000"]),
                Rule::new(["-j", "DROP"]),
            ],
            true,
        ));
        chains.push(ChainRequest::new(
            TABLE_MARK_DROP_CHAIN,
            MARK_DROP_CHAIN.into(),
            vec![Rule::new(["-j", "MARK", "--set-xmark", "0x2000/0x2000"])],
            true,
        ));
        chains.extend(link_chains);
        chains.push(ChainRequest::new(
            TABLE_LINKS_CHAIN,
            LINKS_CHAIN.into(),
            branch_rules,
            true,
        ));
        chains.push(ChainRequest::new(
            TABLE_FIREWALL_CHAIN,
            FIREWALL_CHAIN.into(),
            vec![Rule::new([
                "-m",
                "mark",
                "--mark",
                "0x2000/0x2000",
                "-j",
                DROP_CHAIN,
            ])],
            true,
        ));
        chains
    }
}

/// The rules anchoring the emitted chains into the predefined tables.
pub fn embedding() -> Vec<RuleDef> {
    let comment = ["-m", "comment", "--comment", "meshbridge firewall rules"];
    let jump = |target: &str| {
        let mut args: Vec<String> = comment.iter().map(|s| s.to_string()).collect();
        args.push("-j".into());
        args.push(target.into());
        Rule { args }
    };
    vec![
        RuleDef {
            table: TABLE_LINKS_CHAIN.into(),
            chain: "PREROUTING".into(),
            rule: jump(LINKS_CHAIN),
            before: String::new(),
        },
        RuleDef {
            table: TABLE_FIREWALL_CHAIN.into(),
            chain: "FORWARD".into(),
            rule: jump(FIREWALL_CHAIN),
            before: "KUBE-FORWARD".into(),
        },
        RuleDef {
            table: TABLE_FIREWALL_CHAIN.into(),
            chain: "OUTPUT".into(),
            rule: jump(FIREWALL_CHAIN),
            before: String::new(),
        },
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::LinkSpec;

    fn registry_with_policy() -> Links {
        let links = Links::new(8088, None);
        links
            .put(&LinkSpec {
                name: "peer1".into(),
                cluster_address: "192.168.0.12/24".into(),
                endpoint: "peer1.example".into(),
                ingress: vec!["100.64.16.0/28".into(), "!100.64.16.5/32".into()],
                ..Default::default()
            })
            .unwrap();
        links
    }

    #[test]
    fn test_encode_name_stable_and_chain_safe() {
        let a = encode_name("peer1");
        assert_eq!(a, encode_name("peer1"));
        assert_ne!(a, encode_name("peer2"));
        // iptables chain names are limited to 28 characters
        assert!(FW_LINK_CHAIN_PREFIX.len() + a.len() <= 28);
    }

    #[test]
    fn test_ingress_chain_layout() {
        let links = registry_with_policy();
        let link = links.get("peer1").unwrap();
        let chain = link.ingress_chain().unwrap();

        assert!(chain.chain.starts_with(FW_LINK_CHAIN_PREFIX));
        assert_eq!(chain.table, TABLE_LINK_CHAIN);
        // comment, one deny, one allow, catch-all
        assert_eq!(chain.rules.len(), 4);
        assert_eq!(
            chain.rules[1].args,
            vec!["-d", "100.64.16.5/32", "-j", MARK_DROP_CHAIN]
        );
        assert_eq!(chain.rules[2].args, vec!["-d", "100.64.16.0/28", "-j", "RETURN"]);
        assert_eq!(chain.rules[3].args, vec!["-j", MARK_DROP_CHAIN]);
    }

    #[test]
    fn test_no_policy_no_chain() {
        let links = Links::new(8088, None);
        links
            .put(&LinkSpec {
                name: "open".into(),
                cluster_address: "192.168.0.13/24".into(),
                endpoint: "open.example".into(),
                ..Default::default()
            })
            .unwrap();
        assert!(links.get("open").unwrap().ingress_chain().is_none());
        assert!(links.firewall_chains().is_empty());
    }

    #[test]
    fn test_firewall_chain_set() {
        let links = registry_with_policy();
        let chains = links.firewall_chains();
        // drop, mark-drop, one link chain, links branch, firewall
        assert_eq!(chains.len(), 5);

        let branch = chains.iter().find(|c| c.chain == LINKS_CHAIN).unwrap();
        assert_eq!(branch.rules.len(), 1);
        assert_eq!(branch.rules[0].args[0], "-s");
        assert_eq!(branch.rules[0].args[1], "192.168.0.12/32");

        assert!(chains.iter().any(|c| c.chain == DROP_CHAIN));
        assert!(chains.iter().any(|c| c.chain == MARK_DROP_CHAIN));
        assert!(chains.iter().any(|c| c.chain == FIREWALL_CHAIN));
    }

    #[test]
    fn test_embedding_rules() {
        let defs = embedding();
        assert_eq!(defs.len(), 3);
        assert!(defs.iter().any(|d| d.chain == "PREROUTING"));
        assert!(defs
            .iter()
            .any(|d| d.chain == "FORWARD" && d.before == "KUBE-FORWARD"));
    }
}
