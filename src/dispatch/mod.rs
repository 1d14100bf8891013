//! Dispatch engine root
//!
//! Ties the zone index and the per-vhost node tables together into the
//! `(client ip, host, key)` → `(zone, backend server)` query, and carries the
//! admin mutation and statistics surfaces.
//!
//! The whole graph is immutable after load: queries touch only atomics and
//! the per-node cursor lock, so no root lock is needed. Live mutation is
//! limited to scalar node/server attributes.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use tracing::debug;

use crate::error::{Error, Result};
use crate::routing::{Node, OperStatus};
use crate::zone::{ipv4_to_u32, ZoneIndex, ZONE_SLOTS};

/// A virtual host: a set of nodes plus the zone-to-node view.
#[derive(Debug)]
pub struct Vhost {
    pub name: String,
    nodes: Vec<Node>,
    node_ids: HashMap<String, usize>,
    zone2node: Vec<usize>,
    default_node: usize,
    reqcount: AtomicU64,
}

impl Vhost {
    /// Assemble a vhost, resolving each node's overflow target by name.
    /// Zones start out mapped to the default node until [`Self::map_zone`]
    /// overrides them.
    pub fn new(name: &str, mut nodes: Vec<Node>, default_node: usize) -> Self {
        let node_ids: HashMap<String, usize> =
            nodes.iter().map(|n| (n.name.clone(), n.id)).collect();
        for node in &mut nodes {
            node.overflow_id = node
                .overflow_to
                .as_ref()
                .and_then(|target| node_ids.get(target))
                .copied();
        }
        Self {
            name: name.to_string(),
            nodes,
            node_ids,
            zone2node: vec![default_node; ZONE_SLOTS],
            default_node,
            reqcount: AtomicU64::new(0),
        }
    }

    /// Route a zone id to a node.
    pub fn map_zone(&mut self, zone_id: usize, node_id: usize) {
        self.zone2node[zone_id] = node_id;
    }

    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    pub fn node_by_name(&self, name: &str) -> Option<&Node> {
        self.node_ids.get(name).map(|&id| &self.nodes[id])
    }

    pub fn requests_total(&self) -> u64 {
        self.reqcount.load(Ordering::Relaxed)
    }
}

/// A dispatch decision: the backend to redirect to and the matched zone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Dispatched {
    pub server_ip: String,
    pub zone: String,
}

/// Root of the in-memory dispatch model.
#[derive(Debug)]
pub struct Dispatcher {
    zones: ZoneIndex,
    vhosts: HashMap<String, Vhost>,
    reqcount: AtomicU64,
    othercount: AtomicU64,
}

impl Dispatcher {
    pub fn new(zones: ZoneIndex, vhosts: HashMap<String, Vhost>) -> Self {
        Self {
            zones,
            vhosts,
            reqcount: AtomicU64::new(0),
            othercount: AtomicU64::new(0),
        }
    }

    pub fn zones(&self) -> &ZoneIndex {
        &self.zones
    }

    pub fn vhost(&self, host: &str) -> Option<&Vhost> {
        self.vhosts.get(host)
    }

    /// Zone name for a client address, or "" when none matches. Diagnostic
    /// path; does not count as traffic.
    pub fn query_zone(&self, clip: &str) -> String {
        self.zones
            .lookup(ipv4_to_u32(clip))
            .map(|z| z.name.clone())
            .unwrap_or_default()
    }

    /// Select a backend server for a request.
    ///
    /// `clip` is the client address, `host` the virtual host, `key` the
    /// balancing key (typically the request path).
    pub fn query(&self, clip: &str, host: &str, key: &str) -> Result<Dispatched> {
        self.reqcount.fetch_add(1, Ordering::Relaxed);
        let Some(vhost) = self.vhosts.get(host) else {
            self.othercount.fetch_add(1, Ordering::Relaxed);
            return Err(Error::UnknownHost(host.to_string()));
        };
        vhost.reqcount.fetch_add(1, Ordering::Relaxed);

        let ip = ipv4_to_u32(clip);
        if ip == 0 {
            return Err(Error::InvalidClientIp(clip.to_string()));
        }

        let mut zone = "None".to_string();
        let mut node_id = vhost.default_node;
        if let Some(z) = self.zones.lookup(ip) {
            zone = z.name.clone();
            node_id = vhost.zone2node[z.id];
        }
        let mut node = &vhost.nodes[node_id];

        // Down cascade: the overflow target if configured, otherwise the
        // next live node in declaration order. No wraparound.
        if !node.is_up() {
            node = match node.overflow_id {
                Some(oid) => &vhost.nodes[oid],
                None => vhost.nodes[node.id + 1..]
                    .iter()
                    .find(|n| n.is_up())
                    .ok_or_else(|| Error::NoLiveNode(node.name.clone()))?,
            };
        }

        // Bandwidth headroom shift. The overflow target is taken as-is,
        // without re-checking its own status or budget.
        if node.wants_overflow() {
            if let Some(oid) = node.overflow_id {
                node = &vhost.nodes[oid];
            }
        }

        node.record_request(unix_now());
        let server = node.select(key)?;
        debug!(host, zone = %zone, node = %node.name, server = %server.ip, "dispatched");
        Ok(Dispatched {
            server_ip: server.ip.clone(),
            zone,
        })
    }

    /// Live mutation of node or server attributes.
    ///
    /// Records are applied as parsed; the first malformed record aborts the
    /// call but earlier records in the same call stay applied.
    pub fn set(&self, host: &str, object: &str, values: &[String]) -> Result<()> {
        let vhost = self
            .vhosts
            .get(host)
            .ok_or_else(|| Error::UnknownHost(host.to_string()))?;

        match object {
            "node" => {
                for value in values {
                    let items: Vec<&str> = value.split(':').collect();
                    let &[name, field, val] = items.as_slice() else {
                        return Err(Error::AdminField(value.clone()));
                    };
                    let node = vhost
                        .node_by_name(name)
                        .ok_or_else(|| Error::AdminField(value.clone()))?;
                    match field {
                        "bw" => {
                            let bw = val
                                .parse::<i64>()
                                .map_err(|_| Error::AdminField(value.clone()))?;
                            node.set_bw(bw);
                        }
                        "status" => {
                            let status = OperStatus::parse(val)
                                .ok_or_else(|| Error::AdminField(value.clone()))?;
                            node.set_status(status);
                        }
                        _ => return Err(Error::AdminField(value.clone())),
                    }
                }
            }
            "server" => {
                for value in values {
                    let items: Vec<&str> = value.split(':').collect();
                    let &[name, ip, field, val] = items.as_slice() else {
                        return Err(Error::AdminField(value.clone()));
                    };
                    let server = vhost
                        .node_by_name(name)
                        .and_then(|node| node.server_by_ip(ip))
                        .ok_or_else(|| Error::AdminField(value.clone()))?;
                    match field {
                        "weight" => server.set_weight_spec(val),
                        "status" => {
                            let status = OperStatus::parse(val)
                                .ok_or_else(|| Error::AdminField(value.clone()))?;
                            server.set_status(status);
                        }
                        _ => return Err(Error::AdminField(value.clone())),
                    }
                }
            }
            _ => return Err(Error::AdminField(object.to_string())),
        }
        Ok(())
    }

    /// Counter retrieval for the admin surface.
    ///
    /// `node` selects the counter: "none" → vhost total, "all" → global
    /// total, "other" → requests for unknown hosts, anything else → that
    /// node's total, or its previous-minute count when `last` is non-empty.
    /// Unknown hosts or nodes read as 0.
    pub fn get_count(&self, host: &str, node: &str, last: &str) -> u64 {
        match node {
            "none" => self
                .vhosts
                .get(host)
                .map(|v| v.requests_total())
                .unwrap_or(0),
            "all" => self.reqcount.load(Ordering::Relaxed),
            "other" => self.othercount.load(Ordering::Relaxed),
            _ => self
                .vhosts
                .get(host)
                .and_then(|v| v.node_by_name(node))
                .map(|n| {
                    if last.is_empty() {
                        n.requests_total()
                    } else {
                        n.requests_last_minute()
                    }
                })
                .unwrap_or(0),
        }
    }
}

fn unix_now() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::routing::{Balance, NodeSpec, ServerSpec};

    fn server(ip: &str, id: usize) -> ServerSpec {
        ServerSpec {
            ip: ip.to_string(),
            id,
            weight_spec: String::new(),
            status: OperStatus::Up,
        }
    }

    fn node(name: &str, id: usize, servers: Vec<ServerSpec>) -> NodeSpec {
        NodeSpec {
            name: name.to_string(),
            id,
            balance: Balance::RoundRobin,
            bw: 0,
            maxbw: 0,
            freebw: 20,
            status: OperStatus::Up,
            overflow_to: None,
            servers,
        }
    }

    /// Zone z1 = 10.0.0.0/24, vhost "h1" with three single-server nodes:
    /// n1 (default, serves z1), n2 (n1's overflow), n3.
    fn dispatcher() -> Dispatcher {
        let mut zones = ZoneIndex::new();
        let id = zones.intern("z1").unwrap();
        let base = ipv4_to_u32("10.0.0.0");
        zones.insert(base, base | 0xff, "z1", id);

        let mut n1 = node("n1", 0, vec![server("1.1.1.1", 0)]);
        n1.overflow_to = Some("n2".to_string());
        let n2 = node("n2", 1, vec![server("2.2.2.2", 0)]);
        let n3 = node("n3", 2, vec![server("3.3.3.3", 0)]);

        let nodes = vec![
            Node::build(n1).unwrap(),
            Node::build(n2).unwrap(),
            Node::build(n3).unwrap(),
        ];
        let mut vhost = Vhost::new("h1", nodes, 0);
        vhost.map_zone(id, 0);

        let mut vhosts = HashMap::new();
        vhosts.insert("h1".to_string(), vhost);
        Dispatcher::new(zones, vhosts)
    }

    #[test]
    fn query_resolves_zone_and_server() {
        let disp = dispatcher();
        let out = disp.query("10.0.0.17", "h1", "/a").unwrap();
        assert_eq!(out.server_ip, "1.1.1.1");
        assert_eq!(out.zone, "z1");
    }

    #[test]
    fn query_outside_any_zone_uses_default_node() {
        let disp = dispatcher();
        let out = disp.query("172.16.0.1", "h1", "/a").unwrap();
        assert_eq!(out.server_ip, "1.1.1.1");
        assert_eq!(out.zone, "None");
    }

    #[test]
    fn unknown_host_is_counted_separately() {
        let disp = dispatcher();
        assert!(matches!(
            disp.query("10.0.0.17", "nosuch", "/"),
            Err(Error::UnknownHost(_))
        ));
        assert_eq!(disp.get_count("", "other", ""), 1);
        assert_eq!(disp.get_count("", "all", ""), 1);
    }

    #[test]
    fn invalid_client_ip_is_rejected() {
        let disp = dispatcher();
        assert!(matches!(
            disp.query("bogus", "h1", "/"),
            Err(Error::InvalidClientIp(_))
        ));
        assert!(matches!(
            disp.query("0.0.0.0", "h1", "/"),
            Err(Error::InvalidClientIp(_))
        ));
    }

    #[test]
    fn query_zone_is_diagnostic_only() {
        let disp = dispatcher();
        assert_eq!(disp.query_zone("10.0.0.17"), "z1");
        assert_eq!(disp.query_zone("10.0.1.1"), "");
        assert_eq!(disp.get_count("", "all", ""), 0);
    }

    #[test]
    fn down_node_shifts_to_overflow_target() {
        let disp = dispatcher();
        disp.set("h1", "node", &["n1:status:down".to_string()]).unwrap();
        let out = disp.query("10.0.0.17", "h1", "/a").unwrap();
        assert_eq!(out.server_ip, "2.2.2.2");
    }

    /// Variant of [`dispatcher`] whose zone maps straight to n2, which has
    /// no overflow target of its own.
    fn dispatcher_on_middle_node() -> Dispatcher {
        let mut zones = ZoneIndex::new();
        let id = zones.intern("z1").unwrap();
        let base = ipv4_to_u32("10.0.0.0");
        zones.insert(base, base | 0xff, "z1", id);

        let n1 = node("n1", 0, vec![server("1.1.1.1", 0)]);
        let n2 = node("n2", 1, vec![server("2.2.2.2", 0)]);
        let n3 = node("n3", 2, vec![server("3.3.3.3", 0)]);
        let nodes = vec![
            Node::build(n1).unwrap(),
            Node::build(n2).unwrap(),
            Node::build(n3).unwrap(),
        ];
        let mut vhost = Vhost::new("h1", nodes, 0);
        vhost.map_zone(id, 1);

        let mut vhosts = HashMap::new();
        vhosts.insert("h1".to_string(), vhost);
        Dispatcher::new(zones, vhosts)
    }

    #[test]
    fn down_node_without_overflow_scans_forward() {
        let disp = dispatcher_on_middle_node();
        disp.set("h1", "node", &["n2:status:down".to_string()]).unwrap();
        let out = disp.query("10.0.0.17", "h1", "/a").unwrap();
        assert_eq!(out.server_ip, "3.3.3.3");
    }

    #[test]
    fn no_live_node_after_downed_tail_is_an_error() {
        let disp = dispatcher_on_middle_node();
        disp.set(
            "h1",
            "node",
            &["n2:status:down".to_string(), "n3:status:down".to_string()],
        )
        .unwrap();
        assert!(matches!(
            disp.query("10.0.0.17", "h1", "/"),
            Err(Error::NoLiveNode(_))
        ));
    }

    #[test]
    fn bandwidth_headroom_shifts_to_overflow() {
        let mut n1 = node("n1", 0, vec![server("1.1.1.1", 0)]);
        n1.overflow_to = Some("n2".to_string());
        n1.bw = 10;
        n1.maxbw = 100;
        n1.freebw = 50;
        let n2 = node("n2", 1, vec![server("2.2.2.2", 0)]);

        let nodes = vec![Node::build(n1).unwrap(), Node::build(n2).unwrap()];
        let vhost = Vhost::new("h1", nodes, 0);
        let mut vhosts = HashMap::new();
        vhosts.insert("h1".to_string(), vhost);
        let disp = Dispatcher::new(ZoneIndex::new(), vhosts);

        // First query of the minute seeds reqmin > reqlastmin; the shift
        // kicks in from the second query of the same minute on.
        let first = disp.query("172.16.0.1", "h1", "/").unwrap();
        assert_eq!(first.server_ip, "1.1.1.1");
        let second = disp.query("172.16.0.1", "h1", "/").unwrap();
        assert_eq!(second.server_ip, "2.2.2.2");
    }

    #[test]
    fn set_applies_records_until_first_malformed() {
        let disp = dispatcher();
        let err = disp.set(
            "h1",
            "node",
            &["n1:bw:77".to_string(), "n1:bw:notanint".to_string()],
        );
        assert!(matches!(err, Err(Error::AdminField(_))));
        // The first record stayed applied.
        assert_eq!(disp.vhost("h1").unwrap().node_by_name("n1").unwrap().bw(), 77);
    }

    #[test]
    fn set_rejects_unknown_host_and_object() {
        let disp = dispatcher();
        assert!(matches!(
            disp.set("nosuch", "node", &[]),
            Err(Error::UnknownHost(_))
        ));
        assert!(matches!(
            disp.set("h1", "widget", &[]),
            Err(Error::AdminField(_))
        ));
    }

    #[test]
    fn set_updates_server_weight_spec() {
        let disp = dispatcher();
        disp.set("h1", "server", &["n1:1.1.1.1:weight:60".to_string()]).unwrap();
        let vhost = disp.vhost("h1").unwrap();
        let server = vhost.node_by_name("n1").unwrap().server_by_ip("1.1.1.1").unwrap();
        assert_eq!(server.weight_spec(), "60");
    }

    #[test]
    fn get_count_reads_per_node_and_per_vhost_totals() {
        let disp = dispatcher();
        for _ in 0..3 {
            disp.query("10.0.0.17", "h1", "/a").unwrap();
        }
        assert_eq!(disp.get_count("h1", "none", ""), 3);
        assert_eq!(disp.get_count("h1", "n1", ""), 3);
        assert_eq!(disp.get_count("h1", "n2", ""), 0);
        assert_eq!(disp.get_count("", "all", ""), 3);
        assert_eq!(disp.get_count("nosuch", "none", ""), 0);
        assert_eq!(disp.get_count("h1", "nosuch", ""), 0);
    }
}
