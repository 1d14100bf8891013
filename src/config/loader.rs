//! Dispatch model loader
//!
//! Reads the configuration directory layout:
//!
//! ```text
//! <cfg>/ipz                   zone ranges, one `CIDR;zonename` per line
//! <cfg>/<vhost>/node.conf     node pools, INI-like sections
//! <cfg>/<vhost>/view.conf     one `zonename;nodename` per line
//! ```
//!
//! Loading is all-or-nothing: a malformed range, an unknown reference or an
//! inconsistent weight table aborts startup.

use std::collections::HashMap;
use std::fs;
use std::path::Path;

use ipnetwork::Ipv4Network;
use tracing::info;

use crate::dispatch::{Dispatcher, Vhost};
use crate::error::{Error, Result};
use crate::routing::{Balance, Node, NodeSpec, OperStatus, ServerSpec};
use crate::zone::ZoneIndex;

const DEFAULT_FREEBW: i64 = 20;

/// Load the complete dispatch model from a configuration directory.
pub fn load_dispatcher(dir: &Path) -> Result<Dispatcher> {
    let mut zones = ZoneIndex::new();
    load_zones(&dir.join("ipz"), &mut zones)?;

    let mut vhosts = HashMap::new();
    let entries = fs::read_dir(dir)
        .map_err(|e| Error::Config(format!("cannot read config dir {}: {}", dir.display(), e)))?;
    for entry in entries {
        let entry = entry.map_err(Error::Io)?;
        if !entry.file_type().map_err(Error::Io)?.is_dir() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let vdir = entry.path();
        let mut vhost = load_nodes(&vdir.join("node.conf"), &name)?;
        load_view(&vdir.join("view.conf"), &zones, &mut vhost)?;
        info!(vhost = %name, nodes = vhost.nodes().len(), "vhost loaded");
        vhosts.insert(name, vhost);
    }

    info!(zones = zones.len(), vhosts = vhosts.len(), "dispatch model loaded");
    Ok(Dispatcher::new(zones, vhosts))
}

/// Parse the `ipz` zone file into the interval index.
fn load_zones(path: &Path, zones: &mut ZoneIndex) -> Result<()> {
    let content = read(path)?;
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Some((cidr, name)) = line.split_once(';') else {
            return Err(Error::Config(format!(
                "{}: expected CIDR;zonename, got {:?}",
                path.display(),
                line
            )));
        };
        let net: Ipv4Network = cidr.trim().parse().map_err(|e| {
            Error::Config(format!("{}: bad CIDR {:?}: {}", path.display(), cidr, e))
        })?;
        let name = name.trim();
        let ipmin = u32::from(net.ip());
        // Host-bit mask of the range; the address is taken as written, not
        // masked down to the network boundary.
        let span = u32::MAX.checked_shr(net.prefix() as u32).unwrap_or(0);
        let id = zones.intern(name)?;
        zones.insert(ipmin, ipmin | span, name, id);
    }
    Ok(())
}

/// Parse one vhost's `node.conf` into an assembled [`Vhost`].
fn load_nodes(path: &Path, vhost_name: &str) -> Result<Vhost> {
    let content = read(path)?;
    let mut specs: Vec<NodeSpec> = Vec::new();
    let mut default_node = 0usize;

    for raw in content.lines() {
        let line = raw.trim_end();
        // Anything shorter than three characters cannot be a directive.
        if line.len() < 3 || line.starts_with('#') {
            continue;
        }
        if line.starts_with('[') && line.ends_with(']') {
            let name = &line[1..line.len() - 1];
            specs.push(NodeSpec {
                name: name.to_string(),
                id: specs.len(),
                balance: Balance::RoundRobin,
                bw: 0,
                maxbw: 0,
                freebw: DEFAULT_FREEBW,
                status: OperStatus::Up,
                overflow_to: None,
                servers: Vec::new(),
            });
            continue;
        }
        // Directives before the first section have nothing to attach to.
        let Some(current) = specs.last_mut() else {
            continue;
        };
        if line == "default" {
            default_node = current.id;
            continue;
        }
        let Some((key, val)) = line.split_once('=') else {
            continue;
        };
        match key {
            "server" => current.servers.push(parse_server(path, val, current.servers.len())?),
            "bw" => current.bw = parse_int(path, key, val)?,
            "maxbw" => current.maxbw = parse_int(path, key, val)?,
            "freebw" => current.freebw = parse_int(path, key, val)?,
            "overflow2node" => current.overflow_to = Some(val.to_string()),
            "status" => {
                current.status = OperStatus::parse(val).ok_or_else(|| {
                    Error::Config(format!("{}: unknown status {:?}", path.display(), val))
                })?;
            }
            "default" => default_node = current.id,
            "balance" => {
                let c = val.chars().next().ok_or_else(|| {
                    Error::Config(format!("{}: empty balance value", path.display()))
                })?;
                current.balance = Balance::from_config_char(c).map_err(|_| {
                    Error::Config(format!(
                        "{}: {}: balance config is invalid",
                        path.display(),
                        current.name
                    ))
                })?;
            }
            _ => {}
        }
    }

    if specs.is_empty() {
        return Err(Error::Config(format!(
            "{}: no nodes defined for vhost {}",
            path.display(),
            vhost_name
        )));
    }

    let nodes = specs.into_iter().map(Node::build).collect::<Result<Vec<_>>>()?;
    Ok(Vhost::new(vhost_name, nodes, default_node))
}

/// Parse a `server=<ip> <id> [<weightstr>] [<status>]` value.
fn parse_server(path: &Path, val: &str, position: usize) -> Result<ServerSpec> {
    let fields: Vec<&str> = val.split(' ').filter(|f| !f.is_empty()).collect();
    if fields.len() < 2 || fields.len() > 4 {
        return Err(Error::Config(format!(
            "{}: expected server=<ip> <id> [<weightstr>] [<status>], got {:?}",
            path.display(),
            val
        )));
    }
    let id: usize = fields[1].parse().map_err(|_| {
        Error::Config(format!("{}: bad server id {:?}", path.display(), fields[1]))
    })?;
    if id != position {
        return Err(Error::Config(format!(
            "{}: server {} declared with id {} at position {}",
            path.display(),
            fields[0],
            id,
            position
        )));
    }
    let status = match fields.get(3) {
        Some(word) => OperStatus::parse(word).ok_or_else(|| {
            Error::Config(format!("{}: unknown status {:?}", path.display(), word))
        })?,
        None => OperStatus::Up,
    };
    Ok(ServerSpec {
        ip: fields[0].to_string(),
        id,
        weight_spec: fields.get(2).unwrap_or(&"").to_string(),
        status,
    })
}

/// Parse one vhost's `view.conf`, mapping zones onto nodes.
fn load_view(path: &Path, zones: &ZoneIndex, vhost: &mut Vhost) -> Result<()> {
    let content = read(path)?;
    for line in content.lines() {
        let line = line.trim();
        let Some((zone, node)) = line.split_once(';') else {
            continue;
        };
        let zone_id = zones.id_of(zone.trim()).ok_or_else(|| {
            Error::Config(format!("{}: not valid zone: {}", path.display(), zone))
        })?;
        let node_id = vhost
            .node_by_name(node.trim())
            .map(|n| n.id)
            .ok_or_else(|| {
                Error::Config(format!("{}: not valid node: {}", path.display(), node))
            })?;
        vhost.map_zone(zone_id, node_id);
    }
    Ok(())
}

fn read(path: &Path) -> Result<String> {
    fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))
}

fn parse_int(path: &Path, key: &str, val: &str) -> Result<i64> {
    val.trim().parse().map_err(|_| {
        Error::Config(format!("{}: bad integer for {}: {:?}", path.display(), key, val))
    })
}
