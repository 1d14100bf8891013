//! Node and server model with per-policy weight materialization
//!
//! A node is a pool of backend servers behind one balance policy. Policies
//! that weight their servers pre-compute their lookup tables here, once, at
//! load time:
//! - `h` builds an ordered ring of 32-bit hash intervals (one anchor per
//!   weight slot) and resolves keys with a range query,
//! - `A` shuffles weight slots into a fixed array at random,
//! - `a` interleaves weight slots deterministically in triplets.
//!
//! Tables never change after construction; only scalar attributes (status,
//! bandwidth, weight spec) and counters mutate at runtime.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicI64, AtomicU64, AtomicU8, Ordering};

use parking_lot::{Mutex, RwLock};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::error::{Error, Result};
use crate::routing::hash::{hash_str, mix32};

/// Number of weight slots per node; also the required total weight for the
/// slot-table policies.
pub const WEIGHT_SLOTS: usize = 10_000;

/// Operational status of a node or server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum OperStatus {
    #[default]
    Up = 0,
    Down = 2,
    Backup = 4,
}

impl OperStatus {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "backup" => Some(Self::Backup),
            _ => None,
        }
    }
}

/// Load-balance policy of a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Balance {
    /// Sole server, no selection.
    Single,
    /// Cyclic cursor over live servers.
    RoundRobin,
    /// Consistent hashing over weight-derived intervals.
    HashRing,
    /// Random slot table weighted by server capacity.
    WeightedRandom,
    /// Deterministic interleaved slot table.
    Arranged,
}

impl Balance {
    /// Map the single-character config form. `w` parses but has never had
    /// selection behavior, so it is rejected here.
    pub fn from_config_char(c: char) -> Result<Self> {
        match c {
            'o' => Ok(Self::Single),
            'r' => Ok(Self::RoundRobin),
            'h' => Ok(Self::HashRing),
            'A' => Ok(Self::WeightedRandom),
            'a' => Ok(Self::Arranged),
            other => Err(Error::Config(format!(
                "unsupported balance policy '{}'",
                other
            ))),
        }
    }
}

/// A backend server inside a node.
///
/// `next` is the successor index in the node's cyclic server list; the
/// fallback scan and round-robin cursor both walk it.
#[derive(Debug)]
pub struct Server {
    pub ip: String,
    pub id: usize,
    pub next: usize,
    /// Weight slots accrued during table materialization.
    pub weight: usize,
    weight_spec: RwLock<String>,
    status: AtomicU8,
}

impl Server {
    pub fn is_up(&self) -> bool {
        self.status.load(Ordering::Relaxed) == OperStatus::Up as u8
    }

    pub fn set_status(&self, status: OperStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn weight_spec(&self) -> String {
        self.weight_spec.read().clone()
    }

    /// Replace the textual weight. Takes effect on the next table
    /// materialization (i.e. restart), not on live traffic.
    pub fn set_weight_spec(&self, spec: &str) {
        *self.weight_spec.write() = spec.to_string();
    }
}

/// One interval of the policy-`h` ring: hash keys in `keymin..=keymax` map
/// to `server`. Stored keyed by `keymax`.
#[derive(Debug, Clone, Copy)]
pub struct RingSpan {
    pub keymin: u32,
    pub server: usize,
}

/// Server definition as parsed from `node.conf`, before materialization.
#[derive(Debug, Clone)]
pub struct ServerSpec {
    pub ip: String,
    pub id: usize,
    pub weight_spec: String,
    pub status: OperStatus,
}

/// Node definition as parsed from `node.conf`.
#[derive(Debug, Clone)]
pub struct NodeSpec {
    pub name: String,
    pub id: usize,
    pub balance: Balance,
    pub bw: i64,
    pub maxbw: i64,
    pub freebw: i64,
    pub status: OperStatus,
    pub overflow_to: Option<String>,
    pub servers: Vec<ServerSpec>,
}

/// A dispatch target: a pool of servers, one balance policy, bandwidth
/// bookkeeping and request counters.
#[derive(Debug)]
pub struct Node {
    pub name: String,
    pub id: usize,
    pub balance: Balance,
    pub maxbw: i64,
    pub freebw: i64,
    pub overflow_to: Option<String>,
    /// Resolved by the vhost once every sibling node is known.
    pub overflow_id: Option<usize>,
    servers: Vec<Server>,
    server_ids: HashMap<String, usize>,
    cursor: Mutex<usize>,
    ring: BTreeMap<u32, RingSpan>,
    slots: Vec<usize>,
    bw: AtomicI64,
    status: AtomicU8,
    reqcount: AtomicU64,
    reqmin: AtomicU64,
    reqlastmin: AtomicU64,
    last_rotation: AtomicU64,
}

impl Node {
    /// Materialize a node from its parsed definition.
    pub fn build(spec: NodeSpec) -> Result<Self> {
        if spec.servers.is_empty() {
            return Err(Error::Config(format!("node {} has no servers", spec.name)));
        }
        for (idx, server) in spec.servers.iter().enumerate() {
            if server.id != idx {
                return Err(Error::Config(format!(
                    "node {}: server {} has id {} but position {}",
                    spec.name, server.ip, server.id, idx
                )));
            }
        }

        // A single server needs no policy.
        let balance = if spec.servers.len() == 1 {
            Balance::Single
        } else {
            spec.balance
        };

        let mut weights = vec![0usize; spec.servers.len()];
        let mut ring = BTreeMap::new();
        let mut slots = Vec::new();
        let mut cursor = 0usize;

        match balance {
            Balance::HashRing => {
                ring = build_ring(&spec.name, &spec.servers, &mut weights)?;
            }
            Balance::WeightedRandom => {
                slots = build_random_slots(&spec.name, &spec.servers, &mut weights)?;
            }
            Balance::Arranged => {
                parse_flat_weights(&spec.name, &spec.servers, &mut weights)?;
                if weights.iter().sum::<usize>() != WEIGHT_SLOTS {
                    return Err(Error::Config(format!(
                        "node {}: arranged weights must total {}",
                        spec.name, WEIGHT_SLOTS
                    )));
                }
                let (table, end_cursor) = build_arranged_slots(&weights);
                slots = table;
                cursor = end_cursor;
            }
            Balance::Single | Balance::RoundRobin => {}
        }

        let count = spec.servers.len();
        let mut server_ids = HashMap::with_capacity(count);
        let servers = spec
            .servers
            .into_iter()
            .enumerate()
            .map(|(idx, s)| {
                server_ids.insert(s.ip.clone(), idx);
                Server {
                    ip: s.ip,
                    id: idx,
                    next: (idx + 1) % count,
                    weight: weights[idx],
                    weight_spec: RwLock::new(s.weight_spec),
                    status: AtomicU8::new(s.status as u8),
                }
            })
            .collect();

        Ok(Self {
            name: spec.name,
            id: spec.id,
            balance,
            maxbw: spec.maxbw,
            freebw: spec.freebw,
            overflow_to: spec.overflow_to,
            overflow_id: None,
            servers,
            server_ids,
            cursor: Mutex::new(cursor),
            ring,
            slots,
            bw: AtomicI64::new(spec.bw),
            status: AtomicU8::new(spec.status as u8),
            reqcount: AtomicU64::new(0),
            reqmin: AtomicU64::new(0),
            reqlastmin: AtomicU64::new(0),
            last_rotation: AtomicU64::new(0),
        })
    }

    pub fn servers(&self) -> &[Server] {
        &self.servers
    }

    pub fn server_by_ip(&self, ip: &str) -> Option<&Server> {
        self.server_ids.get(ip).map(|&idx| &self.servers[idx])
    }

    pub fn is_up(&self) -> bool {
        self.status.load(Ordering::Relaxed) == OperStatus::Up as u8
    }

    pub fn set_status(&self, status: OperStatus) {
        self.status.store(status as u8, Ordering::Relaxed);
    }

    pub fn bw(&self) -> i64 {
        self.bw.load(Ordering::Relaxed)
    }

    pub fn set_bw(&self, bw: i64) {
        self.bw.store(bw, Ordering::Relaxed);
    }

    /// Bandwidth headroom rule for shifting traffic to the overflow node.
    pub fn wants_overflow(&self) -> bool {
        self.maxbw - self.bw() >= self.freebw
            && self.reqmin.load(Ordering::Relaxed) > self.reqlastmin.load(Ordering::Relaxed)
    }

    /// Rotate the per-minute request window on the first call in a new
    /// minute, then count the request.
    pub fn record_request(&self, now_secs: u64) {
        let minute = now_secs / 60;
        let prev = self.last_rotation.swap(minute, Ordering::Relaxed);
        if prev != minute {
            let closed = self.reqmin.swap(0, Ordering::Relaxed);
            self.reqlastmin.store(closed, Ordering::Relaxed);
        }
        self.reqcount.fetch_add(1, Ordering::Relaxed);
        self.reqmin.fetch_add(1, Ordering::Relaxed);
    }

    pub fn requests_total(&self) -> u64 {
        self.reqcount.load(Ordering::Relaxed)
    }

    pub fn requests_last_minute(&self) -> u64 {
        self.reqlastmin.load(Ordering::Relaxed)
    }

    /// Advance the cyclic cursor to the next live server.
    ///
    /// Each server is inspected at most once; a node with no live server
    /// yields an error rather than spinning.
    pub fn next_live(&self) -> Result<&Server> {
        let mut cursor = self.cursor.lock();
        let mut idx = *cursor;
        for _ in 0..self.servers.len() {
            let server = &self.servers[idx];
            if server.is_up() {
                *cursor = server.next;
                return Ok(server);
            }
            idx = server.next;
        }
        Err(Error::NoLiveServer(self.name.clone()))
    }

    /// Pick a server for `key` according to the node's balance policy.
    pub fn select(&self, key: &str) -> Result<&Server> {
        let chosen = match self.balance {
            // Sole server, returned without a status check.
            Balance::Single => return Ok(&self.servers[*self.cursor.lock()]),
            Balance::RoundRobin => return self.next_live(),
            Balance::HashRing => match self.ring.range(hash_str(key)..).next() {
                Some((_, span)) => &self.servers[span.server],
                None => return self.next_live(),
            },
            Balance::WeightedRandom | Balance::Arranged => {
                // Modulo keeps the historical key mapping; slot 9999 is
                // unreachable through this path.
                let slot = hash_str(key) as usize % (WEIGHT_SLOTS - 1);
                &self.servers[self.slots[slot]]
            }
        };
        if chosen.is_up() {
            Ok(chosen)
        } else {
            self.next_live()
        }
    }

    #[cfg(test)]
    pub(crate) fn ring(&self) -> &BTreeMap<u32, RingSpan> {
        &self.ring
    }

    #[cfg(test)]
    pub(crate) fn slots(&self) -> &[usize] {
        &self.slots
    }
}

/// Hash anchor for one weight slot of one server. The packing constants are
/// part of the table contract; see [`mix32`].
fn slot_anchor(server: usize, slot: i64) -> u32 {
    let raw = (server as i64 + 1) * 256 * 32 + (slot + 1) * 563_217;
    mix32(raw as u32)
}

/// Build the policy-`h` interval ring.
///
/// Each server's `weightstr` is a comma-separated list of percentage tokens
/// (`"x"` or `"x-y"`), expanded to one hash anchor per weight slot on a
/// running cursor. Sorted anchors carve `[0, 2^32)` into contiguous
/// intervals; the final interval is extended to `u32::MAX` so every key
/// resolves.
fn build_ring(
    node: &str,
    servers: &[ServerSpec],
    weights: &mut [usize],
) -> Result<BTreeMap<u32, RingSpan>> {
    let mut anchors: Vec<(u32, usize)> = Vec::with_capacity(WEIGHT_SLOTS);
    let mut k: i64 = 0;

    for (id, spec) in servers.iter().enumerate() {
        for token in spec.weight_spec.split(',') {
            let (swmin, swmax) = match token.split_once('-') {
                Some((lo, hi)) => {
                    let lo = parse_weight_int(node, &spec.ip, lo)?;
                    let hi = parse_weight_int(node, &spec.ip, hi)?;
                    (lo * 100, hi * 100)
                }
                None => {
                    let w = parse_weight_int(node, &spec.ip, token)?;
                    (k + 1, w * 100 + k)
                }
            };
            for slot in swmin..=swmax {
                if anchors.len() >= WEIGHT_SLOTS {
                    return Err(Error::Config(format!(
                        "node {}: total weight exceeds {}",
                        node, WEIGHT_SLOTS
                    )));
                }
                anchors.push((slot_anchor(id, slot), id));
                weights[id] += 1;
            }
            k = swmax;
        }
    }

    if anchors.len() != WEIGHT_SLOTS {
        return Err(Error::Config(format!(
            "node {}: total weight is {}, expected {}",
            node,
            anchors.len(),
            WEIGHT_SLOTS
        )));
    }

    anchors.sort_by_key(|&(hash, _)| hash);

    let mut ring = BTreeMap::new();
    let mut keymin: u32 = 0;
    for (idx, &(hash, server)) in anchors.iter().enumerate() {
        // On anchor collision the later server wins the whole interval.
        if idx + 1 < anchors.len() && anchors[idx + 1].0 == hash {
            continue;
        }
        let keymax = if idx == anchors.len() - 1 { u32::MAX } else { hash };
        ring.insert(keymax, RingSpan { keymin, server });
        keymin = hash.wrapping_add(1);
    }
    Ok(ring)
}

/// Build the policy-`A` slot table: each server's `w*100` slots land on
/// random free positions.
fn build_random_slots(
    node: &str,
    servers: &[ServerSpec],
    weights: &mut [usize],
) -> Result<Vec<usize>> {
    parse_flat_weights(node, servers, weights)?;
    if weights.iter().sum::<usize>() > WEIGHT_SLOTS {
        return Err(Error::Config(format!(
            "node {}: weighted-random weights exceed {}",
            node, WEIGHT_SLOTS
        )));
    }

    let mut slots = vec![0usize; WEIGHT_SLOTS];
    let mut rng = StdRng::from_entropy();
    for (id, &weight) in weights.iter().enumerate() {
        for _ in 0..weight {
            // Slot value 0 doubles as the empty sentinel, so a draw may
            // reclaim a position already granted to server 0.
            let mut slot = rng.gen_range(0..WEIGHT_SLOTS);
            while slots[slot] > 0 {
                slot = rng.gen_range(0..WEIGHT_SLOTS);
            }
            slots[slot] = id;
        }
    }
    Ok(slots)
}

/// Parse plain integer percentage weights into slot counts (`w*100`).
fn parse_flat_weights(node: &str, servers: &[ServerSpec], weights: &mut [usize]) -> Result<()> {
    for (id, spec) in servers.iter().enumerate() {
        let w = parse_weight_int(node, &spec.ip, &spec.weight_spec)?;
        weights[id] = (w as usize) * 100;
    }
    Ok(())
}

fn parse_weight_int(node: &str, ip: &str, token: &str) -> Result<i64> {
    token.trim().parse::<i64>().map_err(|_| {
        Error::Config(format!(
            "node {}: server {} has invalid weight token {:?}",
            node, ip, token
        ))
    })
}

/// Build the policy-`a` slot table.
///
/// Slots are walked in per-server triplets: position `i` belongs to server
/// `(i % (count*3)) / 3`. A server whose weight falls short of the even
/// share `tt = slots/count` leaves holes in predicate-selected positions;
/// a second pass hands those to servers with weight above the share,
/// advancing a cyclic cursor. The predicates are load-bearing and mirrored
/// exactly from the deployed table format, including the `sg` comparison in
/// the third carve-out class.
///
/// Returns the table and the final cursor position.
fn build_arranged_slots(weights: &[usize]) -> (Vec<usize>, usize) {
    let count = weights.len();
    let mut slots = vec![0usize; WEIGHT_SLOTS];
    let mut accrued = vec![0i64; count];
    let tt = (WEIGHT_SLOTS / count) as i64;
    let gg = tt / 3;

    for i in 0..WEIGHT_SLOTS {
        let sgn = (i / (count * 3)) as i64;
        let sg = i % (count * 3);
        let sid = sg / 3;
        let ssw = weights[sid] as i64;
        if ssw <= accrued[sid] || accrued[sid] >= tt {
            continue;
        }
        accrued[sid] += 1;
        slots[i] = sid;
        if ssw < tt {
            let cc = tt - ssw;
            let m = sg % 3;
            if (gg - cc < sgn || gg - cc < 0) && m == 1 {
                if accrued[sid] > ssw {
                    accrued[sid] -= 1;
                }
            } else if (gg < cc && cc <= gg * 2) && gg * 2 - cc < sgn && m == 2 {
                if accrued[sid] > ssw {
                    accrued[sid] -= 1;
                }
            } else if cc > gg * 2 && tt - cc < sgn && m == 0 && accrued[sid] > ssw {
                accrued[sid] -= 1;
            }
        }
    }

    let mut cursor = 0usize;
    for i in 0..WEIGHT_SLOTS {
        let sg = i % (count * 3);
        let sgn = (i / (count * 3)) as i64;
        let sid = sg / 3;
        let ssw = weights[sid] as i64;
        if ssw >= tt {
            continue;
        }
        let cc = tt - ssw;
        let m = sg % 3;
        let takeover = ((gg - cc <= sgn || gg - cc < 0) && m == 1)
            || ((gg < cc && cc <= gg * 2) && gg * 2 - cc <= sgn && m == 2)
            || (cc > gg * 2 && tt - cc <= sg as i64 && m == 0);
        if !takeover {
            continue;
        }
        let mut donor = None;
        for _ in 0..count {
            let w = weights[cursor] as i64;
            if w > tt && w > accrued[cursor] {
                donor = Some(cursor);
                cursor = (cursor + 1) % count;
                break;
            }
            cursor = (cursor + 1) % count;
        }
        // No server has spare weight; the slot keeps its current owner.
        let Some(taker) = donor else { continue };
        slots[i] = taker;
        accrued[taker] += 1;
    }

    (slots, cursor)
}
