//! Capacity-aware placement of new nodes onto servers.
//!
//! Planning is pure: [`plan`] looks at the servers and produces an
//! [`Allocation`] or a capacity error without touching them. [`Allocation::apply`]
//! then records the placement in the server records.

use log::debug;
use uuid::Uuid;

use crate::address::NetworkLayout;
use crate::error::{Error, Result};
use crate::types::{Node, Server, ServerId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    /// Clean build: servers are wiped first, so every slot counts.
    Fresh,
    /// Add to running nodes, continuing from each server's current load.
    Incremental,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Allocation {
    mode: Option<Mode>,
    assignments: Vec<(ServerId, Vec<Node>)>,
}

impl Allocation {
    pub fn assignments(&self) -> &[(ServerId, Vec<Node>)] {
        &self.assignments
    }

    pub fn for_server(&self, id: ServerId) -> &[Node] {
        self.assignments
            .iter()
            .find(|(server, _)| *server == id)
            .map(|(_, nodes)| nodes.as_slice())
            .unwrap_or(&[])
    }

    /// Every placed node, ordered by build-wide number.
    pub fn nodes(&self) -> Vec<Node> {
        let mut nodes: Vec<Node> = self
            .assignments
            .iter()
            .flat_map(|(_, nodes)| nodes.iter().cloned())
            .collect();
        nodes.sort_by_key(|n| n.num);
        nodes
    }

    pub fn len(&self) -> usize {
        self.assignments.iter().map(|(_, nodes)| nodes.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records the placement in the server records.
    pub fn apply(&self, servers: &mut [Server]) {
        if self.mode == Some(Mode::Fresh) {
            for server in servers.iter_mut() {
                server.nodes = 0;
                server.ips.clear();
            }
        }
        for (id, nodes) in &self.assignments {
            if let Some(server) = servers.iter_mut().find(|s| s.id == *id) {
                server.nodes += nodes.len();
                server.ips.extend(nodes.iter().map(|n| n.ip));
            }
        }
    }
}

/// Places `requested` new nodes, numbering them from `first_num`.
pub fn plan(
    servers: &[Server],
    requested: usize,
    first_num: usize,
    mode: Mode,
    layout: &NetworkLayout,
) -> Result<Allocation> {
    let load = |s: &Server| match mode {
        Mode::Fresh => 0,
        Mode::Incremental => s.nodes,
    };

    let available: usize = servers
        .iter()
        .map(|s| s.max.saturating_sub(load(s)))
        .sum();
    if available < requested {
        return Err(Error::CapacityExceeded {
            requested,
            available,
        });
    }

    // (server, next local id, slots left); exhausted servers drop out
    let mut open: Vec<(&Server, usize, usize)> = servers
        .iter()
        .map(|s| (s, load(s), s.max.saturating_sub(load(s))))
        .filter(|(_, _, left)| *left > 0)
        .collect();

    let mut assignments: Vec<(ServerId, Vec<Node>)> = Vec::new();
    let mut num = first_num;
    while num < first_num + requested {
        let Some((server, next_local, left)) = open.first_mut() else {
            return Err(Error::Internal("ran out of servers while allocating".into()));
        };

        let local_id = u32::try_from(*next_local)
            .map_err(|_| Error::validation(format!("{} has too many nodes", server)))?;
        let node = Node {
            id: Uuid::new_v4(),
            num,
            local_id,
            server: server.id,
            ip: layout.node_ip(server.subnet_id, local_id)?,
            name: layout.node_name(server.subnet_id, local_id),
        };
        debug!("placing node {} on {} as {}", num, server, node.ip);

        match assignments.last_mut() {
            Some((id, nodes)) if *id == server.id => nodes.push(node),
            _ => assignments.push((server.id, vec![node])),
        }

        *next_local += 1;
        *left -= 1;
        if *left == 0 {
            open.remove(0);
        }
        num += 1;
    }

    Ok(Allocation {
        mode: Some(mode),
        assignments,
    })
}
