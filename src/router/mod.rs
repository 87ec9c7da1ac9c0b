//! Route emission for the external router component
//!
//! The broker never programs kernel routes itself. It computes route
//! requests from the link registry; the router component owns netlink,
//! iptables and the tun device plumbing.

use std::net::IpAddr;

use ipnet::IpNet;

use crate::links::Links;
use crate::net::cidr_net;

/// Routing priority used for all mesh routes
pub const ROUTE_PRIORITY: u32 = 101;

/// One requested kernel route.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RouteRequest {
    pub dst: IpNet,
    /// Next hop; `None` binds the route to the local tun device
    pub gw: Option<IpAddr>,
    /// Gateway is reachable on-link even without an interface route
    pub onlink: bool,
    pub priority: u32,
}

/// Routes towards links served by other gateway nodes: every egress CIDR
/// and the peer cluster network, via the link's gateway.
pub fn gateway_routes(links: &Links, node_ip: IpAddr, onlink: bool) -> Vec<RouteRequest> {
    let mut routes = Vec::new();
    links.visit(|link| {
        let Some(gw) = link.gateway else {
            return true;
        };
        if gw == node_ip {
            return true;
        }
        for egress in link.egress.iter() {
            routes.push(RouteRequest {
                dst: *egress,
                gw: Some(gw),
                onlink,
                priority: ROUTE_PRIORITY,
            });
        }
        routes.push(RouteRequest {
            dst: cidr_net(&link.cluster_address),
            gw: Some(gw),
            onlink,
            priority: ROUTE_PRIORITY,
        });
        true
    });
    routes
}

/// Routes for links this node gateways itself: egress CIDRs bound to the
/// local tun device.
pub fn local_routes(links: &Links, node_ip: IpAddr) -> Vec<RouteRequest> {
    let mut routes = Vec::new();
    links.visit(|link| {
        if link.gateway != Some(node_ip) {
            return true;
        }
        for egress in link.egress.iter() {
            routes.push(RouteRequest {
                dst: *egress,
                gw: None,
                onlink: false,
                priority: ROUTE_PRIORITY,
            });
        }
        true
    });
    routes
}
