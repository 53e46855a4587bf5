use std::collections::HashMap;
use std::net::IpAddr;

use crate::config::ServiceConfig;
use crate::protocol::{Transport, normalize_ip};
use crate::session::{ServiceId, ServiceLookup};

/// Services of the monitored host, keyed by port.
///
/// A packet belongs to a service when the endpoint on the local address
/// uses a configured port with a matching transport.
pub struct ServiceTable {
    local_ip: IpAddr,
    by_port: HashMap<u16, Vec<ServiceConfig>>,
}

impl ServiceTable {
    pub fn new(local_ip: IpAddr, services: &[ServiceConfig]) -> Self {
        let mut by_port: HashMap<u16, Vec<ServiceConfig>> = HashMap::new();
        for service in services {
            by_port.entry(service.port).or_default().push(service.clone());
        }
        ServiceTable {
            local_ip: normalize_ip(local_ip),
            by_port,
        }
    }

    pub fn len(&self) -> usize {
        self.by_port.values().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.by_port.is_empty()
    }

    pub fn get(&self, id: ServiceId) -> Option<&ServiceConfig> {
        self.by_port.values().flatten().find(|s| s.id == id)
    }

    fn find(&self, transport: Transport, port: u16) -> Option<ServiceId> {
        self.by_port
            .get(&port)?
            .iter()
            .find(|s| s.protocol.is_none_or(|p| p == transport))
            .map(|s| s.id)
    }
}

impl ServiceLookup for ServiceTable {
    fn lookup_service(
        &self,
        transport: Transport,
        addr_a: IpAddr,
        port_a: u16,
        addr_b: IpAddr,
        port_b: u16,
    ) -> Option<ServiceId> {
        let local = |addr: IpAddr| normalize_ip(addr) == self.local_ip;
        if local(addr_a) {
            if let Some(id) = self.find(transport, port_a) {
                return Some(id);
            }
        }
        if local(addr_b) {
            return self.find(transport, port_b);
        }
        None
    }
}
