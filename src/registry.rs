//! Process wide registry of the packet connections listeners serve on.
//!
//! Listeners register their transport connection under their URI scheme
//! while serving, which lets diagnostics and outgoing dialers find a socket
//! that already has NAT mappings.

use std::sync::{Arc, LazyLock};

use dashmap::DashMap;
use natquic_core::filter::PacketConn;

static DEFAULT_REGISTRY: LazyLock<Registry> = LazyLock::new(Registry::default);

pub fn default_registry() -> &'static Registry {
    &DEFAULT_REGISTRY
}

#[derive(Default)]
pub struct Registry {
    available: DashMap<String, Vec<Arc<dyn PacketConn>>>,
}

impl Registry {
    pub fn register(&self, scheme: &str, conn: Arc<dyn PacketConn>) {
        self.available
            .entry(scheme.to_string())
            .or_default()
            .push(conn);
    }
    pub fn unregister(&self, scheme: &str, conn: &Arc<dyn PacketConn>) {
        let mut empty = false;
        if let Some(mut conns) = self.available.get_mut(scheme) {
            conns.retain(|c| !same_conn(c, conn));
            empty = conns.is_empty();
        }
        if empty {
            self.available.remove_if(scheme, |_, conns| conns.is_empty());
        }
    }
    pub fn get(&self, scheme: &str) -> Vec<Arc<dyn PacketConn>> {
        self.available
            .get(scheme)
            .map(|conns| conns.clone())
            .unwrap_or_default()
    }
}

fn same_conn(a: &Arc<dyn PacketConn>, b: &Arc<dyn PacketConn>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}
