// Path: crates/minion/src/grains.rs
//! Static grain collection.
//!
//! Grains are the per-minion metadata the master caches for targeting.
//! The core collects a small built-in set and merges the statically
//! configured grains over it; the full grain module library is outside
//! this codebase.

use herd_types::config::MinionConfig;
use herd_types::MinionId;
use serde_json::{json, Map, Value};

/// Collects the effective grains for this minion.
pub fn collect(id: &MinionId, config: &MinionConfig) -> Map<String, Value> {
    let mut grains = Map::new();
    grains.insert("id".to_string(), json!(id.as_str()));
    grains.insert("os".to_string(), json!(std::env::consts::OS));
    grains.insert("os_family".to_string(), json!(os_family()));
    grains.insert("cpuarch".to_string(), json!(std::env::consts::ARCH));
    grains.insert(
        "num_cpus".to_string(),
        json!(std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1)),
    );
    if let Ok(host) = std::env::var("HOSTNAME") {
        if !host.is_empty() {
            grains.insert("host".to_string(), json!(host));
        }
    }
    // Configured grains win over collected ones.
    for (key, value) in &config.grains {
        grains.insert(key.clone(), value.clone());
    }
    grains
}

/// Detects the local address the minion would reach its master from.
///
/// Binding a UDP socket and connecting it resolves the routing decision
/// without sending anything; unresolvable entries (test brokers) yield
/// nothing.
pub fn local_addrs(masters: &[String], port: u16) -> Vec<std::net::IpAddr> {
    for master in masters {
        let Ok(sock) = std::net::UdpSocket::bind(("0.0.0.0", 0)) else {
            continue;
        };
        if sock.connect((master.as_str(), port)).is_err() {
            continue;
        }
        if let Ok(addr) = sock.local_addr() {
            return vec![addr.ip()];
        }
    }
    Vec::new()
}

fn os_family() -> &'static str {
    match std::env::consts::OS {
        "linux" | "android" => "Linux",
        "macos" | "ios" | "freebsd" | "netbsd" | "openbsd" => "BSD",
        "windows" => "Windows",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_configured_grains_override() {
        let mut config = MinionConfig::default();
        config
            .grains
            .insert("os".to_string(), json!("CustomOS"));
        config
            .grains
            .insert("role".to_string(), json!("web"));

        let grains = collect(&MinionId::new("m1"), &config);
        assert_eq!(grains["id"], json!("m1"));
        assert_eq!(grains["os"], json!("CustomOS"));
        assert_eq!(grains["role"], json!("web"));
        assert!(grains.contains_key("cpuarch"));
    }
}
