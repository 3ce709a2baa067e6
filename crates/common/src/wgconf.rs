//! WireGuard configuration rendering
//!
//! Values are written as-is. The output is a config file read by the tunnel
//! daemon, never a command line, so nothing is escaped.

use crate::keys::PrivateKey;
use crate::types::PeerEntry;
use std::fmt::Write;
use zeroize::Zeroizing;

/// Render an `[Interface]` section followed by one `[Peer]` section per entry
///
/// Peers are emitted in the order given. The result holds the private key, so
/// it comes back wrapped to be wiped when the caller drops it.
pub fn render(
    interface_address: &str,
    listen_port: u16,
    private_key: &PrivateKey,
    peers: &[PeerEntry],
) -> Zeroizing<String> {
    let mut out = Zeroizing::new(String::new());

    // Writing to a String cannot fail
    let _ = writeln!(out, "[Interface]");
    let _ = writeln!(out, "PrivateKey = {}", private_key.expose_secret());
    let _ = writeln!(out, "Address = {}", interface_address);
    let _ = writeln!(out, "ListenPort = {}", listen_port);

    for peer in peers {
        let _ = write!(out, "\n[Peer]\n");
        let _ = writeln!(out, "PublicKey = {}", peer.public_key);
        let _ = writeln!(out, "AllowedIPs = {}", peer.allowed_ips);
        if let Some(endpoint) = peer.endpoint.as_deref().filter(|e| !e.is_empty()) {
            let _ = writeln!(out, "Endpoint = {}", endpoint);
        }
        if let Some(keepalive) = peer.keepalive {
            let _ = writeln!(out, "PersistentKeepalive = {}", keepalive);
        }
    }

    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::keys::generate_wireguard_keypair;

    fn key() -> PrivateKey {
        generate_wireguard_keypair().private_key
    }

    #[test]
    fn test_interface_and_single_peer() {
        let key = key();
        let text = render(
            "10.8.0.1/24",
            51820,
            &key,
            &[PeerEntry::new("P1", "10.8.0.2/32")],
        );

        let expected = format!(
            "[Interface]\nPrivateKey = {}\nAddress = 10.8.0.1/24\nListenPort = 51820\n\n[Peer]\nPublicKey = P1\nAllowedIPs = 10.8.0.2/32\n",
            key.expose_secret()
        );
        assert_eq!(text.as_str(), expected);
        assert!(text.find("[Interface]").unwrap() < text.find("[Peer]").unwrap());
    }

    #[test]
    fn test_no_peers() {
        let key = key();
        let text = render("10.8.0.2/24", 51820, &key, &[]);
        assert!(!text.contains("[Peer]"));
        assert!(text.ends_with("ListenPort = 51820\n"));
    }

    #[test]
    fn test_optional_fields() {
        let key = key();
        let peers = vec![
            PeerEntry::new("HUB", "10.8.0.0/24")
                .with_endpoint("vpn.example.com:51820")
                .with_keepalive(25),
            PeerEntry::new("P2", "10.8.0.3/32").with_endpoint(""),
        ];
        let text = render("10.8.0.2/24", 51820, &key, &peers);
        assert!(text.contains("Endpoint = vpn.example.com:51820\nPersistentKeepalive = 25\n"));
        assert_eq!(text.matches("Endpoint =").count(), 1);
        assert_eq!(text.matches("PersistentKeepalive").count(), 1);
    }

    #[test]
    fn test_render_is_pure() {
        let key = key();
        let peers = vec![
            PeerEntry::new("P1", "10.8.0.2/32"),
            PeerEntry::new("P2", "10.8.0.3/32"),
        ];
        let first = render("10.8.0.1/24", 51820, &key, &peers);
        let second = render("10.8.0.1/24", 51820, &key, &peers);
        assert_eq!(first.as_str(), second.as_str());
    }

    #[test]
    fn test_peer_order_preserved() {
        let key = key();
        let a = PeerEntry::new("P1", "10.8.0.2/32");
        let b = PeerEntry::new("P2", "10.8.0.3/32");

        let forward = render("10.8.0.1/24", 51820, &key, &[a.clone(), b.clone()]);
        let reverse = render("10.8.0.1/24", 51820, &key, &[b, a]);

        assert!(forward.find("PublicKey = P1").unwrap() < forward.find("PublicKey = P2").unwrap());
        assert!(reverse.find("PublicKey = P2").unwrap() < reverse.find("PublicKey = P1").unwrap());

        // Only the peer blocks moved
        let head = |s: &str| s[..s.find("[Peer]").unwrap()].to_string();
        assert_eq!(head(forward.as_str()), head(reverse.as_str()));
        assert_eq!(forward.len(), reverse.len());
    }

    #[test]
    fn test_duplicates_kept() {
        let key = key();
        let peer = PeerEntry::new("P1", "10.8.0.2/32");
        let text = render("10.8.0.1/24", 51820, &key, &[peer.clone(), peer]);
        assert_eq!(text.matches("[Peer]").count(), 2);
    }
}
