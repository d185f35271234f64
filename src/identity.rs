use std::net::UdpSocket;

const FALLBACK_IPV4: &str = "127.0.0.1";
const FALLBACK_MAC: &str = "00:00:00:00:00:00";

/// Stable local identifiers, resolved once at startup and memoized. Every
/// row carries these, so resolution must never happen on the hot path.
#[derive(Debug, Clone)]
pub struct HostIdentity {
    hostname: String,
    ipv4: String,
    mac: String,
}

impl HostIdentity {
    pub fn resolve() -> Self {
        let hostname = sysinfo::System::host_name().unwrap_or_else(|| "localhost".to_string());
        let ipv4 = detect_ipv4().unwrap_or_else(|| FALLBACK_IPV4.to_string());
        let mac = detect_mac().unwrap_or_else(|| FALLBACK_MAC.to_string());
        tracing::info!(%hostname, %ipv4, %mac, "resolved host identity");
        Self {
            hostname,
            ipv4,
            mac,
        }
    }

    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn ipv4(&self) -> &str {
        &self.ipv4
    }

    pub fn mac(&self) -> &str {
        &self.mac
    }
}

// Connectionless connect: no packet is sent, the kernel just picks the
// outbound interface and local address for the route to 8.8.8.8.
fn detect_ipv4() -> Option<String> {
    let socket = UdpSocket::bind("0.0.0.0:0").ok()?;
    socket.connect("8.8.8.8:80").ok()?;
    let local = socket.local_addr().ok()?;
    Some(local.ip().to_string())
}

// WiFi first, then wired, matching the interface priority on the target
// single-board hardware.
fn detect_mac() -> Option<String> {
    for interface in ["wlan0", "eth0"] {
        let path = format!("/sys/class/net/{interface}/address");
        if let Ok(raw) = std::fs::read_to_string(&path) {
            if let Some(mac) = normalize_mac(&raw) {
                return Some(mac);
            }
        }
    }
    None
}

fn normalize_mac(raw: &str) -> Option<String> {
    let mac = raw.trim().to_lowercase();
    let octets: Vec<&str> = mac.split(':').collect();
    if octets.len() != 6 {
        return None;
    }
    if !octets
        .iter()
        .all(|octet| octet.len() == 2 && octet.chars().all(|c| c.is_ascii_hexdigit()))
    {
        return None;
    }
    if mac == FALLBACK_MAC {
        return None;
    }
    Some(mac)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_mac_accepts_canonical_form() {
        assert_eq!(
            normalize_mac("B8:27:EB:12:34:56\n"),
            Some("b8:27:eb:12:34:56".to_string())
        );
    }

    #[test]
    fn normalize_mac_rejects_garbage() {
        assert_eq!(normalize_mac(""), None);
        assert_eq!(normalize_mac("not-a-mac"), None);
        assert_eq!(normalize_mac("b8:27:eb:12:34"), None);
        assert_eq!(normalize_mac("zz:27:eb:12:34:56"), None);
    }

    #[test]
    fn normalize_mac_rejects_all_zero() {
        assert_eq!(normalize_mac("00:00:00:00:00:00"), None);
    }

    #[test]
    fn resolve_always_produces_identifiers() {
        let identity = HostIdentity::resolve();
        assert!(!identity.hostname().is_empty());
        assert!(!identity.ipv4().is_empty());
        assert_eq!(identity.mac().len(), 17);
    }
}
