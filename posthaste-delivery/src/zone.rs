//! A sending zone: one named egress policy shared read-mostly by all of its
//! workers.
//!
//! The only mutable field is `disable_starttls`, flipped when a server is
//! observed to fail the TLS upgrade. It is a cross-worker hint, not a
//! correctness-critical flag, so a relaxed atomic is enough.

use std::{
    hash::BuildHasher,
    sync::atomic::{AtomicBool, Ordering},
};

use posthaste_common::config::{AddressFamily, AuthConfig, PoolAddress, ZoneConfig};

use crate::{speedometer::Speedometer, types::Delivery};

/// Fixed seeds so the nonce → address mapping survives restarts; a delivery
/// retried with the same `id.seq` leaves from the same source address.
fn pool_hasher() -> ahash::RandomState {
    ahash::RandomState::with_seeds(0x6f75_7462, 0x6f75_6e64, 0x7a6f_6e65, 0x706f_6f6c)
}

const DEFAULT_RECEIVED_TEMPLATE: &str =
    "by {helo} (Posthaste) with ESMTP id {id}.{seq}; {date}";

pub struct Zone {
    name: String,
    host: Option<String>,
    port: u16,
    secure: bool,
    require_tls: bool,
    disable_starttls: AtomicBool,
    auth: Option<AuthConfig>,
    family: AddressFamily,
    pool: Vec<PoolAddress>,
    pub speedometer: Option<Speedometer>,
    received_template: Option<String>,
}

impl Zone {
    pub fn new(config: ZoneConfig) -> Self {
        let speedometer = config
            .throttle
            .map(|throttle| Speedometer::new(throttle.messages_per_second, throttle.burst));

        Self {
            name: config.name,
            host: config.host,
            port: config.port,
            secure: config.secure,
            require_tls: config.require_tls,
            disable_starttls: AtomicBool::new(config.disable_starttls),
            auth: config.auth,
            family: config.family,
            pool: config.pool,
            speedometer,
            received_template: config.received_template,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Forced next hop, skipping MX resolution.
    pub fn host(&self) -> Option<&str> {
        self.host.as_deref()
    }

    pub const fn port(&self) -> u16 {
        self.port
    }

    pub const fn secure(&self) -> bool {
        self.secure
    }

    pub const fn require_tls(&self) -> bool {
        self.require_tls
    }

    pub const fn family(&self) -> AddressFamily {
        self.family
    }

    pub const fn auth(&self) -> Option<&AuthConfig> {
        self.auth.as_ref()
    }

    pub fn pool(&self) -> &[PoolAddress] {
        &self.pool
    }

    pub fn starttls_disabled(&self) -> bool {
        self.disable_starttls.load(Ordering::Relaxed)
    }

    /// Stop offering STARTTLS to this zone's servers. Last write wins.
    pub fn disable_starttls(&self) {
        self.disable_starttls.store(true, Ordering::Relaxed);
    }

    /// Pick a stable source address for a connection nonce. Returns `None`
    /// when the pool has no address of the needed family, in which case the
    /// OS chooses.
    pub fn address_for(&self, nonce: &str, want_v6: bool) -> Option<&PoolAddress> {
        let candidates: Vec<&PoolAddress> = self
            .pool
            .iter()
            .filter(|entry| entry.address.is_ipv6() == want_v6)
            .collect();

        if candidates.is_empty() {
            return None;
        }

        let hash = pool_hasher().hash_one(nonce);
        let index = usize::try_from(hash % candidates.len() as u64).unwrap_or(0);
        Some(candidates[index])
    }

    /// Render the trace header value for one delivery. `helo` is the name
    /// actually presented on the connection, or the system hostname when no
    /// connection was made.
    pub fn received_header(&self, delivery: &Delivery, helo: &str) -> String {
        let template = self
            .received_template
            .as_deref()
            .unwrap_or(DEFAULT_RECEIVED_TEMPLATE);

        template
            .replace("{helo}", helo)
            .replace("{id}", &delivery.id)
            .replace("{seq}", &delivery.seq.to_string())
            .replace("{from}", &delivery.from)
            .replace("{zone}", &self.name)
            .replace("{date}", &chrono::Utc::now().to_rfc2822())
    }
}

#[cfg(test)]
mod tests {
    use std::net::IpAddr;

    use posthaste_common::headers::HeaderBlock;

    use super::*;

    fn pool_zone() -> Zone {
        Zone::new(ZoneConfig {
            name: String::from("default"),
            host: None,
            port: 25,
            secure: false,
            disable_starttls: false,
            require_tls: false,
            auth: None,
            family: AddressFamily::Any,
            pool: vec![
                PoolAddress {
                    address: "203.0.113.1".parse().unwrap(),
                    hostname: String::from("out1.example.org"),
                },
                PoolAddress {
                    address: "203.0.113.2".parse().unwrap(),
                    hostname: String::from("out2.example.org"),
                },
                PoolAddress {
                    address: "2001:db8::1".parse().unwrap(),
                    hostname: String::from("out6.example.org"),
                },
            ],
            throttle: None,
            received_template: None,
        })
    }

    fn delivery() -> Delivery {
        Delivery {
            id: String::from("m1"),
            seq: 1,
            from: String::from("a@x.test"),
            to: vec![String::from("b@y.test")],
            domain: String::from("y.test"),
            headers: HeaderBlock::new(),
            body_size: 10,
            deferred_count: 0,
            spam: None,
            dkim: None,
            fbl: None,
            message_id: None,
        }
    }

    #[test]
    fn address_choice_is_stable_per_nonce() {
        let zone = pool_zone();
        let first = zone.address_for("m1.1", false).unwrap().address;
        for _ in 0..10 {
            assert_eq!(zone.address_for("m1.1", false).unwrap().address, first);
        }
    }

    #[test]
    fn address_choice_respects_the_family() {
        let zone = pool_zone();
        let v4 = zone.address_for("m1.1", false).unwrap();
        assert!(v4.address.is_ipv4());
        let v6 = zone.address_for("m1.1", true).unwrap();
        assert_eq!(v6.address, "2001:db8::1".parse::<IpAddr>().unwrap());
    }

    #[test]
    fn empty_family_pool_yields_none() {
        let zone = Zone::new(ZoneConfig {
            name: String::from("v4only"),
            host: None,
            port: 25,
            secure: false,
            disable_starttls: false,
            require_tls: false,
            auth: None,
            family: AddressFamily::Ipv4,
            pool: vec![PoolAddress {
                address: "203.0.113.9".parse().unwrap(),
                hostname: String::from("out9.example.org"),
            }],
            throttle: None,
            received_template: None,
        });
        assert!(zone.address_for("m1.1", true).is_none());
    }

    #[test]
    fn starttls_flag_flips_once_and_stays() {
        let zone = pool_zone();
        assert!(!zone.starttls_disabled());
        zone.disable_starttls();
        assert!(zone.starttls_disabled());
        zone.disable_starttls();
        assert!(zone.starttls_disabled());
    }

    #[test]
    fn received_header_renders_the_template() {
        let zone = pool_zone();
        let value = zone.received_header(&delivery(), "out1.example.org");
        assert!(value.starts_with("by out1.example.org (Posthaste) with ESMTP id m1.1; "));
    }

    #[test]
    fn received_header_honours_custom_templates() {
        let zone = Zone::new(ZoneConfig {
            name: String::from("custom"),
            host: None,
            port: 25,
            secure: false,
            disable_starttls: false,
            require_tls: false,
            auth: None,
            family: AddressFamily::Any,
            pool: vec![],
            throttle: None,
            received_template: Some(String::from("via {zone} from <{from}> by {helo}")),
        });
        assert_eq!(
            zone.received_header(&delivery(), "mx.local"),
            "via custom from <a@x.test> by mx.local"
        );
    }
}
