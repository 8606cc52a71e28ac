use serde::{Deserialize, Serialize};

/// A relay's published identity: where it listens and its long-term RSA
/// public key. Immutable once published (spec.md §3) — a relay that
/// rotates its key pair re-registers under the same `(ip, port)` and the
/// directory replaces the old descriptor in place rather than keeping
/// both.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayDescriptor {
    pub ip: String,
    pub port: u16,
    /// RSA public exponent, decimal string (arbitrary precision).
    pub rsa_public_exp: String,
    /// RSA modulus, decimal string (arbitrary precision).
    pub rsa_modulus: String,
}

impl RelayDescriptor {
    pub fn new(ip: impl Into<String>, port: u16, rsa_public_exp: String, rsa_modulus: String) -> Self {
        Self {
            ip: ip.into(),
            port,
            rsa_public_exp,
            rsa_modulus,
        }
    }

    /// Key under which the directory registry deduplicates descriptors.
    pub fn address_key(&self) -> (String, u16) {
        (self.ip.clone(), self.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn address_key_is_ip_and_port() {
        let d = RelayDescriptor::new("127.0.0.1", 9001, "65537".into(), "123".into());
        assert_eq!(d.address_key(), ("127.0.0.1".to_string(), 9001));
    }
}
