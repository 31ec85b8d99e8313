use crate::core::domain::DeviceId;
use crate::crypto::{self, CryptoError};
use crate::identity::Identity;
use serde::{Deserialize, Serialize};

/// Presence announcement, broadcast as a JSON datagram.
///
/// The signature covers `publicKey + ":" + deviceName` with the public key in
/// the hex form it travels in, so a receiver can verify the claim from the
/// datagram alone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Beacon {
    pub signed_message: String,
    pub public_key: String,
    pub device_name: String,
    pub os: String,
}

impl Beacon {
    /// The exact byte string a beacon signature covers.
    pub fn canonical_payload(public_key_hex: &str, device_name: &str) -> String {
        format!("{}:{}", public_key_hex, device_name)
    }

    /// Build and sign an announcement for this identity. Done once at startup;
    /// identity and name never change while the process runs.
    pub fn signed(identity: &Identity, device_name: &str) -> Result<Self, CryptoError> {
        let public_key = identity.public_key_hex();
        let payload = Self::canonical_payload(&public_key, device_name);
        let signature = identity.sign(payload.as_bytes())?;
        Ok(Self {
            signed_message: hex::encode(signature),
            public_key,
            device_name: device_name.to_string(),
            os: std::env::consts::OS.to_string(),
        })
    }

    /// Check the embedded signature against the embedded key.
    ///
    /// False for any tamper: payload, signature, or key. Never panics on
    /// garbage input.
    pub fn verify(&self) -> bool {
        let Ok(signature) = hex::decode(&self.signed_message) else {
            return false;
        };
        let Ok(public_key) = hex::decode(&self.public_key) else {
            return false;
        };
        let payload = Self::canonical_payload(&self.public_key, &self.device_name);
        crypto::verify_signature(payload.as_bytes(), &signature, &public_key).unwrap_or(false)
    }

    /// Stable id for the announcing device.
    pub fn device_id(&self) -> DeviceId {
        DeviceId::new(crypto::device_id_digest(&self.public_key, &self.device_name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn test_identity() -> Identity {
        let dir = tempdir().unwrap();
        Identity::load_or_generate(&dir.path().join("identity.json")).unwrap()
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let identity = test_identity();
        let beacon = Beacon::signed(&identity, "living-room").unwrap();
        let json = serde_json::to_value(&beacon).unwrap();

        assert!(json.get("signedMessage").is_some());
        assert!(json.get("publicKey").is_some());
        assert!(json.get("deviceName").is_some());
        assert!(json.get("os").is_some());
        assert_eq!(json.as_object().unwrap().len(), 4);
    }

    #[test]
    fn test_signed_beacon_verifies() {
        let identity = test_identity();
        let beacon = Beacon::signed(&identity, "living-room").unwrap();
        assert!(beacon.verify());
    }

    #[test]
    fn test_tampered_name_fails_verification() {
        let identity = test_identity();
        let mut beacon = Beacon::signed(&identity, "living-room").unwrap();
        beacon.device_name = "imposter".to_string();
        assert!(!beacon.verify());
    }

    #[test]
    fn test_garbage_hex_fails_verification() {
        let identity = test_identity();
        let mut beacon = Beacon::signed(&identity, "living-room").unwrap();
        beacon.signed_message = "not-hex!".to_string();
        assert!(!beacon.verify());
    }

    #[test]
    fn test_device_id_stable_across_beacons() {
        let identity = test_identity();
        let first = Beacon::signed(&identity, "living-room").unwrap();
        let second = Beacon::signed(&identity, "living-room").unwrap();
        assert_eq!(first.device_id(), second.device_id());
    }
}
