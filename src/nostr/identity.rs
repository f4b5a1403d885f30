//! Session identity and the cryptographic signer boundary.

use bech32::{Bech32, Hrp};
use rand::{thread_rng, Rng};
use secp256k1::{All, Keypair, Message as SignDigest, Secp256k1};
use sha2::{Digest as _, Sha256};
use thiserror::Error;

use super::event::EventDraft;

const NPUB_HRP: &str = "npub";
const NSEC_HRP: &str = "nsec";

#[derive(Debug, Error)]
pub enum SignerError {
    #[error("invalid key material: {0}")]
    InvalidKey(String),
    #[error("signing failed: {0}")]
    Signing(String),
    #[error("invalid address: {0}")]
    InvalidAddress(String),
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Session identity: one key pair plus a display name.
///
/// Created by the "initialize session" user action and replaced wholesale on
/// reinitialization; never mutated in place.
#[derive(Debug, Clone)]
pub struct Identity {
    pub public_key: String,
    pub secret_key: String,
    pub display_name: String,
}

impl Identity {
    pub fn generate(
        provider: &dyn SignerProvider,
        display_name: Option<String>,
    ) -> Result<Self, SignerError> {
        let keys = provider.generate_keypair()?;
        Ok(Self {
            public_key: keys.public_key,
            secret_key: keys.secret_key,
            display_name: display_name.unwrap_or_else(generate_display_name),
        })
    }
}

#[derive(Debug, Clone)]
pub struct KeyPair {
    pub public_key: String,
    pub secret_key: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AddressKind {
    PublicKey,
    SecretKey,
}

/// Result of decoding a bech32 address: what it is plus the hex payload.
#[derive(Debug, Clone)]
pub struct DecodedAddress {
    pub kind: AddressKind,
    pub data: String,
}

/// External cryptographic identity provider.
///
/// Key generation, event hashing, signing and address encoding all live
/// behind this seam; a provider failure is fatal to the triggering action
/// only, never to the session.
pub trait SignerProvider: Send + Sync {
    fn generate_keypair(&self) -> Result<KeyPair, SignerError>;
    /// Hex id of the event: sha256 over the serialized
    /// `[0, pubkey, created_at, kind, tags, content]` tuple.
    fn event_id(&self, draft: &EventDraft) -> Result<String, SignerError>;
    fn sign(&self, event_id_hex: &str, secret_key_hex: &str) -> Result<String, SignerError>;
    fn encode_address(&self, public_key_hex: &str) -> Result<String, SignerError>;
    fn decode_address(&self, address: &str) -> Result<DecodedAddress, SignerError>;
}

/// Schnorr signer over secp256k1 with NIP-01 event hashing.
pub struct SchnorrSigner {
    secp: Secp256k1<All>,
}

impl SchnorrSigner {
    pub fn new() -> Self {
        Self {
            secp: Secp256k1::new(),
        }
    }
}

impl Default for SchnorrSigner {
    fn default() -> Self {
        Self::new()
    }
}

impl SignerProvider for SchnorrSigner {
    fn generate_keypair(&self) -> Result<KeyPair, SignerError> {
        let (secret_key, _) = self.secp.generate_keypair(&mut thread_rng());
        let keypair = Keypair::from_secret_key(&self.secp, &secret_key);
        let (xonly, _parity) = keypair.x_only_public_key();
        Ok(KeyPair {
            public_key: hex::encode(xonly.serialize()),
            secret_key: hex::encode(secret_key.secret_bytes()),
        })
    }

    fn event_id(&self, draft: &EventDraft) -> Result<String, SignerError> {
        let tuple = serde_json::json!([
            0,
            draft.pubkey,
            draft.created_at,
            draft.kind,
            draft.tags,
            draft.content,
        ]);
        let serialized = serde_json::to_vec(&tuple)?;
        Ok(hex::encode(Sha256::digest(&serialized)))
    }

    fn sign(&self, event_id_hex: &str, secret_key_hex: &str) -> Result<String, SignerError> {
        let digest =
            hex::decode(event_id_hex).map_err(|error| SignerError::Signing(error.to_string()))?;
        let secret = hex::decode(secret_key_hex)
            .map_err(|error| SignerError::InvalidKey(error.to_string()))?;
        let keypair = Keypair::from_seckey_slice(&self.secp, &secret)
            .map_err(|error| SignerError::InvalidKey(error.to_string()))?;
        let message = SignDigest::from_digest_slice(&digest)
            .map_err(|error| SignerError::Signing(error.to_string()))?;
        let signature = self.secp.sign_schnorr_no_aux_rand(&message, &keypair);
        Ok(hex::encode(signature.as_ref()))
    }

    fn encode_address(&self, public_key_hex: &str) -> Result<String, SignerError> {
        let data = hex::decode(public_key_hex)
            .map_err(|error| SignerError::InvalidKey(error.to_string()))?;
        if data.len() != 32 {
            return Err(SignerError::InvalidKey(format!(
                "expected 32-byte public key, got {}",
                data.len()
            )));
        }
        let hrp = Hrp::parse(NPUB_HRP).map_err(|error| SignerError::Signing(error.to_string()))?;
        bech32::encode::<Bech32>(hrp, &data).map_err(|error| SignerError::Signing(error.to_string()))
    }

    fn decode_address(&self, address: &str) -> Result<DecodedAddress, SignerError> {
        let (hrp, data) = bech32::decode(address)
            .map_err(|error| SignerError::InvalidAddress(error.to_string()))?;
        let npub = Hrp::parse(NPUB_HRP).map_err(|error| SignerError::Signing(error.to_string()))?;
        let nsec = Hrp::parse(NSEC_HRP).map_err(|error| SignerError::Signing(error.to_string()))?;
        let kind = if hrp == npub {
            AddressKind::PublicKey
        } else if hrp == nsec {
            AddressKind::SecretKey
        } else {
            return Err(SignerError::InvalidAddress(format!(
                "unknown address prefix: {hrp}"
            )));
        };
        if data.len() != 32 {
            return Err(SignerError::InvalidAddress(format!(
                "expected 32-byte payload, got {}",
                data.len()
            )));
        }
        Ok(DecodedAddress {
            kind,
            data: hex::encode(data),
        })
    }
}

/// Generate a random display name for a fresh session.
/// Format: {adjective}{noun}{number}
fn generate_display_name() -> String {
    let adjectives = [
        "quiet", "patient", "gentle", "steady", "earnest", "candid", "curious", "attentive",
        "mindful", "sincere", "humble", "open",
    ];

    let nouns = [
        "fox", "rose", "prince", "lamp", "well", "echo", "traveler", "listener", "garden",
        "planet", "letter", "star",
    ];

    let mut rng = thread_rng();
    let adjective = adjectives[rng.gen_range(0..adjectives.len())];
    let noun = nouns[rng.gen_range(0..nouns.len())];
    let number: u16 = rng.gen_range(100..9999);

    format!("{}{}{}", adjective, noun, number)
}

/// Check that `pubkey` looks like a 64-char hex x-only public key.
pub fn is_hex_pubkey(pubkey: &str) -> bool {
    pubkey.len() == 64 && pubkey.chars().all(|c| c.is_ascii_hexdigit())
}
