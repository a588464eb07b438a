//! # Security Policy Provider
//!
//! Cryptographic protection of secure-conversation chunk bodies, consumed
//! by the secure channel as an opaque provider behind the
//! [`SecurityPolicy`] trait.
//!
//! Two policies ship with the core:
//! - **None**: plaintext passthrough, for discovery endpoints
//! - **ChaCha20Poly1305**: XChaCha20-Poly1305 AEAD under a pre-shared key,
//!   with the channel and token ids bound in as associated data so a chunk
//!   cannot be replayed across channels or token generations
//!
//! Certificate-based asymmetric policies stay behind the same trait and are
//! out of scope for this core.

use crate::error::{Result, UaError};
use chacha20poly1305::aead::{Aead, AeadCore, KeyInit, OsRng, Payload};
use chacha20poly1305::{Key, XChaCha20Poly1305, XNonce};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use zeroize::Zeroize;

/// Policy URI for unsecured conversations.
pub const POLICY_URI_NONE: &str = "http://opcfoundation.org/UA/SecurityPolicy#None";

/// Policy URI for the symmetric AEAD policy.
pub const POLICY_URI_CHACHA20POLY1305: &str =
    "urn:opcua-protocol:SecurityPolicy#ChaCha20Poly1305";

/// XChaCha20 nonce length prepended to each protected body.
const NONCE_LEN: usize = 24;

/// Message security mode of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SecurityMode {
    None,
    SignAndEncrypt,
}

/// Credential bound to a secure channel for a validity window. Renewable
/// without closing the channel.
#[derive(Debug, Clone)]
pub struct SecurityToken {
    pub token_id: u32,
    pub channel_id: u32,
    pub created_at: Instant,
    pub lifetime: Duration,
}

impl SecurityToken {
    pub fn new(token_id: u32, channel_id: u32, lifetime: Duration) -> Self {
        Self {
            token_id,
            channel_id,
            created_at: Instant::now(),
            lifetime,
        }
    }

    pub fn is_expired(&self) -> bool {
        self.created_at.elapsed() >= self.lifetime
    }

    /// How long a superseded token remains acceptable on receive after a
    /// renewal: a quarter of its lifetime, per the OPC UA overlap rule.
    pub fn overlap_window(&self) -> Duration {
        self.lifetime / 4
    }
}

/// Opaque provider protecting and unprotecting chunk bodies under a token.
pub trait SecurityPolicy: Send + Sync {
    fn uri(&self) -> &str;

    fn mode(&self) -> SecurityMode;

    /// Secure an outgoing body under the given token.
    fn protect(&self, token: &SecurityToken, plaintext: &[u8]) -> Result<Vec<u8>>;

    /// Verify and recover an incoming body under the given token.
    fn unprotect(&self, token: &SecurityToken, data: &[u8]) -> Result<Vec<u8>>;
}

/// Plaintext passthrough policy.
pub struct NoSecurity;

impl SecurityPolicy for NoSecurity {
    fn uri(&self) -> &str {
        POLICY_URI_NONE
    }

    fn mode(&self) -> SecurityMode {
        SecurityMode::None
    }

    fn protect(&self, _token: &SecurityToken, plaintext: &[u8]) -> Result<Vec<u8>> {
        Ok(plaintext.to_vec())
    }

    fn unprotect(&self, _token: &SecurityToken, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }
}

/// Symmetric AEAD policy. Each protected body is `nonce || ciphertext` with
/// the channel and token ids as associated data.
pub struct ChaCha20Poly1305Policy {
    cipher: XChaCha20Poly1305,
}

impl ChaCha20Poly1305Policy {
    pub fn new(mut key: [u8; 32]) -> Self {
        let cipher = XChaCha20Poly1305::new(Key::from_slice(&key));
        key.zeroize();
        Self { cipher }
    }
}

fn token_aad(token: &SecurityToken) -> [u8; 8] {
    let mut aad = [0u8; 8];
    aad[..4].copy_from_slice(&token.channel_id.to_le_bytes());
    aad[4..].copy_from_slice(&token.token_id.to_le_bytes());
    aad
}

impl SecurityPolicy for ChaCha20Poly1305Policy {
    fn uri(&self) -> &str {
        POLICY_URI_CHACHA20POLY1305
    }

    fn mode(&self) -> SecurityMode {
        SecurityMode::SignAndEncrypt
    }

    fn protect(&self, token: &SecurityToken, plaintext: &[u8]) -> Result<Vec<u8>> {
        let nonce = XChaCha20Poly1305::generate_nonce(&mut OsRng);
        let aad = token_aad(token);
        let ciphertext = self
            .cipher
            .encrypt(
                &nonce,
                Payload {
                    msg: plaintext,
                    aad: &aad,
                },
            )
            .map_err(|_| UaError::Security("encryption failed".into()))?;

        let mut out = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        out.extend_from_slice(&nonce);
        out.extend_from_slice(&ciphertext);
        Ok(out)
    }

    fn unprotect(&self, token: &SecurityToken, data: &[u8]) -> Result<Vec<u8>> {
        if data.len() < NONCE_LEN {
            return Err(UaError::Security("protected body too short".into()));
        }
        let (nonce_bytes, ciphertext) = data.split_at(NONCE_LEN);
        let nonce = XNonce::from_slice(nonce_bytes);
        let aad = token_aad(token);
        self.cipher
            .decrypt(
                nonce,
                Payload {
                    msg: ciphertext,
                    aad: &aad,
                },
            )
            .map_err(|_| UaError::Security("decryption or verification failed".into()))
    }
}

/// Build the policy named by the security configuration.
pub fn policy_from_config(cfg: &crate::config::SecurityConfig) -> Result<Arc<dyn SecurityPolicy>> {
    match cfg.policy_uri.as_str() {
        POLICY_URI_NONE => Ok(Arc::new(NoSecurity)),
        POLICY_URI_CHACHA20POLY1305 => {
            let key = cfg.key_bytes().ok_or_else(|| {
                UaError::Config("symmetric policy requires a 32-byte secret_key".into())
            })?;
            Ok(Arc::new(ChaCha20Poly1305Policy::new(key)))
        }
        other => Err(UaError::Security(format!(
            "unsupported security policy: {other}"
        ))),
    }
}
