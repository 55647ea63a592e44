//! Tunnel credentials: SSH keypairs for tunnel clients and basic-auth passwords.

use rand::seq::SliceRandom;
use rand::Rng;
use russh_keys::ssh_key::LineEnding;
use russh_keys::Algorithm;

use crate::error::BrokerError;

pub const SERVICE_PROXY_USER: &str = "serviceproxyuser";
const PASSWORD_LEN: usize = 40;
const LOWER: &[u8] = b"abcdefghijklmnopqrstuvwxyz";
const UPPER: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ";
const DIGITS: &[u8] = b"0123456789";
const SPECIAL: &[u8] = b"!@#$%^&*~";

#[derive(Debug, Clone)]
pub struct KeyPair {
    /// OpenSSH public key line.
    pub public_key: String,
    /// OpenSSH PEM private key.
    pub private_key: String,
}

/// Mint a fresh Ed25519 keypair for a tunnel client.
pub fn generate_keypair() -> Result<KeyPair, BrokerError> {
    let key = russh_keys::PrivateKey::random(&mut rand::thread_rng(), Algorithm::Ed25519)
        .map_err(|e| BrokerError::KeyGen(e.to_string()))?;
    let private_key = key
        .to_openssh(LineEnding::LF)
        .map_err(|e| BrokerError::KeyGen(e.to_string()))?
        .to_string();
    let public_key = key
        .public_key()
        .to_openssh()
        .map_err(|e| BrokerError::KeyGen(e.to_string()))?;
    Ok(KeyPair {
        public_key,
        private_key,
    })
}

/// A 40 character password with lower, upper, digit and special characters.
pub fn generate_password() -> String {
    let classes = [LOWER, UPPER, DIGITS, SPECIAL];
    let mut rng = rand::thread_rng();

    let mut password: Vec<u8> = (0..PASSWORD_LEN)
        .map(|i| {
            let class = classes[i % classes.len()];
            class[rng.gen_range(0..class.len())]
        })
        .collect();
    // the class pattern must not be positional
    password.shuffle(&mut rng);
    password.into_iter().map(char::from).collect()
}
