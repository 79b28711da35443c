//! Payment account derivation.
//!
//! Every order gets its own receiving account. The account's key is derived deterministically from the deployment's
//! master secret, the chain, the currency and the order id, so the same inputs always produce the same address, and
//! the engine never has to store key material: the signing key is re-derived when the balance is withdrawn.
//!
//! Accounts are secp256k1 (ECDSA) keys. Their on-chain identity is the Blake2b-256 hash of the compressed public key,
//! rendered as an SS58 address with the chain's network prefix.
use blake2::{digest::consts::U32, Blake2b, Blake2b512, Digest};
use k256::{ecdsa::SigningKey, elliptic_curve::sec1::ToEncodedPoint};
use kalatori_common::Secret;
use thiserror::Error;

use crate::{currency::Currency, db_types::OrderId};

type Blake2b256 = Blake2b<U32>;

const DERIVATION_DOMAIN: &[u8] = b"kalatori/payment-account/v1";
const SS58_PREFIX: &[u8] = b"SS58PRE";

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DerivationError {
    #[error("Currency {0} does not have a supported address format")]
    UnsupportedAddressFormat(String),
    #[error("The derived key for order {0} is not a valid signing key")]
    InvalidKey(String),
    #[error("Invalid SS58 address: {0}")]
    InvalidAddress(String),
    #[error("The master secret is empty")]
    EmptySecret,
}

/// A derived receiving account, together with the key that controls it.
#[derive(Debug, Clone)]
pub struct PaymentAccount {
    pub address: String,
    /// The 32-byte secp256k1 secret key for the account.
    pub signer: Secret<[u8; 32]>,
}

#[derive(Clone, Debug)]
pub struct AccountDeriver {
    secret: Secret<String>,
}

impl AccountDeriver {
    pub fn new(secret: Secret<String>) -> Result<Self, DerivationError> {
        if secret.reveal().is_empty() {
            return Err(DerivationError::EmptySecret);
        }
        Ok(Self { secret })
    }

    /// Derives the payment account for `order_id` in `currency`. This is a pure function with no side effects.
    pub fn derive(&self, order_id: &OrderId, currency: &Currency) -> Result<PaymentAccount, DerivationError> {
        let prefix = currency.ss58.ok_or_else(|| DerivationError::UnsupportedAddressFormat(currency.symbol.clone()))?;
        // Each component is length-prefixed so that no two distinct inputs produce the same preimage.
        let mut hasher = Blake2b256::new();
        hasher.update(DERIVATION_DOMAIN);
        for part in [
            self.secret.reveal().as_bytes(),
            currency.chain_name.as_bytes(),
            currency.symbol.as_bytes(),
            order_id.as_str().as_bytes(),
        ] {
            hasher.update((part.len() as u64).to_le_bytes());
            hasher.update(part);
        }
        let seed: [u8; 32] = hasher.finalize().into();
        let address = address_from_seed(&seed, prefix).map_err(|e| match e {
            DerivationError::InvalidKey(_) => DerivationError::InvalidKey(order_id.to_string()),
            e => e,
        })?;
        Ok(PaymentAccount { address, signer: Secret::new(seed) })
    }
}

/// The SS58 address of the account controlled by the secp256k1 secret key `seed`.
pub fn address_from_seed(seed: &[u8; 32], prefix: u16) -> Result<String, DerivationError> {
    let key = SigningKey::from_slice(seed).map_err(|e| DerivationError::InvalidKey(e.to_string()))?;
    let public = key.verifying_key().as_affine().to_encoded_point(true);
    let account_id: [u8; 32] = Blake2b256::digest(public.as_bytes()).into();
    ss58_encode(prefix, &account_id)
}

/// Encodes a 32-byte account id as an SS58 address with the given network prefix.
pub fn ss58_encode(prefix: u16, account_id: &[u8; 32]) -> Result<String, DerivationError> {
    let mut data = match prefix {
        0..=63 => vec![prefix as u8],
        64..=16_383 => {
            let first = ((prefix & 0b0000_0000_1111_1100) as u8 >> 2) | 0b0100_0000;
            let second = ((prefix >> 8) as u8) | (((prefix & 0b0000_0000_0000_0011) as u8) << 6);
            vec![first, second]
        },
        _ => return Err(DerivationError::InvalidAddress(format!("network prefix {prefix} is out of range"))),
    };
    data.extend_from_slice(account_id);
    let checksum = ss58_checksum(&data);
    data.extend_from_slice(&checksum[..2]);
    Ok(bs58::encode(data).into_string())
}

/// Decodes an SS58 address into its network prefix and account id, verifying the checksum.
pub fn ss58_decode(address: &str) -> Result<(u16, [u8; 32]), DerivationError> {
    let data = bs58::decode(address).into_vec().map_err(|e| DerivationError::InvalidAddress(e.to_string()))?;
    let (prefix, prefix_len) = match data.first() {
        Some(b) if *b < 64 => (u16::from(*b), 1),
        Some(b) if *b < 128 && data.len() > 1 => {
            let lower = (b << 2) | (data[1] >> 6);
            let upper = data[1] & 0b0011_1111;
            (u16::from(lower) | (u16::from(upper) << 8), 2)
        },
        _ => return Err(DerivationError::InvalidAddress(address.to_string())),
    };
    if data.len() != prefix_len + 32 + 2 {
        return Err(DerivationError::InvalidAddress(format!("{address} has an unexpected length")));
    }
    let body = &data[..prefix_len + 32];
    let checksum = ss58_checksum(body);
    if checksum[..2] != data[prefix_len + 32..] {
        return Err(DerivationError::InvalidAddress(format!("{address} has an invalid checksum")));
    }
    let mut account_id = [0u8; 32];
    account_id.copy_from_slice(&body[prefix_len..]);
    Ok((prefix, account_id))
}

fn ss58_checksum(data: &[u8]) -> [u8; 64] {
    let mut hasher = Blake2b512::new();
    hasher.update(SS58_PREFIX);
    hasher.update(data);
    hasher.finalize().into()
}
