//! Password-substitution transforms. Every kind replaces the original
//! value with a hash of a fixed cleartext; the original only ever feeds
//! salt derivation, so nothing sensitive survives into the replica.

use argon2::{Algorithm, Argon2, Params, Version};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use common::err::{KResult, KashoError};

/// Default cleartext every hashed password resolves to on the replica.
pub const DEFAULT_CLEARTEXT: &str = "password123";

fn default_cleartext() -> String {
    DEFAULT_CLEARTEXT.to_string()
}

fn default_seeded() -> bool {
    true
}

/// 16 salt bytes: derived from the original value when seeding is on
/// (same row in, same hash out), random otherwise.
pub fn salt_for(original: &str, seeded: bool) -> [u8; 16] {
    let mut salt = [0u8; 16];
    if seeded {
        let digest = Sha256::digest(original.as_bytes());
        salt.copy_from_slice(&digest[..16]);
    } else {
        rand::thread_rng().fill_bytes(&mut salt);
    }
    salt
}

fn transform_err(rule: &str, column: &str, cause: impl ToString) -> KashoError {
    KashoError::Transform {
        rule: rule.to_string(),
        column: column.to_string(),
        cause: cause.to_string(),
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Argon2idParams {
    #[serde(default = "Argon2idParams::default_time_cost")]
    pub time_cost: u32,
    #[serde(default = "Argon2idParams::default_memory_kib")]
    pub memory_kib: u32,
    #[serde(default = "Argon2idParams::default_threads")]
    pub threads: u32,
    #[serde(default = "Argon2idParams::default_output_len")]
    pub output_len: usize,
    #[serde(default = "default_cleartext")]
    pub cleartext: String,
    #[serde(default = "default_seeded")]
    pub seeded: bool,
}

impl Argon2idParams {
    fn default_time_cost() -> u32 {
        2
    }
    fn default_memory_kib() -> u32 {
        19_456
    }
    fn default_threads() -> u32 {
        1
    }
    fn default_output_len() -> usize {
        32
    }
}

impl Default for Argon2idParams {
    fn default() -> Self {
        Argon2idParams {
            time_cost: Self::default_time_cost(),
            memory_kib: Self::default_memory_kib(),
            threads: Self::default_threads(),
            output_len: Self::default_output_len(),
            cleartext: default_cleartext(),
            seeded: default_seeded(),
        }
    }
}

/// `hex(salt)$hex(argon2id(cleartext, salt))`
pub fn argon2id(original: &str, column: &str, p: &Argon2idParams) -> KResult<String> {
    let params = Params::new(p.memory_kib, p.time_cost, p.threads, Some(p.output_len))
        .map_err(|e| transform_err("PasswordArgon2id", column, e))?;
    let hasher = Argon2::new(Algorithm::Argon2id, Version::V0x13, params);
    let salt = salt_for(original, p.seeded);
    let mut out = vec![0u8; p.output_len];
    hasher
        .hash_password_into(p.cleartext.as_bytes(), &salt, &mut out)
        .map_err(|e| transform_err("PasswordArgon2id", column, e))?;
    Ok(format!("{}${}", hex::encode(salt), hex::encode(out)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BcryptParams {
    #[serde(default = "BcryptParams::default_cost")]
    pub cost: u32,
    #[serde(default = "default_cleartext")]
    pub cleartext: String,
    #[serde(default = "default_seeded")]
    pub seeded: bool,
}

impl BcryptParams {
    fn default_cost() -> u32 {
        10
    }
}

impl Default for BcryptParams {
    fn default() -> Self {
        BcryptParams {
            cost: Self::default_cost(),
            cleartext: default_cleartext(),
            seeded: default_seeded(),
        }
    }
}

/// Modular-crypt `$2b$…` string, as applications expect in the column.
pub fn bcrypt_hash(original: &str, column: &str, p: &BcryptParams) -> KResult<String> {
    let salt = salt_for(original, p.seeded);
    let parts = bcrypt::hash_with_salt(p.cleartext.as_bytes(), p.cost, salt)
        .map_err(|e| transform_err("PasswordBcrypt", column, e))?;
    Ok(parts.to_string())
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScryptParams {
    #[serde(default = "ScryptParams::default_log_n")]
    pub log_n: u8,
    #[serde(default = "ScryptParams::default_r")]
    pub r: u32,
    #[serde(default = "ScryptParams::default_p")]
    pub p: u32,
    #[serde(default = "ScryptParams::default_output_len")]
    pub output_len: usize,
    #[serde(default = "default_cleartext")]
    pub cleartext: String,
    #[serde(default = "default_seeded")]
    pub seeded: bool,
}

impl ScryptParams {
    fn default_log_n() -> u8 {
        15
    }
    fn default_r() -> u32 {
        8
    }
    fn default_p() -> u32 {
        1
    }
    fn default_output_len() -> usize {
        32
    }
}

impl Default for ScryptParams {
    fn default() -> Self {
        ScryptParams {
            log_n: Self::default_log_n(),
            r: Self::default_r(),
            p: Self::default_p(),
            output_len: Self::default_output_len(),
            cleartext: default_cleartext(),
            seeded: default_seeded(),
        }
    }
}

pub fn scrypt_hash(original: &str, column: &str, p: &ScryptParams) -> KResult<String> {
    let params = scrypt::Params::new(p.log_n, p.r, p.p, p.output_len)
        .map_err(|e| transform_err("PasswordScrypt", column, e))?;
    let salt = salt_for(original, p.seeded);
    let mut out = vec![0u8; p.output_len];
    scrypt::scrypt(p.cleartext.as_bytes(), &salt, &params, &mut out)
        .map_err(|e| transform_err("PasswordScrypt", column, e))?;
    Ok(format!("{}${}", hex::encode(salt), hex::encode(out)))
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Pbkdf2Params {
    #[serde(default = "Pbkdf2Params::default_rounds")]
    pub rounds: u32,
    #[serde(default = "Pbkdf2Params::default_output_len")]
    pub output_len: usize,
    #[serde(default = "default_cleartext")]
    pub cleartext: String,
    #[serde(default = "default_seeded")]
    pub seeded: bool,
}

impl Pbkdf2Params {
    fn default_rounds() -> u32 {
        600_000
    }
    fn default_output_len() -> usize {
        32
    }
}

impl Default for Pbkdf2Params {
    fn default() -> Self {
        Pbkdf2Params {
            rounds: Self::default_rounds(),
            output_len: Self::default_output_len(),
            cleartext: default_cleartext(),
            seeded: default_seeded(),
        }
    }
}

pub fn pbkdf2_hash(original: &str, column: &str, p: &Pbkdf2Params) -> KResult<String> {
    if p.rounds == 0 {
        return Err(transform_err("PasswordPBKDF2", column, "rounds must be positive"));
    }
    let salt = salt_for(original, p.seeded);
    let mut out = vec![0u8; p.output_len];
    pbkdf2::pbkdf2_hmac::<Sha256>(p.cleartext.as_bytes(), &salt, p.rounds, &mut out);
    Ok(format!("{}${}", hex::encode(salt), hex::encode(out)))
}
