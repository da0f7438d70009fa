//! Secret vault - generation and opaque storage of sensitive values
//!
//! Secrets are referenced by name everywhere in the engine. The value
//! type renders as a fixed redaction marker in `Display` and `Debug`, so
//! a secret cannot reach a log line without an explicit, intentional call
//! to [`Secret::reveal`].

use crate::error::VaultError;
use rand::RngCore;
use rand::rngs::OsRng;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Mutex;

/// Marker emitted wherever a secret would otherwise be printed
pub const REDACTED: &str = "[REDACTED]";

const LETTERS_DIGITS: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz0123456789";
const SYMBOLS: &[u8] = b"!@#%^*-_=+";

/// A generated sensitive value, identified by a logical name.
///
/// Cloning is cheap and keeps the value opaque. The plaintext is only
/// reachable through [`Secret::reveal`], which exists for two call sites:
/// step actions that must pass the value to the remote tool being
/// configured, and the final handoff renderer.
#[derive(Clone, PartialEq, Eq)]
pub struct Secret {
    name: String,
    value: String,
}

impl Secret {
    /// Logical name of this secret (e.g. `postgres.app_prod.password`)
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The plaintext value.
    ///
    /// Calling this is the single deliberate unwrap point; never pass the
    /// result to a logger or report.
    pub fn reveal(&self) -> &str {
        &self.value
    }
}

impl fmt::Display for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{REDACTED}")
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Secret")
            .field("name", &self.name)
            .field("value", &REDACTED)
            .finish()
    }
}

/// Length and character-class rules for generated secrets
#[derive(Debug, Clone)]
pub struct SecretPolicy {
    /// Number of characters to generate
    pub length: usize,
    /// Include punctuation beyond letters and digits
    pub symbols: bool,
}

impl Default for SecretPolicy {
    fn default() -> Self {
        Self {
            length: 32,
            symbols: false,
        }
    }
}

impl SecretPolicy {
    fn charset(&self) -> Vec<u8> {
        let mut set = LETTERS_DIGITS.to_vec();
        if self.symbols {
            set.extend_from_slice(SYMBOLS);
        }
        set
    }
}

/// Generator and store for sensitive values, shared across workers.
///
/// All mutation goes through `generate`/`insert`; lookups return clones
/// so callers never hold the map lock.
pub struct SecretVault {
    secrets: Mutex<BTreeMap<String, Secret>>,
}

impl SecretVault {
    /// Create an empty vault
    pub fn new() -> Self {
        Self {
            secrets: Mutex::new(BTreeMap::new()),
        }
    }

    /// Generate a new secret under `name` using OS entropy.
    ///
    /// Fails closed: if the entropy source is unavailable the error is
    /// surfaced, never papered over with a weaker generator. Generating a
    /// name twice in one run is a collision error - secrets are immutable
    /// once created.
    pub fn generate(&self, name: &str, policy: &SecretPolicy) -> Result<Secret, VaultError> {
        if policy.length == 0 {
            return Err(VaultError::Policy("length must be non-zero".to_string()));
        }
        let value = random_string(policy)?;
        self.insert(name, value)
    }

    /// Store an externally supplied value (e.g. a password fixed in the
    /// configuration, or a captured public key) under `name`.
    pub fn insert(&self, name: &str, value: String) -> Result<Secret, VaultError> {
        let secret = Secret {
            name: name.to_string(),
            value,
        };
        let mut secrets = lock_secrets(&self.secrets);
        if secrets.contains_key(name) {
            return Err(VaultError::NameCollision(name.to_string()));
        }
        secrets.insert(name.to_string(), secret.clone());
        Ok(secret)
    }

    /// Look up a secret by name
    pub fn get(&self, name: &str) -> Result<Secret, VaultError> {
        lock_secrets(&self.secrets)
            .get(name)
            .cloned()
            .ok_or_else(|| VaultError::NotFound(name.to_string()))
    }

    /// Whether a secret with this name exists
    pub fn contains(&self, name: &str) -> bool {
        lock_secrets(&self.secrets).contains_key(name)
    }

    /// Names of every secret generated this run, in sorted order.
    ///
    /// This is what reports carry - names, never values.
    pub fn names(&self) -> Vec<String> {
        lock_secrets(&self.secrets).keys().cloned().collect()
    }
}

impl Default for SecretVault {
    fn default() -> Self {
        Self::new()
    }
}

fn lock_secrets(
    secrets: &Mutex<BTreeMap<String, Secret>>,
) -> std::sync::MutexGuard<'_, BTreeMap<String, Secret>> {
    match secrets.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Draw `policy.length` characters from the policy's charset using OS
/// entropy with rejection sampling (no modulo bias).
fn random_string(policy: &SecretPolicy) -> Result<String, VaultError> {
    let charset = policy.charset();
    let limit = 256 - (256 % charset.len());
    let mut out = String::with_capacity(policy.length);
    let mut buf = [0u8; 64];

    while out.len() < policy.length {
        OsRng
            .try_fill_bytes(&mut buf)
            .map_err(|e| VaultError::Entropy(e.to_string()))?;
        for &byte in &buf {
            if (byte as usize) < limit {
                out.push(charset[byte as usize % charset.len()] as char);
                if out.len() == policy.length {
                    break;
                }
            }
        }
    }

    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generate_respects_length_and_charset() {
        let vault = SecretVault::new();
        let secret = vault
            .generate("db.password", &SecretPolicy::default())
            .unwrap();
        assert_eq!(secret.reveal().len(), 32);
        assert!(secret.reveal().chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn generate_with_symbols() {
        let vault = SecretVault::new();
        let policy = SecretPolicy {
            length: 64,
            symbols: true,
        };
        let secret = vault.generate("s", &policy).unwrap();
        assert_eq!(secret.reveal().len(), 64);
        assert!(
            secret
                .reveal()
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || SYMBOLS.contains(&(c as u8)))
        );
    }

    #[test]
    fn zero_length_policy_is_rejected() {
        let vault = SecretVault::new();
        let policy = SecretPolicy {
            length: 0,
            symbols: false,
        };
        assert!(matches!(
            vault.generate("s", &policy),
            Err(VaultError::Policy(_))
        ));
    }

    #[test]
    fn name_collision_is_an_error() {
        let vault = SecretVault::new();
        vault
            .generate("db.password", &SecretPolicy::default())
            .unwrap();
        assert!(matches!(
            vault.generate("db.password", &SecretPolicy::default()),
            Err(VaultError::NameCollision(_))
        ));
    }

    #[test]
    fn get_unknown_secret_is_not_found() {
        let vault = SecretVault::new();
        assert!(matches!(vault.get("nope"), Err(VaultError::NotFound(_))));
    }

    #[test]
    fn display_and_debug_are_redacted() {
        let vault = SecretVault::new();
        let secret = vault.insert("k", "hunter2hunter2".to_string()).unwrap();
        assert_eq!(format!("{secret}"), REDACTED);
        let debug = format!("{secret:?}");
        assert!(!debug.contains("hunter2"));
        assert!(debug.contains("k"));
    }

    #[test]
    fn names_never_expose_values() {
        let vault = SecretVault::new();
        vault.insert("a.one", "v1".to_string()).unwrap();
        vault.insert("b.two", "v2".to_string()).unwrap();
        assert_eq!(vault.names(), vec!["a.one", "b.two"]);
    }

    #[test]
    fn generated_secrets_differ() {
        let vault = SecretVault::new();
        let a = vault.generate("a", &SecretPolicy::default()).unwrap();
        let b = vault.generate("b", &SecretPolicy::default()).unwrap();
        assert_ne!(a.reveal(), b.reveal());
    }
}
