//! Subaccount derivation and the on-disk vault.
//!
//! Every subwallet is derived from a signature the parent keypair makes over
//! a fixed message: the signature bytes are the derivation root, and
//! `hash(root || index)` seeds the subaccount keypair. The same parent and
//! index always produce the same address, so a lost vault can be rebuilt
//! from the parent keypair alone.

use std::fmt;
use std::fs;
use std::path::Path;

use serde::de::Error as _;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use solana_sdk::{
    hash::hashv,
    pubkey::Pubkey,
    signature::Keypair,
    signer::{keypair::keypair_from_seed, Signer},
};

use crate::error::FleetError;

/// Number of subaccounts in a generated fleet.
pub const FLEET_SIZE: u32 = 100;

/// Message the parent signs to authorize derivation. Versioned so a future
/// scheme change cannot silently produce different addresses.
pub const DERIVATION_MESSAGE: &[u8] = b"solfleet subwallet derivation v1";

/// One derived subaccount. The signing key is owned here, kept out of
/// `Debug` output and the CSV export; it is written only to the vault file.
pub struct Account {
    pub index: u32,
    keypair: Keypair,
    pub native_lamports: u64,
    pub token_lamports: Option<u64>,
}

impl Account {
    pub fn pubkey(&self) -> Pubkey {
        self.keypair.pubkey()
    }
}

impl fmt::Debug for Account {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Account")
            .field("index", &self.index)
            .field("address", &self.pubkey())
            .field("native_lamports", &self.native_lamports)
            .field("token_lamports", &self.token_lamports)
            .finish()
    }
}

#[derive(Serialize, Deserialize)]
struct AccountRecord {
    index: u32,
    address: String,
    secret_key: Vec<u8>,
    native_lamports: u64,
    token_lamports: Option<u64>,
}

impl Serialize for Account {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        AccountRecord {
            index: self.index,
            address: self.pubkey().to_string(),
            secret_key: self.keypair.to_bytes().to_vec(),
            native_lamports: self.native_lamports,
            token_lamports: self.token_lamports,
        }
        .serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Account {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let record = AccountRecord::deserialize(deserializer)?;
        let keypair = Keypair::try_from(record.secret_key.as_slice())
            .map_err(|e| D::Error::custom(format!("account {}: bad secret key: {e}", record.index)))?;
        if keypair.pubkey().to_string() != record.address {
            return Err(D::Error::custom(format!(
                "account {}: address does not match secret key",
                record.index
            )));
        }
        Ok(Account {
            index: record.index,
            keypair,
            native_lamports: record.native_lamports,
            token_lamports: record.token_lamports,
        })
    }
}

/// Derivation root: the parent's signature over [`DERIVATION_MESSAGE`].
pub fn derive_seed(parent: &Keypair) -> [u8; 64] {
    let signature = parent.sign_message(DERIVATION_MESSAGE);
    let mut seed = [0u8; 64];
    seed.copy_from_slice(signature.as_ref());
    seed
}

/// Derive the subaccount at `index` from a derivation root.
pub fn derive_account(seed: &[u8; 64], index: u32) -> Result<Account, FleetError> {
    let index_bytes = index.to_le_bytes();
    let digest = hashv(&[seed.as_slice(), index_bytes.as_slice()]);
    let keypair = keypair_from_seed(digest.as_ref())
        .map_err(|e| FleetError::Key(format!("derivation failed at index {index}: {e}")))?;
    Ok(Account {
        index,
        keypair,
        native_lamports: 0,
        token_lamports: None,
    })
}

/// The persisted account set. Replaced wholesale on restore; balance fields
/// are the only parts mutated in place (by funding and refresh).
#[derive(Debug, Serialize, Deserialize)]
pub struct Vault {
    pub created_at: String,
    pub parent_address: String,
    pub accounts: Vec<Account>,
}

impl Vault {
    /// Derive a full fleet from the parent keypair.
    pub fn generate(parent: &Keypair) -> Result<Self, FleetError> {
        let seed = derive_seed(parent);
        let accounts = (0..FLEET_SIZE)
            .map(|index| derive_account(&seed, index))
            .collect::<Result<Vec<_>, _>>()?;
        Ok(Self {
            created_at: chrono::Utc::now().to_rfc3339(),
            parent_address: parent.pubkey().to_string(),
            accounts,
        })
    }

    pub fn load(path: &Path) -> Result<Self, FleetError> {
        let data = fs::read_to_string(path)?;
        Ok(serde_json::from_str(&data)?)
    }

    pub fn save(&self, path: &Path) -> Result<(), FleetError> {
        let data = serde_json::to_string_pretty(self)?;
        fs::write(path, data)?;
        Ok(())
    }

    /// Write the public address sheet: indexes, addresses, cached balances.
    /// No key material leaves the vault file.
    pub fn export_csv(&self, path: &Path) -> Result<(), FleetError> {
        let mut writer = csv::Writer::from_path(path)?;
        writer.write_record(["index", "address", "native_lamports", "token_lamports"])?;
        for account in &self.accounts {
            writer.write_record([
                account.index.to_string(),
                account.pubkey().to_string(),
                account.native_lamports.to_string(),
                account
                    .token_lamports
                    .map(|v| v.to_string())
                    .unwrap_or_default(),
            ])?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn total_native_lamports(&self) -> u64 {
        self.accounts
            .iter()
            .map(|a| a.native_lamports)
            .sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn derivation_is_deterministic() {
        let parent = Keypair::new();
        let seed_a = derive_seed(&parent);
        let seed_b = derive_seed(&parent);
        assert_eq!(seed_a, seed_b);

        let first = derive_account(&seed_a, 7).unwrap();
        let second = derive_account(&seed_b, 7).unwrap();
        assert_eq!(first.pubkey(), second.pubkey());
    }

    #[test]
    fn distinct_indexes_yield_distinct_addresses() {
        let seed = derive_seed(&Keypair::new());
        let a = derive_account(&seed, 0).unwrap();
        let b = derive_account(&seed, 1).unwrap();
        assert_ne!(a.pubkey(), b.pubkey());
    }

    #[test]
    fn different_parents_do_not_collide() {
        let a = derive_account(&derive_seed(&Keypair::new()), 0).unwrap();
        let b = derive_account(&derive_seed(&Keypair::new()), 0).unwrap();
        assert_ne!(a.pubkey(), b.pubkey());
    }

    #[test]
    fn generate_produces_a_full_unique_fleet() {
        let vault = Vault::generate(&Keypair::new()).unwrap();
        assert_eq!(vault.accounts.len(), FLEET_SIZE as usize);
        let mut addresses: Vec<String> =
            vault.accounts.iter().map(|a| a.pubkey().to_string()).collect();
        addresses.sort();
        addresses.dedup();
        assert_eq!(addresses.len(), FLEET_SIZE as usize);
        for (i, account) in vault.accounts.iter().enumerate() {
            assert_eq!(account.index, i as u32);
        }
    }

    #[test]
    fn vault_round_trips_through_disk() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vault.json");

        let mut vault = Vault::generate(&Keypair::new()).unwrap();
        vault.accounts[3].native_lamports = 1_500_000;
        vault.accounts[3].token_lamports = Some(42);
        vault.save(&path).unwrap();

        let loaded = Vault::load(&path).unwrap();
        assert_eq!(loaded.parent_address, vault.parent_address);
        assert_eq!(loaded.accounts.len(), vault.accounts.len());
        assert_eq!(loaded.accounts[3].pubkey(), vault.accounts[3].pubkey());
        assert_eq!(loaded.accounts[3].native_lamports, 1_500_000);
        assert_eq!(loaded.accounts[3].token_lamports, Some(42));
    }

    #[test]
    fn tampered_vault_is_rejected() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("vault.json");

        let vault = Vault::generate(&Keypair::new()).unwrap();
        vault.save(&path).unwrap();

        // Swap one account's address for another's: the secret no longer matches.
        let data = fs::read_to_string(&path).unwrap();
        let tampered = data.replacen(
            &vault.accounts[0].pubkey().to_string(),
            &vault.accounts[1].pubkey().to_string(),
            1,
        );
        fs::write(&path, tampered).unwrap();

        assert!(matches!(Vault::load(&path), Err(FleetError::Json(_))));
    }

    #[test]
    fn restore_replaces_wholesale() {
        let temp = TempDir::new().unwrap();
        let vault_path = temp.path().join("vault.json");

        let original = Vault::generate(&Keypair::new()).unwrap();
        original.save(&vault_path).unwrap();

        let replacement = Vault::generate(&Keypair::new()).unwrap();
        replacement.save(&vault_path).unwrap();

        let loaded = Vault::load(&vault_path).unwrap();
        assert_eq!(loaded.parent_address, replacement.parent_address);
        assert_ne!(loaded.parent_address, original.parent_address);
    }

    #[test]
    fn csv_export_contains_no_secrets() {
        let temp = TempDir::new().unwrap();
        let csv_path = temp.path().join("fleet.csv");

        let vault = Vault::generate(&Keypair::new()).unwrap();
        vault.export_csv(&csv_path).unwrap();

        let sheet = fs::read_to_string(&csv_path).unwrap();
        assert!(sheet.starts_with("index,address,native_lamports,token_lamports"));
        assert!(sheet.contains(&vault.accounts[0].pubkey().to_string()));
        for account in &vault.accounts {
            assert!(!sheet.contains(&account.keypair.to_base58_string()));
        }
    }

    #[test]
    fn debug_output_omits_key_material() {
        let vault = Vault::generate(&Keypair::new()).unwrap();
        let rendered = format!("{:?}", vault.accounts[0]);
        assert!(rendered.contains("address"));
        assert!(!rendered.contains(&vault.accounts[0].keypair.to_base58_string()));
    }
}
