// src/backend/storage/vault.rs
use crate::error::{AfterselfError, Result};
use crate::models::action::ActionPlan;
use crate::models::audit_log::{AuditEntry, AuditEvent};
use crate::models::common::Timestamp;
use crate::models::config::VaultConfig;
use crate::storage::audit_logs::AuditLog;
use crate::storage::files;
use crate::storage::records::{RecordKey, BENEFICIARY_DIR, BENEFICIARY_PLAN_FILE};
use crate::storage::storable::Cbor;
use crate::utils::crypto::{wrap_for_beneficiary, BeneficiaryKey, RecordCipher, VaultKey};
use serde::{de::DeserializeOwned, Serialize};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use tracing::{debug, error, info};

/// Durable encrypted store. The only component that writes bytes to disk.
///
/// Writes (records and audit entries alike) are serialized through one lock.
/// Reads go straight to the file system: every record is replaced atomically, so a
/// reader always sees a complete ciphertext.
pub struct Vault {
    root: PathBuf,
    backup: Option<PathBuf>,
    cipher: RecordCipher,
    beneficiary: Option<BeneficiaryKey>,
    writer: Mutex<AuditLog>,
}

impl Vault {
    /// Opens the vault with the key at the configured key path, creating both on
    /// first use.
    pub fn open(config: &VaultConfig) -> Result<Self> {
        let key = VaultKey::load_or_create(&config.resolved_key_path())?;
        Self::open_with_key(config, key)
    }

    pub fn open_with_key(config: &VaultConfig, key: VaultKey) -> Result<Self> {
        let beneficiary = match (config.beneficiary_key_enabled, &config.beneficiary_public_key) {
            (true, Some(encoded)) => Some(BeneficiaryKey::from_sec1_hex(encoded)?),
            (true, None) => {
                return Err(AfterselfError::Config(
                    "beneficiaryKeyEnabled requires beneficiaryPublicKey".to_string(),
                ))
            }
            (false, _) => None,
        };

        files::ensure_dir(&config.db_path)?;
        files::remove_stale_temp_files(&config.db_path)?;
        files::remove_stale_temp_files(&config.db_path.join(BENEFICIARY_DIR))?;
        let cipher = RecordCipher::new(&key);
        let audit = AuditLog::open(&config.db_path, &cipher)?;

        info!(
            path = %config.db_path.display(),
            backup = config.backup_path.is_some(),
            beneficiary_layer = beneficiary.is_some(),
            audit_entries = audit.len(),
            "vault opened"
        );
        Ok(Self {
            root: config.db_path.clone(),
            backup: config.backup_path.clone(),
            cipher,
            beneficiary,
            writer: Mutex::new(audit),
        })
    }

    /// Encrypts and atomically replaces one record.
    pub fn put<T: Serialize>(&self, key: RecordKey, value: &T) -> Result<()> {
        let plaintext = Cbor(value).to_bytes()?;
        let _guard = self.lock()?;
        self.write_record(key, &plaintext)
    }

    /// Reads one record; `None` if it was never written. Any authentication or
    /// decoding failure is a `VaultIntegrity` error.
    pub fn get<T: DeserializeOwned>(&self, key: RecordKey) -> Result<Option<T>> {
        let Some(sealed) = files::read_optional(&key.path_in(&self.root))? else {
            return Ok(None);
        };
        let decoded = self
            .cipher
            .open(key.label(), &sealed)
            .and_then(|plaintext| Cbor::<T>::from_bytes(key.label(), &plaintext));
        match decoded {
            Ok(value) => Ok(Some(value.into_inner())),
            Err(err) => {
                error!(record = key.label(), error = %err, "vault record failed integrity check");
                Err(err)
            }
        }
    }

    /// Stores the plan and, with the beneficiary layer on, rewrites the standalone
    /// beneficiary export under the same write lock.
    pub fn put_plan(&self, plan: &ActionPlan) -> Result<()> {
        let plaintext = Cbor(plan).to_bytes()?;
        let export = self
            .beneficiary
            .as_ref()
            .map(|key| wrap_for_beneficiary(key, &plaintext))
            .transpose()?;

        let _guard = self.lock()?;
        self.write_record(RecordKey::ActionPlan, &plaintext)?;
        if let Some(export) = export {
            let relative = Path::new(BENEFICIARY_DIR).join(BENEFICIARY_PLAN_FILE);
            files::atomic_write(&self.root.join(&relative), &export)?;
            self.mirror(&relative, &export);
            debug!(plan_id = %plan.id, "beneficiary export rewritten");
        }
        Ok(())
    }

    pub fn get_plan(&self) -> Result<Option<ActionPlan>> {
        self.get(RecordKey::ActionPlan)
    }

    /// The plan wrapped under the beneficiary key, decryptable without the vault key.
    pub fn beneficiary_plan_export(&self) -> Result<Option<Vec<u8>>> {
        if self.beneficiary.is_none() {
            return Ok(None);
        }
        files::read_optional(&self.root.join(BENEFICIARY_DIR).join(BENEFICIARY_PLAN_FILE))
    }

    pub fn append_audit(&self, event: AuditEvent, now: Timestamp) -> Result<AuditEntry> {
        let mut audit = self.lock()?;
        let appended = audit.append(&self.cipher, event, now)?;
        for (relative, sealed) in &appended.written {
            self.mirror(relative, sealed);
        }
        Ok(appended.entry)
    }

    pub fn audit_entries(&self) -> Result<Vec<AuditEntry>> {
        let audit = self.lock()?;
        audit.entries(&self.cipher)
    }

    fn write_record(&self, key: RecordKey, plaintext: &[u8]) -> Result<()> {
        let sealed = self.cipher.seal(key.label(), plaintext)?;
        files::atomic_write(&key.path_in(&self.root), &sealed)?;
        self.mirror(Path::new(&key.file_name()), &sealed);
        debug!(record = key.label(), bytes = sealed.len(), "vault record written");
        Ok(())
    }

    fn mirror(&self, relative: &Path, sealed: &[u8]) {
        if let Some(backup) = &self.backup {
            files::mirror_to_backup(backup, relative, sealed);
        }
    }

    fn lock(&self) -> Result<MutexGuard<'_, AuditLog>> {
        self.writer
            .lock()
            .map_err(|_| AfterselfError::InternalError("vault writer lock poisoned".to_string()))
    }
}
