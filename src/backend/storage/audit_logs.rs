// src/backend/storage/audit_logs.rs
use crate::error::{AfterselfError, Result};
use crate::models::audit_log::{AuditEntry, AuditEvent};
use crate::models::common::Timestamp;
use crate::storage::files;
use crate::storage::records::{
    audit_file_name, audit_label, parse_audit_file_name, AUDIT_DIR, AUDIT_HEAD_FILE, AUDIT_HEAD_LABEL,
};
use crate::storage::storable::Cbor;
use crate::utils::crypto::{generate_ulid, RecordCipher};
use std::fs;
use std::path::{Path, PathBuf};

/// Append-only audit log: one write-once encrypted file per entry, named by a
/// zero-padded sequence number. The sequence number is part of the associated
/// data, so entries cannot be reordered or renamed undetected. A sealed head
/// record holds the number of entries appended, so a truncated tail is caught too.
#[derive(Debug)]
pub struct AuditLog {
    dir: PathBuf,
    next_seq: u64,
}

/// A freshly appended entry and the files written for it, for backup mirroring.
pub struct Appended {
    pub entry: AuditEntry,
    pub written: Vec<(PathBuf, Vec<u8>)>,
}

impl AuditLog {
    /// Appends continue after both the newest entry on disk and the sealed head,
    /// so entries removed from the tail leave a detectable gap.
    pub fn open(vault_root: &Path, cipher: &RecordCipher) -> Result<Self> {
        let dir = vault_root.join(AUDIT_DIR);
        files::ensure_dir(&dir)?;
        files::remove_stale_temp_files(&dir)?;
        let on_disk = sequence_numbers(&dir)?.last().map_or(0, |last| last + 1);
        let head = read_head(&dir, cipher)?.unwrap_or(0);
        Ok(Self {
            dir,
            next_seq: on_disk.max(head),
        })
    }

    pub fn len(&self) -> u64 {
        self.next_seq
    }

    pub fn is_empty(&self) -> bool {
        self.next_seq == 0
    }

    pub fn append(&mut self, cipher: &RecordCipher, event: AuditEvent, now: Timestamp) -> Result<Appended> {
        let seq = self.next_seq;
        let entry = AuditEntry {
            id: generate_ulid(now),
            timestamp: now,
            kind: event.kind,
            action: event.action,
            details: event.details,
            success: event.success,
        };
        let sealed = cipher.seal(&audit_label(seq), &Cbor(&entry).to_bytes()?)?;
        let file_name = audit_file_name(seq);
        files::write_once(&self.dir.join(&file_name), &sealed)?;
        self.next_seq += 1;

        let head = cipher.seal(AUDIT_HEAD_LABEL, &Cbor(&self.next_seq).to_bytes()?)?;
        files::atomic_write(&self.dir.join(AUDIT_HEAD_FILE), &head)?;
        Ok(Appended {
            entry,
            written: vec![
                (Path::new(AUDIT_DIR).join(file_name), sealed),
                (Path::new(AUDIT_DIR).join(AUDIT_HEAD_FILE), head),
            ],
        })
    }

    /// All entries in append order. A missing sequence number is tampering, and so
    /// is an entry count short of the sealed head. One entry past the head is an
    /// append whose head write never landed.
    pub fn entries(&self, cipher: &RecordCipher) -> Result<Vec<AuditEntry>> {
        let seqs = sequence_numbers(&self.dir)?;
        let head = read_head(&self.dir, cipher)?.unwrap_or(0);
        let count = seqs.len() as u64;
        if count != head && count != head + 1 {
            return Err(AfterselfError::integrity(
                AUDIT_HEAD_LABEL,
                format!("audit log holds {count} entries, head records {head}"),
            ));
        }

        let mut entries = Vec::new();
        for (expected, seq) in seqs.into_iter().enumerate() {
            let label = audit_label(seq);
            if seq != expected as u64 {
                return Err(AfterselfError::integrity(label, format!("audit log gap before entry {seq}")));
            }
            let sealed = fs::read(self.dir.join(audit_file_name(seq)))?;
            let plaintext = cipher.open(&label, &sealed)?;
            entries.push(Cbor::<AuditEntry>::from_bytes(&label, &plaintext)?.into_inner());
        }
        Ok(entries)
    }
}

fn read_head(dir: &Path, cipher: &RecordCipher) -> Result<Option<u64>> {
    let Some(sealed) = files::read_optional(&dir.join(AUDIT_HEAD_FILE))? else {
        return Ok(None);
    };
    let plaintext = cipher.open(AUDIT_HEAD_LABEL, &sealed)?;
    Ok(Some(Cbor::<u64>::from_bytes(AUDIT_HEAD_LABEL, &plaintext)?.into_inner()))
}

fn sequence_numbers(dir: &Path) -> Result<Vec<u64>> {
    let mut seqs = Vec::new();
    for entry in fs::read_dir(dir)? {
        let name = entry?.file_name();
        if let Some(seq) = parse_audit_file_name(&name.to_string_lossy()) {
            seqs.push(seq);
        }
    }
    seqs.sort_unstable();
    Ok(seqs)
}
