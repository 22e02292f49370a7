// src/backend/storage/storable.rs
use crate::error::{AfterselfError, Result};
use serde::{de::DeserializeOwned, Serialize};

/// Helper struct to wrap any serde type so it can be stored as a CBOR plaintext
/// inside an encrypted record. Wrap a reference to encode without cloning.
#[derive(Clone, Debug, PartialEq)]
pub struct Cbor<T>(pub T);

impl<T: Serialize> Cbor<T> {
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut writer = vec![];
        ciborium::ser::into_writer(&self.0, &mut writer)
            .map_err(|e| AfterselfError::InternalError(format!("failed to encode record: {e}")))?;
        Ok(writer)
    }
}

impl<T: DeserializeOwned> Cbor<T> {
    /// A plaintext that authenticated but does not decode is still corruption.
    pub fn from_bytes(label: &str, bytes: &[u8]) -> Result<Self> {
        ciborium::de::from_reader(bytes)
            .map(Cbor)
            .map_err(|e| AfterselfError::integrity(label, format!("undecodable record: {e}")))
    }
}

impl<T> Cbor<T> {
    pub fn into_inner(self) -> T {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::state::HeartbeatRecord;

    #[test]
    fn borrowed_value_encodes_like_owned() {
        let record = HeartbeatRecord {
            last_check_in: Some(10),
            last_ping_sent: None,
            missed_check_ins: 2,
            missed_ping: Some(7),
        };
        let bytes = Cbor(&record).to_bytes().unwrap();
        let back: HeartbeatRecord = Cbor::from_bytes("heartbeat", &bytes).unwrap().into_inner();
        assert_eq!(back, record);
    }

    #[test]
    fn garbage_is_an_integrity_error() {
        let err = Cbor::<HeartbeatRecord>::from_bytes("heartbeat", &[0xff, 0x00, 0x13]).unwrap_err();
        assert!(err.is_integrity());
    }
}
