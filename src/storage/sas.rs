//! Shared-key SAS tokens for Azure Blob Storage.

use base64::{engine::general_purpose::STANDARD, Engine};
use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use std::fmt;
use std::time::Duration;

use super::StorageError;

type HmacSha256 = Hmac<Sha256>;

/// Storage service version the tokens are signed for.
pub const SAS_VERSION: &str = "2022-11-02";

/// Maximum lifetime of an access grant.
pub const MAX_SAS_TTL: Duration = Duration::from_secs(7 * 24 * 60 * 60);

/// Validate an access grant lifetime.
pub fn validate_ttl(ttl: Duration) -> Result<(), String> {
    if ttl.is_zero() {
        Err("expiry duration must be greater than zero".to_string())
    } else if ttl > MAX_SAS_TTL {
        Err(format!(
            "expiry duration {:?} exceeds maximum allowed {:?}",
            ttl, MAX_SAS_TTL
        ))
    } else {
        Ok(())
    }
}

fn sas_time(t: &DateTime<Utc>) -> String {
    t.format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

/// Signs SAS tokens with the storage account key.
#[derive(Clone)]
pub struct SharedKeySigner {
    account: String,
    key: Vec<u8>,
    allow_http: bool,
}

impl fmt::Debug for SharedKeySigner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedKeySigner")
            .field("account", &self.account)
            .field("key", &"<redacted>")
            .field("allow_http", &self.allow_http)
            .finish()
    }
}

impl SharedKeySigner {
    /// `account_key` is the base64 key as shown in the storage account settings.
    pub fn new(account: &str, account_key: &str, allow_http: bool) -> Result<Self, StorageError> {
        if account.is_empty() {
            return Err(StorageError::Config("storage account name is empty".to_string()));
        }
        let key = STANDARD
            .decode(account_key.trim())
            .map_err(|e| StorageError::Config(format!("storage account key is not base64: {}", e)))?;
        if key.is_empty() {
            return Err(StorageError::Config("storage account key is empty".to_string()));
        }
        Ok(Self {
            account: account.to_string(),
            key,
            allow_http,
        })
    }

    fn protocol(&self) -> &'static str {
        if self.allow_http {
            "https,http"
        } else {
            "https"
        }
    }

    fn sign(&self, string_to_sign: &str) -> Result<String, StorageError> {
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .map_err(|e| StorageError::Signing(e.to_string()))?;
        mac.update(string_to_sign.as_bytes());
        Ok(STANDARD.encode(mac.finalize().into_bytes()))
    }

    /// Service SAS query string granting read access to one blob.
    pub fn blob_read_sas(
        &self,
        container: &str,
        blob: &str,
        start: &DateTime<Utc>,
        expiry: &DateTime<Utc>,
    ) -> Result<String, StorageError> {
        if expiry <= start {
            return Err(StorageError::Signing(
                "expiry must be after start".to_string(),
            ));
        }
        let (st, se) = (sas_time(start), sas_time(expiry));
        let canonical_resource = format!("/blob/{}/{}/{}", self.account, container, blob);
        let string_to_sign = [
            "r",                 // permissions
            st.as_str(),         // start
            se.as_str(),         // expiry
            canonical_resource.as_str(),
            "",                  // identifier
            "",                  // ip
            self.protocol(),     // protocol
            SAS_VERSION,         // version
            "b",                 // resource type
            "",                  // snapshot time
            "",                  // encryption scope
            "",                  // rscc
            "",                  // rscd
            "",                  // rsce
            "",                  // rscl
            "",                  // rsct
        ]
        .join("\n");
        let signature = self.sign(&string_to_sign)?;

        Ok(format!(
            "sv={}&st={}&se={}&sr=b&sp=r&spr={}&sig={}",
            SAS_VERSION,
            urlencoding::encode(&st),
            urlencoding::encode(&se),
            urlencoding::encode(self.protocol()),
            urlencoding::encode(&signature)
        ))
    }

    /// Account SAS query string allowing container creation.
    pub fn container_create_sas(
        &self,
        start: &DateTime<Utc>,
        expiry: &DateTime<Utc>,
    ) -> Result<String, StorageError> {
        let (st, se) = (sas_time(start), sas_time(expiry));
        let mut string_to_sign = [
            self.account.as_str(),
            "c", // permissions
            "b", // services
            "c", // resource types
            st.as_str(),
            se.as_str(),
            "", // ip
            self.protocol(),
            SAS_VERSION,
            "", // encryption scope
        ]
        .join("\n");
        string_to_sign.push('\n');
        let signature = self.sign(&string_to_sign)?;

        Ok(format!(
            "sv={}&ss=b&srt=c&sp=c&st={}&se={}&spr={}&sig={}",
            SAS_VERSION,
            urlencoding::encode(&st),
            urlencoding::encode(&se),
            urlencoding::encode(self.protocol()),
            urlencoding::encode(&signature)
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn signer() -> SharedKeySigner {
        SharedKeySigner::new("devaccount", &STANDARD.encode(b"super-secret-key"), false).unwrap()
    }

    fn query_param<'a>(query: &'a str, name: &str) -> Option<&'a str> {
        query
            .split('&')
            .filter_map(|pair| pair.split_once('='))
            .find(|(k, _)| *k == name)
            .map(|(_, v)| v)
    }

    #[test]
    fn test_validate_ttl() {
        assert!(validate_ttl(Duration::from_secs(3600)).is_ok());
        assert!(validate_ttl(MAX_SAS_TTL).is_ok());
        assert!(validate_ttl(Duration::ZERO).is_err());
        assert!(validate_ttl(MAX_SAS_TTL + Duration::from_secs(1)).is_err());
    }

    #[test]
    fn test_new_rejects_bad_keys() {
        assert!(SharedKeySigner::new("acct", "not base64!!", false).is_err());
        assert!(SharedKeySigner::new("acct", "", false).is_err());
        assert!(SharedKeySigner::new("", &STANDARD.encode(b"k"), false).is_err());
    }

    #[test]
    fn test_debug_redacts_key() {
        let debug = format!("{:?}", signer());
        assert!(debug.contains("devaccount"));
        assert!(!debug.contains("c3VwZXI"));
    }

    #[test]
    fn test_blob_read_sas_fields() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();

        let sas = signer()
            .blob_read_sas("audio", "audio/abc/x.mp4", &start, &expiry)
            .unwrap();

        assert_eq!(query_param(&sas, "sv"), Some(SAS_VERSION));
        assert_eq!(query_param(&sas, "sp"), Some("r"));
        assert_eq!(query_param(&sas, "sr"), Some("b"));
        assert_eq!(query_param(&sas, "spr"), Some("https"));
        assert_eq!(query_param(&sas, "st"), Some("2024-05-01T12%3A00%3A00Z"));
        assert_eq!(query_param(&sas, "se"), Some("2024-05-01T13%3A00%3A00Z"));
        assert!(query_param(&sas, "sig").is_some_and(|s| !s.is_empty()));
    }

    #[test]
    fn test_blob_read_sas_is_deterministic_per_input() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let later = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 1).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 5, 1, 13, 0, 0).unwrap();
        let s = signer();

        let a = s.blob_read_sas("audio", "k.mp4", &start, &expiry).unwrap();
        let b = s.blob_read_sas("audio", "k.mp4", &start, &expiry).unwrap();
        let c = s.blob_read_sas("audio", "k.mp4", &later, &expiry).unwrap();
        let d = s.blob_read_sas("audio", "other.mp4", &start, &expiry).unwrap();

        assert_eq!(a, b);
        assert_ne!(query_param(&a, "sig"), query_param(&c, "sig"));
        assert_ne!(query_param(&a, "sig"), query_param(&d, "sig"));
    }

    #[test]
    fn test_blob_read_sas_rejects_non_positive_window() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        assert!(matches!(
            signer().blob_read_sas("audio", "k.mp4", &start, &start),
            Err(StorageError::Signing(_))
        ));
    }

    #[test]
    fn test_container_create_sas_fields() {
        let start = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let expiry = Utc.with_ymd_and_hms(2024, 5, 1, 12, 15, 0).unwrap();
        let http_signer =
            SharedKeySigner::new("devaccount", &STANDARD.encode(b"super-secret-key"), true).unwrap();

        let sas = http_signer.container_create_sas(&start, &expiry).unwrap();

        assert_eq!(query_param(&sas, "ss"), Some("b"));
        assert_eq!(query_param(&sas, "srt"), Some("c"));
        assert_eq!(query_param(&sas, "sp"), Some("c"));
        assert_eq!(query_param(&sas, "spr"), Some("https%2Chttp"));
    }
}
