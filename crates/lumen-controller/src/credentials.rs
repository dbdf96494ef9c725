//! SQLite-backed credential store.
//!
//! Holds the device identity and one pinned server certificate per host.
//! Pairing writes certificates through [`CredentialStore`]; the CLI lists,
//! removes, exports and imports them.

use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
use lumen_core::errors::StoreError;
use lumen_core::types::{DeviceIdentity, PinnedCertificate};
use lumen_core::CredentialStore;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info};

const SCHEMA_VERSION: i32 = 1;

/// Credential store errors
#[derive(Debug, Error)]
pub enum CredentialError {
    #[error("Certificate not found for host: {0}")]
    NotFound(String),

    #[error("Stored data is corrupt: {0}")]
    Corrupt(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
}

impl From<CredentialError> for StoreError {
    fn from(e: CredentialError) -> Self {
        match e {
            CredentialError::NotFound(host) => StoreError::NotFound(host),
            CredentialError::Corrupt(msg) => StoreError::DataCorruption(msg),
            CredentialError::Serialization(msg) => StoreError::Serialization(msg),
            other => StoreError::OperationFailed(other.to_string()),
        }
    }
}

/// A pinned certificate with its bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredCertificate {
    pub host: String,
    pub certificate: PinnedCertificate,
    pub pinned_at: SystemTime,
}

impl StoredCertificate {
    pub fn fingerprint(&self) -> String {
        self.certificate.fingerprint()
    }
}

#[derive(Serialize, Deserialize)]
struct ExportedCredentials {
    identity: Option<String>,
    certificates: Vec<ExportedCertificate>,
}

#[derive(Serialize, Deserialize)]
struct ExportedCertificate {
    host: String,
    /// Base64 DER
    certificate: String,
    fingerprint: String,
    pinned_at: String,
}

/// Persistent credential storage using SQLite
pub struct SqliteCredentialStore {
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCredentialStore {
    /// Open or create the credentials database
    pub fn open(path: &Path) -> Result<Self, CredentialError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::run_migrations(&conn)?;
        debug!(path = %path.display(), "opened credential store");
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, for tests and throwaway runs
    pub fn open_in_memory() -> Result<Self, CredentialError> {
        let conn = Connection::open_in_memory()?;
        Self::run_migrations(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn run_migrations(conn: &Connection) -> Result<(), CredentialError> {
        conn.execute(
            "CREATE TABLE IF NOT EXISTS schema_version (version INTEGER PRIMARY KEY)",
            [],
        )?;
        let current: i32 = conn.query_row(
            "SELECT COALESCE(MAX(version), 0) FROM schema_version",
            [],
            |row| row.get(0),
        )?;

        if current < 1 {
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS identity (
                    id INTEGER PRIMARY KEY CHECK (id = 1),
                    value TEXT NOT NULL,
                    created_at INTEGER NOT NULL
                );

                CREATE TABLE IF NOT EXISTS pinned_certs (
                    host TEXT PRIMARY KEY,
                    der BLOB NOT NULL,
                    pinned_at INTEGER NOT NULL
                );
                "#,
            )?;
            conn.execute(
                "INSERT OR REPLACE INTO schema_version (version) VALUES (?)",
                [SCHEMA_VERSION],
            )?;
        }
        Ok(())
    }

    /// Stored identity, without creating one
    pub async fn identity(&self) -> Result<Option<DeviceIdentity>, CredentialError> {
        let conn = self.conn.lock().await;
        Self::read_identity(&conn)
    }

    fn read_identity(conn: &Connection) -> Result<Option<DeviceIdentity>, CredentialError> {
        let value: Option<String> = conn
            .query_row("SELECT value FROM identity WHERE id = 1", [], |row| row.get(0))
            .optional()?;
        match value {
            Some(value) => DeviceIdentity::from_stored(&value)
                .map(Some)
                .ok_or_else(|| CredentialError::Corrupt(format!("identity '{value}'"))),
            None => Ok(None),
        }
    }

    fn write_identity(conn: &Connection, identity: &DeviceIdentity) -> Result<(), CredentialError> {
        conn.execute(
            "INSERT OR REPLACE INTO identity (id, value, created_at) VALUES (1, ?, ?)",
            params![identity.as_str(), unix_now()],
        )?;
        Ok(())
    }

    /// All pinned certificates, ordered by host
    pub async fn list(&self) -> Result<Vec<StoredCertificate>, CredentialError> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT host, der, pinned_at FROM pinned_certs ORDER BY host")?;
        let certs = stmt
            .query_map([], Self::row_to_certificate)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(certs)
    }

    /// Pinned certificate for one host
    pub async fn get(&self, host: &str) -> Result<Option<StoredCertificate>, CredentialError> {
        let conn = self.conn.lock().await;
        let cert = conn
            .query_row(
                "SELECT host, der, pinned_at FROM pinned_certs WHERE host = ?",
                [host],
                Self::row_to_certificate,
            )
            .optional()?;
        Ok(cert)
    }

    /// Forget the certificate for `host`
    pub async fn remove(&self, host: &str) -> Result<(), CredentialError> {
        let conn = self.conn.lock().await;
        let rows = conn.execute("DELETE FROM pinned_certs WHERE host = ?", [host])?;
        if rows == 0 {
            return Err(CredentialError::NotFound(host.to_string()));
        }
        info!(host, "removed pinned certificate");
        Ok(())
    }

    /// Forget the identity and every certificate
    pub async fn reset(&self) -> Result<(), CredentialError> {
        let conn = self.conn.lock().await;
        conn.execute_batch("DELETE FROM pinned_certs; DELETE FROM identity;")?;
        info!("credential store reset");
        Ok(())
    }

    /// Write identity and certificates to a JSON file, returning the certificate count
    pub async fn export(&self, path: &Path) -> Result<usize, CredentialError> {
        let identity = self.identity().await?;
        let certs = self.list().await?;

        let exported = ExportedCredentials {
            identity: identity.map(|i| i.as_str().to_string()),
            certificates: certs
                .iter()
                .map(|c| {
                    let pinned_at: chrono::DateTime<chrono::Utc> = c.pinned_at.into();
                    ExportedCertificate {
                        host: c.host.clone(),
                        certificate: BASE64.encode(c.certificate.der()),
                        fingerprint: c.fingerprint(),
                        pinned_at: pinned_at.to_rfc3339(),
                    }
                })
                .collect(),
        };

        let json = serde_json::to_string_pretty(&exported)
            .map_err(|e| CredentialError::Serialization(e.to_string()))?;
        std::fs::write(path, json)?;
        Ok(certs.len())
    }

    /// Load identity and certificates from an exported file.
    ///
    /// Every entry is checked before anything is written; a fingerprint
    /// mismatch rejects the whole file.
    pub async fn import(&self, path: &Path) -> Result<usize, CredentialError> {
        let contents = std::fs::read_to_string(path)?;
        let imported: ExportedCredentials = serde_json::from_str(&contents)
            .map_err(|e| CredentialError::Serialization(e.to_string()))?;

        let identity = match imported.identity {
            Some(value) => Some(
                DeviceIdentity::from_stored(&value)
                    .ok_or_else(|| CredentialError::Corrupt(format!("identity '{value}'")))?,
            ),
            None => None,
        };

        let mut certs = Vec::with_capacity(imported.certificates.len());
        for entry in imported.certificates {
            let der = BASE64
                .decode(&entry.certificate)
                .map_err(|e| CredentialError::Serialization(e.to_string()))?;
            let certificate = PinnedCertificate::from_der(der);
            if !entry.fingerprint.eq_ignore_ascii_case(&certificate.fingerprint()) {
                return Err(CredentialError::Corrupt(format!(
                    "fingerprint mismatch for {}",
                    entry.host
                )));
            }
            let pinned_at = chrono::DateTime::parse_from_rfc3339(&entry.pinned_at)
                .map(|dt| SystemTime::from(dt.with_timezone(&chrono::Utc)))
                .map_err(|e| CredentialError::Serialization(e.to_string()))?;
            certs.push(StoredCertificate {
                host: entry.host,
                certificate,
                pinned_at,
            });
        }

        let mut conn = self.conn.lock().await;
        let tx = conn.transaction()?;
        if let Some(identity) = &identity {
            Self::write_identity(&tx, identity)?;
        }
        for cert in &certs {
            tx.execute(
                "INSERT OR REPLACE INTO pinned_certs (host, der, pinned_at) VALUES (?, ?, ?)",
                params![cert.host, cert.certificate.der(), to_unix(cert.pinned_at)],
            )?;
        }
        tx.commit()?;

        Ok(certs.len())
    }

    fn row_to_certificate(row: &rusqlite::Row) -> rusqlite::Result<StoredCertificate> {
        let host: String = row.get(0)?;
        let der: Vec<u8> = row.get(1)?;
        let pinned_at: i64 = row.get(2)?;
        Ok(StoredCertificate {
            host,
            certificate: PinnedCertificate::from_der(der),
            pinned_at: UNIX_EPOCH + Duration::from_secs(pinned_at.max(0) as u64),
        })
    }
}

fn to_unix(time: SystemTime) -> i64 {
    time.duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}

fn unix_now() -> i64 {
    to_unix(SystemTime::now())
}

#[async_trait]
impl CredentialStore for SqliteCredentialStore {
    async fn device_identity(&self) -> Result<DeviceIdentity, StoreError> {
        let conn = self.conn.lock().await;
        if let Some(identity) = Self::read_identity(&conn)? {
            return Ok(identity);
        }
        let identity = DeviceIdentity::generate()
            .map_err(|e| StoreError::OperationFailed(format!("identity generation: {e}")))?;
        Self::write_identity(&conn, &identity)?;
        info!(identity = %identity, "generated device identity");
        Ok(identity)
    }

    async fn certificate(&self, host: &str) -> Result<Option<PinnedCertificate>, StoreError> {
        Ok(self.get(host).await?.map(|c| c.certificate))
    }

    async fn put_certificate(
        &self,
        host: &str,
        cert: PinnedCertificate,
    ) -> Result<(), StoreError> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO pinned_certs (host, der, pinned_at) VALUES (?, ?, ?)",
            params![host, cert.der(), unix_now()],
        )
        .map_err(CredentialError::from)?;
        info!(host, fingerprint = %cert.fingerprint(), "pinned server certificate");
        Ok(())
    }

    async fn clear_all(&self) -> Result<(), StoreError> {
        Ok(self.reset().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn cert(byte: u8) -> PinnedCertificate {
        PinnedCertificate::from_der(vec![0x30, 0x82, byte, byte])
    }

    #[tokio::test]
    async fn test_identity_created_once_and_persisted() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("creds.db");

        let first = {
            let store = SqliteCredentialStore::open(&path).unwrap();
            assert!(store.identity().await.unwrap().is_none());
            store.device_identity().await.unwrap()
        };

        let store = SqliteCredentialStore::open(&path).unwrap();
        assert_eq!(store.device_identity().await.unwrap(), first);
        assert_eq!(store.identity().await.unwrap(), Some(first));
    }

    #[tokio::test]
    async fn test_put_and_get_certificate() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.put_certificate("10.0.0.2", cert(1)).await.unwrap();

        assert_eq!(store.certificate("10.0.0.2").await.unwrap(), Some(cert(1)));
        assert_eq!(store.certificate("10.0.0.3").await.unwrap(), None);

        // Re-pairing replaces the pin.
        store.put_certificate("10.0.0.2", cert(2)).await.unwrap();
        assert_eq!(store.certificate("10.0.0.2").await.unwrap(), Some(cert(2)));
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_list_is_ordered_by_host() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        store.put_certificate("zeta", cert(1)).await.unwrap();
        store.put_certificate("alpha", cert(2)).await.unwrap();

        let hosts: Vec<String> = store
            .list()
            .await
            .unwrap()
            .into_iter()
            .map(|c| c.host)
            .collect();
        assert_eq!(hosts, vec!["alpha", "zeta"]);
    }

    #[tokio::test]
    async fn test_remove_missing_host() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(matches!(
            store.remove("nowhere").await,
            Err(CredentialError::NotFound(_))
        ));

        store.put_certificate("pc", cert(1)).await.unwrap();
        store.remove("pc").await.unwrap();
        assert!(store.get("pc").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_clear_all_forgets_everything() {
        let store = SqliteCredentialStore::open_in_memory().unwrap();
        let identity = store.device_identity().await.unwrap();
        store.put_certificate("a", cert(1)).await.unwrap();
        store.put_certificate("b", cert(2)).await.unwrap();

        store.clear_all().await.unwrap();

        assert!(store.list().await.unwrap().is_empty());
        assert!(store.identity().await.unwrap().is_none());
        assert_ne!(store.device_identity().await.unwrap(), identity);
    }

    #[tokio::test]
    async fn test_export_then_import_into_fresh_store() {
        let temp_dir = TempDir::new().unwrap();
        let export_path = temp_dir.path().join("export.json");

        let source = SqliteCredentialStore::open_in_memory().unwrap();
        let identity = source.device_identity().await.unwrap();
        source.put_certificate("pc", cert(7)).await.unwrap();
        source.put_certificate("laptop", cert(9)).await.unwrap();
        assert_eq!(source.export(&export_path).await.unwrap(), 2);

        let target = SqliteCredentialStore::open_in_memory().unwrap();
        assert_eq!(target.import(&export_path).await.unwrap(), 2);

        assert_eq!(target.identity().await.unwrap(), Some(identity));
        assert_eq!(target.certificate("pc").await.unwrap(), Some(cert(7)));
        assert_eq!(target.certificate("laptop").await.unwrap(), Some(cert(9)));
    }

    #[tokio::test]
    async fn test_import_rejects_fingerprint_mismatch() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("tampered.json");
        std::fs::write(
            &path,
            serde_json::json!({
                "identity": null,
                "certificates": [{
                    "host": "pc",
                    "certificate": BASE64.encode([1u8, 2, 3]),
                    "fingerprint": "00",
                    "pinned_at": "2024-01-01T00:00:00+00:00"
                }]
            })
            .to_string(),
        )
        .unwrap();

        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(matches!(
            store.import(&path).await,
            Err(CredentialError::Corrupt(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_import_rejects_garbage() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("garbage.json");
        std::fs::write(&path, "not json").unwrap();

        let store = SqliteCredentialStore::open_in_memory().unwrap();
        assert!(matches!(
            store.import(&path).await,
            Err(CredentialError::Serialization(_))
        ));
    }

    #[test]
    fn test_error_maps_to_store_error() {
        assert_eq!(
            StoreError::from(CredentialError::NotFound("pc".into())),
            StoreError::NotFound("pc".into())
        );
        assert!(matches!(
            StoreError::from(CredentialError::Corrupt("x".into())),
            StoreError::DataCorruption(_)
        ));
    }
}
