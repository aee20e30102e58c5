use std::io::Write;
use std::path::{Path, PathBuf};

use futures::future::{BoxFuture, FutureExt};
use log::debug;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::{DeliveryError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InvoiceStatus {
    Draft,
    // Older files were written with "send".
    #[serde(alias = "send")]
    Sent,
}

/// Invoice as seen by the delivery pipeline.
///
/// Only `id` and `status` are typed. Every other field is carried through
/// untouched so that saving never rewrites what the pipeline does not own.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Invoice {
    pub id: String,
    pub status: InvoiceStatus,
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

/// Invoice persistence collaborator.
pub trait InvoiceRepository: Send + Sync {
    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Invoice>>;

    fn save<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, Result<()>>;
}

/// One `<id>.json` file per invoice.
pub struct FileInvoiceRepository {
    dir: PathBuf,
}

impl FileInvoiceRepository {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        FileInvoiceRepository { dir: dir.into() }
    }

    fn path_for(&self, id: &str) -> Result<PathBuf> {
        validate_id(id)?;
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

impl InvoiceRepository for FileInvoiceRepository {
    fn load<'a>(&'a self, id: &'a str) -> BoxFuture<'a, Result<Invoice>> {
        async move {
            let path = self.path_for(id)?;
            debug!("Loading invoice {} from {}", id, path.display());

            let data = tokio::fs::read(&path).await.map_err(|e| {
                DeliveryError::Persist(format!("failed to read invoice file '{}': {}", path.display(), e))
            })?;
            serde_json::from_slice(&data)
                .map_err(|e| DeliveryError::Persist(format!("failed to parse invoice '{}': {}", id, e)))
        }
        .boxed()
    }

    fn save<'a>(&'a self, invoice: &'a Invoice) -> BoxFuture<'a, Result<()>> {
        async move {
            let path = self.path_for(&invoice.id)?;
            let data = serde_json::to_vec_pretty(invoice).map_err(|e| {
                DeliveryError::Persist(format!("failed to marshal invoice '{}': {}", invoice.id, e))
            })?;

            let dir = self.dir.clone();
            tokio::task::spawn_blocking(move || write_atomically(&dir, &path, &data))
                .await
                .map_err(|e| DeliveryError::Persist(format!("invoice writer task failed: {}", e)))?
        }
        .boxed()
    }
}

/// Ids end up in file names, so only a conservative alphabet is accepted.
pub fn validate_id(id: &str) -> Result<()> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(DeliveryError::InvalidRequest(format!("malformed identifier '{}'", id)))
    }
}

/// Writes `data` to a temporary file in `dir` and renames it over `path`.
pub(crate) fn write_atomically(dir: &Path, path: &Path, data: &[u8]) -> Result<()> {
    let persist_err = |e: std::io::Error| {
        DeliveryError::Persist(format!("failed to write '{}': {}", path.display(), e))
    };

    std::fs::create_dir_all(dir).map_err(persist_err)?;
    let mut file = tempfile::NamedTempFile::new_in(dir).map_err(persist_err)?;
    file.write_all(data).map_err(persist_err)?;
    file.as_file().sync_all().map_err(persist_err)?;
    file.persist(path).map_err(|e| persist_err(e.error))?;
    Ok(())
}
