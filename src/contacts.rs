use crate::address::normalize;
use serde::{Deserialize, Serialize};
use std::io::Read;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Contact {
    pub email: String,
    pub name: String,
    pub organization: String,
}

impl Contact {
    /// Ledger key for this contact
    pub fn key(&self) -> String {
        normalize(&self.email)
    }
}

/// Header names used to pull contact fields out of the CSV.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContactColumns {
    pub email: String,
    pub name: String,
    pub organization: String,
}

impl Default for ContactColumns {
    fn default() -> Self {
        Self {
            email: "School Email Address".to_string(),
            name: "School Principal".to_string(),
            organization: "School Name".to_string(),
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ContactError {
    #[error("Contact source not found: {0}")]
    NotFound(PathBuf),
    #[error("Contact source is missing required column '{0}'")]
    MissingColumn(String),
    #[error("Failed to read contact source")]
    Csv(#[from] csv::Error),
    #[error("Failed to open contact source")]
    Io(#[from] std::io::Error),
}

pub fn load_contacts<P: AsRef<Path>>(
    path: P,
    columns: &ContactColumns,
) -> Result<Vec<Contact>, ContactError> {
    let path = path.as_ref();
    if !path.exists() {
        return Err(ContactError::NotFound(path.to_path_buf()));
    }
    let file = std::fs::File::open(path)?;
    let contacts = read_contacts(file, columns)?;
    log::info!("📇 Loaded {} contacts from {}", contacts.len(), path.display());
    Ok(contacts)
}

/// Parse contacts from CSV with a header row. Rows keep their source order;
/// rows with an empty address are dropped. The name and organization
/// columns are optional.
pub fn read_contacts<R: Read>(reader: R, columns: &ContactColumns) -> Result<Vec<Contact>, ContactError> {
    let mut csv_reader = csv::ReaderBuilder::new()
        .flexible(true)
        .trim(csv::Trim::All)
        .from_reader(reader);

    let headers = csv_reader.headers()?.clone();
    let position = |name: &str| headers.iter().position(|h| h.eq_ignore_ascii_case(name));

    let email_idx = position(&columns.email).ok_or_else(|| ContactError::MissingColumn(columns.email.clone()))?;
    let name_idx = position(&columns.name);
    let organization_idx = position(&columns.organization);
    if name_idx.is_none() {
        log::warn!("Contact source has no '{}' column; names default to empty", columns.name);
    }

    let mut contacts = Vec::new();
    for record in csv_reader.records() {
        let record = record?;
        let field = |idx: Option<usize>| {
            idx.and_then(|i| record.get(i))
                .unwrap_or("")
                .trim()
                .to_string()
        };

        let email = field(Some(email_idx));
        if email.is_empty() {
            continue;
        }
        contacts.push(Contact {
            email,
            name: field(name_idx),
            organization: field(organization_idx),
        });
    }

    Ok(contacts)
}
