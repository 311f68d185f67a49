use std::fs::{self, File};
use std::io::{BufRead, BufReader, Cursor, Write};
use std::path::{Path, PathBuf};
use anyhow::{bail, Context, Result};
use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use shared::protocol::{
    DISCOVERY_BACKUP_FILE, DISCOVERY_CODE_VERSION, DISCOVERY_FILE, MAX_RATING, TEMPORARY_SUFFIX,
};
use shared::types::{Network, NetworkType, ServiceKind};
use crate::discovery::service::ServiceRecord;

/// Where a successful load came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadSource {
    Primary,
    Backup,
}

/// On-disk home of the service list: a primary file plus a backup that
/// lags one generation behind.
#[derive(Debug, Clone)]
pub struct DiscoveryStore {
    primary: PathBuf,
    backup: PathBuf,
}

impl DiscoveryStore {
    pub fn new(data_path: impl AsRef<Path>) -> Self {
        let data_path = data_path.as_ref();
        Self {
            primary: data_path.join(DISCOVERY_FILE),
            backup: data_path.join(DISCOVERY_BACKUP_FILE),
        }
    }

    pub fn primary_path(&self) -> &Path {
        &self.primary
    }

    pub fn backup_path(&self) -> &Path {
        &self.backup
    }

    /// Write all records, replacing the primary file atomically.
    pub fn save(&self, records: &[ServiceRecord]) -> Result<()> {
        if let Some(parent) = self.primary.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }

        let temporary = with_suffix(&self.backup, TEMPORARY_SUFFIX);
        if temporary.exists() {
            fs::remove_file(&temporary)
                .with_context(|| format!("Failed to remove stale temporary file: {}", temporary.display()))?;
        }

        let bytes = encode(records).context("Failed to serialize discovery services")?;
        write_synced(&temporary, &bytes)?;

        let had_primary = self.primary.exists();
        if had_primary {
            if let Err(e) = self.refresh_backup() {
                tracing::warn!("Could not back up {}: {:#}", self.primary.display(), e);
            }
        }

        fs::rename(&temporary, &self.primary)
            .with_context(|| format!("Failed to replace data file: {}", self.primary.display()))?;

        if !had_primary {
            if let Err(e) = self.refresh_backup() {
                tracing::warn!("Could not create initial backup {}: {:#}", self.backup.display(), e);
            }
        }

        Ok(())
    }

    /// Copy the current primary over the backup via a temporary file.
    fn refresh_backup(&self) -> Result<()> {
        let staging = with_suffix(&self.backup, ".new");
        fs::copy(&self.primary, &staging)
            .with_context(|| format!("Failed to copy {} to {}", self.primary.display(), staging.display()))?;
        fs::rename(&staging, &self.backup)
            .with_context(|| format!("Failed to replace backup file: {}", self.backup.display()))?;
        Ok(())
    }

    /// Load the primary file, falling back to the backup.
    pub fn load(&self) -> Result<(Vec<ServiceRecord>, LoadSource)> {
        match read_file(&self.primary) {
            Ok(records) => return Ok((records, LoadSource::Primary)),
            Err(e) => tracing::warn!(
                "Failed to load discovery services from primary file, switching to backup {}: {:#}",
                self.backup.display(),
                e
            ),
        }

        let records = read_file(&self.backup)?;
        Ok((records, LoadSource::Backup))
    }
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

fn write_synced(path: &Path, bytes: &[u8]) -> Result<()> {
    let mut file = File::create(path)
        .with_context(|| format!("Failed to open data file for write: {}", path.display()))?;
    file.write_all(bytes)
        .with_context(|| format!("Failed to write data file: {}", path.display()))?;
    file.sync_all()
        .with_context(|| format!("Failed to sync data file: {}", path.display()))?;
    Ok(())
}

fn read_file(path: &Path) -> Result<Vec<ServiceRecord>> {
    let bytes = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    decode(&bytes).with_context(|| format!("Failed to parse {}", path.display()))
}

/// `{ version: u16, count: u32, count x record }`
pub fn encode(records: &[ServiceRecord]) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    buf.write_u16::<BigEndian>(DISCOVERY_CODE_VERSION)?;
    buf.write_u32::<BigEndian>(records.len() as u32)?;
    for record in records {
        record.write_to(&mut buf)?;
    }
    Ok(buf)
}

pub fn decode(bytes: &[u8]) -> Result<Vec<ServiceRecord>> {
    let mut cursor = Cursor::new(bytes);
    let version = cursor.read_u16::<BigEndian>().context("Missing version tag")?;
    let count = cursor.read_u32::<BigEndian>().context("Missing service count")?;

    let mut records = Vec::new();
    for index in 0..count {
        let record = ServiceRecord::read_from(&mut cursor, version)
            .with_context(|| format!("Corrupt service record {} of {}", index + 1, count))?;
        records.push(record);
    }

    if (cursor.position() as usize) != bytes.len() {
        bail!("{} trailing bytes after {} records", bytes.len() - cursor.position() as usize, count);
    }

    Ok(records)
}

/// A service seeded from the bundled defaults file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DefaultService {
    pub url: String,
    pub kind: ServiceKind,
    pub networks: NetworkType,
    pub rating: u8,
    /// Permanently blocked entry
    pub banned: bool,
}

/// Parse the line-oriented defaults file. The first character is the type
/// code and the URL starts at offset 2.
pub fn parse_defaults(reader: impl BufRead) -> Result<Vec<DefaultService>> {
    let mut services = Vec::new();

    for line in reader.lines() {
        let line = line.context("Failed to read default services")?;
        let line = line.trim_end();

        if line.chars().count() < 7 {
            continue;
        }

        let mut chars = line.chars();
        let code = chars.next();
        let url: String = chars.skip(1).collect();

        let service = match code {
            Some('2') | Some('M') => DefaultService {
                url,
                kind: ServiceKind::Gwc,
                networks: Network::G2.into(),
                rating: MAX_RATING,
                banned: false,
            },
            Some('X') => DefaultService {
                url,
                kind: ServiceKind::Null,
                networks: NetworkType::NULL,
                rating: 0,
                banned: true,
            },
            // '1' (Gnutella), 'D' (eDonkey), 'U' (UDP bootstrap) and comments
            _ => continue,
        };
        services.push(service);
    }

    Ok(services)
}

pub fn load_defaults(path: impl AsRef<Path>) -> Result<Vec<DefaultService>> {
    let path = path.as_ref();
    let file = File::open(path).with_context(|| format!("Could not open file: {}", path.display()))?;
    parse_defaults(BufReader::new(file))
}
