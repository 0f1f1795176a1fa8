use std::fmt;
use std::str::FromStr;

use chrono::NaiveDateTime;
use ring::digest::{SHA256, digest};
use serde::{Deserialize, Serialize};

use crate::operation::ChangeOperation;
use crate::validation::IdentifierValidator;
use crate::{Error, Result};

const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Sortable migration identifier: a `YYYYMMDDHHMMSS` timestamp plus an
/// optional `-N` sequence number for migrations authored in the same second.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MigrationId {
    timestamp: u64,
    seq: u32,
}

impl MigrationId {
    pub fn new(timestamp: NaiveDateTime, seq: u32) -> Self {
        let timestamp = timestamp
            .format(TIMESTAMP_FORMAT)
            .to_string()
            .parse()
            .unwrap_or_default();
        Self { timestamp, seq }
    }

    pub fn timestamp(&self) -> Option<NaiveDateTime> {
        NaiveDateTime::parse_from_str(&format!("{:014}", self.timestamp), TIMESTAMP_FORMAT).ok()
    }

    pub fn seq(&self) -> u32 {
        self.seq
    }
}

impl fmt::Display for MigrationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.seq == 0 {
            write!(f, "{:014}", self.timestamp)
        } else {
            write!(f, "{:014}-{}", self.timestamp, self.seq)
        }
    }
}

impl FromStr for MigrationId {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (stamp, seq) = match s.split_once('-') {
            Some((stamp, seq)) => (stamp, Some(seq)),
            None => (s, None),
        };

        if stamp.len() != 14 || !stamp.bytes().all(|b| b.is_ascii_digit()) {
            return Err(Error::InvalidMigration(format!(
                "migration id {s:?} must start with a YYYYMMDDHHMMSS timestamp"
            )));
        }
        NaiveDateTime::parse_from_str(stamp, TIMESTAMP_FORMAT).map_err(|e| {
            Error::InvalidMigration(format!("migration id {s:?} has an invalid timestamp: {e}"))
        })?;

        let seq = match seq {
            None => 0,
            Some(raw) => match raw.parse::<u32>() {
                Ok(n) if n > 0 && !raw.starts_with('0') => n,
                _ => {
                    return Err(Error::InvalidMigration(format!(
                        "migration id {s:?} has an invalid sequence suffix"
                    )));
                }
            },
        };

        let timestamp = stamp
            .parse()
            .map_err(|_| Error::InvalidMigration(format!("migration id {s:?} is out of range")))?;
        Ok(Self { timestamp, seq })
    }
}

impl TryFrom<String> for MigrationId {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        value.parse()
    }
}

impl From<MigrationId> for String {
    fn from(id: MigrationId) -> Self {
        id.to_string()
    }
}

/// One versioned change unit. Immutable once authored.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Migration {
    pub id: MigrationId,
    pub name: String,
    pub up: Vec<ChangeOperation>,
    pub down: Vec<ChangeOperation>,
}

impl Migration {
    pub fn new(
        id: MigrationId,
        name: impl Into<String>,
        up: Vec<ChangeOperation>,
        down: Vec<ChangeOperation>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            up,
            down,
        }
    }

    /// Replace `down` with the inverse of `up`, walked in reverse.
    ///
    /// Fails when any `up` operation has no structural inverse (raw
    /// statements, seed rows, drops, alterations).
    pub fn with_derived_down(mut self) -> Result<Self> {
        let mut down = Vec::with_capacity(self.up.len());
        for (index, op) in self.up.iter().enumerate().rev() {
            let inverse = op.inverse().ok_or_else(|| {
                Error::InvalidMigration(format!(
                    "migration {} ({}): operation {index} ({}) cannot be reversed automatically; \
                     write an explicit down sequence",
                    self.id,
                    self.name,
                    op.kind()
                ))
            })?;
            down.push(inverse);
        }
        self.down = down;
        Ok(self)
    }

    pub fn validate(&self) -> Result<()> {
        IdentifierValidator::validate_migration_name(&self.name)?;
        for (index, op) in self.up.iter().chain(self.down.iter()).enumerate() {
            op.validate().map_err(|e| {
                Error::InvalidMigration(format!(
                    "migration {} ({}) operation {index}: {e}",
                    self.id, self.name
                ))
            })?;
        }
        Ok(())
    }

    /// SHA-256 over the canonical JSON form of the migration, lowercase hex.
    pub fn checksum(&self) -> Result<String> {
        let canonical = serde_json::to_vec(self)?;
        let hash = digest(&SHA256, &canonical);
        Ok(hash.as_ref().iter().map(|b| format!("{b:02x}")).collect())
    }
}
