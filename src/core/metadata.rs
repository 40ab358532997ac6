/// Bundle metadata record (`backup_info.txt`)
///
/// Plain `Key: value` lines so an operator can read it with `cat`.

use std::fs;
use std::path::Path;

use chrono::{DateTime, Local};

use crate::core::error::Result;

pub const KEY_DATE: &str = "Backup Date";
pub const KEY_DATABASE: &str = "Database";
pub const KEY_ODOO_VERSION: &str = "Odoo Version";
pub const KEY_KIND: &str = "Backup Type";
pub const KEY_DUMP_SHA256: &str = "Dump SHA256";
pub const KEY_TOOL_VERSION: &str = "Tool Version";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupKind {
    Full,
}

impl BackupKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackupKind::Full => "full",
        }
    }
}

/// Ordered key-value record; unknown keys survive a read/write cycle
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BackupInfo {
    entries: Vec<(String, String)>,
}

impl BackupInfo {
    pub fn new(
        created: DateTime<Local>,
        database: &str,
        odoo_version: &str,
        kind: BackupKind,
        dump_sha256: &str,
    ) -> Self {
        let mut info = Self::default();
        info.set(KEY_DATE, created.to_rfc3339());
        info.set(KEY_DATABASE, database);
        info.set(KEY_ODOO_VERSION, odoo_version);
        info.set(KEY_KIND, kind.as_str());
        info.set(KEY_DUMP_SHA256, dump_sha256);
        info.set(KEY_TOOL_VERSION, env!("CARGO_PKG_VERSION"));
        info
    }

    pub fn parse(content: &str) -> Self {
        let mut info = Self::default();
        for line in content.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            if let Some((key, value)) = line.split_once(':') {
                info.set(key.trim(), value.trim());
            }
        }
        info
    }

    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        Ok(Self::parse(&fs::read_to_string(path)?))
    }

    pub fn write<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        fs::write(path, self.render())?;
        Ok(())
    }

    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
            .filter(|v| !v.is_empty())
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        if let Some(entry) = self.entries.iter_mut().find(|(k, _)| *k == key) {
            entry.1 = value;
        } else {
            self.entries.push((key, value));
        }
    }

    pub fn database(&self) -> Option<&str> {
        self.get(KEY_DATABASE)
    }

    pub fn dump_sha256(&self) -> Option<&str> {
        self.get(KEY_DUMP_SHA256)
    }

    pub fn entries(&self) -> impl Iterator<Item = (&str, &str)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }
}
