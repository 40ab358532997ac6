/// PostgreSQL archive header reader
///
/// `pg_dump -Fc` writes a self-describing header before the table of
/// contents. It records the archive version, the integer width used for the
/// rest of the file, the creation time and the name of the dumped database.
/// Reading it needs no server, so a bundle can be cross-checked before any
/// destructive step.
///
/// Layout (all integers are a sign byte followed by `int_size` little-endian
/// magnitude bytes, strings are an integer length followed by raw bytes):
///
/// ```text
/// "PGDMP" vmaj vmin [vrev] int_size [off_size] format
/// compression            (byte from 1.15, int from 1.4, byte before)
/// sec min hour mday mon year isdst dbname   (from 1.4)
/// server_version pg_dump_version            (from 1.10)
/// ```

use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use chrono::{NaiveDate, NaiveDateTime};
use thiserror::Error;

const MAGIC: &[u8; 5] = b"PGDMP";

#[derive(Error, Debug)]
pub enum DumpHeaderError {
    #[error("not a PostgreSQL custom-format archive")]
    BadMagic,

    #[error("unsupported archive version {0}.{1}.{2}")]
    UnsupportedVersion(u8, u8, u8),

    #[error("unsupported integer size {0}")]
    BadIntSize(u8),

    #[error("header is truncated")]
    Truncated,

    #[error("failed to read dump: {0}")]
    Io(#[from] io::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpFormat {
    Custom,
    Tar,
    Directory,
    Other(u8),
}

impl From<u8> for DumpFormat {
    fn from(b: u8) -> Self {
        match b {
            1 => DumpFormat::Custom,
            3 => DumpFormat::Tar,
            5 => DumpFormat::Directory,
            other => DumpFormat::Other(other),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpHeader {
    pub version: (u8, u8, u8),
    pub int_size: u8,
    pub off_size: u8,
    pub format: DumpFormat,
    pub created: Option<NaiveDateTime>,
    pub dbname: Option<String>,
    pub server_version: Option<String>,
    pub pg_dump_version: Option<String>,
}

impl DumpHeader {
    pub fn read_file<P: AsRef<Path>>(path: P) -> Result<Self, DumpHeaderError> {
        let file = File::open(path.as_ref())?;
        Self::read_from(BufReader::new(file))
    }

    pub fn read_from<R: Read>(reader: R) -> Result<Self, DumpHeaderError> {
        HeaderReader::new(reader).read()
    }

    /// Database name recorded by pg_dump, if the archive carries one
    pub fn catalog_name(&self) -> Option<&str> {
        self.dbname.as_deref().filter(|n| !n.is_empty())
    }
}

/// Archive versions are compared as one packed number like pg_dump does
fn packed(major: u8, minor: u8, rev: u8) -> u32 {
    ((major as u32) << 16) | ((minor as u32) << 8) | rev as u32
}

struct HeaderReader<R> {
    inner: R,
    version: u32,
    int_size: u8,
}

impl<R: Read> HeaderReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            version: 0,
            int_size: 4,
        }
    }

    fn byte(&mut self) -> Result<u8, DumpHeaderError> {
        let mut b = [0u8; 1];
        self.inner.read_exact(&mut b).map_err(eof_as_truncated)?;
        Ok(b[0])
    }

    fn int(&mut self) -> Result<i64, DumpHeaderError> {
        let negative = if self.version > packed(1, 0, 0) {
            self.byte()? != 0
        } else {
            false
        };

        let mut value: i64 = 0;
        for shift in 0..self.int_size {
            let b = self.byte()? as i64;
            if shift < 8 {
                value |= b << (8 * shift as u32);
            }
        }

        Ok(if negative { -value } else { value })
    }

    fn string(&mut self) -> Result<Option<String>, DumpHeaderError> {
        let len = self.int()?;
        if len < 0 {
            return Ok(None);
        }
        // Header strings are names and version banners; anything huge is garbage
        if len > 4096 {
            return Err(DumpHeaderError::Truncated);
        }
        let mut buf = vec![0u8; len as usize];
        self.inner.read_exact(&mut buf).map_err(eof_as_truncated)?;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }

    fn read(mut self) -> Result<DumpHeader, DumpHeaderError> {
        let mut magic = [0u8; 5];
        self.inner.read_exact(&mut magic).map_err(eof_as_truncated)?;
        if &magic != MAGIC {
            return Err(DumpHeaderError::BadMagic);
        }

        let vmaj = self.byte()?;
        let vmin = self.byte()?;
        let vrev = if vmaj > 1 || (vmaj == 1 && vmin > 0) {
            self.byte()?
        } else {
            0
        };
        if vmaj != 1 {
            return Err(DumpHeaderError::UnsupportedVersion(vmaj, vmin, vrev));
        }
        self.version = packed(vmaj, vmin, vrev);

        let int_size = self.byte()?;
        if !(1..=8).contains(&int_size) {
            return Err(DumpHeaderError::BadIntSize(int_size));
        }
        self.int_size = int_size;

        let off_size = if self.version >= packed(1, 7, 0) {
            self.byte()?
        } else {
            int_size
        };
        let format = DumpFormat::from(self.byte()?);

        if self.version >= packed(1, 15, 0) {
            self.byte()?;
        } else if self.version >= packed(1, 4, 0) {
            self.int()?;
        } else if self.version >= packed(1, 2, 0) {
            self.byte()?;
        }

        let mut created = None;
        let mut dbname = None;
        if self.version >= packed(1, 4, 0) {
            let sec = self.int()?;
            let min = self.int()?;
            let hour = self.int()?;
            let mday = self.int()?;
            let mon = self.int()?;
            let year = self.int()?;
            let _isdst = self.int()?;
            dbname = self.string()?;
            created = tm_to_datetime(sec, min, hour, mday, mon, year);
        }

        let (server_version, pg_dump_version) = if self.version >= packed(1, 10, 0) {
            (self.string()?, self.string()?)
        } else {
            (None, None)
        };

        Ok(DumpHeader {
            version: (vmaj, vmin, vrev),
            int_size,
            off_size,
            format,
            created,
            dbname,
            server_version,
            pg_dump_version,
        })
    }
}

fn eof_as_truncated(e: io::Error) -> DumpHeaderError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        DumpHeaderError::Truncated
    } else {
        DumpHeaderError::Io(e)
    }
}

/// `struct tm` fields: years since 1900, months from 0
fn tm_to_datetime(sec: i64, min: i64, hour: i64, mday: i64, mon: i64, year: i64) -> Option<NaiveDateTime> {
    let date = NaiveDate::from_ymd_opt(
        i32::try_from(year + 1900).ok()?,
        u32::try_from(mon + 1).ok()?,
        u32::try_from(mday).ok()?,
    )?;
    date.and_hms_opt(
        u32::try_from(hour).ok()?,
        u32::try_from(min).ok()?,
        u32::try_from(sec).ok()?,
    )
}
