//! Resource source statement log.
//!
//! A [`ResourceSource`] is the ordered history of property edits for one
//! resource id. Statements are only ever appended; insertion order is the
//! chronology and ticks never decrease along it.
//!
//! Two persisted encodings carry the same sequence.
//!
//! Text:
//! ```text
//! resource <uuid>
//! <tick> <platform-hex16> SET <key-hex16> <len> <len raw bytes>
//! <tick> <platform-hex16> UNSET <key-hex16>
//! <tick> <platform-hex16> BLOB <key-hex16> <checksum-hex64> <size>
//! ```
//!
//! Binary (all integers little-endian):
//! ```text
//! 0x00  4   "RSRC" magic
//! 0x04  1   version (u8) = 1
//! 0x05  3   reserved (must be 0)
//! 0x08  16  resource uuid
//! 0x18  ... records: tick u64, platform u64, op u8, key u64, payload
//!           SET payload:  len u64, bytes
//!           BLOB payload: checksum [u8; 32], size u64
//! ```

use crate::error::{Error, Result};
use crate::hash::{HASH_SIZE, Hash, KeyHash};
use crate::platform::Platform;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::Write;
use std::path::Path;
use uuid::Uuid;

/// Logical time attached to each statement.
pub type Tick = u64;

/// Magic bytes at the start of a binary source.
pub const MAGIC: &[u8; 4] = b"RSRC";

/// Current binary format version.
pub const VERSION: u8 = 1;

/// Size of the binary header in bytes.
pub const HEADER_SIZE: usize = 24;

const TEXT_HEADER: &str = "resource";

/// Statement kinds, as stored in the op byte and text op field.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Op {
    Set = 1,
    Unset = 2,
    Blob = 3,
}

impl Op {
    /// Convert to byte representation.
    pub fn to_u8(self) -> u8 {
        self as u8
    }

    /// Parse from byte representation.
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Op::Set),
            2 => Some(Op::Unset),
            3 => Some(Op::Blob),
            _ => None,
        }
    }

    /// Text form of the op.
    pub fn as_str(&self) -> &'static str {
        match self {
            Op::Set => "SET",
            Op::Unset => "UNSET",
            Op::Blob => "BLOB",
        }
    }

    fn parse(s: &str) -> Option<Self> {
        match s {
            "SET" => Some(Op::Set),
            "UNSET" => Some(Op::Unset),
            "BLOB" => Some(Op::Blob),
            _ => None,
        }
    }
}

/// A single edit in a resource's history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Statement {
    /// Set a property to a value.
    SetValue {
        tick: Tick,
        key: KeyHash,
        platform: Platform,
        value: Vec<u8>,
    },
    /// Tombstone: the property has no value at this platform as of `tick`.
    Unset {
        tick: Tick,
        key: KeyHash,
        platform: Platform,
    },
    /// Set a property to a blob held in the blob store.
    SetBlob {
        tick: Tick,
        key: KeyHash,
        platform: Platform,
        checksum: Hash,
        size: u64,
    },
}

impl Statement {
    pub fn tick(&self) -> Tick {
        match self {
            Statement::SetValue { tick, .. }
            | Statement::Unset { tick, .. }
            | Statement::SetBlob { tick, .. } => *tick,
        }
    }

    pub fn key(&self) -> KeyHash {
        match self {
            Statement::SetValue { key, .. }
            | Statement::Unset { key, .. }
            | Statement::SetBlob { key, .. } => *key,
        }
    }

    pub fn platform(&self) -> Platform {
        match self {
            Statement::SetValue { platform, .. }
            | Statement::Unset { platform, .. }
            | Statement::SetBlob { platform, .. } => *platform,
        }
    }

    pub fn op(&self) -> Op {
        match self {
            Statement::SetValue { .. } => Op::Set,
            Statement::Unset { .. } => Op::Unset,
            Statement::SetBlob { .. } => Op::Blob,
        }
    }

    /// The value this statement gives its key, or None for a tombstone.
    pub fn resolved(&self) -> Option<Resolved<'_>> {
        match self {
            Statement::SetValue { value, .. } => Some(Resolved::Value(value.as_slice())),
            Statement::Unset { .. } => None,
            Statement::SetBlob { checksum, size, .. } => Some(Resolved::Blob {
                checksum: *checksum,
                size: *size,
            }),
        }
    }
}

/// Result of resolving a property.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolved<'a> {
    /// An inline value.
    Value(&'a [u8]),
    /// A reference to a stored blob.
    Blob { checksum: Hash, size: u64 },
}

impl<'a> Resolved<'a> {
    /// The inline value as UTF-8, if it is one.
    pub fn as_str(&self) -> Option<&'a str> {
        match self {
            Resolved::Value(value) => std::str::from_utf8(value).ok(),
            Resolved::Blob { .. } => None,
        }
    }
}

/// Persisted encoding of a source.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Encoding {
    Text,
    Binary,
}

impl Encoding {
    /// Detect the encoding of persisted data by its leading magic.
    pub fn detect(data: &[u8]) -> Self {
        if data.starts_with(MAGIC) {
            Encoding::Binary
        } else {
            Encoding::Text
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Encoding::Text => "text",
            Encoding::Binary => "binary",
        }
    }
}

/// The statement history of one resource.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceSource {
    id: Uuid,
    statements: Vec<Statement>,
}

impl ResourceSource {
    /// Create an empty log for a resource.
    pub fn new(id: Uuid) -> Self {
        Self {
            id,
            statements: Vec::new(),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn statements(&self) -> &[Statement] {
        &self.statements
    }

    pub fn len(&self) -> usize {
        self.statements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.statements.is_empty()
    }

    /// Tick of the most recently appended statement.
    pub fn last_tick(&self) -> Option<Tick> {
        self.statements.last().map(Statement::tick)
    }

    /// Append a statement, enforcing non-decreasing ticks.
    pub fn append(&mut self, statement: Statement) -> Result<()> {
        if let Some(last) = self.last_tick()
            && statement.tick() < last
        {
            return Err(Error::TickOrder {
                tick: statement.tick(),
                last,
            });
        }
        tracing::debug!(
            id = %self.id,
            tick = statement.tick(),
            key = %statement.key(),
            platform = %statement.platform(),
            op = statement.op().as_str(),
            "append statement"
        );
        self.statements.push(statement);
        Ok(())
    }

    /// Append a `SetValue` statement.
    pub fn set(
        &mut self,
        tick: Tick,
        key: KeyHash,
        platform: Platform,
        value: impl Into<Vec<u8>>,
    ) -> Result<()> {
        self.append(Statement::SetValue {
            tick,
            key,
            platform,
            value: value.into(),
        })
    }

    /// Append an `Unset` tombstone.
    pub fn unset(&mut self, tick: Tick, key: KeyHash, platform: Platform) -> Result<()> {
        self.append(Statement::Unset {
            tick,
            key,
            platform,
        })
    }

    /// Append a `SetBlob` statement.
    ///
    /// The blob must already be durably written; existence is not checked.
    pub fn set_blob(
        &mut self,
        tick: Tick,
        key: KeyHash,
        platform: Platform,
        checksum: Hash,
        size: u64,
    ) -> Result<()> {
        self.append(Statement::SetBlob {
            tick,
            key,
            platform,
            checksum,
            size,
        })
    }

    /// Latest statement for an exact `(key, platform)` pair.
    ///
    /// Ties on tick go to the later insertion.
    fn latest(&self, key: KeyHash, platform: Platform) -> Option<&Statement> {
        self.statements
            .iter()
            .filter(|s| s.key() == key && s.platform() == platform)
            .max_by_key(|s| s.tick())
    }

    /// Resolve a property for a platform.
    ///
    /// Tiers are tried from `platform` down to the generic platform. In each
    /// tier the latest statement wins; a tombstone leaves the tier empty and
    /// resolution moves on to the next tier. More specific tiers than the
    /// requested one are never consulted.
    pub fn resolve(&self, key: KeyHash, platform: Platform) -> Option<Resolved<'_>> {
        self.resolve_statement(key, platform)
            .and_then(Statement::resolved)
    }

    /// The statement [`ResourceSource::resolve`] takes its result from.
    pub fn resolve_statement(&self, key: KeyHash, platform: Platform) -> Option<&Statement> {
        platform.fallback_chain().find_map(|tier| {
            self.latest(key, tier)
                .filter(|statement| statement.op() != Op::Unset)
        })
    }

    /// Distinct keys in the log, in first-seen order.
    pub fn keys(&self) -> Vec<KeyHash> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .map(Statement::key)
            .filter(|key| seen.insert(*key))
            .collect()
    }

    /// Distinct platforms a key has statements for, in first-seen order.
    pub fn platforms(&self, key: KeyHash) -> Vec<Platform> {
        let mut seen = HashSet::new();
        self.statements
            .iter()
            .filter(|s| s.key() == key)
            .map(Statement::platform)
            .filter(|platform| seen.insert(*platform))
            .collect()
    }

    /// Checksums of all blobs referenced by the log.
    pub fn referenced_blobs(&self) -> HashSet<Hash> {
        self.statements
            .iter()
            .filter_map(|s| match s {
                Statement::SetBlob { checksum, .. } => Some(*checksum),
                _ => None,
            })
            .collect()
    }

    /// Keep only the latest statement per `(key, platform)`, dropping pairs
    /// whose latest statement is a tombstone.
    ///
    /// Survivors keep their relative order. Returns the number of statements
    /// removed.
    pub fn collapse_history(&mut self) -> usize {
        let mut winners: HashMap<(KeyHash, Platform), usize> = HashMap::new();
        for (index, statement) in self.statements.iter().enumerate() {
            let slot = (statement.key(), statement.platform());
            let replace = match winners.get(&slot) {
                Some(&current) => statement.tick() >= self.statements[current].tick(),
                None => true,
            };
            if replace {
                winners.insert(slot, index);
            }
        }

        let keep: HashSet<usize> = winners
            .into_values()
            .filter(|&index| self.statements[index].op() != Op::Unset)
            .collect();

        let before = self.statements.len();
        let statements = std::mem::take(&mut self.statements);
        self.statements = statements
            .into_iter()
            .enumerate()
            .filter(|(index, _)| keep.contains(index))
            .map(|(_, statement)| statement)
            .collect();

        let removed = before - self.statements.len();
        tracing::info!(id = %self.id, removed, remaining = self.statements.len(), "collapsed history");
        removed
    }

    /// Load a source from a file.
    ///
    /// A missing or empty file yields an empty log. Malformed content fails
    /// with a parse error; see [`ResourceSource::read_lenient`] to salvage.
    pub fn read(id: Uuid, path: &Path) -> Result<Self> {
        match Self::read_lenient(id, path)? {
            (_, Some(err)) => Err(err),
            (source, None) => Ok(source),
        }
    }

    /// Load a source, keeping every statement parsed before the first error.
    pub fn read_lenient(id: Uuid, path: &Path) -> Result<(Self, Option<Error>)> {
        let data = match fs::read(path) {
            Ok(data) => data,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::debug!(%id, path = %path.display(), "no persisted source");
                return Ok((Self::new(id), None));
            }
            Err(err) => return Err(err.into()),
        };
        if data.is_empty() {
            return Ok((Self::new(id), None));
        }

        let (source, err) = Self::decode_lenient(&data)?;
        if source.id != id {
            return Err(Error::parse(
                path.display().to_string(),
                format!("source holds resource {}, expected {}", source.id, id),
            ));
        }
        tracing::debug!(
            %id,
            statements = source.len(),
            encoding = Encoding::detect(&data).as_str(),
            "read source"
        );
        Ok((source, err))
    }

    /// Write the source atomically using tempfile.
    pub fn write(&self, path: &Path, encoding: Encoding) -> Result<()> {
        let parent = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        fs::create_dir_all(parent)?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent)?;
        temp_file.write_all(&self.encode(encoding))?;
        temp_file.flush()?;
        temp_file.persist(path)?;

        tracing::info!(
            id = %self.id,
            statements = self.len(),
            encoding = encoding.as_str(),
            path = %path.display(),
            "wrote source"
        );
        Ok(())
    }

    /// Serialize in insertion order.
    pub fn encode(&self, encoding: Encoding) -> Vec<u8> {
        match encoding {
            Encoding::Text => self.encode_text(),
            Encoding::Binary => self.encode_binary(),
        }
    }

    fn encode_text(&self) -> Vec<u8> {
        let mut out = format!("{} {}\n", TEXT_HEADER, self.id.hyphenated()).into_bytes();
        for statement in &self.statements {
            out.extend_from_slice(
                format!(
                    "{} {} {} {}",
                    statement.tick(),
                    statement.platform().to_hex(),
                    statement.op().as_str(),
                    statement.key().to_hex()
                )
                .as_bytes(),
            );
            match statement {
                Statement::SetValue { value, .. } => {
                    out.extend_from_slice(format!(" {} ", value.len()).as_bytes());
                    out.extend_from_slice(value);
                }
                Statement::Unset { .. } => {}
                Statement::SetBlob { checksum, size, .. } => {
                    out.extend_from_slice(format!(" {} {}", checksum.to_hex(), size).as_bytes());
                }
            }
            out.push(b'\n');
        }
        out
    }

    fn encode_binary(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.statements.len() * 25);
        out.extend_from_slice(MAGIC);
        out.push(VERSION);
        out.extend_from_slice(&[0u8; 3]);
        out.extend_from_slice(self.id.as_bytes());
        for statement in &self.statements {
            out.extend_from_slice(&statement.tick().to_le_bytes());
            out.extend_from_slice(&statement.platform().as_u64().to_le_bytes());
            out.push(statement.op().to_u8());
            out.extend_from_slice(&statement.key().as_u64().to_le_bytes());
            match statement {
                Statement::SetValue { value, .. } => {
                    out.extend_from_slice(&(value.len() as u64).to_le_bytes());
                    out.extend_from_slice(value);
                }
                Statement::Unset { .. } => {}
                Statement::SetBlob { checksum, size, .. } => {
                    out.extend_from_slice(checksum.as_bytes());
                    out.extend_from_slice(&size.to_le_bytes());
                }
            }
        }
        out
    }

    /// Parse persisted data in either encoding, failing on the first
    /// malformed record.
    pub fn decode(data: &[u8]) -> Result<Self> {
        match Self::decode_lenient(data)? {
            (_, Some(err)) => Err(err),
            (source, None) => Ok(source),
        }
    }

    /// Parse persisted data, returning the statements parsed before the first
    /// malformed record together with that record's error.
    ///
    /// A malformed header is always an error.
    pub fn decode_lenient(data: &[u8]) -> Result<(Self, Option<Error>)> {
        match Encoding::detect(data) {
            Encoding::Binary => Self::decode_binary(data),
            Encoding::Text => Self::decode_text(data),
        }
    }

    fn decode_binary(data: &[u8]) -> Result<(Self, Option<Error>)> {
        let mut cursor = ByteCursor::new(data);
        let header = cursor.take(HEADER_SIZE)?;
        if header[4] != VERSION {
            return Err(Error::parse(
                "offset 4",
                format!("unsupported version {}", header[4]),
            ));
        }
        if header[5..8] != [0, 0, 0] {
            return Err(Error::parse("offset 5", "reserved bytes must be 0"));
        }
        let mut id = [0u8; 16];
        id.copy_from_slice(&header[8..24]);
        let mut source = Self::new(Uuid::from_bytes(id));

        while !cursor.at_end() {
            let offset = cursor.pos;
            let result = Self::decode_binary_record(&mut cursor)
                .and_then(|statement| source.append(statement))
                .map_err(|err| located(err, format!("offset {}", offset)));
            if let Err(err) = result {
                return Ok((source, Some(err)));
            }
        }
        Ok((source, None))
    }

    fn decode_binary_record(cursor: &mut ByteCursor<'_>) -> Result<Statement> {
        let tick = cursor.read_u64()?;
        let platform = Platform::from_u64(cursor.read_u64()?);
        let op_byte = cursor.read_u8()?;
        let key = KeyHash::from_u64(cursor.read_u64()?);
        let op = Op::from_u8(op_byte)
            .ok_or_else(|| Error::parse("op", format!("unknown op {}", op_byte)))?;
        Ok(match op {
            Op::Set => {
                let len = cursor.read_u64()?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::parse("value", format!("length {} too large", len)))?;
                Statement::SetValue {
                    tick,
                    key,
                    platform,
                    value: cursor.take(len)?.to_vec(),
                }
            }
            Op::Unset => Statement::Unset {
                tick,
                key,
                platform,
            },
            Op::Blob => {
                let mut checksum = [0u8; HASH_SIZE];
                checksum.copy_from_slice(cursor.take(HASH_SIZE)?);
                Statement::SetBlob {
                    tick,
                    key,
                    platform,
                    checksum: Hash::from_bytes(checksum),
                    size: cursor.read_u64()?,
                }
            }
        })
    }

    fn decode_text(data: &[u8]) -> Result<(Self, Option<Error>)> {
        let mut cursor = TextCursor::new(data);
        let id = cursor
            .header()
            .map_err(|err| located(err, "line 1".to_string()))?;
        let mut source = Self::new(id);

        while !cursor.at_end() {
            let line = cursor.line;
            let result = Self::decode_text_record(&mut cursor)
                .and_then(|statement| source.append(statement))
                .map_err(|err| located(err, format!("line {}", line)));
            if let Err(err) = result {
                return Ok((source, Some(err)));
            }
        }
        Ok((source, None))
    }

    fn decode_text_record(cursor: &mut TextCursor<'_>) -> Result<Statement> {
        let tick = cursor.number("tick")?;
        cursor.space()?;
        let platform = Platform::from_hex(cursor.field()?)?;
        cursor.space()?;
        let op_field = cursor.field()?;
        let op = Op::parse(op_field)
            .ok_or_else(|| Error::parse("op", format!("unknown op {}", op_field)))?;
        cursor.space()?;
        let key = KeyHash::from_hex(cursor.field()?)?;

        let statement = match op {
            Op::Set => {
                cursor.space()?;
                let len = cursor.number("length")?;
                let len = usize::try_from(len)
                    .map_err(|_| Error::parse("value", format!("length {} too large", len)))?;
                cursor.space()?;
                Statement::SetValue {
                    tick,
                    key,
                    platform,
                    value: cursor.take(len)?.to_vec(),
                }
            }
            Op::Unset => Statement::Unset {
                tick,
                key,
                platform,
            },
            Op::Blob => {
                cursor.space()?;
                let checksum = Hash::from_hex(cursor.field()?)?;
                cursor.space()?;
                Statement::SetBlob {
                    tick,
                    key,
                    platform,
                    checksum,
                    size: cursor.number("size")?,
                }
            }
        };
        cursor.newline()?;
        Ok(statement)
    }
}

/// Attach a record location to errors raised while decoding it.
fn located(err: Error, location: String) -> Error {
    match err {
        Error::Parse { reason, .. } => Error::parse(location, reason),
        other => Error::parse(location, other.to_string()),
    }
}

struct ByteCursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> ByteCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn at_end(&self) -> bool {
        self.pos >= self.data.len()
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let remaining = self.data.len() - self.pos;
        if len > remaining {
            return Err(Error::parse(
                format!("offset {}", self.pos),
                format!("truncated: need {} bytes, {} left", len, remaining),
            ));
        }
        let bytes = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(bytes)
    }

    fn read_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn read_u64(&mut self) -> Result<u64> {
        let mut bytes = [0u8; 8];
        bytes.copy_from_slice(self.take(8)?);
        Ok(u64::from_le_bytes(bytes))
    }
}

struct TextCursor<'a> {
    bytes: ByteCursor<'a>,
    line: usize,
}

impl<'a> TextCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self {
            bytes: ByteCursor::new(data),
            line: 1,
        }
    }

    fn at_end(&self) -> bool {
        self.bytes.at_end()
    }

    fn header(&mut self) -> Result<Uuid> {
        let tag = self.field()?;
        if tag != TEXT_HEADER {
            return Err(Error::parse("header", format!("expected '{}', got '{}'", TEXT_HEADER, tag)));
        }
        self.space()?;
        let id = self.field()?;
        let id = Uuid::parse_str(id)
            .map_err(|e| Error::parse("header", format!("invalid resource id {}: {}", id, e)))?;
        self.newline()?;
        Ok(id)
    }

    /// Next run of bytes up to a space or newline.
    fn field(&mut self) -> Result<&'a str> {
        let rest = &self.bytes.data[self.bytes.pos..];
        let len = rest
            .iter()
            .position(|&b| b == b' ' || b == b'\n')
            .unwrap_or(rest.len());
        if len == 0 {
            return Err(Error::parse("field", "empty field"));
        }
        let field = self.bytes.take(len)?;
        std::str::from_utf8(field)
            .map_err(|e| Error::parse("field", format!("invalid UTF-8: {}", e)))
    }

    fn number(&mut self, what: &str) -> Result<u64> {
        let field = self.field()?;
        field
            .parse::<u64>()
            .map_err(|e| Error::parse(what, format!("invalid {} {}: {}", what, field, e)))
    }

    fn take(&mut self, len: usize) -> Result<&'a [u8]> {
        let bytes = self.bytes.take(len)?;
        self.line += bytes.iter().filter(|&&b| b == b'\n').count();
        Ok(bytes)
    }

    fn space(&mut self) -> Result<()> {
        self.expect(b' ', "space")
    }

    fn newline(&mut self) -> Result<()> {
        self.expect(b'\n', "end of line")?;
        self.line += 1;
        Ok(())
    }

    fn expect(&mut self, byte: u8, what: &str) -> Result<()> {
        match self.bytes.take(1) {
            Ok([b]) if *b == byte => Ok(()),
            _ => Err(Error::parse("separator", format!("expected {}", what))),
        }
    }
}
