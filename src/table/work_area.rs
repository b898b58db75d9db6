use std::path::{Path, PathBuf};

use ahash::AHashSet;
use tracing::{debug, info, warn};

use crate::config::DbfConfig;
use crate::error::{DbfError, DbfResult};
use crate::file::{AccessMode, BlockFile, Storage};
use crate::index::{IndexEntry, IndexPack, KeyTransform, MAX_FILE_POS};

use super::RecPos;
use super::field::{FIELD_DESCRIPTOR_SIZE, FieldDescriptor, FieldType, layout_fields};
use super::header::TableHeader;
use super::value::Value;

/// Start of the byte range locked for the cooperative table lock.
/// Lies past any real record data so it never blocks plain reads.
pub const LOCK_OFFSET: u64 = 0x4000_0000;
pub const LOCK_LENGTH: u64 = 1;

/// Status byte of a live record
pub const STATUS_LIVE: u8 = b' ';
/// Status byte of a record marked deleted
pub const STATUS_DELETED: u8 = b'*';

/// How this handle came to open the table
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShareMode {
    /// First opener of the table
    Exclusive,
    /// Opened while another session already had the table open
    Shared,
}

/// Bytes of `field` within a full record
fn field_bytes<'a>(record: &'a [u8], field: &FieldDescriptor) -> &'a [u8] {
    &record[field.offset..field.offset + usize::from(field.length)]
}

/// Index key of `record` for `pack`
fn index_key(fields: &[FieldDescriptor], pack: &IndexPack, record: &[u8]) -> DbfResult<Vec<u8>> {
    let field = fields.get(pack.source_field()).ok_or_else(|| {
        DbfError::corrupt(0, format!("index refers to missing field {}", pack.source_field()))
    })?;
    Ok(pack.transform().make_key(field_bytes(record, field)))
}

/// Read and validate the header and field descriptors
fn read_layout(file: &mut dyn BlockFile) -> DbfResult<(TableHeader, Vec<FieldDescriptor>)> {
    let mut signature = [0u8; 1];
    file.read_at(0, &mut signature)?;
    let width = TableHeader::width_for_signature(signature[0])?;

    let mut fixed = vec![0u8; TableHeader::size(width)];
    file.read_at(0, &mut fixed)?;
    let header = TableHeader::decode(&fixed)?;

    let mut block = vec![0u8; header.field_count() * FIELD_DESCRIPTOR_SIZE];
    file.read_at(fixed.len() as u64, &mut block)?;
    let mut fields = block
        .chunks(FIELD_DESCRIPTOR_SIZE)
        .map(FieldDescriptor::decode)
        .collect::<DbfResult<Vec<_>>>()?;

    let record_length = layout_fields(&mut fields);
    if record_length != usize::from(header.record_length) {
        return Err(DbfError::InvalidHeader(format!(
            "record length {} does not match the fields ({})",
            header.record_length, record_length
        )));
    }

    Ok((header, fields))
}

/// An open table: header, field layout, record I/O and its open indexes
pub struct WorkArea {
    used: bool,
    read_only: bool,
    share_mode: ShareMode,
    lock_count: usize,
    path: PathBuf,
    file: Box<dyn BlockFile>,
    /// Record most recently read, written or located
    current: RecPos,
    header: TableHeader,
    fields: Vec<FieldDescriptor>,
    indexes: Vec<IndexPack>,
    /// Controlling index for seek and ordered traversal
    order: Option<usize>,
    config: DbfConfig,
}

impl WorkArea {
    /// Create a new, empty table
    pub fn create(
        storage: &dyn Storage,
        path: &Path,
        mut fields: Vec<FieldDescriptor>,
        config: &DbfConfig,
    ) -> DbfResult<Self> {
        config.validate()?;
        if fields.is_empty() {
            return Err(DbfError::InvalidField(
                "a table needs at least one field".to_string(),
            ));
        }

        let mut names = AHashSet::new();
        for field in &fields {
            if !names.insert(field.name.clone()) {
                return Err(DbfError::InvalidField(format!(
                    "duplicate field name {}",
                    field.name
                )));
            }
        }

        let record_length = layout_fields(&mut fields);
        let header = TableHeader::new(config.rec_pos_width, fields.len(), record_length)?;

        let mut bytes = header.encode();
        for field in &fields {
            bytes.extend_from_slice(&field.encode());
        }

        let mut file = storage.create(path)?;
        file.write_at(0, &bytes)?;
        file.sync()?;

        info!(
            path = %path.display(),
            fields = fields.len(),
            record_length,
            "created table"
        );

        Ok(Self {
            used: true,
            read_only: false,
            share_mode: ShareMode::Exclusive,
            lock_count: 0,
            path: path.to_path_buf(),
            file,
            current: 0,
            header,
            fields,
            indexes: Vec::new(),
            order: None,
            config: config.clone(),
        })
    }

    /// Open an existing table
    pub fn open(
        storage: &dyn Storage,
        path: &Path,
        mode: AccessMode,
        share_mode: ShareMode,
        config: &DbfConfig,
    ) -> DbfResult<Self> {
        config.validate()?;
        let mut file = storage.open(path, mode)?;
        let (header, fields) = read_layout(file.as_mut())?;

        let size = file.size()?;
        if size < header.record_offset(header.record_count) {
            return Err(DbfError::InvalidHeader(format!(
                "header claims {} records but the file holds {} bytes",
                header.record_count, size
            )));
        }

        info!(
            path = %path.display(),
            records = header.record_count,
            ?mode,
            ?share_mode,
            "opened table"
        );

        Ok(Self {
            used: true,
            read_only: mode == AccessMode::ReadOnly,
            share_mode,
            lock_count: 0,
            path: path.to_path_buf(),
            file,
            current: 0,
            header,
            fields,
            indexes: Vec::new(),
            order: None,
            config: config.clone(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn is_open(&self) -> bool {
        self.used
    }

    pub fn is_read_only(&self) -> bool {
        self.read_only
    }

    pub fn share_mode(&self) -> ShareMode {
        self.share_mode
    }

    pub fn header(&self) -> &TableHeader {
        &self.header
    }

    pub fn fields(&self) -> &[FieldDescriptor] {
        &self.fields
    }

    pub fn record_count(&self) -> RecPos {
        self.header.record_count
    }

    pub fn record_length(&self) -> usize {
        usize::from(self.header.record_length)
    }

    pub fn current(&self) -> RecPos {
        self.current
    }

    pub fn config(&self) -> &DbfConfig {
        &self.config
    }

    /// Position of a field by (case-insensitive) name
    pub fn field_index(&self, name: &str) -> DbfResult<usize> {
        let upper = name.to_ascii_uppercase();
        self.fields
            .iter()
            .position(|field| field.name == upper)
            .ok_or_else(|| DbfError::FieldNotFound(name.to_string()))
    }

    fn ensure_open(&self) -> DbfResult<()> {
        if self.used { Ok(()) } else { Err(DbfError::NotOpen) }
    }

    fn ensure_writable(&self) -> DbfResult<()> {
        self.ensure_open()?;
        if self.read_only {
            return Err(DbfError::ReadOnly);
        }
        Ok(())
    }

    fn check_length(&self, data: &[u8]) -> DbfResult<()> {
        if data.len() != self.record_length() {
            return Err(DbfError::InvalidValue {
                field: "record".to_string(),
                reason: format!(
                    "expected {} bytes, got {}",
                    self.record_length(),
                    data.len()
                ),
            });
        }
        Ok(())
    }

    /// Fail with `OutOfRange` unless `record` exists. A miss outside the
    /// lock re-reads the record count, since other sessions may append.
    fn check_bounds(&mut self, record: RecPos) -> DbfResult<()> {
        if record >= self.header.record_count && self.lock_count == 0 {
            self.reload_count()?;
        }
        if record >= self.header.record_count {
            return Err(DbfError::OutOfRange {
                record,
                count: self.header.record_count,
            });
        }
        Ok(())
    }

    fn reload_count(&mut self) -> DbfResult<()> {
        let mut fixed = vec![0u8; TableHeader::size(self.header.width)];
        self.file.read_at(0, &mut fixed)?;
        let header = TableHeader::decode(&fixed)?;
        if header.record_length != self.header.record_length {
            return Err(DbfError::InvalidHeader(
                "record length changed on disk".to_string(),
            ));
        }
        self.header = header;
        Ok(())
    }

    fn write_header(&mut self) -> DbfResult<()> {
        self.header.touch();
        self.file.write_at(0, &self.header.encode())?;
        Ok(())
    }

    fn read_raw(&mut self, record: RecPos) -> DbfResult<Vec<u8>> {
        let mut buf = vec![0u8; self.record_length()];
        self.file.read_at(self.header.record_offset(record), &mut buf)?;
        Ok(buf)
    }

    // Locking

    pub fn is_locked(&self) -> bool {
        self.lock_count > 0
    }

    /// Take the cooperative table lock, or bump its count if already held.
    /// The first acquisition re-reads the header and index descriptors so
    /// changes made by other sessions become visible.
    pub fn lock(&mut self) -> DbfResult<()> {
        self.ensure_writable()?;

        if self.lock_count == 0 {
            if !self.file.try_lock_range(LOCK_OFFSET, LOCK_LENGTH)? {
                debug!(path = %self.path.display(), "table lock denied");
                return Err(DbfError::LockDenied(self.path.display().to_string()));
            }
            debug!(path = %self.path.display(), "table lock granted");

            if let Err(err) = self.refresh() {
                if let Err(unlock_err) = self.file.unlock_range(LOCK_OFFSET, LOCK_LENGTH) {
                    warn!(path = %self.path.display(), error = %unlock_err, "failed to release table lock");
                }
                return Err(err);
            }
        }

        self.lock_count += 1;
        Ok(())
    }

    /// Drop one level of the table lock, releasing it at zero after
    /// flushing every open index
    pub fn unlock(&mut self) -> DbfResult<()> {
        self.ensure_open()?;

        match self.lock_count {
            0 => Ok(()),
            1 => {
                let flushed = self.flush();
                self.lock_count = 0;
                self.file.unlock_range(LOCK_OFFSET, LOCK_LENGTH)?;
                debug!(path = %self.path.display(), "table lock released");
                flushed
            }
            _ => {
                self.lock_count -= 1;
                Ok(())
            }
        }
    }

    /// Run a mutating operation under the table lock and flush afterwards
    fn with_lock<T>(&mut self, op: impl FnOnce(&mut Self) -> DbfResult<T>) -> DbfResult<T> {
        self.lock()?;
        let result = op(self);
        let flushed = self.flush();
        let unlocked = self.unlock();

        let value = result?;
        flushed?;
        unlocked?;
        Ok(value)
    }

    /// Re-read the header and every index descriptor from disk
    pub fn refresh(&mut self) -> DbfResult<()> {
        self.ensure_open()?;

        let (header, fields) = read_layout(self.file.as_mut())?;
        if fields != self.fields {
            return Err(DbfError::InvalidHeader(
                "field layout changed on disk".to_string(),
            ));
        }
        self.header = header;

        for pack in &mut self.indexes {
            pack.refresh()?;
        }
        Ok(())
    }

    /// Write back dirty index pages. Attempts every index and reports the
    /// first failure.
    pub fn flush(&mut self) -> DbfResult<()> {
        self.ensure_open()?;

        let mut result = Ok(());
        for pack in &mut self.indexes {
            if let Err(err) = pack.flush()
                && result.is_ok()
            {
                result = Err(err);
            }
        }
        result
    }

    // Records

    /// Read the raw bytes of a record, status byte included
    pub fn read_record(&mut self, record: RecPos) -> DbfResult<Vec<u8>> {
        self.ensure_open()?;
        self.check_bounds(record)?;

        let data = self.read_raw(record)?;
        self.current = record;
        Ok(data)
    }

    /// Overwrite an existing record
    pub fn write_record(&mut self, record: RecPos, data: &[u8]) -> DbfResult<()> {
        self.ensure_writable()?;
        self.check_length(data)?;

        self.with_lock(|table| {
            table.check_bounds(record)?;

            if !table.indexes.is_empty() {
                let old = table.read_raw(record)?;
                for pack in &table.indexes {
                    if index_key(&table.fields, pack, &old)? != index_key(&table.fields, pack, data)? {
                        let field = &table.fields[pack.source_field()];
                        return Err(DbfError::IndexedKeyChanged(field.name.clone()));
                    }
                }
            }

            let offset = table.header.record_offset(record);
            table.file.write_at(offset, data)?;
            table.write_header()?;
            table.current = record;
            Ok(())
        })
    }

    /// Append a record and add it to every open index
    pub fn append_record(&mut self, data: &[u8]) -> DbfResult<RecPos> {
        self.ensure_writable()?;
        self.check_length(data)?;

        self.with_lock(|table| {
            let record = table.header.record_count;
            if u64::from(record) + 1 > table.header.width.max_records() {
                return Err(DbfError::CapacityExceeded(format!(
                    "table already holds {} records",
                    record
                )));
            }
            if !table.indexes.is_empty() && record > MAX_FILE_POS {
                return Err(DbfError::CapacityExceeded(format!(
                    "record {} cannot be referenced by an index",
                    record
                )));
            }

            let offset = table.header.record_offset(record);
            table.file.write_at(offset, data)?;
            table.header.record_count = record + 1;
            table.write_header()?;

            for pack in &mut table.indexes {
                let key = index_key(&table.fields, pack, data)?;
                pack.insert(&key, record)?;
            }

            table.current = record;
            debug!(path = %table.path.display(), record, "appended record");
            Ok(record)
        })
    }

    /// Mark or unmark a record as deleted. Records are never removed.
    pub fn set_deleted(&mut self, record: RecPos, deleted: bool) -> DbfResult<()> {
        self.ensure_writable()?;

        self.with_lock(|table| {
            table.check_bounds(record)?;
            let status = if deleted { STATUS_DELETED } else { STATUS_LIVE };
            let offset = table.header.record_offset(record);
            table.file.write_at(offset, &[status])?;
            table.write_header()
        })
    }

    pub fn is_deleted(&mut self, record: RecPos) -> DbfResult<bool> {
        Ok(self.read_record(record)?[0] == STATUS_DELETED)
    }

    // Typed access

    /// Encode one value per field into a live record
    pub fn encode_values(&self, values: &[Value]) -> DbfResult<Vec<u8>> {
        if values.len() != self.fields.len() {
            return Err(DbfError::InvalidValue {
                field: "record".to_string(),
                reason: format!(
                    "expected {} values, got {}",
                    self.fields.len(),
                    values.len()
                ),
            });
        }

        let mut record = Vec::with_capacity(self.record_length());
        record.push(STATUS_LIVE);
        for (value, field) in values.iter().zip(&self.fields) {
            record.extend_from_slice(&value.encode(field)?);
        }
        Ok(record)
    }

    pub fn decode_values(&self, record: &[u8]) -> DbfResult<Vec<Value>> {
        self.check_length(record)?;
        self.fields
            .iter()
            .map(|field| Value::decode(field_bytes(record, field), field))
            .collect()
    }

    pub fn read_values(&mut self, record: RecPos) -> DbfResult<Vec<Value>> {
        let data = self.read_record(record)?;
        self.decode_values(&data)
    }

    pub fn write_values(&mut self, record: RecPos, values: &[Value]) -> DbfResult<()> {
        self.ensure_writable()?;
        let data = self.encode_values(values)?;
        self.write_record(record, &data)
    }

    pub fn append_values(&mut self, values: &[Value]) -> DbfResult<RecPos> {
        self.ensure_writable()?;
        let data = self.encode_values(values)?;
        self.append_record(&data)
    }

    // Indexes

    pub fn indexes(&self) -> &[IndexPack] {
        &self.indexes
    }

    /// Slot of the controlling index, if any
    pub fn order(&self) -> Option<usize> {
        self.order
    }

    fn check_index_slot(&self) -> DbfResult<()> {
        if self.indexes.len() >= self.config.max_index_files {
            return Err(DbfError::CapacityExceeded(format!(
                "at most {} indexes may be open on one table",
                self.config.max_index_files
            )));
        }
        Ok(())
    }

    /// Key length for `transform` over field `field_idx`, if the pairing is allowed
    fn check_transform(&self, field_idx: usize, transform: KeyTransform) -> DbfResult<usize> {
        let field = &self.fields[field_idx];
        match (transform, field.field_type) {
            (KeyTransform::Verbatim, _)
            | (KeyTransform::UpperCase, FieldType::Character)
            | (KeyTransform::Numeric, FieldType::Numeric) => {}
            _ => {
                return Err(DbfError::InvalidField(format!(
                    "{:?} keys cannot be built over {} field {}",
                    transform,
                    field.field_type.tag() as char,
                    field.name
                )));
            }
        }

        let key_length = transform.key_length(usize::from(field.length));
        if key_length > self.config.max_key_length {
            return Err(DbfError::CapacityExceeded(format!(
                "key of {} bytes exceeds the maximum of {}",
                key_length, self.config.max_key_length
            )));
        }
        Ok(key_length)
    }

    /// Remove an index from the table, fixing up the controlling slot
    fn detach_index(&mut self, slot: usize) -> IndexPack {
        let pack = self.indexes.remove(slot);
        self.order = match self.order {
            Some(current) if current == slot => None,
            Some(current) if current > slot => Some(current - 1),
            other => other,
        };
        pack
    }

    /// Build (or rebuild) an index file over a field from every record
    /// and open it. The first index opened becomes the controlling one.
    pub fn build_index(
        &mut self,
        storage: &dyn Storage,
        path: &Path,
        field_name: &str,
        transform: KeyTransform,
    ) -> DbfResult<usize> {
        self.ensure_writable()?;
        let field_idx = self.field_index(field_name)?;
        let key_length = self.check_transform(field_idx, transform)?;

        let replacing = self.indexes.iter().any(|pack| pack.path() == path);
        if !replacing {
            self.check_index_slot()?;
        }

        self.with_lock(|table| {
            if let Some(slot) = table.indexes.iter().position(|pack| pack.path() == path) {
                table.detach_index(slot).close()?;
            }

            let field = table.fields[field_idx].clone();
            let mut entries = Vec::with_capacity(table.header.record_count as usize);
            for record in 0..table.header.record_count {
                let data = table.read_raw(record)?;
                entries.push(IndexEntry::new(
                    transform.make_key(field_bytes(&data, &field)),
                    record,
                ));
            }

            if storage.exists(path) {
                storage.remove(path)?;
            }
            let file = storage.create(path)?;
            let pack = IndexPack::build(
                file,
                path,
                &table.config,
                field_idx,
                key_length,
                transform,
                entries,
            )?;

            table.indexes.push(pack);
            let slot = table.indexes.len() - 1;
            if table.order.is_none() {
                table.order = Some(slot);
            }

            info!(
                table = %table.path.display(),
                index = %path.display(),
                field = %field.name,
                "built index"
            );
            Ok(slot)
        })
    }

    /// Open an existing index file. Opening one that is already open
    /// shares it and returns the same slot.
    pub fn open_index(&mut self, storage: &dyn Storage, path: &Path) -> DbfResult<usize> {
        self.ensure_open()?;

        if let Some(slot) = self.indexes.iter().position(|pack| pack.path() == path) {
            self.indexes[slot].acquire_share();
            return Ok(slot);
        }
        self.check_index_slot()?;

        let mode = if self.read_only {
            AccessMode::ReadOnly
        } else {
            AccessMode::ReadWrite
        };
        let file = storage.open(path, mode)?;
        let pack = IndexPack::open(file, path, &self.config)?;

        let field_idx = pack.source_field();
        let field = self.fields.get(field_idx).ok_or_else(|| {
            DbfError::corrupt(
                0,
                format!(
                    "index is built over field {}, table has {} fields",
                    field_idx,
                    self.fields.len()
                ),
            )
        })?;
        let expected = pack.transform().key_length(usize::from(field.length));
        if expected != pack.key_length() {
            return Err(DbfError::corrupt(
                0,
                format!(
                    "key length {} does not match field {} ({})",
                    pack.key_length(),
                    field.name,
                    expected
                ),
            ));
        }

        debug!(table = %self.path.display(), index = %path.display(), "opened index");
        self.indexes.push(pack);
        let slot = self.indexes.len() - 1;
        if self.order.is_none() {
            self.order = Some(slot);
        }
        Ok(slot)
    }

    /// Release one share of an index, closing it when none remain
    pub fn close_index(&mut self, slot: usize) -> DbfResult<()> {
        self.ensure_open()?;
        let pack = self.indexes.get_mut(slot).ok_or(DbfError::NoIndex)?;
        if pack.release_share() == 0 {
            self.detach_index(slot).close()?;
        }
        Ok(())
    }

    /// Choose the controlling index; `None` returns to record order
    pub fn set_order(&mut self, slot: Option<usize>) -> DbfResult<()> {
        self.ensure_open()?;
        if let Some(slot) = slot {
            self.indexes.get_mut(slot).ok_or(DbfError::NoIndex)?.reset();
        }
        self.order = slot;
        Ok(())
    }

    fn controlling(&mut self) -> DbfResult<&mut IndexPack> {
        self.ensure_open()?;
        match self.order {
            Some(slot) => self.indexes.get_mut(slot).ok_or(DbfError::NoIndex),
            None => Err(DbfError::NoIndex),
        }
    }

    /// The controlling index, re-read from disk when this session does not
    /// hold the lock and so may have missed other sessions' inserts
    fn fresh_controlling(&mut self) -> DbfResult<&mut IndexPack> {
        let unlocked = self.lock_count == 0;
        let pack = self.controlling()?;
        if unlocked {
            pack.refresh()?;
        }
        Ok(pack)
    }

    /// Locate the first record whose key starts with `key` in the
    /// controlling index and make it current
    pub fn seek(&mut self, key: &str) -> DbfResult<RecPos> {
        let pack = self.fresh_controlling()?;
        let search = pack.transform().make_search_key(key);
        let record = pack.seek(&search)?;
        self.current = record;
        Ok(record)
    }

    /// Next record in controlling-index order
    pub fn next(&mut self) -> DbfResult<Option<RecPos>> {
        let entry = self.controlling()?.next()?;
        if let Some(entry) = &entry {
            self.current = entry.record;
        }
        Ok(entry.map(|entry| entry.record))
    }

    /// Rewind controlling-index traversal to the first key
    pub fn reset(&mut self) -> DbfResult<()> {
        self.fresh_controlling()?.reset();
        Ok(())
    }

    /// Flush and release everything. Later calls fail with `NotOpen`.
    pub fn close(&mut self) -> DbfResult<()> {
        self.ensure_open()?;

        let mut result = Ok(());
        for pack in self.indexes.drain(..) {
            let index_path = pack.path().display().to_string();
            if let Err(err) = pack.close() {
                warn!(index = %index_path, error = %err, "failed to close index");
                if result.is_ok() {
                    result = Err(err);
                }
            }
        }
        self.order = None;

        if self.lock_count > 0 {
            self.lock_count = 0;
            if let Err(err) = self.file.unlock_range(LOCK_OFFSET, LOCK_LENGTH)
                && result.is_ok()
            {
                result = Err(err.into());
            }
        }
        if !self.read_only
            && let Err(err) = self.file.sync()
            && result.is_ok()
        {
            result = Err(err.into());
        }

        self.used = false;
        info!(path = %self.path.display(), "closed table");
        result
    }
}

impl Drop for WorkArea {
    fn drop(&mut self) {
        if self.used
            && let Err(err) = self.close()
        {
            warn!(path = %self.path.display(), error = %err, "failed to close table on drop");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::RecPosWidth;
    use crate::file::{DiskStorage, MemoryStorage};
    use crate::table::Date;

    fn people_fields() -> Vec<FieldDescriptor> {
        vec![
            FieldDescriptor::character("NAME", 10).unwrap(),
            FieldDescriptor::numeric("AGE", 3, 0).unwrap(),
            FieldDescriptor::logical("ACTIVE").unwrap(),
            FieldDescriptor::date("BORN").unwrap(),
        ]
    }

    fn person(name: &str, age: f64) -> Vec<Value> {
        vec![
            Value::Text(name.to_string()),
            Value::Number(age),
            Value::Logical(true),
            Value::Date(Date::new(1990, 5, 17).unwrap()),
        ]
    }

    fn create_people(storage: &MemoryStorage) -> WorkArea {
        WorkArea::create(
            storage,
            Path::new("people.dbf"),
            people_fields(),
            &DbfConfig::default(),
        )
        .unwrap()
    }

    #[test]
    fn test_create_and_reopen_on_disk() {
        let temp_dir = tempfile::tempdir().unwrap();
        let path = temp_dir.path().join("people.dbf");
        let storage = DiskStorage::new();
        let config = DbfConfig::default();

        {
            let mut table = WorkArea::create(&storage, &path, people_fields(), &config).unwrap();
            table.append_values(&person("Ann", 31.0)).unwrap();
            table.append_values(&person("Bob", 42.0)).unwrap();
            table.close().unwrap();
        }

        let mut table =
            WorkArea::open(&storage, &path, AccessMode::ReadOnly, ShareMode::Exclusive, &config)
                .unwrap();
        assert_eq!(table.record_count(), 2);
        assert_eq!(table.record_length(), 1 + 10 + 3 + 1 + 8);
        assert_eq!(table.fields()[1].name, "AGE");
        assert_eq!(table.fields()[1].offset, 11);
        assert_eq!(table.read_values(1).unwrap(), person("Bob", 42.0));

        // header length = fixed part + 4 descriptors
        assert_eq!(table.header().header_length, 32 + 4 * 32);
    }

    #[test]
    fn test_rejects_bad_field_sets() {
        let storage = MemoryStorage::new();
        let config = DbfConfig::default();
        assert!(matches!(
            WorkArea::create(&storage, Path::new("a.dbf"), Vec::new(), &config),
            Err(DbfError::InvalidField(_))
        ));

        let fields = vec![
            FieldDescriptor::character("NAME", 4).unwrap(),
            FieldDescriptor::character("name", 6).unwrap(),
        ];
        assert!(matches!(
            WorkArea::create(&storage, Path::new("b.dbf"), fields, &config),
            Err(DbfError::InvalidField(_))
        ));
    }

    #[test]
    fn test_read_write_bounds() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        table.append_values(&person("Ann", 31.0)).unwrap();

        let count = table.record_count();
        assert!(matches!(
            table.read_record(count),
            Err(DbfError::OutOfRange { record: 1, count: 1 })
        ));

        let data = table.encode_values(&person("Zed", 99.0)).unwrap();
        table.write_record(0, &data).unwrap();
        assert_eq!(table.read_record(0).unwrap(), data);

        assert!(matches!(
            table.write_record(1, &data),
            Err(DbfError::OutOfRange { .. })
        ));
        assert!(matches!(
            table.write_record(0, &data[1..]),
            Err(DbfError::InvalidValue { .. })
        ));
    }

    #[test]
    fn test_narrow_record_count() {
        let storage = MemoryStorage::new();
        let config = DbfConfig {
            rec_pos_width: RecPosWidth::Narrow,
            ..DbfConfig::default()
        };
        let mut table =
            WorkArea::create(&storage, Path::new("n.dbf"), people_fields(), &config).unwrap();
        table.append_values(&person("Ann", 1.0)).unwrap();

        let bytes = storage.contents(Path::new("n.dbf")).unwrap();
        assert_eq!(bytes[0], 0x02);
        assert_eq!(&bytes[4..6], &1u16.to_le_bytes());
        assert_eq!(table.header().header_length, 30 + 4 * 32);
    }

    #[test]
    fn test_deleted_flag() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        table.append_values(&person("Ann", 31.0)).unwrap();

        assert!(!table.is_deleted(0).unwrap());
        table.set_deleted(0, true).unwrap();
        assert!(table.is_deleted(0).unwrap());
        assert_eq!(table.read_record(0).unwrap()[0], STATUS_DELETED);
        table.set_deleted(0, false).unwrap();
        assert!(!table.is_deleted(0).unwrap());
    }

    #[test]
    fn test_read_only_checked_before_io() {
        let storage = MemoryStorage::new();
        let path = Path::new("people.dbf");
        create_people(&storage).close().unwrap();

        let config = DbfConfig::default();
        let mut table =
            WorkArea::open(&storage, path, AccessMode::ReadOnly, ShareMode::Exclusive, &config)
                .unwrap();
        storage.set_fail_reads(path, true);

        let data = vec![b' '; table.record_length()];
        assert!(matches!(table.append_record(&data), Err(DbfError::ReadOnly)));
        assert!(matches!(table.write_record(0, &data), Err(DbfError::ReadOnly)));
        assert!(matches!(table.lock(), Err(DbfError::ReadOnly)));
    }

    #[test]
    fn test_closed_table_is_not_open() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        table.close().unwrap();

        assert!(!table.is_open());
        assert!(matches!(table.read_record(0), Err(DbfError::NotOpen)));
        assert!(matches!(
            table.append_values(&person("Ann", 1.0)),
            Err(DbfError::NotOpen)
        ));
        assert!(matches!(table.seek("A"), Err(DbfError::NotOpen)));
        assert!(matches!(table.close(), Err(DbfError::NotOpen)));
    }

    #[test]
    fn test_index_operations_need_an_index() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        assert!(matches!(table.seek("A"), Err(DbfError::NoIndex)));
        assert!(matches!(table.next(), Err(DbfError::NoIndex)));
        assert!(matches!(table.reset(), Err(DbfError::NoIndex)));
        assert!(matches!(table.set_order(Some(0)), Err(DbfError::NoIndex)));
    }

    #[test]
    fn test_index_maintained_on_append() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        for (name, age) in [("Cid", 20.0), ("Ann", 30.0)] {
            table.append_values(&person(name, age)).unwrap();
        }

        let slot = table
            .build_index(&storage, Path::new("name.ndx"), "name", KeyTransform::Verbatim)
            .unwrap();
        assert_eq!(table.order(), Some(slot));

        table.append_values(&person("Bea", 40.0)).unwrap();

        let mut order = Vec::new();
        while let Some(record) = table.next().unwrap() {
            order.push(record);
        }
        assert_eq!(order, vec![1, 2, 0]);

        assert_eq!(table.seek("Be").unwrap(), 2);
        assert_eq!(table.current(), 2);
        assert!(matches!(table.seek("Dan"), Err(DbfError::KeyNotFound(_))));
    }

    #[test]
    fn test_numeric_and_case_insensitive_indexes() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        for (name, age) in [("bob", 7.0), ("ALF", 100.0), ("Cy", 25.0)] {
            table.append_values(&person(name, age)).unwrap();
        }

        let by_age = table
            .build_index(&storage, Path::new("age.ndx"), "AGE", KeyTransform::Numeric)
            .unwrap();
        let by_name = table
            .build_index(&storage, Path::new("uname.ndx"), "NAME", KeyTransform::UpperCase)
            .unwrap();

        table.set_order(Some(by_age)).unwrap();
        let mut ages = Vec::new();
        while let Some(record) = table.next().unwrap() {
            ages.push(record);
        }
        assert_eq!(ages, vec![0, 2, 1]);

        table.set_order(Some(by_name)).unwrap();
        assert_eq!(table.seek("BOB").unwrap(), 0);
        assert_eq!(table.seek("alf").unwrap(), 1);

        assert!(matches!(
            table.build_index(&storage, Path::new("x.ndx"), "ACTIVE", KeyTransform::Numeric),
            Err(DbfError::InvalidField(_))
        ));
    }

    #[test]
    fn test_write_cannot_change_indexed_key() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        table.append_values(&person("Ann", 30.0)).unwrap();
        table
            .build_index(&storage, Path::new("name.ndx"), "NAME", KeyTransform::Verbatim)
            .unwrap();

        // Same key, other fields changed: allowed
        table.write_values(0, &person("Ann", 31.0)).unwrap();
        assert!(matches!(
            table.write_values(0, &person("Amy", 31.0)),
            Err(DbfError::IndexedKeyChanged(name)) if name == "NAME"
        ));
        assert_eq!(table.read_values(0).unwrap(), person("Ann", 31.0));
    }

    #[test]
    fn test_open_index_shares_and_closes() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);
        table.append_values(&person("Ann", 30.0)).unwrap();
        let path = Path::new("name.ndx");
        let slot = table
            .build_index(&storage, path, "NAME", KeyTransform::Verbatim)
            .unwrap();

        assert_eq!(table.open_index(&storage, path).unwrap(), slot);
        assert_eq!(table.indexes()[slot].share_count(), 2);

        table.close_index(slot).unwrap();
        assert_eq!(table.indexes().len(), 1);
        table.close_index(slot).unwrap();
        assert!(table.indexes().is_empty());
        assert_eq!(table.order(), None);

        // Reopen from disk
        let slot = table.open_index(&storage, path).unwrap();
        assert_eq!(table.seek("Ann").unwrap(), 0);
        assert!(matches!(table.close_index(slot + 1), Err(DbfError::NoIndex)));
    }

    #[test]
    fn test_index_file_limit() {
        let storage = MemoryStorage::new();
        let config = DbfConfig {
            max_index_files: 1,
            ..DbfConfig::default()
        };
        let mut table =
            WorkArea::create(&storage, Path::new("t.dbf"), people_fields(), &config).unwrap();
        table
            .build_index(&storage, Path::new("a.ndx"), "NAME", KeyTransform::Verbatim)
            .unwrap();
        assert!(matches!(
            table.build_index(&storage, Path::new("b.ndx"), "AGE", KeyTransform::Numeric),
            Err(DbfError::CapacityExceeded(_))
        ));
        // Rebuilding an open index replaces it
        table
            .build_index(&storage, Path::new("a.ndx"), "NAME", KeyTransform::UpperCase)
            .unwrap();
        assert_eq!(table.indexes().len(), 1);
    }

    #[test]
    fn test_lock_is_reentrant() {
        let storage = MemoryStorage::new();
        let mut table = create_people(&storage);

        table.lock().unwrap();
        table.lock().unwrap();
        table.append_values(&person("Ann", 1.0)).unwrap();
        assert!(table.is_locked());
        table.unlock().unwrap();
        assert!(table.is_locked());
        table.unlock().unwrap();
        assert!(!table.is_locked());
        table.unlock().unwrap();
    }
}
