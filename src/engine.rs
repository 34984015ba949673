//! The binlog engine.
//!
//! Orchestrates the full lifecycle of an append-only, optionally encrypted
//! event log file:
//!
//! 1. **Open**: adopt a leftover `.new` file from an interrupted reindex,
//!    open and exclusively lock the log, replay it record by record into the
//!    [`EventsProcessor`], and hand every live event to the caller's
//!    callback. A torn or corrupt tail is truncated away.
//! 2. **Run**: accept appends, batch bytes, flush lazily, and trigger a
//!    reindex when the live data is a small fraction of the file.
//! 3. **Reindex**: rewrite the live event set into `<path>.new`, sync it,
//!    and atomically swap it in.
//!
//! The engine is single-threaded by contract: it is owned by one logical
//! actor and takes no internal locks. Cross-process exclusion comes from an
//! advisory file lock held for the lifetime of the engine.

use std::fs::{self, File, OpenOptions, TryLockError};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::chain::ChainBuffer;
use crate::crypto::{self, AesCtrState, DbKey, IV_SIZE, KEY_SIZE, KeyEvent};
use crate::error::{BinlogError, Result, fatal};
use crate::event::{BinlogEvent, SERVICE_TYPE_AES_CTR_ENCRYPTION, SERVICE_TYPE_EMPTY};
use crate::events_buffer::EventsBuffer;
use crate::fsync::{fsync_file_or_die, fsync_parent_dir};
use crate::processor::EventsProcessor;
use crate::reader::{BinlogReader, ReadNext};

/// How long to retry the exclusive file lock before giving up.
const LOCK_RETRY_BUDGET: Duration = Duration::from_millis(100);
const LOCK_RETRY_STEP: Duration = Duration::from_millis(10);

/// Smallest read issued against the file while loading.
const MIN_READ_CHUNK: usize = 4096;

/// Buffered bytes above which `lazy_flush` flushes immediately.
const LAZY_FLUSH_THRESHOLD: usize = 1 << 14;

// Reindex when live data is at most 1/5 of a >100 KB file, or at most 1/2 of
// a >500 KB file.
const REINDEX_SMALL_FILE_SIZE: u64 = 100_000;
const REINDEX_SMALL_FILE_RATE: u64 = 5;
const REINDEX_LARGE_FILE_SIZE: u64 = 500_000;
const REINDEX_LARGE_FILE_RATE: u64 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Load,
    Run,
    Reindex,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EncryptionKind {
    None,
    AesCtr,
}

/// Construction-time options for [`Binlog::open`].
#[derive(Debug, Clone, Copy, Default)]
pub struct BinlogOptions {
    /// Skip `Rewrite`+`Empty` (erase) records while loading, so superseded
    /// events stay visible. For forensic replay of a damaged or suspect log;
    /// the file itself is never modified by an open in this mode beyond
    /// ordinary tail truncation.
    pub ignore_erase: bool,

    /// Route appends through a short-horizon [`EventsBuffer`] that coalesces
    /// rapid rewrites of the same id before they reach the file.
    pub buffer_events: bool,
}

/// Facts about the log established while opening it.
#[derive(Debug, Clone, Copy, Default)]
pub struct BinlogInfo {
    /// The file did not exist before this open.
    pub was_created: bool,
    /// Highest event id in the live set after load.
    pub last_id: u64,
    /// Set once open completes successfully.
    pub is_opened: bool,
}

/// An append-only, optionally encrypted binary event log.
pub struct Binlog {
    path: PathBuf,
    fd: Option<File>,
    state: State,
    encryption: EncryptionKind,

    processor: EventsProcessor,
    events_buffer: Option<EventsBuffer>,
    in_flush_events_buffer: bool,
    pending_events: Vec<BinlogEvent>,

    // Load-time read path: file bytes land in `read_raw`; when the log is
    // encrypted they are pumped through `read_cipher` into `read_plain`,
    // which the parser consumes. Unencrypted logs are parsed straight out
    // of `read_raw`.
    read_raw: ChainBuffer,
    read_plain: ChainBuffer,
    read_cipher: Option<AesCtrState>,

    // Write path: frames are appended (already transformed) to `write_buf`
    // and handed to the file on flush.
    write_buf: Vec<u8>,
    write_cipher: Option<AesCtrState>,

    db_key: DbKey,
    old_db_key: DbKey,
    db_key_used: bool,
    wrong_password: bool,
    aes_ctr_key: [u8; KEY_SIZE],
    aes_ctr_key_salt: Vec<u8>,

    fd_size: u64,
    fd_events: u64,
    need_sync: bool,
    need_flush_since: Option<Instant>,

    ignore_erase: bool,
    info: BinlogInfo,
}

impl Binlog {
    /// Opens (creating if necessary) the binlog at `path` and replays every
    /// live event through `callback` in insertion order.
    ///
    /// `db_key` is the current password material; `old_db_key` is tried when
    /// the log's key record does not verify against `db_key`, and unlocking
    /// through it causes the log to be re-encrypted under `db_key` (or
    /// decrypted, if `db_key` is empty) before open returns. A non-empty
    /// `db_key` on a plaintext log likewise triggers an immediate reindex to
    /// write the encryption envelope.
    ///
    /// # Errors
    ///
    /// `WrongPassword` if neither key verifies, `LockContention` if another
    /// process holds the log, or any I/O error.
    pub fn open(
        path: impl Into<PathBuf>,
        db_key: DbKey,
        old_db_key: DbKey,
        options: BinlogOptions,
        mut callback: impl FnMut(&BinlogEvent),
    ) -> Result<Self> {
        Self::open_impl(path.into(), db_key, old_db_key, options, &mut callback, None)
    }

    /// Like [`Binlog::open`], but also invokes `debug_callback` for every
    /// record decoded during load, before live-set processing. Dump tooling
    /// uses this to see superseded and service records.
    pub fn open_with_debug(
        path: impl Into<PathBuf>,
        db_key: DbKey,
        old_db_key: DbKey,
        options: BinlogOptions,
        mut callback: impl FnMut(&BinlogEvent),
        mut debug_callback: impl FnMut(&BinlogEvent),
    ) -> Result<Self> {
        Self::open_impl(
            path.into(),
            db_key,
            old_db_key,
            options,
            &mut callback,
            Some(&mut debug_callback),
        )
    }

    fn open_impl(
        path: PathBuf,
        db_key: DbKey,
        old_db_key: DbKey,
        options: BinlogOptions,
        callback: &mut dyn FnMut(&BinlogEvent),
        debug_callback: Option<&mut dyn FnMut(&BinlogEvent)>,
    ) -> Result<Self> {
        let new_path = new_path_for(&path);
        if !path.exists() && new_path.exists() {
            // Crash between unlink and rename at the end of a reindex: the
            // finished replacement is sitting next to a missing log.
            tracing::info!(
                path = %path.display(),
                "adopting reindex output left by an interrupted swap",
            );
            fs::rename(&new_path, &path)?;
            fsync_parent_dir(&path)?;
        }

        let was_created = !path.exists();
        let fd = open_locked(&path, false)?;
        if was_created {
            fsync_parent_dir(&path)?;
        }

        let mut binlog = Binlog {
            path,
            fd: Some(fd),
            state: State::Load,
            encryption: EncryptionKind::None,
            processor: EventsProcessor::new(),
            events_buffer: options.buffer_events.then(EventsBuffer::new),
            in_flush_events_buffer: false,
            pending_events: Vec::new(),
            read_raw: ChainBuffer::new(),
            read_plain: ChainBuffer::new(),
            read_cipher: None,
            write_buf: Vec::new(),
            write_cipher: None,
            db_key,
            old_db_key,
            db_key_used: false,
            wrong_password: false,
            aes_ctr_key: [0u8; KEY_SIZE],
            aes_ctr_key_salt: Vec::new(),
            fd_size: 0,
            fd_events: 0,
            need_sync: false,
            need_flush_since: None,
            ignore_erase: options.ignore_erase,
            info: BinlogInfo {
                was_created,
                last_id: 0,
                is_opened: false,
            },
        };

        binlog.load_binlog(callback, debug_callback)?;
        binlog.info.last_id = binlog.processor.last_id();
        if binlog.wrong_password {
            return Err(BinlogError::WrongPassword);
        }

        // A caller key that no on-disk record consumed means the log must
        // gain an encryption envelope; an encrypted log opened with an empty
        // key (unlocked via the old key) must lose it. Both are a rewrite of
        // the whole file.
        if (!binlog.db_key.is_empty() && !binlog.db_key_used)
            || (binlog.db_key.is_empty() && binlog.encryption != EncryptionKind::None)
        {
            binlog.aes_ctr_key_salt.clear();
            binlog.do_reindex()?;
        }

        binlog.info.is_opened = true;
        Ok(binlog)
    }

    /// Facts established while opening the log.
    pub fn info(&self) -> &BinlogInfo {
        &self.info
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Highest event id in the live set.
    pub fn last_id(&self) -> u64 {
        self.processor.last_id()
    }

    /// Number of live (not superseded or erased) events.
    pub fn live_event_count(&self) -> usize {
        self.processor.len()
    }

    /// Sum of raw frame sizes over the live set.
    pub fn total_raw_events_size(&self) -> u64 {
        self.processor.total_raw_events_size()
    }

    /// Since when unflushed bytes have been waiting. The engine never
    /// flushes on a timer itself; an outer scheduler polls this and calls
    /// [`Binlog::flush`] once the age exceeds its budget.
    pub fn need_flush_since(&self) -> Option<Instant> {
        self.need_flush_since
    }

    /// Appends an event to the log.
    ///
    /// The event is applied to the in-memory live set immediately and its
    /// frame is buffered for the file; call [`Binlog::flush`] to push bytes
    /// to the OS and [`Binlog::sync`] for durability. May trigger a reindex
    /// when live data has become a small fraction of the file.
    pub fn add_event(&mut self, event: BinlogEvent) -> Result<()> {
        match self.events_buffer.as_mut() {
            Some(buffer) => buffer.add_event(event),
            None => self.do_add_event(event)?,
        }
        self.lazy_flush()?;

        if self.state == State::Run {
            let fd_size =
                self.fd_size + self.events_buffer.as_ref().map_or(0, EventsBuffer::size);
            let live_size = self.processor.total_raw_events_size();
            let need_reindex =
                |min_size: u64, rate: u64| fd_size > min_size && fd_size / rate > live_size;
            if need_reindex(REINDEX_SMALL_FILE_SIZE, REINDEX_SMALL_FILE_RATE)
                || need_reindex(REINDEX_LARGE_FILE_SIZE, REINDEX_LARGE_FILE_RATE)
            {
                tracing::info!(fd_size, live_size, "live data ratio low, compacting binlog");
                self.do_reindex()?;
            }
        }
        Ok(())
    }

    /// Replaces the password material and rewrites the log under it with a
    /// fresh salt and IV.
    pub fn change_key(&mut self, new_db_key: DbKey) -> Result<()> {
        self.db_key = new_db_key;
        self.aes_ctr_key_salt.clear();
        self.do_reindex()
    }

    /// Drains the events buffer and pushes all buffered bytes to the OS.
    ///
    /// After this returns, every event from a prior [`Binlog::add_event`] is
    /// in the OS write buffer (not necessarily on disk; see
    /// [`Binlog::sync`]).
    pub fn flush(&mut self) -> Result<()> {
        if self.state == State::Load {
            return Ok(());
        }
        self.flush_events_buffer(true)?;
        if !self.write_buf.is_empty()
            && let Some(fd) = self.fd.as_mut()
        {
            fd.write_all(&self.write_buf)?;
            self.write_buf.clear();
            self.need_sync = true;
        }
        self.need_flush_since = None;
        Ok(())
    }

    /// Flushes, then fsyncs if anything was written since the last sync.
    ///
    /// A failed fsync aborts the process: past that point the engine cannot
    /// tell the caller which acknowledged writes survived.
    pub fn sync(&mut self) -> Result<()> {
        self.flush()?;
        if self.need_sync
            && let Some(fd) = self.fd.as_ref()
        {
            fsync_file_or_die(fd, "failed to sync binlog");
            self.need_sync = false;
        }
        Ok(())
    }

    /// Closes the log, flushing first and syncing when `need_sync` is set.
    /// Dropping the engine does the same with `need_sync = true`.
    pub fn close(mut self, need_sync: bool) -> Result<()> {
        self.do_close(need_sync)
    }

    /// Closes the log and removes its files.
    pub fn close_and_destroy(mut self) -> Result<()> {
        let path = self.path.clone();
        let result = self.do_close(false);
        Self::destroy(&path);
        result
    }

    /// Best-effort removal of the log file and any `.new` leftover.
    pub fn destroy(path: impl AsRef<Path>) {
        let path = path.as_ref();
        remove_quiet(path);
        remove_quiet(&new_path_for(path));
    }

    fn do_close(&mut self, need_sync: bool) -> Result<()> {
        if self.fd.is_none() {
            return Ok(());
        }
        let result = if need_sync { self.sync() } else { self.flush() };
        self.fd = None;
        self.info.is_opened = false;
        self.need_sync = false;
        self.need_flush_since = None;
        result
    }

    // ─── Load ───

    fn load_binlog(
        &mut self,
        callback: &mut dyn FnMut(&BinlogEvent),
        mut debug_callback: Option<&mut dyn FnMut(&BinlogEvent)>,
    ) -> Result<()> {
        self.state = State::Load;
        self.wrong_password = false;
        let mut reader = BinlogReader::new();
        // Offset just past the last record that was handled successfully.
        // Everything beyond it is a torn or abandoned write.
        let mut valid_offset = 0u64;
        let mut ready_flag = false;

        loop {
            let source = if self.read_cipher.is_some() {
                &mut self.read_plain
            } else {
                &mut self.read_raw
            };
            match reader.read_next(source) {
                Ok(ReadNext::Event(event)) => {
                    ready_flag = false;
                    let record_end = reader.offset();
                    if self.ignore_erase
                        && event.is_rewrite()
                        && event.event_type() == SERVICE_TYPE_EMPTY
                    {
                        valid_offset = record_end;
                        continue;
                    }
                    if let Some(cb) = debug_callback.as_deref_mut() {
                        cb(&event);
                    }
                    if let Err(error) = self.do_add_event(event) {
                        tracing::error!(
                            %error,
                            offset = valid_offset,
                            "stopping binlog replay at invalid record",
                        );
                        break;
                    }
                    if self.wrong_password {
                        return Ok(());
                    }
                    valid_offset = record_end;
                }
                Ok(ReadNext::NeedBytes(need)) => {
                    if ready_flag {
                        // Two passes without progress: the last fill hit end
                        // of file and the remaining bytes (if any) are a
                        // partial record.
                        break;
                    }
                    self.fill_read_buffer(need.max(MIN_READ_CHUNK))?;
                    self.pump_read();
                    ready_flag = true;
                }
                Err(error) => {
                    tracing::error!(
                        %error,
                        offset = valid_offset,
                        "stopping binlog replay at corrupt record",
                    );
                    break;
                }
            }
        }

        if !self.pending_events.is_empty() {
            // Fragments with no commit record: the operation never
            // happened. They stay on disk until the next reindex but must
            // not be committed by an unrelated future event.
            tracing::warn!(
                count = self.pending_events.len(),
                "dropping uncommitted partial events",
            );
            self.pending_events.clear();
        }

        if let Err(error) = self.processor.finish_replay() {
            // Well-formed records in an impossible order: writer
            // misbehavior, not a torn tail. Surface it instead of truncating
            // good data away.
            tracing::error!(
                %error,
                path = %self.path.display(),
                "binlog replay ended with uncovered out-of-order events",
            );
            return Err(error);
        }

        self.processor.for_each(|event| callback(event));

        let fd = self.fd.as_mut().expect("file is open during load");
        let file_size = fd.metadata()?.len();
        if valid_offset != file_size {
            tracing::warn!(
                path = %self.path.display(),
                old_size = file_size,
                new_size = valid_offset,
                "truncating binlog tail",
            );
            fd.set_len(valid_offset)?;
            fsync_file_or_die(fd, "failed to sync truncated binlog");
            // Restart the encrypted stream from a consistent position by
            // rewriting the file on this open.
            self.db_key_used = false;
        }
        fd.seek(SeekFrom::Start(valid_offset))?;
        self.fd_size = valid_offset;

        self.state = State::Run;
        self.read_raw.clear();
        self.read_plain.clear();
        self.write_buf.clear();
        // The running CTR counter moves from the read path to the write
        // path, so appended frames continue the on-disk keystream exactly
        // where load stopped.
        self.write_cipher = self.read_cipher.take();
        Ok(())
    }

    /// Reads at least `min_bytes` from the file into the raw buffer, or as
    /// much as remains before end of file.
    fn fill_read_buffer(&mut self, min_bytes: usize) -> Result<()> {
        let fd = self.fd.as_mut().expect("file is open during load");
        let mut chunk = vec![0u8; min_bytes.max(MIN_READ_CHUNK)];
        let mut filled = 0;
        while filled < chunk.len() {
            let n = fd.read(&mut chunk[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        self.read_raw.append(&chunk[..filled]);
        Ok(())
    }

    /// Moves raw file bytes through the read cipher into the parse buffer.
    fn pump_read(&mut self) {
        if let Some(cipher) = self.read_cipher.as_mut()
            && !self.read_raw.is_empty()
        {
            let mut bytes = self.read_raw.take_all();
            cipher.apply(&mut bytes);
            self.read_plain.append(&bytes);
        }
    }

    // ─── Event application ───

    /// Partial events accumulate in a pending batch; the next non-partial
    /// event commits the batch and itself, giving all-or-nothing visibility
    /// of multi-record logical operations.
    fn do_add_event(&mut self, mut event: BinlogEvent) -> Result<()> {
        if event.is_partial() {
            // The raw frame keeps the flag; only the applied view loses it.
            event.strip_partial();
            self.pending_events.push(event);
            return Ok(());
        }
        for pending in std::mem::take(&mut self.pending_events) {
            self.do_event(pending)?;
        }
        self.do_event(event)
    }

    fn do_event(&mut self, event: BinlogEvent) -> Result<()> {
        // Validate a live append against the live set up front so a
        // rejected event leaves no bytes in the write buffer. Replay has
        // its own, more tolerant validation in `replay_event`.
        if self.state == State::Run {
            self.processor.check_event(&event)?;
        }

        self.fd_events += 1;
        self.fd_size += event.size() as u64;

        if matches!(self.state, State::Run | State::Reindex) {
            tracing::trace!(?event, reindex = (self.state == State::Reindex), "write binlog event");
            let start = self.write_buf.len();
            self.write_buf.extend_from_slice(event.raw());
            if let Some(cipher) = self.write_cipher.as_mut() {
                cipher.apply(&mut self.write_buf[start..]);
            }
        }

        if event.event_type() == SERVICE_TYPE_AES_CTR_ENCRYPTION {
            self.apply_key_event(&event)?;
        }

        match self.state {
            State::Load => self.processor.replay_event(event)?,
            State::Run => self.processor.add_event(event)?,
            State::Reindex => {}
        }
        Ok(())
    }

    /// Handles an encryption bootstrap record: derive and verify the key,
    /// then splice the cipher into whichever pipeline is active.
    fn apply_key_event(&mut self, event: &BinlogEvent) -> Result<()> {
        let key_event = KeyEvent::parse(event.payload())?;

        let mut key: Option<[u8; KEY_SIZE]> = None;
        if !self.aes_ctr_key_salt.is_empty() && self.aes_ctr_key_salt == key_event.key_salt {
            key = Some(self.aes_ctr_key);
        } else if !self.db_key.is_empty() {
            key = Some(key_event.generate_key(&self.db_key));
        }

        let mut verified = key.as_ref().is_some_and(|k| key_event.verify_key(k));
        if verified {
            self.db_key_used = true;
        } else {
            if self.state == State::Load && !self.old_db_key.is_empty() {
                let old_key = key_event.generate_key(&self.old_db_key);
                if key_event.verify_key(&old_key) {
                    key = Some(old_key);
                    verified = true;
                }
            }
            if !verified {
                tracing::warn!(
                    salt = %hex::encode(&key_event.key_salt),
                    "binlog key verification failed",
                );
                self.wrong_password = true;
            }
        }

        self.encryption = EncryptionKind::AesCtr;
        self.aes_ctr_key_salt = key_event.key_salt.clone();
        self.aes_ctr_key = key.unwrap_or([0u8; KEY_SIZE]);
        let iv: [u8; IV_SIZE] = key_event.iv.as_slice().try_into().expect("length validated");
        let cipher = AesCtrState::new(&self.aes_ctr_key, &iv);

        if self.state == State::Load {
            self.read_cipher = Some(cipher);
            self.pump_read();
        } else {
            debug_assert!(
                self.state == State::Reindex,
                "key events are only written while reindexing",
            );
            // The bootstrap record itself must reach the file as plaintext
            // before the cipher takes over the write path.
            self.flush()?;
            self.write_cipher = Some(cipher);
        }
        Ok(())
    }

    // ─── Flushing ───

    /// Drains the events buffer through [`Binlog::do_add_event`]. Without
    /// `force`, drains only once the buffer's own thresholds say so and
    /// returns the byte size still held.
    fn flush_events_buffer(&mut self, force: bool) -> Result<u64> {
        let Some(buffer) = self.events_buffer.as_mut() else {
            return Ok(0);
        };
        if !force && !buffer.need_flush() {
            return Ok(buffer.size());
        }
        assert!(!self.in_flush_events_buffer, "reentrant events-buffer flush");
        self.in_flush_events_buffer = true;
        let events = buffer.take_events();
        let mut result = Ok(());
        for event in events {
            result = self.do_add_event(event);
            if result.is_err() {
                break;
            }
        }
        self.in_flush_events_buffer = false;
        result.map(|_| 0)
    }

    /// Flushes immediately once enough bytes are pending, otherwise starts
    /// the flush-age clock for the outer scheduler.
    fn lazy_flush(&mut self) -> Result<()> {
        let events_buffer_size = self.flush_events_buffer(false)? as usize;
        let buffered = self.write_buf.len() + events_buffer_size;
        if buffered > LAZY_FLUSH_THRESHOLD {
            self.flush()
        } else {
            if buffered > 0 && self.need_flush_since.is_none() {
                self.need_flush_since = Some(Instant::now());
            }
            Ok(())
        }
    }

    // ─── Reindex ───

    /// Rewrites the live event set into `<path>.new` and atomically swaps it
    /// in. The processor is the source of truth: superseded, erased, and
    /// uncommitted-partial records do not survive.
    fn do_reindex(&mut self) -> Result<()> {
        self.flush_events_buffer(true)?;
        debug_assert!(self.state == State::Run, "reindex requires a running binlog");

        let start_time = Instant::now();
        let start_size = file_size(&self.path);
        let start_events = self.fd_events;

        let new_path = new_path_for(&self.path);
        let new_fd = match open_locked(&new_path, true) {
            Ok(fd) => fd,
            Err(error) => {
                tracing::error!(
                    %error,
                    path = %new_path.display(),
                    "cannot open replacement binlog for reindex",
                );
                return Err(error);
            }
        };

        self.state = State::Reindex;
        // The old fd, and any bytes still buffered for it, is abandoned:
        // every live event is about to be rewritten into the new file.
        self.fd = Some(new_fd);
        self.write_buf.clear();
        self.write_cipher = None;
        self.encryption = EncryptionKind::None;
        self.need_sync = false;
        self.fd_size = 0;
        self.fd_events = 0;

        self.reset_encryption()?;
        let processor = std::mem::take(&mut self.processor);
        let mut replay_result = Ok(());
        for event in processor.iter() {
            replay_result = self.do_event(event.clone());
            if replay_result.is_err() {
                break;
            }
        }
        self.processor = processor;
        replay_result?;

        // The new file's very existence must be durable before the swap.
        self.need_sync = true;
        self.sync()?;

        if let Err(e) = fs::remove_file(&self.path) {
            fatal("failed to unlink old binlog during reindex", &e);
        }
        if let Err(e) = fs::rename(&new_path, &self.path) {
            fatal("failed to rename reindexed binlog", &e);
        }
        if let Err(e) = fsync_parent_dir(&self.path) {
            fatal("failed to sync directory after binlog reindex", &e);
        }

        let finish_size = file_size(&self.path);
        if self.fd_size != finish_size {
            fatal(
                "reindexed binlog size mismatch",
                &format!("wrote {} bytes, file has {finish_size}", self.fd_size),
            );
        }

        tracing::info!(
            path = %self.path.display(),
            elapsed_ms = start_time.elapsed().as_millis() as u64,
            before_size = start_size,
            after_size = finish_size,
            before_events = start_events,
            after_events = self.fd_events,
            "reindexed binlog",
        );

        self.state = State::Run;
        Ok(())
    }

    /// Emits a fresh encryption bootstrap record for the current key, or
    /// leaves the new file plaintext when there is no key. Reuses the
    /// current salt (and with it the derived key) when one is loaded; the IV
    /// is always fresh.
    fn reset_encryption(&mut self) -> Result<()> {
        if self.db_key.is_empty() {
            self.encryption = EncryptionKind::None;
            return Ok(());
        }

        let (salt, key) = if self.aes_ctr_key_salt.is_empty() {
            let salt = crypto::random_salt();
            let key = crypto::derive_key(&self.db_key, &salt);
            (salt, key)
        } else {
            (self.aes_ctr_key_salt.clone(), self.aes_ctr_key)
        };
        let key_event = KeyEvent::generate(salt, &key);
        let event = BinlogEvent::new(
            0,
            SERVICE_TYPE_AES_CTR_ENCRYPTION,
            0,
            &key_event.serialize(),
        )?;
        self.do_event(event)
    }
}

impl Drop for Binlog {
    fn drop(&mut self) {
        if let Err(error) = self.do_close(true) {
            tracing::error!(
                %error,
                path = %self.path.display(),
                "failed to close binlog",
            );
        }
    }
}

/// `<path>.new`, the staging file for an in-progress reindex.
fn new_path_for(path: &Path) -> PathBuf {
    let mut os = path.as_os_str().to_os_string();
    os.push(".new");
    PathBuf::from(os)
}

fn file_size(path: &Path) -> u64 {
    fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}

fn remove_quiet(path: &Path) {
    if let Err(error) = fs::remove_file(path)
        && error.kind() != io::ErrorKind::NotFound
    {
        tracing::warn!(path = %path.display(), %error, "failed to remove binlog file");
    }
}

/// Opens a binlog file read+write and takes the exclusive advisory lock,
/// retrying briefly before reporting contention.
fn open_locked(path: &Path, truncate: bool) -> Result<File> {
    let mut options = OpenOptions::new();
    options.read(true).write(true).create(true);
    if truncate {
        options.truncate(true);
    }
    let fd = options.open(path)?;

    let deadline = Instant::now() + LOCK_RETRY_BUDGET;
    loop {
        match fd.try_lock() {
            Ok(()) => return Ok(fd),
            Err(TryLockError::WouldBlock) => {
                if Instant::now() >= deadline {
                    return Err(BinlogError::LockContention);
                }
                std::thread::sleep(LOCK_RETRY_STEP);
            }
            Err(TryLockError::Error(e)) => return Err(e.into()),
        }
    }
}
