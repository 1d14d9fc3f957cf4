//! Producer-facing usage writer.
//!
//! [`UsageWriter`] is what request handlers hold. Depending on
//! [`WriteMode`] it either writes each patch synchronously through the
//! [`PatchStore`] or hands it to a [`WriteBuffer`] that is only constructed
//! on first use.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::Mutex;
use tracing::{debug, error, warn};
use usagelog_core::{BatchBuilder, RecordId, UsagePatch};

use crate::buffer::{StopReport, WriteBuffer};
use crate::config::{BufferConfig, WriteMode, WriterConfig};
use crate::error::ConfigError;
use crate::metrics;
use crate::storage::PatchStore;

/// Records usage patches in direct or buffered mode.
pub struct UsageWriter {
    mode: WriteMode,
    config: BufferConfig,
    store: Arc<dyn PatchStore>,
    buffer: OnceLock<WriteBuffer>,
    /// Serializes lazy buffer construction against `stop`.
    init: Mutex<()>,
    stopped: AtomicBool,
}

impl std::fmt::Debug for UsageWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UsageWriter")
            .field("mode", &self.mode)
            .field("config", &self.config)
            .field("buffer", &self.buffer.get())
            .field("stopped", &self.stopped.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl UsageWriter {
    /// Creates a writer. The buffer configuration is validated up front even
    /// though the buffer itself is built lazily.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if `config` is invalid.
    pub fn new(
        mode: WriteMode,
        config: BufferConfig,
        store: Arc<dyn PatchStore>,
    ) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            mode,
            config,
            store,
            buffer: OnceLock::new(),
            init: Mutex::new(()),
            stopped: AtomicBool::new(false),
        })
    }

    /// Creates a writer from process settings.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the buffer settings are invalid.
    pub fn from_config(config: &WriterConfig, store: Arc<dyn PatchStore>) -> Result<Self, ConfigError> {
        Self::new(config.write_mode, config.buffer_config()?, store)
    }

    #[must_use]
    pub fn mode(&self) -> WriteMode {
        self.mode
    }

    /// Records one usage update. Never fails; persistence errors are logged
    /// and counted.
    pub async fn record(&self, id: RecordId, patch: UsagePatch) {
        if self.stopped.load(Ordering::Acquire) {
            debug!(%id, "usage writer stopped, dropping patch");
            metrics::record_dropped("stopped", 1);
            return;
        }
        match self.mode {
            WriteMode::Direct => self.write_direct(id, &patch).await,
            WriteMode::Buffered => {
                if let Some(buffer) = self.buffer() {
                    buffer.enqueue(id, patch);
                }
            }
        }
    }

    /// Stops the writer. Drains and stops the buffer if one was constructed.
    pub async fn stop(&self) -> Option<StopReport> {
        {
            let _init = self.init.lock();
            self.stopped.store(true, Ordering::Release);
        }
        match self.buffer.get() {
            Some(buffer) => Some(buffer.stop().await),
            None => None,
        }
    }

    /// Records waiting in the buffer; zero when no buffer exists.
    #[must_use]
    pub fn pending_len(&self) -> usize {
        self.buffer.get().map_or(0, WriteBuffer::pending_len)
    }

    /// The buffer, if buffered mode has constructed it.
    #[must_use]
    pub fn buffer_if_started(&self) -> Option<&WriteBuffer> {
        self.buffer.get()
    }

    fn buffer(&self) -> Option<&WriteBuffer> {
        if let Some(buffer) = self.buffer.get() {
            return Some(buffer);
        }
        let _init = self.init.lock();
        if self.stopped.load(Ordering::Acquire) {
            return None;
        }
        if let Some(buffer) = self.buffer.get() {
            return Some(buffer);
        }
        match WriteBuffer::new(self.config.clone(), Arc::clone(&self.store)) {
            Ok(buffer) => {
                debug!("write buffer constructed on first use");
                Some(self.buffer.get_or_init(|| buffer))
            }
            Err(err) => {
                error!(error = %err, "cannot construct write buffer, dropping patch");
                metrics::record_dropped("no_buffer", 1);
                None
            }
        }
    }

    async fn write_direct(&self, id: RecordId, patch: &UsagePatch) {
        let built = BatchBuilder::build([(id, patch)]);
        for rejected in &built.rejected {
            warn!(
                id = %rejected.id,
                field = rejected.field.as_str(),
                reason = %rejected.reason,
                "dropping unencodable field"
            );
            metrics::record_rejected_field(rejected.field);
        }
        let Some(batch) = built.batch else {
            return;
        };
        match self.store.apply_batch(&batch).await {
            Ok(()) => metrics::record_direct_write(true),
            Err(err) => {
                warn!(%id, error = %err, "direct usage write failed");
                metrics::record_direct_write(false);
            }
        }
    }
}
