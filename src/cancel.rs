use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::error::{Error, Result};

/// Shared flag polled by transfer loops at chunk boundaries.
#[derive(Clone, Default)]
pub struct Cancel(Arc<AtomicBool>);

impl Cancel {
    /// Token that is only cancelled explicitly.
    pub fn new() -> Self { Cancel::default() }

    /// Token cancelled by Ctrl-C. Only one may be created per process.
    pub fn on_ctrlc() -> Result<Self> {
        let cancel = Cancel::new();
        let c = cancel.clone();

        ctrlc::set_handler(move || c.cancel())
            .map_err(|e| Error::Unsupported(format!("unable to install Ctrl-C handler: {}", e)))?;

        Ok(cancel)
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}
