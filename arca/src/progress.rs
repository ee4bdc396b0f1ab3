//! Progress accounting and cooperative cancellation.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Callback invoked with the overall fraction done, in `[0, 1]`.
///
/// Called on every chunk completion from the pipeline's main task; it must
/// not block.
pub type ProgressFn = Box<dyn Fn(f64) + Send>;

/// A cancel flag settable from any thread.
///
/// The pipelines check it at every suspension point and before spawning each
/// worker; once observed, workers are signalled and joined, the scratch
/// directory is removed, and the run surfaces `Canceled`.
#[derive(Clone, Debug, Default)]
pub struct CancelToken {
    flag: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> CancelToken {
        CancelToken::default()
    }

    pub fn cancel(&self) {
        self.flag.store(true, Ordering::SeqCst);
    }

    pub fn is_canceled(&self) -> bool {
        self.flag.load(Ordering::SeqCst)
    }
}

/// Byte accounting for one run: bytes of finished VMs plus bytes of the VM
/// in flight, over the expected total.
pub(crate) struct ProgressMeter {
    total: u64,
    done_vms: u64,
    current_vm: u64,
    callback: Option<ProgressFn>,
}

impl ProgressMeter {
    pub(crate) fn new(total: u64, callback: Option<ProgressFn>) -> ProgressMeter {
        ProgressMeter {
            total,
            done_vms: 0,
            current_vm: 0,
            callback,
        }
    }

    pub(crate) fn add_current(&mut self, bytes: u64) {
        self.current_vm += bytes;
        self.report();
    }

    pub(crate) fn finish_vm(&mut self, vm_size: u64) {
        self.done_vms += vm_size;
        self.current_vm = 0;
        self.report();
    }

    pub(crate) fn fraction(&self) -> f64 {
        if self.total == 0 {
            return 1.0;
        }
        let f = (self.done_vms + self.current_vm) as f64 / self.total as f64;
        f.clamp(0.0, 1.0)
    }

    fn report(&self) {
        if let Some(callback) = &self.callback {
            callback(self.fraction());
        }
    }
}
