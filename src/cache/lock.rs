use std::sync::{Mutex, MutexGuard};

use tracing::warn;

/// Lock a capture buffer, recovering the data if a previous holder panicked.
///
/// Capture buffers only ever grow by whole chunks, so a poisoned guard still holds a
/// consistent prefix of the stream.
pub(crate) fn mutex_lock<'a, T>(
    lock: &'a Mutex<T>,
    target: &'static str,
    op: &'static str,
) -> MutexGuard<'a, T> {
    match lock.lock() {
        Ok(guard) => guard,
        Err(poisoned) => {
            warn!(
                op,
                target_module = target,
                lock_kind = "mutex.lock",
                result = "poisoned_recovered",
                "Recovered from poisoned capture lock"
            );
            poisoned.into_inner()
        }
    }
}
