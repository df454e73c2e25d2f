//! Process-wide memory manager
//!
//! For code that cannot thread a manager through its call graph. The instance
//! is built from the `MIRROR_*` environment on first use and lives until the
//! process exits; there is no teardown.

use std::sync::OnceLock;

use parking_lot::{Mutex, MutexGuard};
use tracing::warn;

use crate::config::{ConfigLoader, MirrorConfig};
use crate::device::DeviceBackend;
use crate::manager::MemoryManager;

/// Manager type behind the global instance
pub type GlobalManager = MemoryManager<Box<dyn DeviceBackend>>;

static MANAGER: OnceLock<Mutex<GlobalManager>> = OnceLock::new();

fn build() -> Mutex<GlobalManager> {
    let config = ConfigLoader::from_env().load().unwrap_or_else(|err| {
        warn!(error = %err, "Ignoring invalid MIRROR_* configuration");
        MirrorConfig::default()
    });
    Mutex::new(MemoryManager::from_config(config))
}

/// The global manager, initializing it on first call
pub fn manager() -> &'static Mutex<GlobalManager> {
    MANAGER.get_or_init(build)
}

/// Lock the global manager
pub fn lock() -> MutexGuard<'static, GlobalManager> {
    manager().lock()
}

/// Run `f` with exclusive access to the global manager
pub fn with_manager<R>(f: impl FnOnce(&mut GlobalManager) -> R) -> R {
    f(&mut lock())
}

/// Whether the global manager has been created
pub fn is_initialized() -> bool {
    MANAGER.get().is_some()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::addr::HostAddr;

    #[test]
    fn test_global_lazy_and_shared() {
        let addr = HostAddr::new(0x7a00_0000);
        with_manager(|mm| unsafe { mm.insert(addr, 4, 4).unwrap() });
        assert!(is_initialized());

        assert!(lock().known(addr, false));
        assert!(std::ptr::eq(manager(), manager()));
        assert_eq!(with_manager(|mm| mm.erase(addr).unwrap()), addr);
    }
}
