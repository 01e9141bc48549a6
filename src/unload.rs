//! The process-wide unload lock (spec §5): every in-flight call into any
//! layer holds this lock shared; unloading a layer (removing its module
//! from the process) takes it exclusive, so it can only proceed once every
//! call already in flight has returned.

use parking_lot::RwLock;

#[derive(Debug, Default)]
pub struct UnloadLock(RwLock<()>);

/// Held by every in-flight dispatcher call. Dropping it releases the shared
/// hold.
pub struct CallGuard<'a>(parking_lot::RwLockReadGuard<'a, ()>);

/// Held while a layer is being unloaded. Dropping it releases the exclusive
/// hold.
pub struct UnloadGuard<'a>(parking_lot::RwLockWriteGuard<'a, ()>);

impl UnloadLock {
    pub fn new() -> Self {
        UnloadLock(RwLock::new(()))
    }

    pub fn enter_call(&self) -> CallGuard<'_> {
        CallGuard(self.0.read())
    }

    pub fn begin_unload(&self) -> UnloadGuard<'_> {
        UnloadGuard(self.0.write())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_calls_do_not_block_each_other() {
        let lock = UnloadLock::new();
        let a = lock.enter_call();
        let b = lock.enter_call();
        drop(a);
        drop(b);
    }

    #[test]
    fn exclusive_unload_is_available_once_calls_drain() {
        let lock = UnloadLock::new();
        {
            let _call = lock.enter_call();
        }
        let _unload = lock.begin_unload();
    }
}
