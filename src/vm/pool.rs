//! Reusable VMs sharing one syscall table.

use std::mem::ManuallyDrop;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::syscall::SyscallTable;
use super::vm::{Limits, Vm};

/// Owner of the shared syscall table and limits, handing out VMs.
#[derive(Debug)]
pub struct VmPool {
    syscalls: Arc<SyscallTable>,
    limits: Limits,
    idle: Mutex<Vec<Vm>>,
    created: AtomicUsize,
}

impl VmPool {
    pub fn new(syscalls: SyscallTable, limits: Limits) -> Self {
        Self {
            syscalls: Arc::new(syscalls),
            limits,
            idle: Mutex::new(Vec::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Take an idle VM or create one. It returns to the pool when the guard
    /// is dropped.
    pub fn acquire(&self) -> PooledVm<'_> {
        let vm = self
            .idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| self.fresh());
        PooledVm {
            vm: ManuallyDrop::new(vm),
            pool: self,
        }
    }

    pub fn limits(&self) -> Limits {
        self.limits
    }

    pub fn syscalls(&self) -> &SyscallTable {
        &self.syscalls
    }

    /// Number of VMs waiting for reuse.
    pub fn idle(&self) -> usize {
        self.idle.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    /// Number of VMs this pool has constructed.
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    fn fresh(&self) -> Vm {
        self.created.fetch_add(1, Ordering::Relaxed);
        Vm::new(Arc::clone(&self.syscalls), self.limits)
    }

    fn release(&self, mut vm: Vm) {
        vm.reset();
        self.idle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(vm);
    }
}

/// A VM borrowed from a [`VmPool`].
#[derive(Debug)]
pub struct PooledVm<'a> {
    vm: ManuallyDrop<Vm>,
    pool: &'a VmPool,
}

impl Deref for PooledVm<'_> {
    type Target = Vm;

    fn deref(&self) -> &Vm {
        &self.vm
    }
}

impl DerefMut for PooledVm<'_> {
    fn deref_mut(&mut self) -> &mut Vm {
        &mut self.vm
    }
}

impl Drop for PooledVm<'_> {
    fn drop(&mut self) {
        // SAFETY: `vm` is taken exactly once, here, and never touched again.
        let vm = unsafe { ManuallyDrop::take(&mut self.vm) };
        self.pool.release(vm);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::DataTree;
    use crate::template::{Opcode, ProgramBuilder, Template};

    fn pool() -> VmPool {
        VmPool::new(SyscallTable::stdlib(100).unwrap(), Limits::default())
    }

    #[test]
    fn test_vm_is_reused() {
        let pool = pool();
        assert_eq!(pool.idle(), 0);
        {
            let _vm = pool.acquire();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 1);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
            assert_eq!(pool.idle(), 0);
        }
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_release_does_not_construct_vms() {
        let pool = pool();
        for _ in 0..3 {
            let _vm = pool.acquire();
        }
        assert_eq!(pool.created(), 1);
        assert_eq!(pool.idle(), 1);
        {
            let _a = pool.acquire();
            let _b = pool.acquire();
        }
        assert_eq!(pool.created(), 2);
        assert_eq!(pool.idle(), 2);
    }

    #[test]
    fn test_released_vm_is_clean_after_fault() {
        let pool = pool();
        let mut b = ProgramBuilder::new();
        b.push_int(1);
        b.push_int(2);
        b.op(Opcode::Ret);
        let t = Template::load(b.build(), true).unwrap();

        {
            let mut vm = pool.acquire();
            assert!(vm.run(t.program(), &mut DataTree::Null, &mut Vec::<u8>::new(), 0).is_err());
        }
        let vm = pool.acquire();
        assert!(vm.is_clean());
    }

    #[test]
    fn test_pool_is_shared_across_threads() {
        let pool = Arc::new(pool());
        let mut b = ProgramBuilder::new();
        b.emit_str("x");
        b.halt();
        let t = Template::load(b.build(), true).unwrap();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                let t = t.clone();
                std::thread::spawn(move || {
                    let mut out: Vec<u8> = Vec::new();
                    pool.acquire()
                        .run(t.program(), &mut DataTree::Null, &mut out, 0)
                        .unwrap();
                    out
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), b"x");
        }
        assert!(pool.idle() >= 1);
    }
}
