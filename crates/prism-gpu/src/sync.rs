//! Synchronization primitives.
//!
//! Two kinds exist: CPU-kind primitives are fences the host can block on and
//! must reset before reuse; GPU-kind primitives are binary semaphores that
//! only queue operations wait on and signal.

use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use ash::vk;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Which side can wait on a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncKind {
    /// Host-waitable (fence).
    Cpu,
    /// Queue-waitable only (semaphore).
    Gpu,
}

impl SyncKind {
    pub fn label(self) -> &'static str {
        match self {
            Self::Cpu => "CPU-kind",
            Self::Gpu => "GPU-kind",
        }
    }
}

/// Native handle of a primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SyncHandle {
    Fence(vk::Fence),
    Semaphore(vk::Semaphore),
}

impl SyncHandle {
    pub fn kind(self) -> SyncKind {
        match self {
            Self::Fence(_) => SyncKind::Cpu,
            Self::Semaphore(_) => SyncKind::Gpu,
        }
    }

    pub fn fence(self) -> Result<vk::Fence> {
        match self {
            Self::Fence(fence) => Ok(fence),
            Self::Semaphore(_) => Err(GpuError::WrongSyncKind {
                expected: SyncKind::Cpu.label(),
            }),
        }
    }

    pub fn semaphore(self) -> Result<vk::Semaphore> {
        match self {
            Self::Semaphore(semaphore) => Ok(semaphore),
            Self::Fence(_) => Err(GpuError::WrongSyncKind {
                expected: SyncKind::Gpu.label(),
            }),
        }
    }
}

/// Collect fences for a host wait, rejecting any GPU-kind handle.
pub fn fences_for_wait(handles: impl IntoIterator<Item = SyncHandle>) -> Result<Vec<vk::Fence>> {
    let mut fences: Vec<vk::Fence> = Vec::new();
    for handle in handles {
        let fence = handle.fence()?;
        if !fences.contains(&fence) {
            fences.push(fence);
        }
    }
    Ok(fences)
}

/// A fence or binary semaphore owned by its creator.
pub struct SyncPrimitive {
    raw: Arc<RawDevice>,
    handle: SyncHandle,
    // Set while a submitted signal is pending a host wait; fences only
    armed: AtomicBool,
}

impl SyncPrimitive {
    /// Create an unsignaled primitive of the given kind.
    pub fn new(raw: &Arc<RawDevice>, kind: SyncKind) -> Result<Self> {
        let handle = unsafe {
            match kind {
                SyncKind::Cpu => SyncHandle::Fence(
                    raw.device
                        .create_fence(&vk::FenceCreateInfo::default(), None)
                        .map_err(|err| {
                            tracing::error!(%err, "vkCreateFence failed");
                            GpuError::from(err)
                        })?,
                ),
                SyncKind::Gpu => SyncHandle::Semaphore(
                    raw.device
                        .create_semaphore(&vk::SemaphoreCreateInfo::default(), None)
                        .map_err(|err| {
                            tracing::error!(%err, "vkCreateSemaphore failed");
                            GpuError::from(err)
                        })?,
                ),
            }
        };
        Ok(Self {
            raw: Arc::clone(raw),
            handle,
            armed: AtomicBool::new(false),
        })
    }

    pub fn kind(&self) -> SyncKind {
        self.handle.kind()
    }

    /// Native handle accessor.
    pub fn native(&self) -> SyncHandle {
        self.handle
    }

    pub fn fence(&self) -> Result<vk::Fence> {
        self.handle.fence()
    }

    pub fn semaphore(&self) -> Result<vk::Semaphore> {
        self.handle.semaphore()
    }

    /// Whether a submission will signal (or has signaled) this fence and it
    /// has not been waited on since.
    pub fn is_armed(&self) -> bool {
        self.armed.load(Ordering::Acquire)
    }

    /// Query the fence status without blocking.
    pub fn is_signaled(&self) -> Result<bool> {
        let fence = self.fence()?;
        Ok(unsafe { self.raw.device.get_fence_status(fence) }?)
    }

    /// Mark a fence as the signal target of a submission.
    ///
    /// Fails if a previous signal has not been waited on and reset yet.
    pub(crate) fn arm(&self) -> Result<()> {
        self.fence()?;
        if self.armed.swap(true, Ordering::AcqRel) {
            return Err(GpuError::InvalidState(
                "CPU-kind primitive reused before it was waited on and reset".into(),
            ));
        }
        Ok(())
    }

    pub(crate) fn disarm(&self) {
        self.armed.store(false, Ordering::Release);
    }
}

impl Drop for SyncPrimitive {
    fn drop(&mut self) {
        unsafe {
            match self.handle {
                SyncHandle::Fence(fence) => self.raw.device.destroy_fence(fence, None),
                SyncHandle::Semaphore(semaphore) => {
                    self.raw.device.destroy_semaphore(semaphore, None);
                }
            }
        }
    }
}

/// Block until every listed CPU-kind primitive is signaled, then reset them.
///
/// An empty list returns immediately. Any GPU-kind primitive is rejected
/// before the host blocks.
#[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
pub fn wait_and_reset(raw: &RawDevice, primitives: &[&SyncPrimitive]) -> Result<()> {
    let fences = fences_for_wait(primitives.iter().map(|p| p.native()))?;
    if fences.is_empty() {
        return Ok(());
    }
    unsafe {
        raw.device.wait_for_fences(&fences, true, u64::MAX).map_err(|err| {
            tracing::error!(%err, "vkWaitForFences failed");
            GpuError::from(err)
        })?;
        raw.device.reset_fences(&fences).map_err(|err| {
            tracing::error!(%err, "vkResetFences failed");
            GpuError::from(err)
        })?;
    }
    for primitive in primitives {
        primitive.disarm();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    #[test]
    fn kind_matches_handle() {
        let fence = SyncHandle::Fence(vk::Fence::from_raw(1));
        let semaphore = SyncHandle::Semaphore(vk::Semaphore::from_raw(2));
        assert_eq!(fence.kind(), SyncKind::Cpu);
        assert_eq!(semaphore.kind(), SyncKind::Gpu);
        assert!(fence.semaphore().is_err());
        assert_eq!(semaphore.semaphore().unwrap(), vk::Semaphore::from_raw(2));
    }

    #[test]
    fn wait_rejects_gpu_kind() {
        let handles = [
            SyncHandle::Fence(vk::Fence::from_raw(1)),
            SyncHandle::Semaphore(vk::Semaphore::from_raw(2)),
        ];
        let err = fences_for_wait(handles).unwrap_err();
        assert!(matches!(err, GpuError::WrongSyncKind { expected: "CPU-kind" }));
    }

    #[test]
    fn wait_list_deduplicates_and_keeps_order() {
        let handles = [
            SyncHandle::Fence(vk::Fence::from_raw(3)),
            SyncHandle::Fence(vk::Fence::from_raw(1)),
            SyncHandle::Fence(vk::Fence::from_raw(3)),
        ];
        assert_eq!(
            fences_for_wait(handles).unwrap(),
            vec![vk::Fence::from_raw(3), vk::Fence::from_raw(1)]
        );
        assert!(fences_for_wait([]).unwrap().is_empty());
    }
}
