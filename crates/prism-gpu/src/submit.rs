//! Queue submission with explicit wait/signal edges.
//!
//! A batch is validated and flattened into a [`BatchPlan`] before anything
//! reaches the driver, so a malformed batch never produces a partial submit.

use crate::command::CommandBuffer;
use crate::device::RawDevice;
use crate::error::{GpuError, Result};
use crate::sync::{SyncHandle, SyncPrimitive};
use ash::vk;
use hashbrown::HashMap;
use parking_lot::Mutex;
use std::sync::Arc;

/// Stage every wait is gated at.
pub const WAIT_STAGE: vk::PipelineStageFlags = vk::PipelineStageFlags::TOP_OF_PIPE;

/// One command buffer with the primitives it waits on and signals.
pub struct SubmitInfo<'a> {
    pub command_buffer: &'a CommandBuffer,
    pub wait_for: Vec<&'a SyncPrimitive>,
    pub signal: Option<&'a SyncPrimitive>,
}

impl<'a> SubmitInfo<'a> {
    pub fn new(command_buffer: &'a CommandBuffer) -> Self {
        Self {
            command_buffer,
            wait_for: Vec::new(),
            signal: None,
        }
    }

    pub fn wait(mut self, primitive: &'a SyncPrimitive) -> Self {
        self.wait_for.push(primitive);
        self
    }

    pub fn signal(mut self, primitive: &'a SyncPrimitive) -> Self {
        self.signal = Some(primitive);
        self
    }
}

/// Native-handle form of a submission, used for planning.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmissionEntry {
    pub command_buffer: vk::CommandBuffer,
    pub waits: Vec<SyncHandle>,
    pub signal: Option<SyncHandle>,
    pub completion: Option<SyncHandle>,
}

/// One flattened `vkQueueSubmit` batch element.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedSubmit {
    pub command_buffer: vk::CommandBuffer,
    pub wait_semaphores: Vec<vk::Semaphore>,
    pub wait_stages: Vec<vk::PipelineStageFlags>,
    pub signal_semaphores: Vec<vk::Semaphore>,
}

/// Validated batch, in input order, plus the batch completion fence.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchPlan {
    pub submits: Vec<PlannedSubmit>,
    pub completion: Option<vk::Fence>,
}

/// Where a semaphore stands while a batch is walked in order.
#[derive(Debug, Clone, Copy)]
enum EdgeState {
    /// Signaled by this entry and not waited yet.
    Pending(usize),
    /// Last signal consumed by this entry.
    Consumed(usize),
    /// Waited by this entry on a signal from outside the batch.
    External(usize),
}

/// Validate wait/signal edges and flatten a batch.
///
/// Each GPU-kind primitive must alternate signal and wait inside a batch.
/// Rejects CPU-kind primitives in wait or signal slots, a second signal
/// before the first one is waited, a second wait without a signal in
/// between, and a wait placed before the entry that signals it. Waits on
/// semaphores signaled outside the batch are allowed.
pub fn plan_batch(entries: &[SubmissionEntry]) -> Result<BatchPlan> {
    let mut first_signal: HashMap<vk::Semaphore, usize> = HashMap::new();
    for (index, entry) in entries.iter().enumerate() {
        if let Some(signal) = entry.signal {
            first_signal.entry(signal.semaphore()?).or_insert(index);
        }
    }

    let mut states: HashMap<vk::Semaphore, EdgeState> = HashMap::new();
    let mut submits = Vec::with_capacity(entries.len());
    for (index, entry) in entries.iter().enumerate() {
        let mut wait_semaphores = Vec::with_capacity(entry.waits.len());
        for wait in &entry.waits {
            let semaphore = wait.semaphore()?;
            let next = match states.get(&semaphore) {
                Some(EdgeState::Pending(_)) => EdgeState::Consumed(index),
                Some(EdgeState::Consumed(previous) | EdgeState::External(previous)) => {
                    return Err(GpuError::InvalidState(format!(
                        "entries {previous} and {index} wait on the same GPU-kind primitive \
                         without a signal in between"
                    )));
                }
                None => match first_signal.get(&semaphore) {
                    Some(&signaler) => {
                        return Err(GpuError::InvalidState(format!(
                            "entry {index} waits on a primitive signaled by entry {signaler}"
                        )));
                    }
                    None => EdgeState::External(index),
                },
            };
            states.insert(semaphore, next);
            wait_semaphores.push(semaphore);
        }

        let signal_semaphores: Vec<vk::Semaphore> =
            entry.signal.map(SyncHandle::semaphore).transpose()?.into_iter().collect();
        for &semaphore in &signal_semaphores {
            if let Some(EdgeState::Pending(previous)) = states.get(&semaphore) {
                return Err(GpuError::InvalidState(format!(
                    "entries {previous} and {index} signal the same GPU-kind primitive \
                     without a wait in between"
                )));
            }
            states.insert(semaphore, EdgeState::Pending(index));
        }

        submits.push(PlannedSubmit {
            command_buffer: entry.command_buffer,
            wait_stages: vec![WAIT_STAGE; wait_semaphores.len()],
            wait_semaphores,
            signal_semaphores,
        });
    }

    let completion = entries
        .last()
        .and_then(|e| e.completion)
        .map(SyncHandle::fence)
        .transpose()?;

    Ok(BatchPlan {
        submits,
        completion,
    })
}

/// The device queue. Submissions are serialized through it.
pub struct Queue {
    raw: Arc<RawDevice>,
    queue: Mutex<vk::Queue>,
    family: u32,
}

impl Queue {
    pub(crate) fn new(raw: &Arc<RawDevice>, family: u32) -> Self {
        let queue = unsafe { raw.device.get_device_queue(family, 0) };
        Self {
            raw: Arc::clone(raw),
            queue: Mutex::new(queue),
            family,
        }
    }

    pub fn family(&self) -> u32 {
        self.family
    }

    /// Submit a batch in order. The last entry's completion fence, if any,
    /// is signaled when the batch finishes.
    #[cfg_attr(feature = "profiling-tracy", tracing::instrument(level = "trace", skip_all))]
    pub fn submit(&self, batch: &[SubmitInfo<'_>]) -> Result<()> {
        if batch.is_empty() {
            return Ok(());
        }
        let entries = batch
            .iter()
            .map(|info| {
                Ok(SubmissionEntry {
                    command_buffer: info.command_buffer.executable_handle()?,
                    waits: info.wait_for.iter().map(|p| p.native()).collect(),
                    signal: info.signal.map(SyncPrimitive::native),
                    completion: info.command_buffer.completion().map(SyncPrimitive::native),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let plan = plan_batch(&entries).inspect_err(|err| {
            tracing::error!(%err, "Rejected submission batch");
        })?;

        let completion = batch.last().and_then(|info| info.command_buffer.completion());
        if let Some(fence) = completion {
            fence.arm()?;
        }

        let command_buffers: Vec<[vk::CommandBuffer; 1]> =
            plan.submits.iter().map(|s| [s.command_buffer]).collect();
        let submit_infos: Vec<vk::SubmitInfo> = plan
            .submits
            .iter()
            .zip(&command_buffers)
            .map(|(s, cmd)| {
                vk::SubmitInfo::default()
                    .command_buffers(cmd)
                    .wait_semaphores(&s.wait_semaphores)
                    .wait_dst_stage_mask(&s.wait_stages)
                    .signal_semaphores(&s.signal_semaphores)
            })
            .collect();

        let queue = self.queue.lock();
        let result = unsafe {
            self.raw.device.queue_submit(
                *queue,
                &submit_infos,
                plan.completion.unwrap_or_else(vk::Fence::null),
            )
        };
        if let Err(err) = result {
            if let Some(fence) = completion {
                fence.disarm();
            }
            tracing::error!(%err, entries = batch.len(), "vkQueueSubmit failed, frame lost");
            return Err(GpuError::Submission(err));
        }
        tracing::trace!(entries = batch.len(), "Submitted batch");
        Ok(())
    }

    /// Block until the queue is idle.
    pub fn wait_idle(&self) -> Result<()> {
        let queue = self.queue.lock();
        unsafe { self.raw.device.queue_wait_idle(*queue) }?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;

    fn cmd(id: u64) -> vk::CommandBuffer {
        vk::CommandBuffer::from_raw(id)
    }

    fn sem(id: u64) -> SyncHandle {
        SyncHandle::Semaphore(vk::Semaphore::from_raw(id))
    }

    fn fence(id: u64) -> SyncHandle {
        SyncHandle::Fence(vk::Fence::from_raw(id))
    }

    fn entry(id: u64, waits: &[u64], signal: Option<u64>) -> SubmissionEntry {
        SubmissionEntry {
            command_buffer: cmd(id),
            waits: waits.iter().map(|&w| sem(w)).collect(),
            signal: signal.map(sem),
            completion: Some(fence(100 + id)),
        }
    }

    #[test]
    fn preserves_order_and_gates_waits_at_top_of_pipe() {
        let plan = plan_batch(&[
            entry(1, &[], Some(10)),
            entry(2, &[10, 99], Some(11)),
            entry(3, &[11], None),
        ])
        .unwrap();

        let order: Vec<_> = plan.submits.iter().map(|s| s.command_buffer).collect();
        assert_eq!(order, vec![cmd(1), cmd(2), cmd(3)]);
        assert_eq!(plan.submits[1].wait_semaphores.len(), 2);
        assert!(plan.submits[1]
            .wait_stages
            .iter()
            .all(|&s| s == vk::PipelineStageFlags::TOP_OF_PIPE));
        assert_eq!(
            plan.submits[0].signal_semaphores,
            vec![vk::Semaphore::from_raw(10)]
        );
        assert!(plan.submits[2].signal_semaphores.is_empty());
    }

    #[test]
    fn completion_comes_from_last_entry() {
        let plan = plan_batch(&[entry(1, &[], Some(10)), entry(2, &[10], None)]).unwrap();
        assert_eq!(plan.completion, Some(vk::Fence::from_raw(102)));

        let mut last = entry(3, &[], None);
        last.completion = None;
        let plan = plan_batch(&[entry(1, &[], None), last]).unwrap();
        assert_eq!(plan.completion, None);
    }

    #[test]
    fn empty_batch_plans_nothing() {
        assert_eq!(plan_batch(&[]).unwrap(), BatchPlan::default());
    }

    #[test]
    fn rejects_double_signal() {
        let err = plan_batch(&[entry(1, &[], Some(10)), entry(2, &[], Some(10))]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }

    #[test]
    fn primitive_reused_after_its_wait() {
        let plan = plan_batch(&[
            entry(1, &[], Some(10)),
            entry(2, &[10], None),
            entry(3, &[], Some(10)),
            entry(4, &[10], None),
        ])
        .unwrap();
        assert_eq!(plan.submits.len(), 4);
        assert_eq!(
            plan.submits[3].wait_semaphores,
            vec![vk::Semaphore::from_raw(10)]
        );
    }

    #[test]
    fn rejects_double_wait_across_reuse() {
        let err = plan_batch(&[
            entry(1, &[], Some(10)),
            entry(2, &[10], None),
            entry(3, &[], Some(10)),
            entry(4, &[10], None),
            entry(5, &[10], None),
        ])
        .unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }

    #[test]
    fn rejects_second_wait_on_external_signal() {
        assert!(plan_batch(&[entry(1, &[20], None)]).is_ok());
        assert!(plan_batch(&[entry(1, &[20], None), entry(2, &[20], None)]).is_err());
    }

    #[test]
    fn rejects_double_wait() {
        let err = plan_batch(&[
            entry(1, &[], Some(10)),
            entry(2, &[10], None),
            entry(3, &[10], None),
        ])
        .unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));
    }

    #[test]
    fn rejects_wait_before_signal() {
        let err = plan_batch(&[entry(1, &[10], None), entry(2, &[], Some(10))]).unwrap_err();
        assert!(matches!(err, GpuError::InvalidState(_)));

        // Waiting on its own signal is also a wait before the signal
        assert!(plan_batch(&[entry(1, &[10], Some(10))]).is_err());
    }

    #[test]
    fn rejects_cpu_kind_in_gpu_slots() {
        let mut bad_wait = entry(1, &[], None);
        bad_wait.waits.push(fence(5));
        assert!(matches!(
            plan_batch(&[bad_wait]).unwrap_err(),
            GpuError::WrongSyncKind { expected: "GPU-kind" }
        ));

        let mut bad_signal = entry(1, &[], None);
        bad_signal.signal = Some(fence(5));
        assert!(plan_batch(&[bad_signal]).is_err());
    }
}
