//! Temporary, persistent and descriptor-heap allocation.
//!
//! Temporary buffers and descriptor heaps are referenced by work that runs
//! after the call that created them returns, so they go into a
//! [`DeferredRelease`] queue instead of being dropped. Entries are tagged with
//! the submission that consumes them and dropped only once the device reports
//! that submission complete. Draining happens on the next allocation.

use crate::binding::BufferBinding;
use crate::device::{Device, SubmissionId};
use crate::resource::ResourceHandle;
use crate::{Error, Result};
use std::collections::VecDeque;
use std::sync::Arc;
use tracing::debug;

/// An object kept alive for the device.
#[derive(Debug)]
enum Deferred<H> {
    Buffer(ResourceHandle),
    Heap(H),
}

/// Queue of owned objects that must outlive a queue submission.
#[derive(Debug)]
pub struct DeferredRelease<H> {
    /// Kept alive until the next submission, which is not known yet.
    unsubmitted: Vec<Deferred<H>>,

    /// Tagged with the submission that references them, oldest first.
    in_flight: VecDeque<(SubmissionId, Vec<Deferred<H>>)>,
}

impl<H> Default for DeferredRelease<H> {
    fn default() -> Self {
        Self {
            unsubmitted: Vec::new(),
            in_flight: VecDeque::new(),
        }
    }
}

impl<H> DeferredRelease<H> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Keep `resource` alive until the next submission completes.
    pub fn keep_buffer(&mut self, resource: ResourceHandle) {
        self.unsubmitted.push(Deferred::Buffer(resource));
    }

    /// Keep `heap` alive until the next submission completes.
    pub fn keep_heap(&mut self, heap: H) {
        self.unsubmitted.push(Deferred::Heap(heap));
    }

    /// Tag everything kept since the last submission with `submission`.
    pub fn submitted(&mut self, submission: SubmissionId) {
        if self.unsubmitted.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.unsubmitted);
        self.in_flight.push_back((submission, batch));
    }

    /// Drop everything tagged with a submission at or before `completed`.
    ///
    /// Returns the number of objects released.
    pub fn release_retired(&mut self, completed: SubmissionId) -> usize {
        let mut released = 0;
        while let Some((submission, _)) = self.in_flight.front() {
            if *submission > completed {
                break;
            }
            if let Some((_, batch)) = self.in_flight.pop_front() {
                released += batch.len();
            }
        }
        released
    }

    /// Objects still held, submitted or not.
    pub fn pending(&self) -> usize {
        self.unsubmitted.len() + self.in_flight.iter().map(|(_, b)| b.len()).sum::<usize>()
    }
}

/// The persistent resource of one dispatchable.
///
/// Created at most once, at initialization, and reused unchanged by every
/// later bind.
#[derive(Debug, Default)]
pub struct PersistentSlot {
    resource: Option<ResourceHandle>,
    created: bool,
}

impl PersistentSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// The persistent buffer, if one was needed.
    pub fn get(&self) -> Option<&ResourceHandle> {
        self.resource.as_ref()
    }

    /// Whole-buffer binding of the persistent resource.
    pub fn binding(&self) -> Option<BufferBinding> {
        self.resource.clone().map(BufferBinding::whole)
    }

    pub fn is_created(&self) -> bool {
        self.created
    }
}

/// Sizes and creates transient resources for one dispatchable.
#[derive(Debug)]
pub struct TransientAllocator<D: Device> {
    device: Arc<D>,
    deferred: DeferredRelease<D::DescriptorHeap>,
}

impl<D: Device> TransientAllocator<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            deferred: DeferredRelease::new(),
        }
    }

    /// Release objects whose submission the device has retired.
    pub fn collect(&mut self) {
        let completed = self.device.completed_submission();
        let released = self.deferred.release_retired(completed);
        if released > 0 {
            debug!(released, %completed, "released deferred resources");
        }
    }

    /// Create a descriptor heap for `required` descriptors.
    ///
    /// At least one descriptor is always allocated so the binding table has
    /// valid handles even when nothing is bound.
    pub fn descriptor_heap(&mut self, required: u32) -> Result<D::DescriptorHeap> {
        self.collect();
        let count = required.max(1);
        debug!(required, count, "creating descriptor heap");
        let heap = self.device.create_descriptor_heap(count)?;
        self.deferred.keep_heap(heap.clone());
        Ok(heap)
    }

    /// Create a temporary buffer of `size` bytes, or nothing if `size` is zero.
    ///
    /// The buffer is kept alive until the next submission completes.
    pub fn temporary(&mut self, size: u64, label: &str) -> Result<Option<ResourceHandle>> {
        if size == 0 {
            debug!(label, "no temporary resource required");
            return Ok(None);
        }
        self.collect();
        let buffer = self.device.create_buffer(size, label)?;
        debug!(label, size, "created temporary resource");
        self.deferred.keep_buffer(buffer.clone());
        Ok(Some(buffer))
    }

    /// Create the persistent buffer held in `slot`.
    ///
    /// Nothing is allocated when `size` is zero.
    ///
    /// # Errors
    ///
    /// [`Error::PersistentReallocated`] if `slot` was already populated.
    pub fn persistent(
        &mut self,
        slot: &mut PersistentSlot,
        size: u64,
        label: &str,
    ) -> Result<Option<ResourceHandle>> {
        if slot.created {
            return Err(Error::PersistentReallocated(label.to_string()));
        }
        slot.created = true;
        if size == 0 {
            debug!(label, "no persistent resource required");
            return Ok(None);
        }
        let buffer = self.device.create_buffer(size, label)?;
        debug!(label, size, "created persistent resource");
        slot.resource = Some(buffer.clone());
        Ok(Some(buffer))
    }

    /// Record that everything allocated so far is referenced by `submission`.
    pub fn submitted(&mut self, submission: SubmissionId) {
        self.deferred.submitted(submission);
    }

    /// Objects awaiting release.
    pub fn pending(&self) -> usize {
        self.deferred.pending()
    }

    pub fn device(&self) -> &Arc<D> {
        &self.device
    }
}
