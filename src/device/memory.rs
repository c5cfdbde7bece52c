//! Device allocations backing host objects.

use super::DeviceHandle;
use crate::backend::{DeviceBufferId, NativeEvent};
use crate::error::{Error, Result};
use crate::event::{Event, EventDescriptor};
use crate::memory::{HostBuffer, ObjectId};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Allocation {
    pub(crate) buffer: DeviceBufferId,
    pub(crate) bytes: usize,
}

fn natives(wait_list: &[&Event]) -> Vec<NativeEvent> {
    wait_list.iter().map(|e| e.native()).collect()
}

impl DeviceHandle {
    /// Device buffer for `host`, allocating (or growing) it as needed.
    pub fn ensure_allocated(&self, host: &HostBuffer) -> Result<DeviceBufferId> {
        let bytes = host.len_bytes();
        let queue = &self.shared().queue;
        let mut table = self.shared().allocations.lock();

        if let Some(existing) = table.get(&host.id()).copied() {
            if existing.bytes >= bytes {
                return Ok(existing.buffer);
            }
            table.remove(&host.id());
            queue.free(existing.buffer).map_err(Error::transfer)?;
        }

        let buffer = queue.allocate(bytes.max(1)).map_err(Error::transfer)?;
        table.insert(host.id(), Allocation { buffer, bytes });
        Ok(buffer)
    }

    /// Copy `host` to its device buffer once `wait_list` has completed.
    pub fn write_buffer(&self, host: &HostBuffer, wait_list: &[&Event]) -> Result<Event> {
        let buffer = self.ensure_allocated(host)?;
        let wait = natives(wait_list);
        let (native, bytes) = host.with_bytes(|data| {
            self.shared()
                .queue
                .enqueue_write(buffer, data, &wait)
                .map(|ev| (ev, data.len()))
        })
        .map_err(Error::transfer)?;

        log::debug!("write {} ({} bytes) to {:?}", host.id(), bytes, buffer);
        if let Some(metrics) = self.metrics() {
            metrics.record_transfer_to_device(bytes);
        }
        self.register_event(native, EventDescriptor::WriteToDevice(host.element_kind()))
    }

    /// Blocking copy of the device buffer back into `host`.
    pub fn read_buffer(&self, host: &HostBuffer, wait_list: &[&Event]) -> Result<Event> {
        let buffer = self.device_buffer(host.id()).ok_or_else(|| {
            Error::invalid_state(format!("{} has no device allocation", host.id()))
        })?;
        let wait = natives(wait_list);
        let (native, bytes) = host
            .with_bytes_mut(|out| {
                self.shared()
                    .queue
                    .enqueue_read(buffer, out, &wait)
                    .map(|ev| (ev, out.len()))
            })
            .map_err(Error::transfer)?;

        log::debug!("read {} ({} bytes) from {:?}", host.id(), bytes, buffer);
        if let Some(metrics) = self.metrics() {
            metrics.record_transfer_to_host(bytes);
        }
        self.register_event(native, EventDescriptor::ReadFromDevice(host.element_kind()))
    }

    /// Free the allocation backing `object`. Returns whether one existed.
    pub fn free_buffer(&self, object: ObjectId) -> Result<bool> {
        let removed = self.shared().allocations.lock().remove(&object);
        match removed {
            Some(allocation) => {
                self.shared()
                    .queue
                    .free(allocation.buffer)
                    .map_err(Error::from)?;
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub fn allocated_objects(&self) -> usize {
        self.shared().allocations.lock().len()
    }
}
