//! Asynchronous completion and profiling.
//!
//! An [`Event`] is allocated when a command is enqueued and owns the native
//! event until [`Event::release`] (or drop) hands its `local_id` back to the
//! device's [`EventPool`]. Status is resolved lazily; once `Complete` is seen
//! it is cached and no further native calls are made.

pub mod pool;

use crate::backend::{codes, status, NativeEvent, ProfilingInfo};
use crate::device::DeviceShared;
use crate::error::{Error, Result};
use crate::memory::ElementKind;
use crate::runtime;
use std::cell::Cell;
use std::fmt;
use std::sync::Arc;

pub use pool::{EventPool, EventSlot};

/// First tag handed out by a device.
pub const DEFAULT_TAG: u64 = 0x12;

/// What a command did, for logs and error messages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventDescriptor {
    SerialKernel,
    ParallelKernel,
    WriteToDevice(ElementKind),
    ReadFromDevice(ElementKind),
    SyncMarker,
    SyncBarrier,
    None,
}

impl fmt::Display for EventDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EventDescriptor::SerialKernel => f.write_str("kernel - serial"),
            EventDescriptor::ParallelKernel => f.write_str("kernel - parallel"),
            EventDescriptor::WriteToDevice(kind) => write!(f, "writeToDevice - {}", kind.array_name()),
            EventDescriptor::ReadFromDevice(kind) => {
                write!(f, "readFromDevice - {}", kind.array_name())
            }
            EventDescriptor::SyncMarker => f.write_str("sync - marker"),
            EventDescriptor::SyncBarrier => f.write_str("sync - barrier"),
            EventDescriptor::None => f.write_str("none"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStatus {
    Queued,
    Submitted,
    Running,
    Complete,
    Error,
    Unknown,
}

impl EventStatus {
    pub fn from_native(value: i32) -> Self {
        match value {
            status::COMPLETE => EventStatus::Complete,
            status::RUNNING => EventStatus::Running,
            status::SUBMITTED => EventStatus::Submitted,
            status::QUEUED => EventStatus::Queued,
            v if v < 0 => EventStatus::Error,
            _ => EventStatus::Unknown,
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            EventStatus::Complete | EventStatus::Error | EventStatus::Unknown
        )
    }
}

/// Handle to one enqueued command.
pub struct Event {
    local_id: usize,
    native: NativeEvent,
    descriptor: EventDescriptor,
    tag: u64,
    cached: Cell<Option<EventStatus>>,
    device: Arc<DeviceShared>,
    released: bool,
}

impl Event {
    /// Bind `native` to a pool slot. On failure the native event is released.
    pub(crate) fn register(
        device: &Arc<DeviceShared>,
        native: NativeEvent,
        descriptor: EventDescriptor,
    ) -> Result<Self> {
        let tag = device.next_tag();
        let slot = EventSlot {
            descriptor,
            tag,
            native,
        };
        let local_id = match device.events.register(slot) {
            Ok(id) => id,
            Err(err) => {
                let _ = device.queue.release_event(native);
                return Err(err);
            }
        };

        if let Some(metrics) = device.metrics() {
            metrics.record_event_allocated();
        }

        Ok(Self {
            local_id,
            native,
            descriptor,
            tag,
            cached: Cell::new(None),
            device: device.clone(),
            released: false,
        })
    }

    pub fn local_id(&self) -> usize {
        self.local_id
    }

    pub fn descriptor(&self) -> EventDescriptor {
        self.descriptor
    }

    pub fn tag(&self) -> u64 {
        self.tag
    }

    pub fn is_released(&self) -> bool {
        self.released
    }

    pub(crate) fn native(&self) -> NativeEvent {
        self.native
    }

    pub fn name(&self) -> String {
        format!("{}: {:#x}", self.descriptor, self.tag)
    }

    fn ensure_live(&self, op: &str) -> Result<()> {
        if self.released {
            if cfg!(debug_assertions) {
                panic!("{} on released event {}", op, self.name());
            }
            return Err(Error::invalid_state(format!(
                "{} on released event {}",
                op,
                self.name()
            )));
        }
        Ok(())
    }

    fn query(&self) -> Result<(EventStatus, i32)> {
        if self.cached.get() == Some(EventStatus::Complete) {
            return Ok((EventStatus::Complete, status::COMPLETE));
        }
        let raw = self.device.queue.event_status(self.native)?;
        let status = EventStatus::from_native(raw);
        if status == EventStatus::Complete {
            self.cached.set(Some(status));
        }
        Ok((status, raw))
    }

    fn status_error(&self, raw: i32) -> Error {
        Error::EventStatus {
            descriptor: self.descriptor,
            tag: self.tag,
            status: raw,
        }
    }

    /// Current status, asking the device unless `Complete` was already seen.
    pub fn status(&self) -> Result<EventStatus> {
        self.ensure_live("status")?;
        self.query().map(|(status, _)| status)
    }

    /// Block until the command has finished.
    ///
    /// `Error` and `Unknown`, before or after the wait, are fatal and carry the
    /// descriptor and tag.
    pub fn wait_on(&self) -> Result<()> {
        self.ensure_live("wait_on")?;

        let (status, raw) = self.query()?;
        match status {
            EventStatus::Complete => return Ok(()),
            EventStatus::Submitted => {
                self.device.queue.flush()?;
            }
            EventStatus::Queued | EventStatus::Running => {}
            EventStatus::Error | EventStatus::Unknown => return Err(self.status_error(raw)),
        }

        self.device
            .queue
            .wait_for_events(&[self.native], self.device.wait_timeout)?;

        let (status, raw) = self.query()?;
        match status {
            EventStatus::Complete => Ok(()),
            EventStatus::Error | EventStatus::Unknown => Err(self.status_error(raw)),
            EventStatus::Queued | EventStatus::Submitted | EventStatus::Running => {
                Err(Error::Device {
                    call: "wait_on",
                    code: codes::WAIT_TIMEOUT,
                })
            }
        }
    }

    fn read_time(&self, info: ProfilingInfo) -> i64 {
        if self.released {
            if cfg!(debug_assertions) {
                panic!("profiling read on released event {}", self.name());
            }
            return -1;
        }
        if !runtime::profiling_enabled() {
            return -1;
        }
        match self.device.queue.profiling_info(self.native, info) {
            Ok(ns) => ns as i64,
            Err(err) => {
                log::warn!("unable to read {:?} time of {}: {}", info, self.name(), err);
                -1
            }
        }
    }

    /// Nanoseconds, or `-1` when profiling is off or the counter is unreadable.
    pub fn submit_time(&self) -> i64 {
        self.read_time(ProfilingInfo::Submit)
    }

    pub fn start_time(&self) -> i64 {
        self.read_time(ProfilingInfo::Start)
    }

    pub fn end_time(&self) -> i64 {
        self.read_time(ProfilingInfo::End)
    }

    pub fn execution_time(&self) -> i64 {
        let start = self.start_time();
        let end = self.end_time();
        if start < 0 || end < 0 {
            return -1;
        }
        end - start
    }

    // same as execution_time; queueing delay is not included
    pub fn total_time(&self) -> i64 {
        self.execution_time()
    }

    pub fn execution_time_secs(&self) -> f64 {
        nanos_to_secs(self.execution_time())
    }

    pub fn total_time_secs(&self) -> f64 {
        nanos_to_secs(self.total_time())
    }

    /// Return the slot to the pool and release the native event.
    pub fn release(&mut self) -> Result<()> {
        self.ensure_live("release")?;
        self.release_inner()
    }

    fn release_inner(&mut self) -> Result<()> {
        self.released = true;
        self.device.events.release(self.local_id)?;
        if let Some(metrics) = self.device.metrics() {
            metrics.record_event_released();
        }
        if let Err(err) = self.device.queue.release_event(self.native) {
            log::warn!("failed to release native event of {}: {}", self.name(), err);
        }
        Ok(())
    }
}

fn nanos_to_secs(ns: i64) -> f64 {
    if ns < 0 {
        -1.0
    } else {
        ns as f64 * 1e-9
    }
}

impl Drop for Event {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release_inner();
        }
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("name", &self.name())
            .field("local_id", &self.local_id)
            .field("native", &self.native)
            .field("status", &self.cached.get())
            .field("released", &self.released)
            .finish()
    }
}
