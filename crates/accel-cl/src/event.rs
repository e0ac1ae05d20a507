use std::fmt;
use std::time::Duration;

use accel_sys::{CommandType, EventStatus, ProfilingParam, RawEvent, Status};

use crate::context::Context;
use crate::error::{Error, Result};
use crate::handle::{EventKind, Handle};

/// Device timestamps of a command, in nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Profiling {
    pub queued: u64,
    pub submit: u64,
    pub start: u64,
    pub end: u64,
}

impl Profiling {
    /// Time the command spent executing.
    pub fn duration(&self) -> Duration {
        Duration::from_nanos(self.end.saturating_sub(self.start))
    }
}

/// Completion token of one enqueued command.
///
/// Status queries only observe; they never move a command forward.
#[derive(Clone)]
pub struct Event {
    handle: Handle<EventKind>,
    context: Context,
}

impl Event {
    pub(crate) fn adopt(context: &Context, raw: RawEvent) -> Self {
        Self {
            handle: Handle::adopt(context.backend().clone(), raw),
            context: context.clone(),
        }
    }

    pub fn raw(&self) -> RawEvent {
        self.handle.raw()
    }

    pub fn context(&self) -> &Context {
        &self.context
    }

    pub fn reference_count(&self) -> Result<u32> {
        self.handle.reference_count()
    }

    pub fn status(&self) -> Result<EventStatus> {
        let result = self.context.backend().event_status(self.raw());
        self.context.check("Event::status", result)
    }

    pub fn is_complete(&self) -> Result<bool> {
        Ok(self.status()? == EventStatus::Complete)
    }

    pub fn command_type(&self) -> Result<CommandType> {
        let result = self.context.backend().event_command_type(self.raw());
        self.context.check("Event::command_type", result)
    }

    /// Timestamps of a finished command. Needs a queue created with profiling enabled.
    pub fn profiling(&self) -> Result<Profiling> {
        let stamp = |param| {
            let result = self.context.backend().event_profiling(self.raw(), param);
            self.context.check("Event::profiling", result)
        };
        Ok(Profiling {
            queued: stamp(ProfilingParam::Queued)?,
            submit: stamp(ProfilingParam::Submit)?,
            start: stamp(ProfilingParam::Start)?,
            end: stamp(ProfilingParam::End)?,
        })
    }

    /// Blocks until the command finishes, returning the failure it ended with if any.
    pub fn wait(&self) -> Result<()> {
        Self::wait_for(std::slice::from_ref(self))
    }

    /// Blocks until every event is terminal. All events must belong to one context. When some
    /// command failed, the error is the first failed event's own status.
    pub fn wait_for(events: &[Event]) -> Result<()> {
        const OP: &str = "Event::wait";
        let Some(first) = events.first() else {
            return Ok(());
        };
        if events.iter().any(|e| !e.context.same(&first.context)) {
            return Err(Error::configuration(
                OP,
                "events belong to different contexts",
            ));
        }
        let raw: Vec<RawEvent> = events.iter().map(Event::raw).collect();
        match first.context.backend().wait_for_events(&raw) {
            Ok(()) => Ok(()),
            Err(Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST) => {
                for event in events {
                    if let EventStatus::Error(status) = event.status()? {
                        return Err(event.context.error(OP, status));
                    }
                }
                Err(first
                    .context
                    .error(OP, Status::EXEC_STATUS_ERROR_FOR_EVENTS_IN_WAIT_LIST))
            }
            Err(status) => Err(first.context.error(OP, status)),
        }
    }
}

impl PartialEq for Event {
    fn eq(&self, other: &Self) -> bool {
        self.handle == other.handle
    }
}

impl Eq for Event {}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Event").field(&self.raw()).finish()
    }
}
