//! Outgoing command queue with pause gating.
use std::{
    collections::VecDeque,
    time::{Duration, Instant, SystemTime},
};

/// Suspends dispatch of queued commands.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PauseCommand {
    /// Pause for a duration, counted from the moment the pause reaches the head of the queue.
    Relative(Duration),
    /// Pause until the wall clock passes the deadline.
    Until(SystemTime),
}

impl PauseCommand {
    pub fn relative(duration: Duration) -> PauseCommand {
        PauseCommand::Relative(duration)
    }

    pub fn until(deadline: SystemTime) -> PauseCommand {
        PauseCommand::Until(deadline)
    }

    pub fn arm(self, now: Instant) -> ActivePause {
        ActivePause {
            command: self,
            armed_at: now,
        }
    }
}

/// A pause that reached the head of the queue and is currently blocking dispatch.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ActivePause {
    command: PauseCommand,
    armed_at: Instant,
}

impl ActivePause {
    pub fn command(&self) -> PauseCommand {
        self.command
    }

    pub fn expired(&self, now: Instant, wall_clock: SystemTime) -> bool {
        match self.command {
            PauseCommand::Relative(duration) => {
                now.saturating_duration_since(self.armed_at) > duration
            }
            PauseCommand::Until(deadline) => wall_clock > deadline,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum WriteCommand {
    Line(String),
    Pause(PauseCommand),
}

/// FIFO of outgoing commands. Dispatch stops at the first pause.
#[derive(Debug, Default)]
pub struct WriteQueue {
    commands: VecDeque<WriteCommand>,
}

impl WriteQueue {
    pub fn push(&mut self, command: WriteCommand) {
        self.commands.push_back(command);
    }

    pub fn len(&self) -> usize {
        self.commands.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commands.is_empty()
    }

    /// Removes and returns every pending command.
    pub fn clear(&mut self) -> Vec<WriteCommand> {
        self.commands.drain(..).collect()
    }

    /// Runs one dispatch step.
    ///
    /// While `pause` is set nothing is sent; the pause is cleared once expired and
    /// sending resumes on the next call. Otherwise lines are handed to `send` in order
    /// until the queue is empty or a pause command is reached, which gets armed.
    /// A line that fails to send stays at the head of the queue.
    pub fn dispatch<E>(
        &mut self,
        pause: &mut Option<ActivePause>,
        now: Instant,
        wall_clock: SystemTime,
        mut send: impl FnMut(&str) -> Result<(), E>,
    ) -> Result<usize, E> {
        if let Some(active) = pause {
            if active.expired(now, wall_clock) {
                *pause = None;
            }
            return Ok(0);
        }

        let mut sent = 0;
        while let Some(command) = self.commands.pop_front() {
            match command {
                WriteCommand::Pause(command) => {
                    *pause = Some(command.arm(now));
                    break;
                }
                WriteCommand::Line(line) => {
                    if let Err(e) = send(&line) {
                        self.commands.push_front(WriteCommand::Line(line));
                        return Err(e);
                    }
                    sent += 1;
                }
            }
        }
        Ok(sent)
    }
}
