//! Outstanding commands awaiting their responses.

use std::collections::HashMap;

use futures::channel::oneshot;

use crate::codec::{Command, Response, encode};
use crate::errors::Error;
use crate::runtime::Instant;

type Result<T> = std::result::Result<T, Error>;

/// Resolves a caller waiting on a command.
pub(crate) type Resolver = oneshot::Sender<Result<Response>>;

pub(crate) struct PendingCommand {
    pub command: Command,
    pub tx: Resolver,
    pub issued: Instant,
}

/// Request ID allocation and correlation for one connection.
///
/// IDs count up from 1 and wrap around. An ID is never handed out while a
/// command holding it is still outstanding.
pub(crate) struct PendingTable {
    next_id: u32,
    entries: HashMap<u32, PendingCommand>,
}

impl Default for PendingTable {
    fn default() -> Self {
        PendingTable {
            next_id: 1,
            entries: HashMap::new(),
        }
    }
}

impl PendingTable {
    fn allocate(&mut self) -> u32 {
        loop {
            let id = self.next_id;
            self.next_id = self.next_id.wrapping_add(1);
            if id != 0 && !self.entries.contains_key(&id) {
                return id;
            }
        }
    }

    /// Assign an ID, encode the command and start tracking it.
    ///
    /// Returns the ID, the encoded line, and the receiver for the outcome.
    pub fn register(
        &mut self,
        command: Command,
    ) -> Result<(u32, String, oneshot::Receiver<Result<Response>>)> {
        let id = self.allocate();
        let command = command.with_id(id);
        let line = encode(&command)?;
        let (tx, rx) = oneshot::channel();
        self.entries.insert(
            id,
            PendingCommand {
                command,
                tx,
                issued: Instant::now(),
            },
        );
        Ok((id, line, rx))
    }

    /// Take the command a response belongs to.
    pub fn take(&mut self, id: u32) -> Option<PendingCommand> {
        self.entries.remove(&id)
    }

    /// Forget a command whose caller stopped waiting.
    pub fn cancel(&mut self, id: u32) -> bool {
        self.entries.remove(&id).is_some()
    }

    /// Fail everything outstanding. Returns how many commands were failed.
    pub fn fail_all(&mut self, error: impl Fn() -> Error) -> usize {
        let count = self.entries.len();
        for (_, pending) in self.entries.drain() {
            let _ = pending.tx.send(Err(error()));
        }
        count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Age of the oldest outstanding command, in seconds.
    pub fn oldest_age(&self) -> Option<f64> {
        self.entries
            .values()
            .map(|p| p.issued.elapsed().as_secs_f64())
            .reduce(f64::max)
    }

    #[cfg(test)]
    fn set_next_id(&mut self, id: u32) {
        self.next_id = id;
    }
}
