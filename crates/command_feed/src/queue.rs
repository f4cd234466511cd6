// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! The buffer between the fetch loop and the dispatch loop.

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::commands::PrivacyCommand;

/// An unbounded FIFO of fetched-but-not-yet-dispatched commands.
///
/// This is the only state shared between the two receive loops. Commands
/// enter in fetch order and leave in the same order; the lock is held only
/// for the queue operation itself, never across an await point.
#[derive(Debug, Default)]
pub(crate) struct CommandQueue {
    commands: Mutex<VecDeque<PrivacyCommand>>,
}

impl CommandQueue {
    pub(crate) fn len(&self) -> usize {
        self.commands.lock().len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.commands.lock().is_empty()
    }

    pub(crate) fn enqueue_all(&self, batch: Vec<PrivacyCommand>) {
        self.commands.lock().extend(batch);
    }

    pub(crate) fn dequeue(&self) -> Option<PrivacyCommand> {
        self.commands.lock().pop_front()
    }
}

#[cfg_attr(coverage_nightly, coverage(off))]
#[cfg(test)]
mod tests {
    use std::time::UNIX_EPOCH;

    use crate::commands::{AccountCloseCommand, CommandCore, LeaseReceipt};

    use super::*;

    fn command(id: &str) -> PrivacyCommand {
        PrivacyCommand::AccountClose(AccountCloseCommand {
            core: CommandCore::new(id, LeaseReceipt::new("receipt"), UNIX_EPOCH),
        })
    }

    #[test]
    fn commands_leave_in_fetch_order() {
        let queue = CommandQueue::default();

        queue.enqueue_all(vec![command("a"), command("b")]);
        queue.enqueue_all(vec![command("c")]);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.dequeue().unwrap().command_id(), "a");
        assert_eq!(queue.dequeue().unwrap().command_id(), "b");
        assert_eq!(queue.dequeue().unwrap().command_id(), "c");
        assert!(queue.dequeue().is_none());
        assert!(queue.is_empty());
    }
}
