//! Per-source task records.
//!
//! A task binds one readiness token to a kind tag, a select flag, and an
//! optional wake deadline. The reactor discriminates on the tag; tasks
//! carry no callbacks and no sockets of their own.

use minstant::Instant;
use mio::Token;

/// What a task does when its token is ready or its deadline passes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TaskKind {
    /// Accepts client connections on the listener socket.
    Listener,
    /// Receives peer datagrams.
    PeerRecv,
    /// Reads framed requests from one client stream.
    ClientRead,
    /// Fires the arrangement's timer at the given index. Owns no socket;
    /// its token exists only to key the task map.
    Timer(usize),
}

/// One entry of the reactor's task map.
#[derive(Debug)]
pub(crate) struct Task {
    pub token: Token,
    /// Whether readiness events for this token are dispatched.
    pub select_on: bool,
    /// When set, the loop wakes no later than this.
    pub wake_at: Option<Instant>,
    pub kind: TaskKind,
}

impl Task {
    pub fn listener(token: Token) -> Self {
        Self {
            token,
            select_on: true,
            wake_at: None,
            kind: TaskKind::Listener,
        }
    }

    pub fn peer_recv(token: Token) -> Self {
        Self {
            token,
            select_on: true,
            wake_at: None,
            kind: TaskKind::PeerRecv,
        }
    }

    pub fn client_read(token: Token) -> Self {
        Self {
            token,
            select_on: true,
            wake_at: None,
            kind: TaskKind::ClientRead,
        }
    }

    pub fn timer(token: Token, index: usize, due: Instant) -> Self {
        Self {
            token,
            select_on: false,
            wake_at: Some(due),
            kind: TaskKind::Timer(index),
        }
    }

    /// Whether the wake deadline has passed.
    pub fn due(&self, now: Instant) -> bool {
        self.wake_at.is_some_and(|at| at <= now)
    }
}

/// What a dispatched task tells the reactor afterwards.
pub(crate) struct Flow {
    /// Finalize and remove this task.
    pub finished: bool,
    /// Newly created tasks to register.
    pub spawned: Vec<Task>,
}

impl Flow {
    /// The task stays installed.
    pub fn keep() -> Self {
        Self {
            finished: false,
            spawned: Vec::new(),
        }
    }

    /// The task is done; finalize it.
    pub fn done() -> Self {
        Self {
            finished: true,
            spawned: Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn timer_due_only_after_deadline() {
        let now = Instant::now();
        let task = Task::timer(Token(7), 0, now + Duration::from_millis(50));

        assert!(!task.due(now));
        assert!(task.due(now + Duration::from_millis(50)));
        assert!(task.due(now + Duration::from_millis(80)));
    }

    #[test]
    fn socket_tasks_have_no_deadline() {
        let now = Instant::now();
        assert!(!Task::listener(Token(0)).due(now));
        assert!(!Task::peer_recv(Token(1)).due(now));
        assert!(!Task::client_read(Token(2)).due(now));
    }

    #[test]
    fn timers_are_not_selectable() {
        let task = Task::timer(Token(3), 1, Instant::now());
        assert!(!task.select_on);
        assert_eq!(task.kind, TaskKind::Timer(1));
    }
}
