//! Prepared-statement state.
//!
//! ```text
//!               prepare()                 prep-exec sent
//! Unprepared ─────────────► PreparePending ─────────────► Prepared
//!      ▲                          ▲                          │
//!      │ connection replaced      └── dirty / prep failed ───┘
//!      └──────────────────────────────────────────────────────┘
//! ```
//!
//! A handle is only valid on the connection it was created on, and only while
//! that connection's close and reconnect counters still have the values
//! recorded at prepare time.

/// Where a parameterized text command is in its prepare cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PrepareState {
    /// Every execute is a one-shot `sp_executesql`.
    #[default]
    Unprepared,
    /// The next execute prepares and executes in one round trip.
    PreparePending,
    /// Executes go through the server handle.
    Prepared,
}

/// Identity and counters of the connection a command runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionCounters {
    /// Logical connection id.
    pub id: u64,
    /// Times the connection was closed.
    pub close_count: u64,
    /// Times the connection was recovered.
    pub reconnect_count: u64,
}

/// Call shape chosen for one execute.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ExecShape {
    /// `sp_executesql`.
    ExecuteSql,
    /// `sp_prepexec`, replacing `previous` when set.
    PrepExec { previous: Option<i32> },
    /// `sp_execute` by handle.
    Execute { handle: i32 },
}

/// Text and parameter shape a handle was prepared for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Signature {
    pub text: String,
    pub shape: u64,
}

#[derive(Debug, Clone, Default)]
pub(crate) struct PreparedStatement {
    state: PrepareState,
    handle: Option<i32>,
    counters: Option<ConnectionCounters>,
    signature: Option<Signature>,
    dirty: bool,
    in_prepare: bool,
}

impl PreparedStatement {
    pub(crate) fn state(&self) -> PrepareState {
        self.state
    }

    pub(crate) fn handle(&self) -> Option<i32> {
        self.handle
    }

    fn is_prepared(&self) -> bool {
        self.state != PrepareState::Unprepared
    }

    fn counters_match(&self, live: ConnectionCounters) -> bool {
        self.counters == Some(live)
    }

    /// Whether the text, parameter shape, or connection counters changed since
    /// the command was prepared. Never true for an unprepared command.
    pub(crate) fn is_dirty(&self, current: &Signature, live: ConnectionCounters) -> bool {
        self.is_prepared()
            && (self.dirty
                || self.signature.as_ref() != Some(current)
                || !self.counters_match(live))
    }

    /// Forget everything if the command moved to another connection.
    ///
    /// Returns the handle that belonged to the previous connection, which the
    /// caller may release there.
    pub(crate) fn rebind(&mut self, live: ConnectionCounters) -> Option<(u64, i32)> {
        let previous = self.counters?;
        if previous.id == live.id {
            return None;
        }
        let stale = self.handle.take().map(|h| (previous.id, h));
        tracing::debug!(from = previous.id, to = live.id, "command moved to another connection, unpreparing");
        *self = Self::default();
        stale
    }

    /// Mark for preparation on the next execute.
    ///
    /// Returns `false` when there is nothing to do: the command is already
    /// prepared and clean.
    pub(crate) fn prepare(&mut self, current: Signature, live: ConnectionCounters) -> bool {
        if self.state == PrepareState::Prepared && !self.is_dirty(&current, live) {
            return false;
        }
        if self.is_dirty(&current, live) {
            self.unprepare_pending(live);
        }
        self.state = PrepareState::PreparePending;
        self.counters = Some(live);
        self.signature = Some(current);
        self.dirty = false;
        tracing::debug!(connection = live.id, "statement marked for preparation");
        true
    }

    /// Drop back to `PreparePending`, keeping the handle only while it is still valid.
    fn unprepare_pending(&mut self, live: ConnectionCounters) {
        self.state = PrepareState::PreparePending;
        if !self.counters_match(live) {
            self.handle = None;
        }
    }

    /// The handle to release with `sp_unprepare`, if it is still valid.
    pub(crate) fn releasable_handle(&self, live: ConnectionCounters) -> Option<i32> {
        self.handle.filter(|_| self.counters_match(live))
    }

    /// Forget the prepare entirely, after an explicit unprepare.
    pub(crate) fn reset(&mut self) {
        *self = Self::default();
    }

    /// Choose the call shape for an execute and advance the state.
    pub(crate) fn select_shape(&mut self, current: Signature, live: ConnectionCounters) -> ExecShape {
        if self.is_dirty(&current, live) {
            self.unprepare_pending(live);
            self.dirty = false;
        }
        match (self.state, self.handle) {
            (PrepareState::Prepared, Some(handle)) => ExecShape::Execute { handle },
            (PrepareState::Unprepared, _) => ExecShape::ExecuteSql,
            (PrepareState::Prepared | PrepareState::PreparePending, previous) => {
                self.state = PrepareState::Prepared;
                self.counters = Some(live);
                self.signature = Some(current);
                self.in_prepare = true;
                ExecShape::PrepExec { previous }
            }
        }
    }

    /// Record the handle returned by a prep-exec.
    pub(crate) fn on_handle(&mut self, handle: i32) {
        if self.in_prepare {
            tracing::debug!(handle, "statement prepared");
        }
        self.handle = Some(handle);
    }

    /// The execute finished. A prep-exec that failed, or returned no
    /// handle, goes back to pending so the next execute prepares again.
    pub(crate) fn finish(&mut self, succeeded: bool) {
        if !self.in_prepare {
            return;
        }
        self.in_prepare = false;
        if !succeeded || self.handle.is_none() {
            self.dirty = true;
            self.state = PrepareState::PreparePending;
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const CONN: ConnectionCounters = ConnectionCounters {
        id: 1,
        close_count: 0,
        reconnect_count: 0,
    };

    fn sig(text: &str, shape: u64) -> Signature {
        Signature {
            text: text.to_string(),
            shape,
        }
    }

    fn prepared() -> PreparedStatement {
        let mut p = PreparedStatement::default();
        assert!(p.prepare(sig("q", 1), CONN));
        assert_eq!(p.select_shape(sig("q", 1), CONN), ExecShape::PrepExec { previous: None });
        p.on_handle(7);
        p.finish(true);
        p
    }

    #[test]
    fn test_unprepared_uses_execute_sql() {
        let mut p = PreparedStatement::default();
        assert_eq!(p.select_shape(sig("q", 1), CONN), ExecShape::ExecuteSql);
        assert_eq!(p.state(), PrepareState::Unprepared);
        assert!(!p.is_dirty(&sig("other", 2), CONN));
    }

    #[test]
    fn test_prepare_cycle() {
        let mut p = prepared();
        assert_eq!(p.state(), PrepareState::Prepared);
        assert_eq!(p.select_shape(sig("q", 1), CONN), ExecShape::Execute { handle: 7 });
        assert!(!p.prepare(sig("q", 1), CONN));
    }

    #[test]
    fn test_dirty_text_reprepares_with_previous_handle() {
        let mut p = prepared();
        assert!(p.is_dirty(&sig("q2", 1), CONN));
        assert_eq!(p.select_shape(sig("q2", 1), CONN), ExecShape::PrepExec { previous: Some(7) });
        p.on_handle(8);
        p.finish(true);
        assert!(!p.is_dirty(&sig("q2", 1), CONN));
    }

    #[test]
    fn test_counter_change_discards_handle() {
        let mut p = prepared();
        let reconnected = ConnectionCounters {
            reconnect_count: 1,
            ..CONN
        };
        assert!(p.is_dirty(&sig("q", 1), reconnected));
        assert_eq!(p.releasable_handle(reconnected), None);
        assert_eq!(
            p.select_shape(sig("q", 1), reconnected),
            ExecShape::PrepExec { previous: None }
        );
    }

    #[test]
    fn test_failed_prep_exec_returns_to_pending() {
        let mut p = PreparedStatement::default();
        p.prepare(sig("q", 1), CONN);
        p.select_shape(sig("q", 1), CONN);
        p.finish(false);
        assert_eq!(p.state(), PrepareState::PreparePending);
        assert!(matches!(p.select_shape(sig("q", 1), CONN), ExecShape::PrepExec { .. }));
    }

    #[test]
    fn test_rebind_resets_on_new_connection() {
        let mut p = prepared();
        assert_eq!(p.rebind(CONN), None);
        let other = ConnectionCounters { id: 2, ..CONN };
        assert_eq!(p.rebind(other), Some((1, 7)));
        assert_eq!(p.state(), PrepareState::Unprepared);
        assert_eq!(p.handle(), None);
    }
}
