use crate::{
    event::{EventSink, Termination},
    sock::{FieldAccessor, read_conn_tuple},
    table::KeyedTable,
    tuple::{ConnTuple, IPPROTO_TCP, PidFd, ThreadKey},
};

/// Clears resolver entries when the kernel tears a connection down.
///
/// The only component that deletes resolver pairs in response to a close.
pub struct TeardownNotifier<'a, F, R> {
    forward: &'a F,
    reverse: &'a R,
}

impl<'a, F, R> TeardownNotifier<'a, F, R>
where
    F: KeyedTable<PidFd, ConnTuple>,
    R: KeyedTable<ConnTuple, PidFd>,
{
    pub const fn new(forward: &'a F, reverse: &'a R) -> Self {
        Self { forward, reverse }
    }

    /// Socket-close hook: the tuple is derived from `sk` as it looks right
    /// now, on the closing thread.
    pub fn on_close<A: FieldAccessor, S: EventSink>(
        &self,
        key: ThreadKey,
        sk: u64,
        accessor: &A,
        sink: &S,
    ) -> bool {
        match read_conn_tuple(accessor, sk, key, IPPROTO_TCP) {
            Some(tuple) => self.finish(&tuple, sink),
            None => false,
        }
    }

    /// Drops both directions for `tuple` and emits one definitive
    /// notification. Returns false when the tuple was never indexed or has
    /// already been finished.
    pub fn finish<S: EventSink>(&self, tuple: &ConnTuple, sink: &S) -> bool {
        let Some(pid_fd) = self.reverse.lookup(tuple) else {
            return false;
        };
        if self.forward.lookup(&pid_fd).as_ref() == Some(tuple) {
            self.forward.remove(&pid_fd);
        }
        if !self.reverse.remove(tuple) {
            // a concurrent close won the race
            return false;
        }
        sink.connection_finished(tuple, Termination::Definitive);
        true
    }
}
