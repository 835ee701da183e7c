//! Per-thread stack of in-flight multi-step socket operations.
//!
//! A syscall entry pushes a frame, an intermediate hook deeper in the call
//! fills it in place, the exit pops it. Nesting is shallow (a connect issued
//! from within a bind path, say) so the stack is fixed at two frames.

use crate::{table::KeyedTable, tuple::ThreadKey};

pub const INTENT_STACK_DEPTH: usize = 2;

#[repr(u8)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IntentKind {
    Connect = 1,
    Bind = 2,
}

/// One in-flight operation. Filled incrementally; anything never filled
/// keeps its zero default.
#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SocketIntent {
    /// [`IntentKind`] as a raw byte, 0 for an empty frame.
    pub kind: u8,
    pub _pad: u8,
    pub family: u16,
    /// Host byte order.
    pub port: u16,
    pub protocol: u16,
    /// IPv4-mapped for `AF_INET`.
    pub addr: [u8; 16],
}

impl SocketIntent {
    pub fn new(kind: IntentKind) -> Self {
        Self {
            kind: kind as u8,
            ..Default::default()
        }
    }

    pub fn is(&self, kind: IntentKind) -> bool {
        self.kind == kind as u8
    }
}

#[repr(C)]
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct IntentStack {
    pub frames: [SocketIntent; INTENT_STACK_DEPTH],
    pub depth: u32,
    pub _pad: u32,
}

impl IntentStack {
    fn top_index(&self) -> Option<usize> {
        match self.depth as usize {
            0 => None,
            d if d <= INTENT_STACK_DEPTH => Some(d - 1),
            _ => Some(INTENT_STACK_DEPTH - 1),
        }
    }

    fn push(&mut self, intent: SocketIntent) {
        match self.top_index() {
            Some(top) if self.frames[top].kind == intent.kind => self.frames[top] = intent,
            Some(top) if top + 1 == INTENT_STACK_DEPTH => self.frames[top] = intent,
            Some(top) => {
                self.frames[top + 1] = intent;
                self.depth = (top + 2) as u32;
            }
            None => {
                self.frames[0] = intent;
                self.depth = 1;
            }
        }
    }

    fn top_mut(&mut self, kind: IntentKind) -> Option<&mut SocketIntent> {
        let top = self.top_index()?;
        let frame = &mut self.frames[top];
        frame.is(kind).then_some(frame)
    }

    fn pop(&mut self, kind: IntentKind) -> Option<SocketIntent> {
        let top = self.top_index()?;
        if !self.frames[top].is(kind) {
            return None;
        }
        let frame = self.frames[top];
        self.frames[top] = SocketIntent::default();
        self.depth = top as u32;
        Some(frame)
    }
}

pub struct IntentCache<'a, T> {
    table: &'a T,
}

impl<'a, T: KeyedTable<ThreadKey, IntentStack>> IntentCache<'a, T> {
    pub const fn new(table: &'a T) -> Self {
        Self { table }
    }

    /// Starts an operation on `key`. Returns false when a new stack could not
    /// be stored.
    pub fn push(&self, key: ThreadKey, kind: IntentKind) -> bool {
        let intent = SocketIntent::new(kind);
        if self
            .table
            .with_entry_mut(&key, |stack| stack.push(intent))
            .is_some()
        {
            return true;
        }
        let mut stack = IntentStack::default();
        stack.push(intent);
        self.table.update(&key, &stack).is_ok()
    }

    /// Edits the top frame in place if it is of `kind`.
    pub fn peek(&self, key: ThreadKey, kind: IntentKind, f: impl FnOnce(&mut SocketIntent)) -> bool {
        self.table
            .with_entry_mut(&key, |stack| match stack.top_mut(kind) {
                Some(frame) => {
                    f(frame);
                    true
                }
                None => false,
            })
            .unwrap_or(false)
    }

    /// Removes the top frame if it is of `kind`. The table entry goes away
    /// with the last frame.
    pub fn pop(&self, key: ThreadKey, kind: IntentKind) -> Option<SocketIntent> {
        let (frame, empty) = self
            .table
            .with_entry_mut(&key, |stack| (stack.pop(kind), stack.depth == 0))?;
        if empty {
            self.table.remove(&key);
        }
        frame
    }
}
