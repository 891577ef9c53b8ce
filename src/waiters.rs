//! The waiter queue of an event.
//!
//! A ring of doubly-linked nodes kept in a slot arena and addressed by index. Slot 0 is the ring
//! head; it never carries a context. New waiters are linked in on the head's predecessor side,
//! and the wake target is always the head's immediate successor. Walking successors from the
//! head therefore visits waiters in arrival order.

use std::sync::Arc;

use crate::context::ExecutionContext;
use crate::error::fatal;

const HEAD: usize = 0;

struct Node {
    prev: usize,
    next: usize,
    context: Option<Arc<ExecutionContext>>,
}

/// Handle to a linked waiter, returned by [`WaiterQueue::prepend()`] and needed to detach it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct WaiterSlot(usize);

pub(crate) struct WaiterQueue {
    nodes: Vec<Node>,
    free: Vec<usize>,
    len: usize,
}

impl WaiterQueue {
    pub(crate) fn new() -> WaiterQueue {
        Self {
            nodes: vec![Node {
                prev: HEAD,
                next: HEAD,
                context: None,
            }],
            free: Vec::new(),
            len: 0,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Links `context` in front of the ring head. A context may only be linked into one queue at
    /// a time; violating that aborts.
    pub(crate) fn prepend(&mut self, context: Arc<ExecutionContext>) -> WaiterSlot {
        context.mark_queued();

        let tail = self.nodes[HEAD].prev;
        let node = Node {
            prev: tail,
            next: HEAD,
            context: Some(context),
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = node;
                index
            }
            None => {
                self.nodes.push(node);
                self.nodes.len() - 1
            }
        };

        self.nodes[tail].next = index;
        self.nodes[HEAD].prev = index;
        self.len += 1;
        WaiterSlot(index)
    }

    /// The context that the next notify should wake: the ring head's successor.
    pub(crate) fn first(&self) -> Option<&Arc<ExecutionContext>> {
        match self.nodes[HEAD].next {
            HEAD => None,
            index => self.nodes[index].context.as_ref(),
        }
    }

    /// Unlinks the waiter in `slot`, wherever it sits in the ring.
    pub(crate) fn detach(&mut self, slot: WaiterSlot) -> Arc<ExecutionContext> {
        let index = slot.0;
        let context = match self.nodes.get_mut(index) {
            Some(node) if index != HEAD => node.context.take(),
            _ => None,
        };
        let context = match context {
            Some(context) => context,
            None => fatal("detaching a waiter slot that is not linked"),
        };

        let (prev, next) = (self.nodes[index].prev, self.nodes[index].next);
        self.nodes[prev].next = next;
        self.nodes[next].prev = prev;
        self.nodes[index].prev = index;
        self.nodes[index].next = index;
        self.free.push(index);
        self.len -= 1;

        context.mark_unqueued();
        context
    }

    /// Waiters in wake order.
    #[cfg(test)]
    pub(crate) fn iter(&self) -> impl Iterator<Item = &Arc<ExecutionContext>> + '_ {
        let mut index = self.nodes[HEAD].next;
        std::iter::from_fn(move || {
            if index == HEAD {
                return None;
            }
            let node = &self.nodes[index];
            index = node.next;
            node.context.as_ref()
        })
    }
}
