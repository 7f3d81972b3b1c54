//! Adapter turning instrumentation hook events into transactions and
//! segments.
//!
//! Each context keeps a stack of open frames. The first enter in a context
//! begins a transaction (or, if one was already begun through the API, opens
//! a segment under it); nested enters push segments; the exit that empties
//! the stack ends the transaction.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use tracing::debug;

use crate::transaction::segment::SegmentHandle;
use crate::transaction::{
    ContextId, NoticedError, TransactionHandle, TransactionKind, TransactionRegistry,
};

/// Error type recorded for errors reported through `on_exit`.
pub const INSTRUMENTED_ERROR_TYPE: &str = "InstrumentedError";

#[derive(Debug)]
enum Frame {
    /// The transaction this adapter began for the context.
    Transaction(TransactionHandle),
    Segment(SegmentHandle),
}

impl Frame {
    fn is_live(&self) -> bool {
        match self {
            Frame::Transaction(transaction) => transaction.is_active(),
            Frame::Segment(segment) => segment.transaction_is_active(),
        }
    }
}

/// A stack is stale once the transaction under its bottom frame has ended
/// without this adapter seeing the matching exit, e.g. when it was reaped.
fn is_stale(stack: &[Frame]) -> bool {
    stack.first().is_some_and(|bottom| !bottom.is_live())
}

pub struct InstrumentationEvents {
    registry: Arc<TransactionRegistry>,
    kind: TransactionKind,
    stacks: Mutex<HashMap<ContextId, Vec<Frame>>>,
}

impl InstrumentationEvents {
    /// `kind` is used for transactions begun by an enter event.
    #[must_use]
    pub fn new(registry: Arc<TransactionRegistry>, kind: TransactionKind) -> Self {
        Self {
            registry,
            kind,
            stacks: Mutex::new(HashMap::new()),
        }
    }

    pub fn on_enter(&self, operation_name: &str, context: ContextId) {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        let stack = stacks.entry(context).or_default();
        if is_stale(stack) {
            debug!(
                "Discarding {} stale frames in context {context}, its transaction already ended",
                stack.len()
            );
            stack.clear();
        }

        let frame = match stack.last() {
            Some(Frame::Segment(parent)) => Some(Frame::Segment(parent.start_child(operation_name))),
            Some(Frame::Transaction(transaction)) => {
                Some(Frame::Segment(transaction.start_segment(operation_name)))
            }
            None => match self.registry.current(context) {
                Some(transaction) => Some(Frame::Segment(transaction.start_segment(operation_name))),
                None => match self.registry.begin(context, self.kind, operation_name) {
                    Ok(transaction) => Some(Frame::Transaction(transaction)),
                    Err(e) => {
                        debug!("Cannot begin transaction for {operation_name}: {e}");
                        None
                    }
                },
            },
        };
        match frame {
            Some(frame) => stack.push(frame),
            None => {
                if stack.is_empty() {
                    stacks.remove(&context);
                }
            }
        }
    }

    /// Closes the innermost open frame of `context`. `error` marks the
    /// transaction as errored when this exit ends it.
    pub fn on_exit(&self, context: ContextId, error: Option<&str>) {
        let frame = {
            let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
            let Some(stack) = stacks.get_mut(&context) else {
                debug!("Ignoring exit without a matching enter in context {context}");
                return;
            };
            let frame = stack.pop();
            if stack.is_empty() {
                stacks.remove(&context);
            }
            frame
        };

        match frame {
            Some(Frame::Segment(segment)) => {
                if let Some(message) = error {
                    debug!(
                        "Segment {:?} of transaction {} exited with error: {message}",
                        segment.name(),
                        segment.transaction_id()
                    );
                }
                segment.end();
            }
            Some(Frame::Transaction(transaction)) => match error {
                Some(message) => {
                    self.registry.end_with_error(
                        &transaction,
                        NoticedError::new(message, INSTRUMENTED_ERROR_TYPE),
                    );
                }
                None => {
                    self.registry.end(&transaction);
                }
            },
            None => debug!("Ignoring exit without a matching enter in context {context}"),
        }
    }

    /// Drops any open frames of `context` and abandons its transaction.
    pub fn on_context_torn_down(&self, context: ContextId) {
        let open = self
            .stacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&context)
            .map_or(0, |stack| stack.len());
        if open > 0 {
            debug!("Context {context} torn down with {open} open frames");
        }
        self.registry.abandon(context);
    }

    /// Drops the frame stacks of every context whose transaction ended
    /// without a matching exit. Returns how many contexts were cleared.
    pub fn prune_stale(&self) -> usize {
        let mut stacks = self.stacks.lock().unwrap_or_else(PoisonError::into_inner);
        let before = stacks.len();
        stacks.retain(|_, stack| !is_stale(stack));
        before - stacks.len()
    }

    /// Number of open frames in `context`.
    #[must_use]
    pub fn depth(&self, context: ContextId) -> usize {
        self.stacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&context)
            .map_or(0, Vec::len)
    }
}
