//! Routine factories.
//!
//! A factory packages a user callback into a routine body. Data-driven
//! bodies loop forever: declare `DataWait`, poll the visitor, run the
//! callback on a hit and yield `Ready` (re-queuing at the tail of the
//! priority bucket, which is what makes same-priority routines take
//! turns), or yield unchanged on a miss. New data therefore always
//! arrives through the update-flag path: the notifier flips the flag,
//! signals the group, and the next scan promotes the routine back to
//! `Ready`.

use std::sync::Arc;

use crate::croutine::{Routine, RoutineBody, RoutineState};
use crate::data::visitor::{DataVisitor, DataVisitorBase};

type BodyBuilder = Box<dyn FnOnce() -> RoutineBody + Send>;

/// A recipe for one routine: how to build its body, plus the visitor
/// whose channels should wake it.
pub struct RoutineFactory {
    create_routine: BodyBuilder,
    data_visitor: Option<Arc<dyn DataVisitorBase>>,
}

impl RoutineFactory {
    /// Build the body and hand back the visitor for notifier
    /// registration.
    pub fn into_parts(self) -> (RoutineBody, Option<Arc<dyn DataVisitorBase>>) {
        ((self.create_routine)(), self.data_visitor)
    }
}

/// Factory for a data-driven routine over a visitor with 1..4 typed
/// input channels.
pub fn create_routine_factory<V, F>(f: F, visitor: Arc<V>) -> RoutineFactory
where
    V: DataVisitor + 'static,
    F: Fn(V::Fetched) + Send + 'static,
{
    let fetcher = visitor.clone();
    RoutineFactory {
        data_visitor: Some(visitor),
        create_routine: Box::new(move || {
            Box::new(move || loop {
                Routine::with_current(|r| r.set_state(RoutineState::DataWait));
                match fetcher.try_fetch() {
                    Some(fetched) => {
                        f(fetched);
                        Routine::yield_with(RoutineState::Ready);
                    }
                    None => Routine::yield_now(),
                }
            })
        }),
    }
}

/// Factory wrapping a bare one-shot closure (no data visitor). Used for
/// generic asynchronous submissions such as timer callbacks.
pub fn create_routine_factory_fn<F>(f: F) -> RoutineFactory
where
    F: FnOnce() + Send + 'static,
{
    RoutineFactory {
        data_visitor: None,
        create_routine: Box::new(move || Box::new(f)),
    }
}
