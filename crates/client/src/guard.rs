use std::ops::{Deref, DerefMut};

use keel_common::StorageEngine;
use tracing::debug;

use crate::session::Session;

/// Removes one engine from the session's eligible set for its lifetime.
///
/// The engine is put back on drop, so restoration happens on return, on
/// error propagation and during unwinding alike. Only an engine that was
/// actually removed is re-inserted.
pub struct EngineRestriction<'s> {
    session: &'s mut Session,
    removed: Option<StorageEngine>,
}

impl<'s> EngineRestriction<'s> {
    pub fn narrow(session: &'s mut Session, engine: StorageEngine) -> Self {
        let removed = session
            .vars
            .isolation_read_engines
            .remove(&engine)
            .then_some(engine);
        if removed.is_some() {
            debug!(operator = "EngineRestriction", engine = %engine, "engine excluded for statement");
        }
        Self { session, removed }
    }

    /// Leaves the session untouched.
    pub fn none(session: &'s mut Session) -> Self {
        Self {
            session,
            removed: None,
        }
    }

    pub fn is_narrowed(&self) -> bool {
        self.removed.is_some()
    }
}

impl Deref for EngineRestriction<'_> {
    type Target = Session;

    fn deref(&self) -> &Session {
        self.session
    }
}

impl DerefMut for EngineRestriction<'_> {
    fn deref_mut(&mut self) -> &mut Session {
        self.session
    }
}

impl Drop for EngineRestriction<'_> {
    fn drop(&mut self) {
        if let Some(engine) = self.removed.take() {
            self.session.vars.isolation_read_engines.insert(engine);
            debug!(operator = "EngineRestriction", engine = %engine, "engine restored");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::panic::{catch_unwind, AssertUnwindSafe};

    use keel_common::{PlannerConfig, SessionId, StorageEngine};

    use super::EngineRestriction;
    use crate::session::Session;

    #[test]
    fn restores_on_drop() {
        let mut s = Session::new(SessionId(1), &PlannerConfig::default());
        {
            let g = EngineRestriction::narrow(&mut s, StorageEngine::AnalyticReplica);
            assert!(g.is_narrowed());
            assert!(!g.vars.isolation_read_engines.contains(&StorageEngine::AnalyticReplica));
        }
        assert!(s.vars.isolation_read_engines.contains(&StorageEngine::AnalyticReplica));
    }

    #[test]
    fn restores_during_unwind() {
        let mut s = Session::new(SessionId(1), &PlannerConfig::default());
        let r = catch_unwind(AssertUnwindSafe(|| {
            let _g = EngineRestriction::narrow(&mut s, StorageEngine::AnalyticReplica);
            panic!("planning blew up");
        }));
        assert!(r.is_err());
        assert!(s.vars.isolation_read_engines.contains(&StorageEngine::AnalyticReplica));
    }

    #[test]
    fn absent_engine_is_not_added_back() {
        let mut cfg = PlannerConfig::default();
        cfg.isolation_read_engines.remove(&StorageEngine::AnalyticReplica);
        let mut s = Session::new(SessionId(1), &cfg);
        {
            let g = EngineRestriction::narrow(&mut s, StorageEngine::AnalyticReplica);
            assert!(!g.is_narrowed());
        }
        assert!(!s.vars.isolation_read_engines.contains(&StorageEngine::AnalyticReplica));
    }
}
