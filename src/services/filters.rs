//! Event filters: pure predicates gating handler invocation.
//!
//! Filters run before a handler is invoked. A non-matching event is skipped
//! silently for that handler and counted through the observability sink;
//! filters never fail dispatch. Filters attach either bus-wide or to an
//! individual registration.

use std::collections::HashSet;
use std::num::NonZeroU32;
use std::sync::Arc;

use governor::{DefaultDirectRateLimiter, DefaultKeyedRateLimiter, Quota, RateLimiter};

use crate::domain::message::{EventEnvelope, SessionId};

/// A pure predicate over event envelopes.
///
/// Implementations must not block and must not mutate the event; the same
/// envelope may be evaluated against many filters and handlers.
pub trait EventFilter: Send + Sync {
    /// Whether the event should reach the handler.
    fn matches(&self, event: &EventEnvelope) -> bool;

    /// Name used in skip observations and logs.
    fn name(&self) -> &str {
        "filter"
    }
}

/// Passes only events carrying a specific session id.
pub struct SessionFilter {
    session_id: SessionId,
}

impl SessionFilter {
    /// Filter for the given session.
    pub const fn new(session_id: SessionId) -> Self {
        Self { session_id }
    }
}

impl EventFilter for SessionFilter {
    fn matches(&self, event: &EventEnvelope) -> bool {
        event.session_id.as_ref() == Some(&self.session_id)
    }

    fn name(&self) -> &str {
        "session"
    }
}

/// Passes only events whose short type name is in an allow list.
pub struct EventTypeFilter {
    allowed: HashSet<String>,
}

impl EventTypeFilter {
    /// Build from any collection of type names.
    pub fn new<I, S>(allowed: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self { allowed: allowed.into_iter().map(Into::into).collect() }
    }
}

impl EventFilter for EventTypeFilter {
    fn matches(&self, event: &EventEnvelope) -> bool {
        self.allowed.contains(event.event_type)
    }

    fn name(&self) -> &str {
        "event_type"
    }
}

/// Wraps an arbitrary closure as a filter.
pub struct PredicateFilter {
    name: String,
    predicate: Box<dyn Fn(&EventEnvelope) -> bool + Send + Sync>,
}

impl PredicateFilter {
    /// Name the predicate for observability, then wrap it.
    pub fn new<F>(name: impl Into<String>, predicate: F) -> Self
    where
        F: Fn(&EventEnvelope) -> bool + Send + Sync + 'static,
    {
        Self { name: name.into(), predicate: Box::new(predicate) }
    }
}

impl EventFilter for PredicateFilter {
    fn matches(&self, event: &EventEnvelope) -> bool {
        (self.predicate)(event)
    }

    fn name(&self) -> &str {
        &self.name
    }
}

/// Token-bucket rate limit applied across all matching events.
///
/// Events above the sustained rate are skipped, not queued. Skips count as
/// filtered deliveries in the observability stream.
pub struct RateLimitFilter {
    limiter: DefaultDirectRateLimiter,
}

impl RateLimitFilter {
    /// Allow `per_second` events per second with burst up to the same size.
    pub fn per_second(per_second: NonZeroU32) -> Self {
        Self { limiter: RateLimiter::direct(Quota::per_second(per_second)) }
    }
}

impl EventFilter for RateLimitFilter {
    fn matches(&self, _event: &EventEnvelope) -> bool {
        self.limiter.check().is_ok()
    }

    fn name(&self) -> &str {
        "rate_limit"
    }
}

/// Per-session token-bucket rate limit. Events without a session id pass
/// unmetered.
pub struct SessionRateLimitFilter {
    limiter: DefaultKeyedRateLimiter<SessionId>,
}

impl SessionRateLimitFilter {
    /// Allow `per_second` events per second per session.
    pub fn per_second(per_second: NonZeroU32) -> Self {
        Self { limiter: RateLimiter::keyed(Quota::per_second(per_second)) }
    }
}

impl EventFilter for SessionRateLimitFilter {
    fn matches(&self, event: &EventEnvelope) -> bool {
        event
            .session_id
            .as_ref()
            .is_none_or(|sid| self.limiter.check_key(sid).is_ok())
    }

    fn name(&self) -> &str {
        "session_rate_limit"
    }
}

/// Conjunction of filters: every inner filter must match.
pub struct CompositeFilter {
    filters: Vec<Arc<dyn EventFilter>>,
}

impl CompositeFilter {
    /// AND together the given filters. An empty composite matches all.
    pub const fn all(filters: Vec<Arc<dyn EventFilter>>) -> Self {
        Self { filters }
    }
}

impl EventFilter for CompositeFilter {
    fn matches(&self, event: &EventEnvelope) -> bool {
        self.filters.iter().all(|f| f.matches(event))
    }

    fn name(&self) -> &str {
        "composite"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::message::Event;

    #[derive(Debug)]
    struct Tick {
        session: Option<SessionId>,
    }

    impl Event for Tick {
        fn session_id(&self) -> Option<&SessionId> {
            self.session.as_ref()
        }
    }

    fn envelope(session: Option<&str>) -> EventEnvelope {
        EventEnvelope::new(Tick { session: session.map(SessionId::from) })
    }

    #[test]
    fn session_filter_matches_only_its_session() {
        let filter = SessionFilter::new(SessionId::from("a"));
        assert!(filter.matches(&envelope(Some("a"))));
        assert!(!filter.matches(&envelope(Some("b"))));
        assert!(!filter.matches(&envelope(None)));
    }

    #[test]
    fn type_filter_uses_short_names() {
        let filter = EventTypeFilter::new(["Tick"]);
        assert!(filter.matches(&envelope(None)));

        let other = EventTypeFilter::new(["Tock"]);
        assert!(!other.matches(&envelope(None)));
    }

    #[test]
    fn predicate_filter_wraps_closure() {
        let filter =
            PredicateFilter::new("has_session", |e: &EventEnvelope| e.session_id.is_some());
        assert!(filter.matches(&envelope(Some("s"))));
        assert!(!filter.matches(&envelope(None)));
    }

    #[test]
    fn rate_limit_filter_skips_above_rate() {
        let filter = RateLimitFilter::per_second(NonZeroU32::new(2).unwrap());
        let env = envelope(None);

        assert!(filter.matches(&env));
        assert!(filter.matches(&env));
        // Burst of two exhausted within the same instant.
        assert!(!filter.matches(&env));
    }

    #[test]
    fn session_rate_limit_meters_per_session() {
        let filter = SessionRateLimitFilter::per_second(NonZeroU32::new(1).unwrap());

        assert!(filter.matches(&envelope(Some("a"))));
        assert!(!filter.matches(&envelope(Some("a"))));
        // A different session has its own bucket.
        assert!(filter.matches(&envelope(Some("b"))));
        // Sessionless events pass unmetered.
        assert!(filter.matches(&envelope(None)));
    }

    #[test]
    fn composite_requires_all_filters() {
        let composite = CompositeFilter::all(vec![
            Arc::new(EventTypeFilter::new(["Tick"])),
            Arc::new(SessionFilter::new(SessionId::from("a"))),
        ]);

        assert!(composite.matches(&envelope(Some("a"))));
        assert!(!composite.matches(&envelope(Some("b"))));

        let empty = CompositeFilter::all(Vec::new());
        assert!(empty.matches(&envelope(None)));
    }
}
