//! Endpoint subscription check.
//!
//! Decides whether an endpoint wants a given event type. A matcher is an
//! exact event type, the catch-all `*`, or a namespace wildcard such as
//! `order.*`.

use courier_core::Endpoint;

const WILDCARD: &str = "*";
const NAMESPACE_WILDCARD: &str = ".*";

/// Returns whether `endpoint` is subscribed to `event_type`.
///
/// An empty subscription set matches nothing. Matching is case-sensitive.
pub fn is_subscribed(endpoint: &Endpoint, event_type: &str) -> bool {
    endpoint.subscribed_events.iter().any(|matcher| matches(matcher, event_type))
}

/// Returns whether a single matcher accepts `event_type`.
pub fn matches(matcher: &str, event_type: &str) -> bool {
    if matcher == WILDCARD || matcher == event_type {
        return true;
    }

    match matcher.strip_suffix(NAMESPACE_WILDCARD) {
        // `order.*` needs the `order.` prefix plus at least one more character.
        Some(namespace) => event_type
            .strip_prefix(namespace)
            .and_then(|rest| rest.strip_prefix('.'))
            .is_some_and(|name| !name.is_empty()),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    fn endpoint(subscriptions: &[&str]) -> Endpoint {
        Endpoint::new("https://example.com/hook", subscriptions.iter().copied())
    }

    #[test]
    fn exact_match_is_subscribed() {
        assert!(is_subscribed(&endpoint(&["order.created"]), "order.created"));
    }

    #[test]
    fn different_type_is_not_subscribed() {
        assert!(!is_subscribed(&endpoint(&["order.shipped"]), "order.created"));
    }

    #[test]
    fn empty_subscription_set_matches_nothing() {
        assert!(!is_subscribed(&endpoint(&[]), "order.created"));
    }

    #[test]
    fn catch_all_matches_everything() {
        assert!(is_subscribed(&endpoint(&["*"]), "order.created"));
        assert!(is_subscribed(&endpoint(&["*"]), "user.deleted"));
    }

    #[test]
    fn namespace_wildcard_matches_children_only() {
        let ep = endpoint(&["order.*"]);

        assert!(is_subscribed(&ep, "order.created"));
        assert!(is_subscribed(&ep, "order.line.added"));
        assert!(!is_subscribed(&ep, "order"));
        assert!(!is_subscribed(&ep, "order."));
        assert!(!is_subscribed(&ep, "orders.created"));
    }

    #[test]
    fn matching_is_case_sensitive() {
        assert!(!is_subscribed(&endpoint(&["Order.Created"]), "order.created"));
    }

    #[test]
    fn any_matching_entry_is_enough() {
        let ep = endpoint(&["user.created", "order.shipped", "order.created"]);
        assert!(is_subscribed(&ep, "order.created"));
    }

    proptest! {
        #[test]
        fn exact_entry_always_matches(event_type in "[a-z]{1,8}(\\.[a-z]{1,8}){0,2}") {
            prop_assert!(is_subscribed(&endpoint(&[event_type.as_str()]), &event_type));
        }

        #[test]
        fn namespace_wildcard_matches_its_children(
            namespace in "[a-z]{1,8}",
            name in "[a-z]{1,8}",
        ) {
            let matcher = format!("{namespace}.*");
            let event_type = format!("{namespace}.{name}");
            prop_assert!(matches(&matcher, &event_type));
        }
    }
}
