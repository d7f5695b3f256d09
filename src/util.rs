use std::{rc::Rc, time::Duration};

use serde_json::Value;

use crate::Instant;

/// Time remaining until data updated at `updated_at` goes stale, saturating
/// at zero.
pub(crate) fn time_until_stale(updated_at: Instant, stale_time: Duration) -> Duration {
    let staleness_point = updated_at + stale_time;
    staleness_point.0.saturating_sub(Instant::now().0)
}

/// Structural sharing: reuse the previous value whenever the next one is
/// deeply equal, so reference identity tracks content identity.
pub(crate) fn replace_equal_deep(prev: &Rc<Value>, next: Rc<Value>) -> Rc<Value> {
    if *prev == next {
        prev.clone()
    } else {
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn stale_time_saturates_at_zero() {
        let old = Instant::from_millis(0);
        assert_eq!(time_until_stale(old, Duration::from_secs(1)), Duration::ZERO);

        let fresh = Instant::now();
        let remaining = time_until_stale(fresh, Duration::from_secs(60));
        assert!(remaining > Duration::from_secs(59));
    }

    #[test]
    fn equal_content_keeps_the_old_reference() {
        let prev = Rc::new(json!({"a": [1, 2, 3]}));
        let next = Rc::new(json!({"a": [1, 2, 3]}));
        let shared = replace_equal_deep(&prev, next);
        assert!(Rc::ptr_eq(&prev, &shared));
    }

    #[test]
    fn different_content_takes_the_new_reference() {
        let prev = Rc::new(json!({"a": 1}));
        let next = Rc::new(json!({"a": 2}));
        let shared = replace_equal_deep(&prev, next.clone());
        assert!(Rc::ptr_eq(&next, &shared));
    }
}
