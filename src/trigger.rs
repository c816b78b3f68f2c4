use std::collections::HashSet;

use parking_lot::Mutex;

type TriggerFn = Box<dyn Fn() + Send + Sync + 'static>;

/// Fires a callback once, off the caller's thread, after every named
/// condition has been marked complete.
///
/// Construction with an empty condition set fires immediately. Marking a
/// condition after the trigger has fired is a no-op, as is marking the same
/// condition twice.
pub struct MultiConditionTrigger {
    inner: Mutex<TriggerState>,
}

struct TriggerState {
    remaining: HashSet<String>,
    completed: bool,
    trigger: Option<TriggerFn>,
}

impl MultiConditionTrigger {
    pub fn new<I, S>(conditions: I, trigger: TriggerFn) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let remaining: HashSet<String> = conditions.into_iter().map(Into::into).collect();
        let completed = remaining.is_empty();

        let this = Self {
            inner: Mutex::new(TriggerState {
                remaining,
                completed,
                trigger: Some(trigger),
            }),
        };
        if completed {
            this.spawn_trigger();
        }
        this
    }

    /// Marks one condition complete; the last one fires the callback.
    pub fn mark_complete(&self, condition: &str) {
        let fire = {
            let mut inner = self.inner.lock();
            if inner.completed {
                return;
            }
            inner.remaining.remove(condition);
            inner.completed = inner.remaining.is_empty();
            inner.completed
        };
        if fire {
            self.spawn_trigger();
        }
    }

    fn spawn_trigger(&self) {
        let Some(trigger) = self.inner.lock().trigger.take() else {
            return;
        };
        std::thread::spawn(move || trigger());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc;
    use std::sync::Arc;
    use std::time::Duration;

    fn counting_trigger() -> (TriggerFn, Arc<AtomicUsize>, mpsc::Receiver<()>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count_clone = Arc::clone(&count);
        let (tx, rx) = mpsc::channel();
        let trigger: TriggerFn = Box::new(move || {
            count_clone.fetch_add(1, Ordering::SeqCst);
            let _ = tx.send(());
        });
        (trigger, count, rx)
    }

    #[test]
    fn test_fires_after_all_conditions() {
        let (trigger, count, rx) = counting_trigger();
        let t = MultiConditionTrigger::new(["a", "b"], trigger);

        t.mark_complete("a");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        t.mark_complete("b");
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_fires_exactly_once() {
        let (trigger, count, rx) = counting_trigger();
        let t = MultiConditionTrigger::new(["a", "b"], trigger);

        t.mark_complete("a");
        t.mark_complete("b");
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");

        t.mark_complete("a");
        t.mark_complete("b");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_empty_condition_set_fires_immediately() {
        let (trigger, count, rx) = counting_trigger();
        let _t = MultiConditionTrigger::new(Vec::<String>::new(), trigger);
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_unknown_condition_does_not_fire() {
        let (trigger, count, rx) = counting_trigger();
        let t = MultiConditionTrigger::new(["a"], trigger);

        t.mark_complete("z");
        assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
        assert_eq!(count.load(Ordering::SeqCst), 0);

        t.mark_complete("a");
        rx.recv_timeout(Duration::from_secs(5)).expect("fired");
    }

    #[test]
    fn test_duplicate_marks_do_not_fire_early() {
        let (trigger, count, _rx) = counting_trigger();
        let t = MultiConditionTrigger::new(["a", "b"], trigger);

        t.mark_complete("a");
        t.mark_complete("a");
        std::thread::sleep(Duration::from_millis(20));
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
