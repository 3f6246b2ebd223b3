//! Pass-through stage that counts the keys it sees.

use std::cell::RefCell;
use std::collections::HashMap;
use std::rc::Rc;

use super::upstream;
use crate::error::WorkError;
use crate::event::Event;
use crate::stage::Stage;

#[derive(Debug)]
pub struct KeyCounter {
    inner: Rc<Stage>,
    counts: RefCell<HashMap<String, u64>>,
}

impl KeyCounter {
    pub fn new(inner: Rc<Stage>) -> Self {
        Self {
            inner,
            counts: RefCell::default(),
        }
    }

    pub fn inner(&self) -> &Rc<Stage> {
        &self.inner
    }

    pub fn count(&self, key: &str) -> u64 {
        self.counts.borrow().get(key).copied().unwrap_or(0)
    }

    pub fn distinct_keys(&self) -> usize {
        self.counts.borrow().len()
    }

    /// The `n` most frequent keys, most frequent first; ties by key.
    pub fn top_keys(&self, n: usize) -> Vec<(String, u64)> {
        let mut keys: Vec<(String, u64)> = self
            .counts
            .borrow()
            .iter()
            .map(|(k, v)| (k.clone(), *v))
            .collect();
        keys.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        keys.truncate(n);
        keys
    }

    pub(crate) async fn work(&self, event: &Event) -> Result<(), WorkError> {
        *self
            .counts
            .borrow_mut()
            .entry(event.key().to_string())
            .or_insert(0) += 1;
        upstream(self.inner.accept(event.clone()).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::VirtualClock;
    use crate::event::{EventId, Response};
    use crate::rng::SimRng;
    use crate::stages::{AvailabilityModel, Dependency};

    #[test]
    fn counts_keys_and_forwards() {
        let mut vclock = VirtualClock::new();
        let clock = vclock.clock();
        let dep = Stage::builder().build(
            &clock,
            Dependency::new(AvailabilityModel::Constant(1.0), None, SimRng::new(0)),
        );
        let counter = Stage::builder().build(&clock, KeyCounter::new(Rc::clone(&dep)));

        for (id, key) in ["b", "a", "b", "c", "b", "a"].into_iter().enumerate() {
            let response = vclock
                .run_until(counter.accept(Event::new(EventId(id as u64), key)))
                .unwrap();
            assert_eq!(response, Response::Success);
        }

        let counts = counter.key_counter().unwrap();
        assert_eq!(counts.count("b"), 3);
        assert_eq!(counts.distinct_keys(), 3);
        assert_eq!(
            counts.top_keys(2),
            vec![("b".to_string(), 3), ("a".to_string(), 2)]
        );
        assert_eq!(dep.traffic().arrived, 6);
    }
}
