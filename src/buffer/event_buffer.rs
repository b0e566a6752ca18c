use std::{
    mem,
    sync::{Mutex, MutexGuard},
};

/// Thread-safe append-only list that hands back full batches.
///
/// The buffer never writes anything itself: `append` and `flush` swap the
/// pending list out under the lock and return it, so the caller performs the
/// durable write only after the lock has been released.
pub struct EventBuffer<T> {
    items: Mutex<Vec<T>>,
    threshold: usize,
}

impl<T> EventBuffer<T> {
    /// A threshold of zero behaves like one.
    pub fn new(threshold: usize) -> Self {
        let threshold = threshold.max(1);
        Self {
            items: Mutex::new(Vec::with_capacity(threshold)),
            threshold,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<T>> {
        match self.items.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    pub fn threshold(&self) -> usize {
        self.threshold
    }

    /// Appends one item. Returns the drained batch when the buffer reaches
    /// its threshold.
    pub fn append(&self, item: T) -> Option<Vec<T>> {
        let mut items = self.lock();
        items.push(item);
        if items.len() >= self.threshold {
            Some(mem::replace(&mut *items, Vec::with_capacity(self.threshold)))
        } else {
            None
        }
    }

    /// Drains whatever is pending, regardless of size.
    pub fn flush(&self) -> Vec<T> {
        mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread};

    #[test]
    fn reaching_threshold_drains_one_full_batch() {
        let buffer = EventBuffer::new(50);
        for value in 0..49 {
            assert!(buffer.append(value).is_none());
        }
        let batch = buffer.append(49).expect("threshold reached");
        assert_eq!(batch, (0..50).collect::<Vec<_>>());
        assert!(buffer.is_empty());
        assert!(buffer.flush().is_empty());
    }

    #[test]
    fn flush_drains_partial_batch() {
        let buffer = EventBuffer::new(50);
        for value in 0..49 {
            assert!(buffer.append(value).is_none());
        }
        let batch = buffer.flush();
        assert_eq!(batch.len(), 49);
        assert_eq!(buffer.len(), 0);
    }

    #[test]
    fn zero_threshold_drains_every_append() {
        let buffer = EventBuffer::new(0);
        assert_eq!(buffer.threshold(), 1);
        assert_eq!(buffer.append("a"), Some(vec!["a"]));
    }

    #[test]
    fn concurrent_appends_lose_nothing() {
        let buffer = Arc::new(EventBuffer::new(7));
        let handles: Vec<_> = (0..4)
            .map(|producer| {
                let buffer = Arc::clone(&buffer);
                thread::spawn(move || {
                    let mut drained = Vec::new();
                    for seq in 0..250 {
                        if let Some(batch) = buffer.append((producer, seq)) {
                            drained.extend(batch);
                        }
                    }
                    drained
                })
            })
            .collect();

        let mut all: Vec<(i32, i32)> = handles
            .into_iter()
            .flat_map(|handle| handle.join().unwrap())
            .collect();
        all.extend(buffer.flush());
        assert_eq!(all.len(), 1000);

        for producer in 0..4 {
            let seqs: Vec<_> = all
                .iter()
                .filter(|(p, _)| *p == producer)
                .map(|(_, seq)| *seq)
                .collect();
            let mut sorted = seqs.clone();
            sorted.sort();
            assert_eq!(sorted, (0..250).collect::<Vec<_>>());
        }
    }
}
