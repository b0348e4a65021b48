//! Sorted controller event vectors
//!
//! Every controller stream inside [`crate::midi_state::MidiState`] is a
//! vector of `{delay, value}` events sorted by delay. The vectors are never
//! empty: the first entry is the base value carried over from the previous
//! block, and the last entry is the value that remains current into the next
//! block.

/// A single timestamped controller event. `delay` is in samples from the
/// start of the current render block.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Event {
    pub delay: usize,
    pub value: f32,
}

impl Event {
    pub fn new(delay: usize, value: f32) -> Self {
        Self { delay, value }
    }
}

pub type EventVector = Vec<Event>;

/// Insert an event keeping the vector sorted by delay. An event at an
/// already-occupied delay overwrites the previous value, so inserting the
/// same event twice is a no-op.
pub fn insert_event(events: &mut EventVector, delay: usize, value: f32) {
    match events.binary_search_by(|e| e.delay.cmp(&delay)) {
        Ok(idx) => events[idx].value = value,
        Err(idx) => events.insert(idx, Event::new(delay, value)),
    }
}

/// Value of the stream at `delay`: the first event at or after `delay`, or
/// the last event when `delay` is past the end of the vector.
pub fn value_at(events: &EventVector, delay: usize) -> f32 {
    debug_assert!(!events.is_empty());
    match events.binary_search_by(|e| e.delay.cmp(&delay)) {
        Ok(idx) => events[idx].value,
        Err(idx) => {
            if idx < events.len() {
                events[idx].value
            } else {
                events.last().map(|e| e.value).unwrap_or(0.0)
            }
        }
    }
}

/// Last (current) value of the stream.
pub fn last_value(events: &EventVector) -> f32 {
    debug_assert!(!events.is_empty());
    events.last().map(|e| e.value).unwrap_or(0.0)
}

/// Collapse the vector to a single base event carrying the final value.
/// Called at the end of every block.
pub fn flush(events: &mut EventVector) {
    debug_assert!(!events.is_empty());
    let last = last_value(events);
    events.clear();
    events.push(Event::new(0, last));
}

/// Interleave two sorted event vectors into `dest` so that the value of
/// `dest` at any delay equals `a(delay) + b(delay)`, holding the last known
/// value of each stream between its events.
pub fn additive_merge(a: &EventVector, b: &EventVector, dest: &mut EventVector) {
    debug_assert!(!a.is_empty());
    debug_assert!(!b.is_empty());

    dest.clear();

    let mut iter_a = a.iter();
    let mut iter_b = b.iter();
    let mut next_a = iter_a.next();
    let mut next_b = iter_b.next();

    let mut prev_a = next_a.map(|e| e.value).unwrap_or(0.0);
    let mut prev_b = next_b.map(|e| e.value).unwrap_or(0.0);

    dest.push(Event::new(0, prev_a + prev_b));
    next_a = iter_a.next();
    next_b = iter_b.next();

    loop {
        match (next_a, next_b) {
            (None, None) => break,
            (Some(ea), None) => {
                prev_a = ea.value;
                dest.push(Event::new(ea.delay, prev_a + prev_b));
                next_a = iter_a.next();
            }
            (None, Some(eb)) => {
                prev_b = eb.value;
                dest.push(Event::new(eb.delay, prev_a + prev_b));
                next_b = iter_b.next();
            }
            (Some(ea), Some(eb)) => {
                if ea.delay == eb.delay {
                    prev_a = ea.value;
                    prev_b = eb.value;
                    dest.push(Event::new(ea.delay, prev_a + prev_b));
                    next_a = iter_a.next();
                    next_b = iter_b.next();
                } else if ea.delay < eb.delay {
                    prev_a = ea.value;
                    dest.push(Event::new(ea.delay, prev_a + prev_b));
                    next_a = iter_a.next();
                } else {
                    prev_b = eb.value;
                    dest.push(Event::new(eb.delay, prev_a + prev_b));
                    next_b = iter_b.next();
                }
            }
        }
    }
}
