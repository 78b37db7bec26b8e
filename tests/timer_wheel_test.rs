// Timer Wheel Stress Test
//
// Mixed add/update/remove churn over a day of deadlines, advanced in random
// jumps: the drained multiset must equal inserted minus removed, nothing may
// fire early, and poll order must be by deadline.

use std::collections::{HashMap, HashSet};

use rand::Rng;

use concord::progress::LogGroupTimers;

const DAY_MS: u64 = 86_400_000;

#[test]
fn test_stress_mixed_operations_conserve_timers() {
    let mut rng = rand::rng();
    let mut wheel: LogGroupTimers<u32> = LogGroupTimers::new(6, 32);
    let mut deadlines: HashMap<u32, u64> = HashMap::new();

    for id in 0..10_000u32 {
        let deadline = rng.random_range(0..DAY_MS);
        wheel.add(deadline, id);
        deadlines.insert(id, deadline);
    }
    // Update half once.
    for id in 0..5_000u32 {
        let deadline = rng.random_range(0..DAY_MS);
        wheel.update(deadline, id);
        deadlines.insert(id, deadline);
    }
    // Remove a quarter.
    for id in 0..2_500u32 {
        assert!(wheel.remove(&id));
        deadlines.remove(&id);
    }
    assert_eq!(wheel.len(), deadlines.len());

    let mut drained: HashSet<u32> = HashSet::new();
    let mut now = 0u64;
    while now < DAY_MS {
        now += rng.random_range(1..DAY_MS / 20);
        wheel.advance(now, &mut |_, id| {
            assert!(
                deadlines[&id] <= now,
                "timer {id} fired {}ms early",
                deadlines[&id] - now
            );
            assert!(drained.insert(id), "timer {id} drained twice");
        });
    }
    wheel.advance(u64::MAX, &mut |_, id| {
        assert!(drained.insert(id));
    });

    let expected: HashSet<u32> = deadlines.keys().copied().collect();
    assert_eq!(drained, expected);
    assert!(wheel.is_empty());
}

#[test]
fn test_poll_order_after_churn() {
    let mut rng = rand::rng();
    let mut wheel: LogGroupTimers<u32> = LogGroupTimers::new(4, 8);
    let mut deadlines = HashMap::new();

    for id in 0..2_000u32 {
        let deadline = rng.random_range(0..1_000_000u64);
        wheel.add(deadline, id);
        deadlines.insert(id, deadline);
    }
    for id in 0..500u32 {
        wheel.remove(&id);
        deadlines.remove(&id);
    }

    let mut prev = 0u64;
    let mut count = 0;
    while let Some((deadline, id)) = wheel.poll() {
        assert_eq!(deadlines[&id], deadline);
        assert!(deadline >= prev, "poll went backwards");
        prev = deadline;
        count += 1;
    }
    assert_eq!(count, deadlines.len());
}

#[test]
fn test_wake_at_never_exceeds_min_deadline() {
    let mut rng = rand::rng();
    let mut wheel: LogGroupTimers<u32> = LogGroupTimers::new(4, 8);
    let mut deadlines = HashMap::new();
    for id in 0..200u32 {
        let deadline = rng.random_range(0..100_000u64);
        wheel.add(deadline, id);
        deadlines.insert(id, deadline);
    }
    while !wheel.is_empty() {
        let min = *deadlines.values().min().unwrap();
        let wake = wheel.wake_at().expect("non-empty");
        assert!(wake <= min, "wake_at {wake} past earliest deadline {min}");
        let (_, id) = wheel.poll().unwrap();
        deadlines.remove(&id);
    }
}
