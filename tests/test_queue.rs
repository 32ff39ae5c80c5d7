// SPDX-License-Identifier: Apache-2.0
// Copyright (c) 2025 Au-Zone Technologies. All Rights Reserved.

use edgefirst_dsp::queue::BlockingQueue;
use std::{
    sync::{Arc, Barrier},
    thread,
    time::{Duration, Instant},
};

#[test]
fn test_disable_wakes_all_waiters() {
    const WAITERS: usize = 6;
    let queue = Arc::new(BlockingQueue::<u32>::new());
    let barrier = Arc::new(Barrier::new(WAITERS + 1));

    let waiters: Vec<_> = (0..WAITERS)
        .map(|_| {
            let queue = queue.clone();
            let barrier = barrier.clone();
            thread::spawn(move || {
                barrier.wait();
                queue.pop()
            })
        })
        .collect();

    barrier.wait();
    thread::sleep(Duration::from_millis(50));
    let start = Instant::now();
    assert!(queue.disable().is_empty());

    for waiter in waiters {
        assert_eq!(waiter.join().unwrap(), None);
    }
    println!("woke {WAITERS} waiters in {:?}", start.elapsed());
    assert!(start.elapsed() < Duration::from_secs(1));
}

#[test]
fn test_items_reach_blocked_consumer() {
    let queue = Arc::new(BlockingQueue::new());
    let consumer = {
        let queue = queue.clone();
        thread::spawn(move || {
            let mut seen = Vec::new();
            while let Some(item) = queue.pop() {
                seen.push(item);
            }
            seen
        })
    };

    for i in 0..100 {
        assert!(queue.push(i));
    }
    while !queue.is_empty() {
        thread::sleep(Duration::from_millis(1));
    }
    queue.disable();
    assert_eq!(consumer.join().unwrap(), (0..100).collect::<Vec<_>>());
}

#[test]
fn test_reenable_after_disable() {
    let queue = BlockingQueue::new();
    queue.push("stale");
    assert_eq!(queue.disable(), vec!["stale"]);
    assert!(!queue.is_enabled());
    assert_eq!(queue.pop_timeout(Duration::from_secs(5)), None);

    queue.enable();
    assert!(queue.is_enabled());
    assert_eq!(queue.try_pop(), None);
    queue.push("fresh");
    assert_eq!(queue.pop(), Some("fresh"));
}
