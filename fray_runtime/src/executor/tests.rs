use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

use rand::seq::SliceRandom;
use rand::SeedableRng;

use super::aborts::AbortHandler;
use super::*;
use crate::conflict::Lockable;
use crate::worklist::GlobalFifo;

#[test]
fn executor_counting_sum() {
    let sum = AtomicU64::new(0);
    let config = Config::new().loopname("counting").threads(4);
    let report = for_each(
        0..1000u64,
        |x: &mut u64, _cx: &mut UserContext<'_, u64>| -> IterResult {
            sum.fetch_add(*x, Ordering::Relaxed);
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(sum.load(Ordering::Relaxed), 499500);
    assert_eq!(report.iterations, 1000);
    assert_eq!(report.conflicts, 0);
    assert_eq!(report.commits, 1000);
    assert!(!report.broke);
}

#[test]
fn executor_push_chain() {
    let config = Config::new().loopname("push").threads(2);
    let report = for_each(
        vec![1u64],
        |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            if *x > 0 {
                cx.push(*x - 1);
            }
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.iterations, 2);
    assert_eq!(report.pushes, 1);
    assert_eq!(report.conflicts, 0);
}

#[test]
fn executor_forced_conflict() {
    struct RendezvousOp<'a> {
        lock: &'a Lockable<u32>,
        arrivals: &'a AtomicUsize,
    }
    impl<'a> Operator<u64> for RendezvousOp<'a> {
        fn call(&self, _item: &mut u64, cx: &mut UserContext<'_, u64>) -> IterResult {
            // wait until both iterations are in flight, so that exactly one
            // of them must lose the lock; retries sail through
            self.arrivals.fetch_add(1, Ordering::SeqCst);
            while self.arrivals.load(Ordering::SeqCst) < 2 {
                std::hint::spin_loop();
            }
            let mut g = cx.write(self.lock)?;
            *g += 1;
            Ok(())
        }
    }

    let lock = Lockable::new(0u32);
    let arrivals = AtomicUsize::new(0);
    let config = Config::new()
        .loopname("forced-conflict")
        .threads(2)
        .disable_push();
    let report = for_each(
        vec![0u64, 1],
        RendezvousOp {
            lock: &lock,
            arrivals: &arrivals,
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.commits, 2);
    assert!(report.conflicts >= 1);
    assert_eq!(report.iterations, report.commits + report.conflicts);
    // no lost item, no double commit
    assert_eq!(lock.into_inner(), 2);
}

#[test]
fn executor_break_discards_remaining() {
    let config = Config::new()
        .loopname("break")
        .threads(4)
        .enable_break()
        .disable_push();
    let report = for_each(
        0..1000u64,
        |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            if *x == 42 {
                cx.break_loop();
            }
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert!(report.broke);
    assert!(report.iterations >= 1);
    assert!(report.iterations <= 1000);
}

#[test]
fn executor_break_on_first_iteration() {
    let config = Config::new().threads(1).enable_break().disable_push();
    let report = for_each(
        0..10u64,
        |_x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            cx.break_loop();
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert!(report.broke);
    assert_eq!(report.iterations, 1);
}

#[test]
fn executor_escalation_targets_double_policy() {
    let topo = Topology::uniform(8, 4);
    // four packages, so Auto resolves to the double policy
    let h = AbortHandler::<u64>::new(&topo, AbortPolicy::Auto);
    // tid 7 lives in package 3, whose leader is tid 6
    assert_eq!(h.escalation_target(7, 1), 7); // odd retry: local
    assert_eq!(h.escalation_target(7, 3), 7);
    assert_eq!(h.escalation_target(7, 2), 6); // even: half-way to the leader
    assert_eq!(h.escalation_target(6, 2), 2); // leaders climb the package tree
    assert_eq!(h.escalation_target(6, 4), 2);
    assert_eq!(h.escalation_target(0, 2), 0); // package 0's leader stays put
}

#[test]
fn executor_escalation_targets_basic_policy() {
    // two packages: Auto resolves to basic, every retry climbs packages
    let topo = Topology::uniform(4, 2);
    let h = AbortHandler::<u64>::new(&topo, AbortPolicy::Auto);
    assert_eq!(h.escalation_target(3, 2), 0);
    assert_eq!(h.escalation_target(1, 7), 0);
}

#[test]
fn executor_escalation_targets_bounded_policy() {
    let topo = Topology::uniform(8, 4);
    let h = AbortHandler::<u64>::new(&topo, AbortPolicy::Bounded);
    assert_eq!(h.escalation_target(7, 1), 7); // early retries stay local
    assert_eq!(h.escalation_target(7, 2), 6); // then climb within the package
    assert_eq!(h.escalation_target(7, 4), 6);
    assert_eq!(h.escalation_target(7, 5), 2); // then climb packages
    assert_eq!(h.escalation_target(6, 3), 2); // leaders skip the package climb
}

#[test]
fn executor_escalation_targets_eager_policy() {
    let topo = Topology::uniform(8, 4);
    let h = AbortHandler::<u64>::new(&topo, AbortPolicy::Eager);
    for retries in 1..10 {
        assert_eq!(h.escalation_target(5, retries), 5);
    }
}

#[test]
fn executor_abort_queue_routing() {
    let topo = Topology::uniform(8, 4);
    let h = AbortHandler::new(&topo, AbortPolicy::Auto);

    h.push_new(7, 42u64);
    let item = h.pop_local(7).unwrap();
    assert_eq!(item.retries, 1);
    assert_eq!(item.val, 42);

    // second abort escalates half-way toward the package leader
    h.push_retry(7, item);
    assert!(h.pop_local(7).is_none());
    let item = h.pop_local(6).unwrap();
    assert_eq!(item.retries, 2);

    // third abort is odd again: stays local to the thread it died on
    h.push_retry(6, item);
    let item = h.pop_local(6).unwrap();
    assert_eq!(item.retries, 3);
}

#[test]
fn executor_escalation_retries_until_commit() {
    const N: usize = 32;
    struct EvenHater<'a> {
        attempts: &'a [AtomicU32],
    }
    impl<'a> Operator<usize> for EvenHater<'a> {
        fn call(&self, item: &mut usize, _cx: &mut UserContext<'_, usize>) -> IterResult {
            // even items refuse to commit until their seventh attempt
            if *item % 2 == 0 && self.attempts[*item].fetch_add(1, Ordering::SeqCst) < 6 {
                return Err(Conflict);
            }
            Ok(())
        }
    }

    let attempts: Vec<AtomicU32> = (0..N).map(|_| AtomicU32::new(0)).collect();
    let config = Config::new()
        .loopname("escalation")
        .threads(8)
        .topology(Topology::uniform(8, 4))
        .disable_push();
    let report = for_each(0..N, EvenHater { attempts: &attempts }, &config).unwrap();

    assert_eq!(report.commits, N as u64);
    assert_eq!(report.conflicts, (N as u64 / 2) * 6);
    assert_eq!(report.iterations, report.commits + report.conflicts);
    for (i, a) in attempts.iter().enumerate() {
        let expected = if i % 2 == 0 { 7 } else { 1 };
        assert_eq!(a.load(Ordering::SeqCst), expected);
    }
}

#[test]
fn executor_slow_producer_quiescence() {
    const CHAIN: u64 = 20;
    let committed = AtomicU64::new(0);
    let config = Config::new()
        .loopname("slow-producer")
        .threads(4)
        .disable_aborts();
    let report = for_each(
        vec![CHAIN],
        |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            std::thread::sleep(Duration::from_micros(200));
            committed.fetch_add(1, Ordering::SeqCst);
            if *x > 0 {
                cx.push(*x - 1);
            }
            Ok(())
        },
        &config,
    )
    .unwrap();
    // the loop must not terminate while the chain is still producing
    assert_eq!(report.iterations, CHAIN + 1);
    assert_eq!(committed.load(Ordering::SeqCst), CHAIN + 1);
    assert_eq!(report.pushes, CHAIN);
}

#[test]
fn executor_fast_push_back_spills() {
    // a single seed fans out into 100 staged children in one iteration;
    // with aborts disabled they spill into the worklist past the threshold
    let config = Config::new().loopname("spill").threads(2).disable_aborts();
    let report = for_each(
        vec![0u64],
        |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            if *x == 0 {
                for i in 1..=100 {
                    cx.push(i);
                }
            }
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.iterations, 101);
    assert_eq!(report.pushes, 100);
}

#[test]
fn executor_empty_range() {
    let config = Config::new().loopname("empty").threads(4);
    let report = for_each(Vec::<u64>::new(), plain_op(|_x: &mut u64| {}), &config).unwrap();
    assert_eq!(report, LoopReport::default());
}

#[test]
fn executor_single_item_single_thread() {
    let wl = GlobalFifo::new(1);
    let config = Config::new().threads(1);
    let report = for_each_in(
        &wl,
        vec![7u64],
        plain_op(|x: &mut u64| assert_eq!(*x, 7)),
        &config,
    )
    .unwrap();
    assert_eq!(report.commits, 1);
    assert_eq!(report.conflicts, 0);
}

#[test]
fn executor_single_thread_matches_sequential() {
    let mut rng = rand_xorshift::XorShiftRng::seed_from_u64(0);
    let mut input: Vec<u64> = (0..100).collect();
    input.shuffle(&mut rng);

    let seen = parking_lot::Mutex::new(Vec::new());
    let wl = GlobalFifo::new(1);
    let config = Config::new().threads(1).disable_push();
    let report = for_each_in(
        &wl,
        input.clone(),
        |x: &mut u64, _cx: &mut UserContext<'_, u64>| -> IterResult {
            seen.lock().push(*x);
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.commits, 100);
    // one thread on a strict FIFO commits in exactly seed order
    assert_eq!(*seen.lock(), input);
}

#[test]
fn executor_no_aborts_processes_every_item_once() {
    let seen = parking_lot::Mutex::new(Vec::new());
    let config = Config::new().threads(4).disable_aborts().disable_push();
    let report = for_each(
        0..1000u64,
        |x: &mut u64, _cx: &mut UserContext<'_, u64>| -> IterResult {
            seen.lock().push(*x);
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.iterations, 1000);
    let mut seen = seen.into_inner();
    seen.sort();
    assert_eq!(seen, (0..1000).collect::<Vec<_>>());
}

#[test]
fn executor_per_iter_alloc() {
    let total = AtomicU64::new(0);
    let config = Config::new()
        .threads(2)
        .enable_per_iter_alloc()
        .disable_push();
    let report = for_each(
        0..100u64,
        |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
            let scratch = cx.per_iter_alloc().alloc([*x; 4]);
            scratch[2] += 1;
            total.fetch_add(scratch.iter().sum::<u64>(), Ordering::Relaxed);
            Ok(())
        },
        &config,
    )
    .unwrap();
    assert_eq!(report.commits, 100);
    assert_eq!(total.load(Ordering::Relaxed), 4 * 4950 + 100);
}

#[test]
fn executor_abort_discards_staged_pushes() {
    struct PushThenConflict<'a> {
        attempts: &'a AtomicU32,
    }
    impl<'a> Operator<u64> for PushThenConflict<'a> {
        fn call(&self, item: &mut u64, cx: &mut UserContext<'_, u64>) -> IterResult {
            if *item < 100 {
                cx.push(*item + 100);
                // the first attempt stages a push and then conflicts
                if self.attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    return Err(Conflict);
                }
            }
            Ok(())
        }
    }

    let attempts = AtomicU32::new(0);
    let config = Config::new().threads(2).loopname("abort-discards-pushes");
    let report = for_each(
        vec![1u64],
        PushThenConflict {
            attempts: &attempts,
        },
        &config,
    )
    .unwrap();
    // aborted attempt + committed retry + the one surviving child
    assert_eq!(report.iterations, 3);
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.commits, 2);
    // the push staged by the aborted attempt was discarded
    assert_eq!(report.pushes, 1);
}

#[test]
fn executor_stress_random_lock_grabs() {
    const N: usize = 10_000;
    const STRIPES: usize = 16;

    struct StripeAdd<'a> {
        stripes: &'a [Lockable<u64>],
    }
    impl<'a> Operator<u64> for StripeAdd<'a> {
        fn call(&self, item: &mut u64, cx: &mut UserContext<'_, u64>) -> IterResult {
            let a = (*item as usize).wrapping_mul(0x9E37_79B9) % STRIPES;
            let b = (*item as usize).wrapping_mul(0x85EB_CA6B) % STRIPES;
            let mut ga = cx.write(&self.stripes[a])?;
            *ga += *item;
            if b != a {
                let mut gb = cx.write(&self.stripes[b])?;
                *gb += 1;
            }
            Ok(())
        }
    }

    let stripes: Vec<Lockable<u64>> = (0..STRIPES).map(|_| Lockable::new(0)).collect();
    let config = Config::new()
        .loopname("stress")
        .threads(4)
        .disable_push();
    let report = for_each(
        0..N as u64,
        StripeAdd { stripes: &stripes },
        &config,
    )
    .unwrap();
    assert_eq!(report.commits, N as u64);
    assert_eq!(report.iterations, report.commits + report.conflicts);

    let expected: u64 = (0..N as u64)
        .map(|x| {
            let a = (x as usize).wrapping_mul(0x9E37_79B9) % STRIPES;
            let b = (x as usize).wrapping_mul(0x85EB_CA6B) % STRIPES;
            x + u64::from(a != b)
        })
        .sum();
    let total: u64 = stripes.into_iter().map(|s| s.into_inner()).sum();
    assert_eq!(total, expected);
}

#[test]
fn executor_operator_panic_resurfaces() {
    let result = catch_unwind(AssertUnwindSafe(|| {
        for_each(
            0..100u64,
            |x: &mut u64, _cx: &mut UserContext<'_, u64>| -> IterResult {
                if *x == 13 {
                    panic!("unlucky");
                }
                Ok(())
            },
            &Config::new().threads(4).disable_push().disable_stats(),
        )
    }));
    let payload = result.unwrap_err();
    assert_eq!(payload.downcast_ref::<&str>().copied(), Some("unlucky"));
}

#[test]
fn executor_conflict_without_aborts_is_a_failure() {
    let result = catch_unwind(AssertUnwindSafe(|| {
        for_each(
            vec![1u64],
            |_x: &mut u64, _cx: &mut UserContext<'_, u64>| -> IterResult { Err(Conflict) },
            &Config::new().threads(2).disable_aborts().disable_push().disable_stats(),
        )
    }));
    assert!(result.is_err());
}

#[test]
fn executor_config_validation() {
    let noop = plain_op(|_x: &mut u64| {});
    assert_eq!(
        for_each(0..1u64, &noop, &Config::new().threads(0)).unwrap_err(),
        ConfigError::ZeroThreads
    );
    assert_eq!(
        for_each(0..1u64, &noop, &Config::new().threads(MAX_THREADS + 1)).unwrap_err(),
        ConfigError::TooManyThreads(MAX_THREADS + 1)
    );
    assert_eq!(
        for_each(
            0..1u64,
            &noop,
            &Config::new().threads(4).topology(Topology::uniform(2, 1))
        )
        .unwrap_err(),
        ConfigError::TopologyMismatch {
            topology: 2,
            threads: 4
        }
    );
    assert_eq!(
        for_each(0..1u64, &noop, &Config::new().threads(1).chunk_size(0)).unwrap_err(),
        ConfigError::ZeroChunk
    );
}

#[test]
fn executor_on_each_runs_every_thread_once() {
    let hits: Vec<AtomicU32> = (0..6).map(|_| AtomicU32::new(0)).collect();
    on_each(
        |tid, nthreads| {
            assert_eq!(nthreads, 6);
            hits[tid].fetch_add(1, Ordering::SeqCst);
        },
        &Config::new().threads(6),
    )
    .unwrap();
    for h in &hits {
        assert_eq!(h.load(Ordering::SeqCst), 1);
    }
}

#[test]
fn executor_push_disabled_panics_on_push() {
    let pushed = AtomicBool::new(false);
    let result = catch_unwind(AssertUnwindSafe(|| {
        for_each(
            vec![1u64],
            |x: &mut u64, cx: &mut UserContext<'_, u64>| -> IterResult {
                pushed.store(true, Ordering::SeqCst);
                cx.push(*x);
                Ok(())
            },
            &Config::new().threads(1).disable_push().disable_stats(),
        )
    }));
    assert!(pushed.load(Ordering::SeqCst));
    assert!(result.is_err());
}
