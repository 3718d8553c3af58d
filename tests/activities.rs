//! Background activities: launch at quiescence, cooperative shutdown on
//! exit, and failure propagation from the activity join.

#[macro_use]
mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use common::{track, wait_until};
use statechart::{MachineBuilder, MachineError, TransitionDef};

#[test]
fn activity_runs_while_its_state_is_active() {
    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let a = builder.state("a", sm).unwrap();
    let b = builder.state("b", sm).unwrap();
    builder.transition(TransitionDef::on(a, 1).to(b)).unwrap();
    builder.transition(TransitionDef::on(b, 2).to(a)).unwrap();

    let started = Arc::new(AtomicUsize::new(0));
    let stopped = Arc::new(AtomicUsize::new(0));
    let on_start = Arc::clone(&started);
    let on_stop = Arc::clone(&stopped);
    builder
        .activity(a, move |exit_request| {
            on_start.fetch_add(1, Ordering::SeqCst);
            exit_request.wait();
            on_stop.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
        .unwrap();

    let machine = builder.build();
    machine.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::SeqCst) == 1
    }));
    assert_eq!(stopped.load(Ordering::SeqCst), 0);

    // Exiting `a` joins the activity thread before the exit hook runs.
    machine.add_event(1).unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 1);

    // Re-entering relaunches it.
    machine.add_event(2).unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        started.load(Ordering::SeqCst) == 2
    }));

    machine.stop().unwrap();
    assert_eq!(stopped.load(Ordering::SeqCst), 2);
}

#[test]
fn activity_failure_surfaces_on_exit_and_stops_the_machine() {
    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let a = builder.state("a", sm).unwrap();
    let b = builder.state("b", sm).unwrap();
    builder.transition(TransitionDef::on(a, 1).to(b)).unwrap();
    let t_a = track(&mut builder, a);
    let t_b = track(&mut builder, b);

    builder
        .activity(a, |exit_request| {
            exit_request.wait();
            Err("activity exploded".into())
        })
        .unwrap();

    let machine = builder.build();
    machine.start().unwrap();

    let err = machine.add_event(1).unwrap_err();
    assert!(matches!(err, MachineError::Activity { ref state, .. } if state == "a"));
    assert!(!machine.running());
    assert_active!(machine, []);

    // The failing state is still torn down exactly once and the target
    // was never entered.
    t_a.assert_counts("a", 1, 1);
    t_b.assert_counts("b", 0, 0);
}

#[test]
fn activity_panic_is_reported_as_a_failure() {
    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let a = builder.state("a", sm).unwrap();
    let b = builder.state("b", sm).unwrap();
    builder.transition(TransitionDef::on(a, 1).to(b)).unwrap();
    builder
        .activity(a, |exit_request| {
            exit_request.wait();
            panic!("activity panicked");
        })
        .unwrap();

    let machine = builder.build();
    machine.start().unwrap();

    let err = machine.add_event(1).unwrap_err();
    assert!(matches!(err, MachineError::Activity { ref state, .. } if state == "a"));
    assert!(!machine.running());
}

#[test]
fn activity_can_poll_with_a_timeout() {
    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let a = builder.state("a", sm).unwrap();

    let ticks = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&ticks);
    builder
        .activity(a, move |exit_request| {
            while !exit_request.wait_timeout(Duration::from_millis(2)) {
                counter.fetch_add(1, Ordering::SeqCst);
            }
            Ok(())
        })
        .unwrap();

    let machine = builder.build();
    machine.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        ticks.load(Ordering::SeqCst) >= 3
    }));
    machine.stop().unwrap();
}

#[test]
fn activities_in_parallel_regions_run_together() {
    use statechart::ChildMode;

    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let p = builder.state("p", sm).unwrap();
    builder.child_mode(p, ChildMode::Parallel).unwrap();
    let r1 = builder.state("r1", p).unwrap();
    let r2 = builder.state("r2", p).unwrap();
    let outside = builder.state("outside", sm).unwrap();
    builder
        .transition(TransitionDef::on(p, 1).to(outside))
        .unwrap();

    let running_count = Arc::new(AtomicUsize::new(0));
    for region in [r1, r2] {
        let counter = Arc::clone(&running_count);
        builder
            .activity(region, move |exit_request| {
                counter.fetch_add(1, Ordering::SeqCst);
                exit_request.wait();
                counter.fetch_sub(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }

    let machine = builder.build();
    machine.start().unwrap();
    assert!(wait_until(Duration::from_secs(2), || {
        running_count.load(Ordering::SeqCst) == 2
    }));

    machine.add_event(1).unwrap();
    assert_eq!(running_count.load(Ordering::SeqCst), 0);
}
