//! Property tests: the configuration invariants hold across arbitrary
//! event sequences, and every entry is balanced by an exit once the
//! machine stops.

mod common;

use common::{track, Track};
use proptest::prelude::*;
use statechart::{ChildMode, MachineBuilder, StateId, StateMachine, TransitionDef};

struct Fixture {
    machine: StateMachine<i32>,
    tracks: Vec<(String, Track)>,
}

/// `sm -> {a -> {aa, ab}, b -> {ba, bb}, p (parallel) -> {r1 -> {r1a, r1b},
/// r2 -> {r2a, r2b}}}` with transitions crossing between the compound and
/// parallel halves.
fn fixture() -> Fixture {
    let mut builder = MachineBuilder::<i32>::new("sm");
    let sm = builder.root();
    let a = builder.state("a", sm).unwrap();
    let aa = builder.state("aa", a).unwrap();
    let ab = builder.state("ab", a).unwrap();
    let b = builder.state("b", sm).unwrap();
    let ba = builder.state("ba", b).unwrap();
    let bb = builder.state("bb", b).unwrap();
    let p = builder.state("p", sm).unwrap();
    builder.child_mode(p, ChildMode::Parallel).unwrap();
    let r1 = builder.state("r1", p).unwrap();
    let r1a = builder.state("r1a", r1).unwrap();
    let r1b = builder.state("r1b", r1).unwrap();
    let r2 = builder.state("r2", p).unwrap();
    let r2a = builder.state("r2a", r2).unwrap();
    let r2b = builder.state("r2b", r2).unwrap();

    builder.transition(TransitionDef::on(aa, 2).to(ba)).unwrap();
    builder.transition(TransitionDef::on(ba, 2).to(bb)).unwrap();
    builder.transition(TransitionDef::on(a, 3).to(bb)).unwrap();
    builder.transition(TransitionDef::on(b, 3).to(ab)).unwrap();
    builder.transition(TransitionDef::on(aa, 4).to(b)).unwrap();
    builder.transition(TransitionDef::on(ba, 4).to(a)).unwrap();
    builder.transition(TransitionDef::on(a, 5).to(ab)).unwrap();
    builder.transition(TransitionDef::on(ab, 6).to(a)).unwrap();
    builder.transition(TransitionDef::on(a, 7).to(p)).unwrap();
    builder.transition(TransitionDef::on(b, 7).to(p)).unwrap();
    builder.transition(TransitionDef::on(p, 8).to(a)).unwrap();
    builder
        .transition(TransitionDef::on(r1a, 9).to(r1b))
        .unwrap();
    builder
        .transition(TransitionDef::on(r2a, 9).to(r2b))
        .unwrap();
    builder
        .transition(TransitionDef::on(r1b, 10).to(r1a))
        .unwrap();

    let mut tracks = Vec::new();
    for (name, id) in [
        ("a", a),
        ("aa", aa),
        ("ab", ab),
        ("b", b),
        ("ba", ba),
        ("bb", bb),
        ("p", p),
        ("r1", r1),
        ("r1a", r1a),
        ("r1b", r1b),
        ("r2", r2),
        ("r2a", r2a),
        ("r2b", r2b),
    ] {
        tracks.push((name.to_string(), track(&mut builder, id)));
    }

    Fixture {
        machine: builder.build(),
        tracks,
    }
}

fn check_configuration(machine: &StateMachine<i32>) {
    let states: Vec<StateId> = machine.pre_order().collect();
    assert_eq!(machine.is_active(machine.root()), machine.running());

    for &state in &states {
        let children: Vec<StateId> = states
            .iter()
            .copied()
            .filter(|&c| machine.parent(c) == Some(state))
            .collect();
        if children.is_empty() {
            continue;
        }

        let active_children = children.iter().filter(|&&c| machine.is_active(c)).count();
        if machine.is_active(state) {
            match machine.child_mode(state) {
                ChildMode::Exclusive => assert_eq!(
                    active_children,
                    1,
                    "compound '{}' must have exactly one active child",
                    machine.name(state)
                ),
                ChildMode::Parallel => assert_eq!(
                    active_children,
                    children.len(),
                    "parallel '{}' must have all children active",
                    machine.name(state)
                ),
            }
        } else {
            assert_eq!(
                active_children,
                0,
                "inactive '{}' must not have active children",
                machine.name(state)
            );
        }
    }
}

proptest! {
    #[test]
    fn configuration_invariants_hold_for_any_event_sequence(
        events in prop::collection::vec(0i32..12, 0..40)
    ) {
        let f = fixture();
        f.machine.start().unwrap();
        check_configuration(&f.machine);

        for event in events {
            let changes_before = f.machine.num_configuration_changes();
            let config_before = f.machine.active_configuration();

            f.machine.add_event(event).unwrap();
            check_configuration(&f.machine);

            // Either the event was discarded and nothing moved, or the
            // change counter advanced by exactly one.
            let changes_after = f.machine.num_configuration_changes();
            if changes_after == changes_before {
                prop_assert_eq!(&config_before, &f.machine.active_configuration());
            } else {
                prop_assert_eq!(changes_after, changes_before + 1);
            }
        }

        f.machine.stop().unwrap();
        prop_assert!(!f.machine.running());
        prop_assert!(f.machine.active_configuration().is_empty());

        for (name, t) in &f.tracks {
            prop_assert_eq!(
                t.entered(),
                t.exited(),
                "'{}' entered {} times but exited {} times",
                name,
                t.entered(),
                t.exited()
            );
        }
    }

    #[test]
    fn change_counter_never_decreases(
        events in prop::collection::vec(0i32..12, 0..20)
    ) {
        let f = fixture();
        f.machine.start().unwrap();

        let mut last = f.machine.num_configuration_changes();
        for event in events {
            f.machine.add_event(event).unwrap();
            let now = f.machine.num_configuration_changes();
            prop_assert!(now >= last);
            last = now;
        }
    }
}
