mod common;

use common::*;
use glam::IVec2;
use racing_rl::{Action, RacePhase, StartPose, StepInfo, TrackConfig};

/// Step car 0 with `action` until it terminates; returns the 1-based tick
/// it ended on and that tick's report.
fn drive_until_done(
    race: &mut racing_rl::RaceController,
    mut action: impl FnMut(u32) -> Action,
    max_ticks: u32,
) -> (u32, StepInfo) {
    for tick in 1..=max_ticks {
        let outcome = race.step(&[action(tick)]);
        let info = outcome.cars[0];
        if info.terminated {
            return (tick, info);
        }
    }
    panic!("car still racing after {max_ticks} ticks");
}

#[test]
fn straight_run_crosses_gate_then_finishes() {
    let mut race = solo_race();
    let mut gate_tick = None;
    let mut finish = None;
    for tick in 1..=200u32 {
        let info = race.step(&[Action::Forward]).cars[0];
        assert!(!info.collision, "collision on tick {tick}");
        if info.checkpoint_forward {
            gate_tick = Some(tick);
        }
        if info.terminated {
            finish = Some((tick, info));
            break;
        }
    }

    assert_eq!(gate_tick, Some(32));
    let (tick, info) = finish.expect("car should reach the line");
    assert_eq!(tick, 47);
    assert!(info.finished);
    assert!((info.velocity - 4.7).abs() < 1e-3);
    assert_eq!(info.progress, 1.0);
    assert_eq!(race.phase(), RacePhase::Finished);

    let racer = race.racer(0).unwrap();
    assert!(racer.finished() && !racer.crashed());
    assert!(!racer.car().can_move());
    assert!((racer.finish_time().unwrap() - 47.0 / 60.0).abs() < 1e-5);

    // Finished races ignore further input.
    let before = racer.car().position();
    race.step(&[Action::Forward]);
    assert_eq!(race.racer(0).unwrap().car().position(), before);
}

#[test]
fn reaching_the_line_from_beyond_is_a_crash() {
    // Start past the line and back down onto it.
    let config = TrackConfig {
        solo_start: StartPose::new(340.0, 200.0),
        ..lane_config()
    };
    let mut race = solo_race_on(lane_track(config));
    let (tick, info) = drive_until_done(&mut race, |_| Action::Reverse, 200);

    assert_eq!(tick, 27);
    assert!(info.collision && !info.finished);
    assert_eq!(race.phase(), RacePhase::Failed);
    let racer = race.racer(0).unwrap();
    assert!(racer.crashed() && racer.finish_time().is_none());
    // Stopped on the upper edge of the line.
    let car = racer.car();
    assert!(car.position().y > 230.0 && car.position().y < 250.0);
    let (_, row) = race.track().finish_overlap(car).unwrap();
    assert!(row <= 2);
}

#[test]
fn finish_wins_over_a_border_hit_on_the_same_tick() {
    // The far wall covers the whole finish line.
    let track = track_with_border(lane_config(), &border_with_top(275));
    let mut race = solo_race_on(track);
    let (tick, info) = drive_until_done(&mut race, |_| Action::Forward, 200);

    assert_eq!(tick, 47);
    assert!(info.finished && !info.collision);
    assert_eq!(race.phase(), RacePhase::Finished);
    let racer = race.racer(0).unwrap();
    assert!(racer.finished() && !racer.crashed());
    assert!(race.track().hits_border(racer.car()));
}

#[test]
fn turning_into_the_wall_crashes() {
    let mut race = solo_race();
    let (tick, info) = drive_until_done(
        &mut race,
        |t| if t <= 30 { Action::Forward } else { Action::Left },
        230,
    );

    assert!(info.collision && !info.finished);
    // Roughly 90 degrees into the turn the rotated body reaches the wall.
    assert!((48..=56).contains(&tick), "crashed on tick {tick}");
    assert_eq!(race.phase(), RacePhase::Failed);
    let car = race.car(0).unwrap();
    assert!(car.failed() && !car.can_move());
    // Left turns drift toward the left wall.
    assert!(car.position().x < 340.0);
    assert!(car.heading() > 0.0 && car.heading() < 180.0);
}

#[test]
fn obstacle_hit_slows_car_and_is_destroyed() {
    let config = TrackConfig {
        obstacle_pool: vec![IVec2::new(330, 300)],
        obstacle_count: 1,
        ..lane_config()
    };
    let mut race = race_with(config, quiet_config(), 1);
    race.skip_countdown();
    assert_eq!(race.obstacles().live_count(), 1);

    let mut hits = Vec::new();
    let mut last = StepInfo::default();
    for tick in 1..=300u32 {
        last = race.step(&[Action::Forward]).cars[0];
        if last.hit_obstacle {
            assert!(!last.collision && !last.finished);
            hits.push((tick, last.velocity));
        }
        if last.terminated {
            break;
        }
    }

    assert_eq!(hits.len(), 1, "hits: {hits:?}");
    let (tick, velocity) = hits[0];
    assert_eq!(tick, 38);
    // 3.7 carried in, +0.1 this tick, then a quarter survives the impact.
    assert!((velocity - 0.95).abs() < 1e-4);
    assert_eq!(race.obstacles().live_count(), 0);

    assert!(last.finished && !last.collision);
    assert_eq!(race.phase(), RacePhase::Finished);
}

#[test]
fn idle_car_runs_out_of_time() {
    let mut race = solo_race();
    let budget = race.config().tick_budget();
    assert_eq!(budget, 1500);

    let (tick, info) = drive_until_done(&mut race, |_| Action::Idle, budget + 10);
    assert_eq!(tick, budget);
    assert!(info.timeout && !info.collision && !info.finished);
    assert_eq!(race.phase(), RacePhase::Failed);

    let racer = race.racer(0).unwrap();
    assert!(racer.timed_out() && !racer.crashed());
    assert!(!racer.car().can_move());
    assert_eq!(racer.car().position(), glam::Vec2::new(340.0, 400.0));
}

#[test]
fn two_car_race_with_countdown() {
    let mut race = race_with(lane_config(), quiet_config(), 2);
    assert_eq!(race.phase(), RacePhase::Countdown);

    let mut p2_crash = None;
    let mut p1_finish = None;
    for step in 1..=400u32 {
        let p1 = if step > 180 { Action::Forward } else { Action::Idle };
        let p2 = if step > 150 { Action::ForwardRight } else { Action::Idle };
        let outcome = race.step(&[p1, p2]);

        if step <= 180 {
            // Countdown ignores input.
            assert_eq!(race.car(0).unwrap().velocity(), 0.0);
            assert_eq!(race.car(1).unwrap().velocity(), 0.0);
        }
        if step == 180 {
            assert_eq!(outcome.phase, RacePhase::Running);
        }
        if outcome.cars[1].collision {
            p2_crash = Some(step);
        }
        if outcome.cars[0].finished {
            p1_finish = Some(step);
        }
        if outcome.phase.is_over() {
            break;
        }
    }

    let p2_crash = p2_crash.expect("second car should hit the right wall");
    assert!((195..=205).contains(&p2_crash), "crashed on step {p2_crash}");
    assert_eq!(p1_finish, Some(227));
    assert_eq!(race.phase(), RacePhase::Finished);
    assert!(race.racer(1).unwrap().crashed());
    // The crashed car stays where it hit the wall.
    assert!(race.car(1).unwrap().position().x > 370.0);
}

#[test]
fn restart_puts_cars_back_on_the_grid() {
    let mut race = race_with(lane_config(), quiet_config(), 2);
    race.skip_countdown();
    for _ in 0..20 {
        race.step(&[Action::Forward, Action::ForwardLeft]);
    }
    race.restart();

    assert_eq!(race.phase(), RacePhase::Countdown);
    for (slot, x) in [(0, 320.0), (1, 370.0)] {
        let racer = race.racer(slot).unwrap();
        assert_eq!(racer.car().position(), glam::Vec2::new(x, 400.0));
        assert_eq!(racer.car().velocity(), 0.0);
        assert_eq!(racer.ticks_remaining(), 1500);
        assert_eq!(racer.checkpoints().next_index(), 0);
    }
}

#[test]
fn observations_stay_in_range_while_racing() {
    let mut race = solo_race();
    for tick in 0..60u32 {
        let action = if tick % 3 == 0 { Action::ForwardRight } else { Action::Forward };
        race.step(&[action]);
        let obs = race.observation(0).unwrap();
        for (i, v) in obs.iter().enumerate() {
            assert!((-1.0..=1.0).contains(v), "feature {i} = {v}");
        }
        if race.phase().is_over() {
            break;
        }
    }
    assert!(race.observation(1).is_none());
}
