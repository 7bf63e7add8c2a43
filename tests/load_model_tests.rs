//! Integration tests for ramp schedules and load model validation.

use fxdeals_loadtest::config_validation::ValidationError;
use fxdeals_loadtest::load_models::{ExecutorKind, LoadModel, RampSchedule, Stage};
use std::time::Duration;

fn secs(s: u64) -> Duration {
    Duration::from_secs(s)
}

fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}

#[test]
fn test_first_stage_interpolates_from_start_value() {
    let schedule = RampSchedule::new(2.0, vec![Stage::new(10.0, secs(30))]);

    assert!(approx(schedule.target_at(Duration::ZERO), 2.0));
    assert!(approx(schedule.target_at(secs(15)), 6.0));
    // The boundary belongs to the next stage; past the last one the curve is zero.
    assert!(approx(schedule.target_at(secs(30)), 0.0));
    assert!(approx(schedule.target_at(Duration::from_millis(29_999)), 10.0 - 8.0 / 30_000.0));
}

#[test]
fn test_stage_boundary_belongs_to_the_next_stage() {
    let schedule = RampSchedule::new(
        0.0,
        vec![Stage::new(10.0, secs(10)), Stage::new(10.0, secs(10))],
    );

    assert_eq!(schedule.stage_index_at(secs(9)), Some(0));
    assert_eq!(schedule.stage_index_at(secs(10)), Some(1));
    assert_eq!(schedule.stage_index_at(secs(20)), None);
    assert!(approx(schedule.target_at(secs(10)), 10.0));
}

#[test]
fn test_zero_duration_stage_jumps_to_target() {
    let schedule = RampSchedule::new(
        1.0,
        vec![Stage::new(50.0, Duration::ZERO), Stage::new(50.0, secs(10))],
    );

    assert_eq!(schedule.stage_index_at(Duration::ZERO), Some(1));
    assert!(approx(schedule.target_at(Duration::ZERO), 50.0));
    assert!(approx(schedule.integral_to(secs(2)), 100.0));
}

#[test]
fn test_integral_of_constant_rate() {
    let schedule = RampSchedule::flat(10.0, secs(60));

    assert!(approx(schedule.integral_to(secs(1)), 10.0));
    assert!(approx(schedule.integral_to(secs(60)), 600.0));
    // Clamped at the end of the schedule.
    assert!(approx(schedule.integral_to(secs(90)), 600.0));
}

#[test]
fn test_integral_of_ramps_is_trapezoidal() {
    // 0 -> 10 over 10s, hold 10 for 10s, 10 -> 0 over 10s.
    let schedule = RampSchedule::new(
        0.0,
        vec![
            Stage::new(10.0, secs(10)),
            Stage::new(10.0, secs(10)),
            Stage::new(0.0, secs(10)),
        ],
    );

    assert!(approx(schedule.integral_to(secs(5)), 12.5));
    assert!(approx(schedule.integral_to(secs(10)), 50.0));
    assert!(approx(schedule.integral_to(secs(20)), 150.0));
    assert!(approx(schedule.integral_to(secs(30)), 200.0));
    assert_eq!(schedule.total_duration(), secs(30));
    assert!(approx(schedule.max_target(), 10.0));
}

#[test]
fn test_due_time_inverts_the_integral() {
    let flat = RampSchedule::flat(10.0, secs(60));
    assert_eq!(flat.time_for_integral(0.0), Some(Duration::ZERO));
    let first = flat.time_for_integral(1.0).unwrap();
    assert!(approx(first.as_secs_f64(), 0.1));
    assert!(approx(flat.time_for_integral(600.0).unwrap().as_secs_f64(), 60.0));
    assert_eq!(flat.time_for_integral(601.0), None);

    // 0 -> 10 over 10s: area 8 is reached at t = 4s, then 50 more at 10/s.
    let ramp = RampSchedule::new(
        0.0,
        vec![Stage::new(10.0, secs(10)), Stage::new(10.0, secs(10))],
    );
    let t = ramp.time_for_integral(8.0).unwrap();
    assert!((t.as_secs_f64() - 4.0).abs() < 1e-6, "{:?}", t);
    let t = ramp.time_for_integral(100.0).unwrap();
    assert!((t.as_secs_f64() - 15.0).abs() < 1e-6, "{:?}", t);
    for elapsed in [secs(1), secs(7), secs(13)] {
        let back = ramp.time_for_integral(ramp.integral_to(elapsed)).unwrap();
        assert!((back.as_secs_f64() - elapsed.as_secs_f64()).abs() < 1e-6);
    }
}

#[test]
fn test_rate_schedule_normalizes_time_unit() {
    let model = LoadModel::ConstantArrivalRate {
        rate: 30.0,
        time_unit: secs(60),
        duration: secs(120),
        pre_allocated_vus: 1,
        max_vus: 5,
    };

    let schedule = model.rate_schedule().unwrap();
    assert!(approx(schedule.target_at(secs(1)), 0.5));
    assert!(approx(schedule.integral_to(secs(120)), 60.0));
    assert!(model.vu_schedule().is_none());
}

#[test]
fn test_ramping_vus_pool_bounds_follow_peak_target() {
    let model = LoadModel::RampingVus {
        start_vus: 0,
        stages: vec![
            Stage::new(5.0, secs(30)),
            Stage::new(100.0, secs(60)),
            Stage::new(0.0, secs(30)),
        ],
    };

    assert_eq!(model.kind(), ExecutorKind::RampingVus);
    assert_eq!(model.pool_bounds(), (0, 100));
    assert_eq!(model.duration(), secs(120));
}

#[test]
fn test_executor_kind_names() {
    let names: Vec<String> = [
        ExecutorKind::ConstantArrivalRate,
        ExecutorKind::RampingArrivalRate,
        ExecutorKind::RampingVus,
        ExecutorKind::ConstantVus,
        ExecutorKind::SharedIterations,
    ]
    .iter()
    .map(|k| k.to_string())
    .collect();

    assert_eq!(
        names,
        vec![
            "constant-arrival-rate",
            "ramping-arrival-rate",
            "ramping-vus",
            "constant-vus",
            "shared-iterations"
        ]
    );
}

#[test]
fn test_max_vus_below_preallocated_names_the_field() {
    let model = LoadModel::ConstantArrivalRate {
        rate: 10.0,
        time_unit: secs(1),
        duration: secs(10),
        pre_allocated_vus: 20,
        max_vus: 10,
    };

    let err = model.validate("scenarios.batches").unwrap_err();
    assert_eq!(err.field(), Some("scenarios.batches.max_vus"));
}

#[test]
fn test_ramping_executor_requires_stages() {
    let model = LoadModel::RampingArrivalRate {
        start_rate: 1.0,
        time_unit: secs(1),
        stages: vec![],
        pre_allocated_vus: 1,
        max_vus: 1,
    };

    let err = model.validate("scenarios.singles").unwrap_err();
    assert!(matches!(err, ValidationError::FieldError { .. }));
    assert_eq!(err.field(), Some("scenarios.singles.stages"));
}

#[test]
fn test_negative_stage_target_is_rejected() {
    let model = LoadModel::RampingVus {
        start_vus: 0,
        stages: vec![Stage::new(5.0, secs(10)), Stage::new(-1.0, secs(10))],
    };

    let err = model.validate("scenarios.reads").unwrap_err();
    assert_eq!(err.field(), Some("scenarios.reads.stages[1].target"));
}

#[test]
fn test_zero_duration_and_zero_iterations_are_rejected() {
    let constant = LoadModel::ConstantVus {
        vus: 1,
        duration: Duration::ZERO,
    };
    assert_eq!(
        constant.validate("scenarios.smoke").unwrap_err().field(),
        Some("scenarios.smoke.duration")
    );

    let shared = LoadModel::SharedIterations {
        vus: 1,
        iterations: 0,
        max_duration: secs(60),
    };
    assert_eq!(
        shared.validate("scenarios.seed").unwrap_err().field(),
        Some("scenarios.seed.iterations")
    );
}
