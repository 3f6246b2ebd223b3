//! End-to-end pipeline scenarios in virtual time.

use std::rc::Rc;

use stagesim::config::ArrivalPattern;
use stagesim::{
    AvailabilityModel, BreakerState, Cache, CircuitBreaker, CircuitBreakerConfig, Dependency,
    Driver, DriverConfig, Event, EventId, QueueConfig, Response, Retry, Sampler, SimRng, Stage,
    Timeout, VirtualClock,
};

fn dependency(
    vclock: &VirtualClock,
    availability: AvailabilityModel,
    latency: Option<f64>,
) -> Rc<Stage> {
    Stage::builder().queue(QueueConfig::unbounded()).build(
        &vclock.clock(),
        Dependency::new(availability, latency.map(Sampler::constant), SimRng::new(11)),
    )
}

/// Sends one event and returns its response and the ticks it took.
fn send(vclock: &mut VirtualClock, stage: &Rc<Stage>, id: u64, key: &str) -> (Response, u64) {
    let clock = vclock.clock();
    let accept = stage.accept(Event::new(EventId(id), key));
    let started = clock.now();
    let response = vclock.run_until(accept).expect("event settles");
    (response, vclock.now() - started)
}

// ============================================================================
// Cache
// ============================================================================

#[test]
fn cache_hit_skips_dependency() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(1.0), Some(150.0));
    let cache = Stage::builder().build(&clock, Cache::new(Rc::clone(&dep)));

    assert_eq!(send(&mut vclock, &cache, 0, "a"), (Response::Success, 150));
    assert_eq!(send(&mut vclock, &cache, 1, "a"), (Response::Success, 0));
    assert_eq!(send(&mut vclock, &cache, 2, "b"), (Response::Success, 150));

    assert_eq!(dep.traffic().arrived, 2);
    let stats = cache.cache().unwrap().stats();
    assert_eq!(stats.hits, 1);
    assert_eq!(stats.misses, 2);
}

#[test]
fn failed_fetch_is_not_cached() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(
        &vclock,
        AvailabilityModel::Scripted(vec![false, true]),
        Some(10.0),
    );
    let cache = Stage::builder().build(&clock, Cache::new(Rc::clone(&dep)));

    assert_eq!(send(&mut vclock, &cache, 0, "a").0, Response::Fail);
    assert!(cache.cache().unwrap().store().is_empty());
    assert_eq!(send(&mut vclock, &cache, 1, "a").0, Response::Success);
    assert_eq!(send(&mut vclock, &cache, 2, "a"), (Response::Success, 0));
    assert_eq!(dep.traffic().arrived, 2);
}

#[test]
fn lru_ttl_forces_refetch() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(1.0), Some(10.0));
    let cache = Stage::builder().build(&clock, Cache::lru(Rc::clone(&dep), Some(8), Some(100)));
    assert_eq!(cache.kind(), "lru-cache");

    send(&mut vclock, &cache, 0, "a");
    assert_eq!(send(&mut vclock, &cache, 1, "a").1, 0);

    for _ in 0..100 {
        vclock.tick();
    }
    assert_eq!(send(&mut vclock, &cache, 2, "a").1, 10);
    assert_eq!(cache.cache().unwrap().stats().expirations, 1);
}

#[test]
fn aside_cache_answers_without_waiting() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(1.0), Some(50.0));
    let cache = Stage::builder().build(&clock, Cache::aside(Rc::clone(&dep), None, None));

    assert_eq!(send(&mut vclock, &cache, 0, "a"), (Response::Fail, 0));
    vclock.start(None);
    assert_eq!(dep.traffic().succeeded, 1);

    assert_eq!(send(&mut vclock, &cache, 1, "a"), (Response::Success, 0));
}

// ============================================================================
// Retry
// ============================================================================

#[test]
fn retry_succeeds_on_third_attempt() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(
        &vclock,
        AvailabilityModel::Scripted(vec![false, false, true]),
        None,
    );
    let retry = Stage::builder().build(&clock, Retry::new(Rc::clone(&dep), 2));

    assert_eq!(send(&mut vclock, &retry, 0, "a").0, Response::Success);
    assert_eq!(dep.traffic().arrived, 3);
    assert_eq!(retry.traffic().succeeded, 1);
}

#[test]
fn retry_fails_when_every_attempt_fails() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(0.0), None);
    let retry = Stage::builder().build(&clock, Retry::new(Rc::clone(&dep), 2));

    assert_eq!(send(&mut vclock, &retry, 0, "a").0, Response::Fail);
    assert_eq!(dep.traffic().arrived, 3);
    assert_eq!(retry.traffic().failed, 1);
}

// ============================================================================
// Timeout
// ============================================================================

#[test]
fn timeout_fires_and_orphan_completes() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(1.0), Some(500.0));
    let timeout = Stage::builder().build(&clock, Timeout::new(Rc::clone(&dep), 100));

    assert_eq!(send(&mut vclock, &timeout, 0, "a"), (Response::Fail, 100));
    assert_eq!(dep.traffic().in_flight(), 1);
    assert_eq!(dep.traffic().succeeded, 0);

    vclock.start(None);
    assert_eq!(vclock.now(), 501);
    assert_eq!(dep.traffic().succeeded, 1);
    assert_eq!(timeout.traffic().failed, 1);
}

#[test]
fn driver_run_lets_timed_out_calls_finish() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = Stage::builder().queue(QueueConfig::bounded(0, 1)).build(
        &clock,
        Dependency::new(
            AvailabilityModel::Constant(1.0),
            Some(Sampler::constant(500.0)),
            SimRng::new(5),
        ),
    );
    let timeout = Stage::builder().build(&clock, Timeout::new(Rc::clone(&dep), 50));
    let mut driver = Driver::new(DriverConfig {
        keyspace: Sampler::constant(1.0),
        arrivals: ArrivalPattern::Uniform,
        seed: 0,
    });

    let first = driver.run(&mut vclock, &timeout, 10.0, 1).unwrap();
    assert_eq!(first.fail.count, 1);
    assert_eq!(first.end_tick, 50);
    assert_eq!(dep.queue().busy_workers(), 0);
    assert_eq!(dep.traffic().in_flight(), 0);
    assert_eq!(dep.traffic().succeeded, 1);

    // the only dependency worker is free again for the next run
    let second = driver.run(&mut vclock, &timeout, 10.0, 1).unwrap();
    assert_eq!(second.fail.count, 1);
    assert_eq!(dep.traffic().arrived, 2);
    assert_eq!(dep.traffic().rejected, 0);
    assert_eq!(dep.queue().busy_workers(), 0);
}

#[test]
fn timeout_passes_fast_responses() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(1.0), Some(40.0));
    let timeout = Stage::builder().build(&clock, Timeout::new(Rc::clone(&dep), 100));

    assert_eq!(send(&mut vclock, &timeout, 0, "a"), (Response::Success, 40));
}

// ============================================================================
// Circuit breaker
// ============================================================================

#[test]
fn open_breaker_short_circuits_then_half_opens() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(0.0), None);
    let breaker = Stage::builder().queue(QueueConfig::unbounded()).build(
        &clock,
        CircuitBreaker::new(
            Rc::clone(&dep),
            CircuitBreakerConfig {
                threshold: 0.3,
                capacity: 10,
                open_ticks: 100,
                report_failures_as_success: false,
            },
        )
        .unwrap(),
    );
    let cb = breaker.circuit_breaker().unwrap();

    for id in 0..10 {
        assert_eq!(send(&mut vclock, &breaker, id, "a").0, Response::Fail);
    }
    assert_eq!(cb.state(), BreakerState::Open);
    assert_eq!(dep.traffic().arrived, 10);

    assert_eq!(send(&mut vclock, &breaker, 10, "a"), (Response::Fail, 0));
    assert_eq!(dep.traffic().arrived, 10);

    for _ in 0..100 {
        vclock.tick();
    }
    send(&mut vclock, &breaker, 11, "a");
    assert_eq!(dep.traffic().arrived, 11);
    assert_eq!(cb.state(), BreakerState::HalfOpen);
}

#[test]
fn masked_failures_report_success() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    let dep = dependency(&vclock, AvailabilityModel::Constant(0.0), None);
    let breaker = Stage::builder().build(
        &clock,
        CircuitBreaker::new(
            Rc::clone(&dep),
            CircuitBreakerConfig {
                report_failures_as_success: true,
                ..CircuitBreakerConfig::default()
            },
        )
        .unwrap(),
    );

    assert_eq!(send(&mut vclock, &breaker, 0, "a").0, Response::Success);
    assert_eq!(breaker.traffic().failed, 1);
    assert_eq!(breaker.circuit_breaker().unwrap().breaker().recorded(), 1);
}

// ============================================================================
// Composition
// ============================================================================

#[test]
fn retry_around_timeout_around_dependency() {
    let mut vclock = VirtualClock::new();
    let clock = vclock.clock();
    // every call outlasts the deadline
    let dep = Stage::builder().queue(QueueConfig::unbounded()).build(
        &clock,
        Dependency::new(
            AvailabilityModel::Constant(1.0),
            Some(Sampler::constant(30.0)),
            SimRng::new(1),
        ),
    );
    let timeout = Stage::builder()
        .queue(QueueConfig::unbounded())
        .build(&clock, Timeout::new(Rc::clone(&dep), 20));
    let retry = Stage::builder().build(&clock, Retry::new(Rc::clone(&timeout), 1));

    let (response, ticks) = send(&mut vclock, &retry, 0, "a");
    assert_eq!(response, Response::Fail);
    assert_eq!(ticks, 40);
    assert_eq!(timeout.traffic().arrived, 2);
    assert_eq!(dep.traffic().arrived, 2);
}
