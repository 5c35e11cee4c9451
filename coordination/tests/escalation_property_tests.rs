//! Escalation property tests: deterministic pseudo-random failure sequences
//! checked against the ladder invariants.
//!
//! Tests verify:
//! - Tier never decreases and never leaves the ladder
//! - Every promotion moves exactly one rung
//! - Three similar same-kind failures promote (or fail at the top)
//! - Reserved cost never reaches the ceiling before a call is granted
//! - The $5.00 ceiling scenario aborts with no further calls

use coordination::{
    BackendDescriptor, ErrorClassifier, ErrorKind, ErrorLog, ErrorRecord, EscalationEngine,
    LadderStatus, Reservation, TerminalReason, Transition,
};

/// Small deterministic generator (LCG) so failures are reproducible.
struct Lcg(u64);

impl Lcg {
    fn next(&mut self) -> u64 {
        self.0 = self
            .0
            .wrapping_mul(6364136223846793005)
            .wrapping_add(1442695040888963407);
        self.0 >> 33
    }

    fn pick<'a, T>(&mut self, items: &'a [T]) -> &'a T {
        &items[(self.next() as usize) % items.len()]
    }
}

fn ladder() -> Vec<BackendDescriptor> {
    vec![
        BackendDescriptor::new("fast", "claude-haiku", 0.50),
        BackendDescriptor::new("balanced", "claude-sonnet", 1.00),
        BackendDescriptor::new("deep", "claude-opus", 2.00),
    ]
}

const FAILURES: [(&str, ErrorKind); 6] = [
    ("SyntaxError: invalid syntax", ErrorKind::Syntax),
    ("Insufficient credits for project", ErrorKind::Api),
    ("NameError: name 'algo' is not defined", ErrorKind::Logic),
    ("backtest timed out", ErrorKind::Timeout),
    ("Connection refused", ErrorKind::Resource),
    ("something odd happened", ErrorKind::Unknown),
];

// ── Property: tier is monotone and stays on the ladder ─────────────

#[test]
fn prop_tier_monotone_over_random_sequences() {
    let engine = EscalationEngine::new(ladder()).unwrap();

    for seed in 0..200u64 {
        let mut rng = Lcg(seed);
        let mut state = engine.initial_state(f64::MAX);
        let mut last_tier = 0;

        for iteration in 1..=60u32 {
            // Bias toward repeats so promotions actually happen.
            let (message, kind) = if rng.next() % 3 == 0 {
                *rng.pick(&FAILURES)
            } else {
                FAILURES[(seed as usize) % FAILURES.len()]
            };
            let record = ErrorRecord::new(message, kind, iteration);
            let transition = engine.record_failure(&mut state, &record);

            if let Transition::Promote { from, to, .. } = transition {
                assert_eq!(to, from + 1, "seed {seed}: promotion skipped a rung");
            }
            assert!(state.tier >= last_tier, "seed {seed}: tier decreased");
            assert!(state.tier < state.tier_count, "seed {seed}: tier out of range");
            last_tier = state.tier;

            if !state.is_active() {
                break;
            }
        }
    }
}

// ── Property: three similar same-kind failures promote ─────────────

#[test]
fn prop_three_similar_failures_promote_exactly_one() {
    let engine = EscalationEngine::new(ladder()).unwrap();

    for (message, kind) in FAILURES.iter().filter(|(_, k)| k.is_known()) {
        let mut state = engine.initial_state(f64::MAX);
        for i in 1..=3 {
            engine.record_failure(&mut state, &ErrorRecord::new(format!("{message} #{i}"), *kind, i));
        }
        assert_eq!(state.tier, 1, "kind {kind}");

        for i in 4..=6 {
            engine.record_failure(&mut state, &ErrorRecord::new(*message, *kind, i));
        }
        assert_eq!(state.tier, 2, "kind {kind}");

        // At the top the next three fail the ladder instead of promoting.
        for i in 7..=9 {
            engine.record_failure(&mut state, &ErrorRecord::new(*message, *kind, i));
        }
        assert_eq!(state.tier, 2);
        assert!(matches!(
            state.status,
            LadderStatus::Failed(TerminalReason::TopTierExhausted { .. })
        ));
    }
}

#[test]
fn prop_interleaved_kinds_never_promote() {
    let engine = EscalationEngine::new(ladder()).unwrap();
    let mut state = engine.initial_state(f64::MAX);
    for i in 0..30u32 {
        let (message, kind) = FAILURES[(i as usize) % 2];
        engine.record_failure(&mut state, &ErrorRecord::new(message, kind, i));
    }
    assert_eq!(state.tier, 0);
}

// ── Property: granted reservations stay below the ceiling ──────────

#[test]
fn prop_reservations_respect_ceiling() {
    let engine = EscalationEngine::new(ladder()).unwrap();

    for seed in 0..100u64 {
        let mut rng = Lcg(seed);
        let ceiling = 1.0 + (rng.next() % 2000) as f64 / 100.0;
        let mut state = engine.initial_state(ceiling);

        while state.is_active() {
            match engine.reserve(&mut state) {
                Reservation::Granted { estimate, .. } => {
                    assert!(state.total_cost < ceiling, "seed {seed}");
                    let actual = estimate * (rng.next() % 150) as f64 / 100.0;
                    engine.settle(&mut state, estimate, Some(actual));
                }
                Reservation::Denied(reason) => {
                    assert!(matches!(reason, TerminalReason::CostCeiling { .. }));
                    break;
                }
            }
        }
        assert!(matches!(
            state.status,
            LadderStatus::Aborted(TerminalReason::CostCeiling { .. })
        ));
    }
}

// ── Scenario: $5.00 ceiling ────────────────────────────────────────

#[test]
fn scenario_cost_ceiling_aborts_after_settlement() {
    let engine = EscalationEngine::new(ladder()).unwrap();
    let classifier = ErrorClassifier::new();
    let mut log = ErrorLog::new();
    let mut state = engine.initial_state(5.00);
    let mut calls = 0;

    // (actual cost reported by the agent, tier expected before the call)
    let script = [
        (0.50, 0),
        (0.50, 0),
        (0.50, 0),
        (1.00, 1),
        (1.00, 1),
        (1.60, 1),
    ];

    for (iteration, (actual, expected_tier)) in script.iter().enumerate() {
        let iteration = iteration as u32 + 1;
        let Reservation::Granted { tier, estimate, .. } = engine.reserve(&mut state) else {
            panic!("iteration {iteration}: reservation denied early");
        };
        assert_eq!(tier, *expected_tier);
        calls += 1;

        let message = "API error: insufficient credits for organization";
        let kind = classifier.classify(message, &log);
        assert_eq!(kind, ErrorKind::Api);
        let record = ErrorRecord::new(message, kind, iteration);
        log.append(record.clone()).unwrap();

        if engine.settle(&mut state, estimate, Some(*actual)).is_some() {
            break;
        }
        engine.record_failure(&mut state, &record);
    }

    assert!((state.total_cost - 5.10).abs() < 1e-9, "cost {}", state.total_cost);
    assert_eq!(calls, 6);
    assert_eq!(state.tier, 1);
    assert_eq!(log.len(), 6);
    assert!(matches!(
        state.status,
        LadderStatus::Aborted(TerminalReason::CostCeiling { .. })
    ));
    assert!(matches!(engine.reserve(&mut state), Reservation::Denied(_)));
}
