//! Cross-tier integration battery: upgrade paths, the full union matrix,
//! wire-format vectors, and the zero-value counter workflow.

use std::panic::catch_unwind;

use hll_estimator::{install_defaults, Error, ExplicitThreshold, Hll, Settings, StorageType};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const UNION_SETTINGS: Settings = Settings {
    log2m: 11,
    regwidth: 5,
    explicit_threshold: ExplicitThreshold::Fixed(5),
    sparse_enabled: true,
};

const NO_SPARSE_SETTINGS: Settings = Settings {
    log2m: 11,
    regwidth: 5,
    explicit_threshold: ExplicitThreshold::Fixed(5),
    sparse_enabled: false,
};

/// Deterministic stream of distinct raw hashes.
fn hashes(seed: u64, n: usize) -> Vec<u64> {
    let mut rng = StdRng::seed_from_u64(seed);
    (0..n).map(|_| rng.gen()).collect()
}

fn counter_with(settings: Settings, values: &[u64]) -> Hll {
    let mut hll = Hll::new(settings).unwrap();
    for &value in values {
        hll.add_raw(value);
    }
    hll
}

#[test]
fn hundred_explicit_hashes_then_dense() {
    let settings = Settings {
        log2m: 10,
        regwidth: 4,
        explicit_threshold: ExplicitThreshold::Fixed(100),
        sparse_enabled: false,
    };

    let values = hashes(7, 101);
    let mut hll = counter_with(settings, &values[..100]);

    assert_eq!(StorageType::Explicit, hll.storage_type());
    assert_eq!(100, hll.cardinality());

    // One more insert promotes straight past sparse to dense.
    hll.add_raw(values[100]);
    assert_eq!(StorageType::Dense, hll.storage_type());
}

#[test]
fn upgrades_preserve_observations() {
    // The tiered path (explicit -> sparse -> dense) must land on the same
    // register state as inserting directly into a dense counter.
    let tiered_settings = Settings {
        log2m: 8,
        regwidth: 4,
        explicit_threshold: ExplicitThreshold::Auto,
        sparse_enabled: true,
    };
    let dense_settings = Settings {
        log2m: 8,
        regwidth: 4,
        explicit_threshold: ExplicitThreshold::Disabled,
        sparse_enabled: false,
    };

    let values = hashes(21, 500);
    let tiered = counter_with(tiered_settings, &values);
    let direct = counter_with(dense_settings, &values);

    assert_eq!(StorageType::Dense, tiered.storage_type());
    assert_eq!(StorageType::Dense, direct.storage_type());
    assert_eq!(direct.cardinality(), tiered.cardinality());

    // Identical register payloads; the headers differ in the cutoff byte.
    assert_eq!(direct.to_bytes()[3..], tiered.to_bytes()[3..]);
}

#[test]
fn insertion_is_idempotent_in_every_tier() {
    for n in [3usize, 40, 1200] {
        let values = hashes(33, n);
        let mut hll = counter_with(UNION_SETTINGS, &values);

        let cardinality = hll.cardinality();
        let bytes = hll.to_bytes();

        // Re-adding values already observed changes nothing.
        for &value in &values[..n.min(50)] {
            hll.add_raw(value);
        }
        assert_eq!(cardinality, hll.cardinality());
        assert_eq!(bytes, hll.to_bytes());
    }
}

struct UnionCase {
    label: &'static str,
    lhs_settings: Settings,
    lhs_n: usize,
    rhs_n: usize,
    expect: StorageType,
}

#[test]
fn union_matrix_across_all_tier_combinations() {
    // Counts are chosen against Fixed(5) explicit and the calculated 512
    // sparse threshold so each operand lands in the intended tier.
    let cases = [
        UnionCase { label: "empty with empty", lhs_settings: UNION_SETTINGS, lhs_n: 0, rhs_n: 0, expect: StorageType::Empty },
        UnionCase { label: "empty with explicit", lhs_settings: UNION_SETTINGS, lhs_n: 0, rhs_n: 1, expect: StorageType::Explicit },
        UnionCase { label: "explicit with empty", lhs_settings: UNION_SETTINGS, lhs_n: 1, rhs_n: 0, expect: StorageType::Explicit },
        UnionCase { label: "empty with sparse", lhs_settings: UNION_SETTINGS, lhs_n: 0, rhs_n: 6, expect: StorageType::Sparse },
        UnionCase { label: "sparse with empty", lhs_settings: UNION_SETTINGS, lhs_n: 6, rhs_n: 0, expect: StorageType::Sparse },
        UnionCase { label: "empty with dense", lhs_settings: UNION_SETTINGS, lhs_n: 0, rhs_n: 1000, expect: StorageType::Dense },
        UnionCase { label: "dense with empty", lhs_settings: UNION_SETTINGS, lhs_n: 1000, rhs_n: 0, expect: StorageType::Dense },
        UnionCase { label: "explicit with explicit", lhs_settings: UNION_SETTINGS, lhs_n: 2, rhs_n: 2, expect: StorageType::Explicit },
        UnionCase { label: "explicit with explicit, overflowing", lhs_settings: UNION_SETTINGS, lhs_n: 3, rhs_n: 3, expect: StorageType::Sparse },
        UnionCase { label: "explicit with sparse", lhs_settings: UNION_SETTINGS, lhs_n: 2, rhs_n: 6, expect: StorageType::Sparse },
        UnionCase { label: "sparse with explicit", lhs_settings: UNION_SETTINGS, lhs_n: 6, rhs_n: 2, expect: StorageType::Sparse },
        UnionCase { label: "explicit with dense", lhs_settings: UNION_SETTINGS, lhs_n: 2, rhs_n: 1000, expect: StorageType::Dense },
        UnionCase { label: "dense with explicit", lhs_settings: UNION_SETTINGS, lhs_n: 1000, rhs_n: 2, expect: StorageType::Dense },
        UnionCase { label: "sparse with sparse", lhs_settings: UNION_SETTINGS, lhs_n: 6, rhs_n: 6, expect: StorageType::Sparse },
        UnionCase { label: "sparse with sparse, overflowing", lhs_settings: UNION_SETTINGS, lhs_n: 450, rhs_n: 450, expect: StorageType::Dense },
        UnionCase { label: "sparse with dense", lhs_settings: UNION_SETTINGS, lhs_n: 6, rhs_n: 1000, expect: StorageType::Dense },
        UnionCase { label: "dense with sparse", lhs_settings: UNION_SETTINGS, lhs_n: 1000, rhs_n: 6, expect: StorageType::Dense },
        UnionCase { label: "dense with dense", lhs_settings: UNION_SETTINGS, lhs_n: 1000, rhs_n: 1000, expect: StorageType::Dense },
        UnionCase { label: "explicit with sparse, sparse disabled", lhs_settings: NO_SPARSE_SETTINGS, lhs_n: 1, rhs_n: 6, expect: StorageType::Dense },
        UnionCase { label: "empty with sparse, sparse disabled", lhs_settings: NO_SPARSE_SETTINGS, lhs_n: 0, rhs_n: 6, expect: StorageType::Dense },
    ];

    for (i, case) in cases.iter().enumerate() {
        // Disjoint value streams per side, distinct per case.
        let lhs_values = hashes(100 + i as u64, case.lhs_n);
        let rhs_values = hashes(200 + i as u64, case.rhs_n);

        let mut lhs = counter_with(case.lhs_settings, &lhs_values);
        let rhs = counter_with(UNION_SETTINGS, &rhs_values);
        let rhs_snapshot = rhs.clone();

        lhs.strict_union(&rhs).unwrap();

        assert_eq!(case.expect, lhs.storage_type(), "{}", case.label);

        // The merged counter matches one that saw every value directly.
        let mut all_values = lhs_values.clone();
        all_values.extend_from_slice(&rhs_values);
        let reference = counter_with(case.lhs_settings, &all_values);
        assert_eq!(reference, lhs, "{}", case.label);
        assert_eq!(reference.cardinality(), lhs.cardinality(), "{}", case.label);

        // The other operand is never mutated.
        assert_eq!(rhs_snapshot, rhs, "{}", case.label);

        // Nor is it affected by later growth of the union target.
        lhs.add_raw(hashes(300 + i as u64, 1)[0]);
        assert_eq!(rhs_snapshot, rhs, "{}", case.label);
    }
}

#[test]
fn union_with_empty_is_identity() {
    let values = hashes(55, 700);
    let counter = counter_with(UNION_SETTINGS, &values);

    // Empty into populated.
    let mut lhs = counter.clone();
    lhs.strict_union(&Hll::new(UNION_SETTINGS).unwrap()).unwrap();
    assert_eq!(counter.to_bytes(), lhs.to_bytes());

    // Populated into empty yields a bytewise-equal counter.
    let mut empty = Hll::new(UNION_SETTINGS).unwrap();
    empty.strict_union(&counter).unwrap();
    assert_eq!(counter.to_bytes(), empty.to_bytes());
}

#[test]
fn dense_union_is_commutative() {
    let a_values = hashes(81, 1500);
    let b_values = hashes(82, 1500);

    let a = counter_with(UNION_SETTINGS, &a_values);
    let b = counter_with(UNION_SETTINGS, &b_values);
    assert_eq!(StorageType::Dense, a.storage_type());
    assert_eq!(StorageType::Dense, b.storage_type());

    let mut ab = a.clone();
    ab.strict_union(&b).unwrap();
    let mut ba = b.clone();
    ba.strict_union(&a).unwrap();

    assert_eq!(ab.to_bytes(), ba.to_bytes());
}

#[test]
fn round_trips_preserve_counter_state() {
    let shapes = [
        Settings {
            log2m: 11,
            regwidth: 5,
            explicit_threshold: ExplicitThreshold::Auto,
            sparse_enabled: true,
        },
        Settings {
            log2m: 11,
            regwidth: 5,
            explicit_threshold: ExplicitThreshold::Fixed(128),
            sparse_enabled: true,
        },
        Settings {
            log2m: 10,
            regwidth: 4,
            explicit_threshold: ExplicitThreshold::Disabled,
            sparse_enabled: true,
        },
        Settings {
            log2m: 10,
            regwidth: 4,
            explicit_threshold: ExplicitThreshold::Disabled,
            sparse_enabled: false,
        },
        // regwidth 8 stresses the widest registers; log2m 4 with regwidth 3
        // stresses the trailing-byte dense payload.
        Settings {
            log2m: 12,
            regwidth: 8,
            explicit_threshold: ExplicitThreshold::Auto,
            sparse_enabled: true,
        },
        Settings {
            log2m: 4,
            regwidth: 3,
            explicit_threshold: ExplicitThreshold::Disabled,
            sparse_enabled: false,
        },
    ];

    for (i, settings) in shapes.into_iter().enumerate() {
        for n in [0usize, 1, 50, 600, 3000] {
            let hll = counter_with(settings, &hashes(1000 + i as u64, n));
            let restored = Hll::from_bytes(&hll.to_bytes()).unwrap();
            assert_eq!(hll, restored, "settings {settings:?}, n = {n}");
            assert_eq!(hll.to_bytes(), restored.to_bytes());
        }
    }
}

#[test]
fn adding_zero_is_invisible() {
    for n in [0usize, 3, 40, 1200] {
        let mut hll = counter_with(UNION_SETTINGS, &hashes(4, n));
        let cardinality = hll.cardinality();
        let bytes = hll.to_bytes();

        hll.add_raw(0);

        assert_eq!(cardinality, hll.cardinality());
        assert_eq!(bytes, hll.to_bytes());
    }
}

#[test]
fn strict_union_rejects_incompatible_counters() {
    let mut a = counter_with(UNION_SETTINGS, &hashes(9, 10));
    let b = counter_with(
        Settings {
            log2m: 12,
            ..UNION_SETTINGS
        },
        &hashes(10, 10),
    );

    assert_eq!(Err(Error::Incompatible), a.strict_union(&b));
}

fn assert_panics_uninitialized(op: impl FnOnce() + std::panic::UnwindSafe) {
    let payload = catch_unwind(op).expect_err("operation should panic without defaults");
    let message = payload
        .downcast_ref::<String>()
        .cloned()
        .or_else(|| payload.downcast_ref::<&str>().map(ToString::to_string))
        .unwrap_or_default();
    assert!(
        message.contains("without default settings"),
        "unexpected panic message: {message}"
    );
}

// The one test touching the process-wide defaults registry. Everything has
// to happen inside a single function: the registry is install-once and the
// test harness runs functions concurrently.
#[test]
fn zero_value_counters_follow_installed_defaults() {
    // Every operation on a zero-value counter is a coding error while no
    // defaults are installed.
    assert_panics_uninitialized(|| {
        Hll::default().add_raw(1);
    });
    assert_panics_uninitialized(|| {
        Hll::default().cardinality();
    });
    assert_panics_uninitialized(|| {
        Hll::default().settings();
    });
    assert_panics_uninitialized(|| {
        Hll::default().to_bytes();
    });
    assert_panics_uninitialized(|| {
        Hll::default().clear();
    });
    assert_panics_uninitialized(|| {
        let mut hll = Hll::default();
        hll.union(&Hll::default());
    });
    assert_panics_uninitialized(|| {
        let mut hll = Hll::default();
        let _ = hll.strict_union(&Hll::default());
    });

    let defaults = Settings {
        log2m: 31,
        regwidth: 6,
        explicit_threshold: ExplicitThreshold::Auto,
        sparse_enabled: true,
    };
    install_defaults(defaults).unwrap();

    // An empty zero-value counter serializes to exactly these three header
    // bytes under the defaults above.
    assert_eq!(vec![0x11, 0xbf, 0x7f], Hll::default().to_bytes());

    assert_eq!(0, Hll::default().cardinality());
    assert_eq!(defaults, Hll::default().settings());

    let mut hll = Hll::default();
    hll.add_raw(1);
    assert_eq!(1, hll.cardinality());
    assert_eq!(StorageType::Explicit, hll.storage_type());
    hll.clear();
    assert_eq!(0, hll.cardinality());

    let mut hll = Hll::default();
    hll.union(&Hll::default());
    assert_eq!(0, hll.cardinality());

    // Round trip of the empty wire vector.
    let restored = Hll::from_bytes(&[0x11, 0xbf, 0x7f]).unwrap();
    assert_eq!(defaults, restored.settings());
    assert_eq!(StorageType::Empty, restored.storage_type());

    // Reinstalling identical settings is idempotent; different settings
    // conflict.
    install_defaults(defaults).unwrap();
    assert_eq!(
        Err(Error::DefaultsConflict),
        install_defaults(Settings {
            regwidth: 5,
            ..defaults
        })
    );
}
