//! Historical reads and diffs over a scripted feed
//!
//! The script is ingested with a flush every two records, so delta layer `n`
//! holds sequences `2n-1` and `2n` and gets layer id `n`.

use std::collections::BTreeMap;

use seqvault::layer::LayerId;
use seqvault::{
    CancelToken, ChangeKind, ChangeRecord, Engine, EngineConfig, Sequence, SequenceRange, VaultError,
};
use tempfile::TempDir;

// =============================================================================
// Test Utilities
// =============================================================================

const SCRIPT: &[(&str, u64, Option<&str>)] = &[
    ("a", 1, Some("x")),
    ("b", 2, Some("y")),
    ("a", 3, Some("z")),
    ("a", 4, Some("x")),
    ("c", 5, Some("1")),
    ("b", 6, None),
    ("d", 7, Some("1")),
    ("c", 8, Some("2")),
];

const KEYS: &[&str] = &["a", "b", "c", "d", "missing"];

fn test_config(dir: &TempDir) -> EngineConfig {
    let mut config = EngineConfig::new(dir.path());
    config.flush_threshold_records = 2;
    config.compaction_trigger_layers = 1000;
    config.compaction_min_tombstones = 1_000_000;
    config.image_interval_sequences = 1_000_000;
    config.reclamation_grace_secs = 0;
    config
}

fn record(key: &str, sequence: u64, value: Option<&str>) -> ChangeRecord {
    match value {
        Some(value) => ChangeRecord::put(key, sequence, value),
        None => ChangeRecord::delete(key, sequence),
    }
}

fn scripted_engine(config: EngineConfig) -> Engine {
    let engine = Engine::open(config).unwrap();
    for (key, sequence, value) in SCRIPT {
        engine.ingest(record(key, *sequence, *value)).unwrap();
    }
    engine
}

/// State at `at`, computed directly from the script.
fn model(at: u64) -> BTreeMap<Vec<u8>, Vec<u8>> {
    let mut state = BTreeMap::new();
    for (key, _, value) in SCRIPT.iter().filter(|(_, s, _)| *s <= at) {
        match value {
            Some(value) => {
                state.insert(key.as_bytes().to_vec(), value.as_bytes().to_vec());
            }
            None => {
                state.remove(key.as_bytes());
            }
        }
    }
    state
}

fn seq(value: u64) -> Sequence {
    Sequence::new(value)
}

fn ids(values: &[u64]) -> Vec<LayerId> {
    values.iter().map(|v| LayerId::new(*v)).collect()
}

fn assert_matches_model(engine: &Engine, upto: u64) {
    for at in 1..=upto {
        let expected = model(at);
        for key in KEYS {
            assert_eq!(
                engine.read_at(key.as_bytes(), seq(at)).unwrap(),
                expected.get(key.as_bytes()).cloned(),
                "read_at({key}, {at})"
            );
        }
        let state = engine
            .reconstruct_state(seq(at), None, &CancelToken::new())
            .unwrap();
        assert_eq!(state, expected, "reconstruct_state({at})");
    }
}

// =============================================================================
// Point-in-time reads
// =============================================================================

#[test]
fn test_read_at_follows_history() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    assert_eq!(engine.watermark().unwrap(), seq(8));
    assert_eq!(engine.read_at(b"a", seq(0)).unwrap(), None);
    assert_eq!(engine.read_at(b"a", seq(2)).unwrap(), Some(b"x".to_vec()));
    assert_eq!(engine.read_at(b"a", seq(3)).unwrap(), Some(b"z".to_vec()));
    assert_eq!(engine.read_at(b"b", seq(5)).unwrap(), Some(b"y".to_vec()));
    assert_eq!(engine.read_at(b"b", seq(6)).unwrap(), None);
    assert_eq!(engine.read_at(b"c", seq(4)).unwrap(), None);
}

#[test]
fn test_reads_agree_with_model_at_every_sequence() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));
    assert_matches_model(&engine, 8);
}

#[test]
fn test_reads_agree_after_compaction_and_image() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.compaction_max_inputs = 2;
    let engine = scripted_engine(config);

    engine.compact().unwrap().unwrap();
    let image = engine.create_image().unwrap().unwrap();
    assert_eq!(image.sequence, seq(8));
    assert_eq!(image.key_count, 3);
    assert_matches_model(&engine, 8);

    // One more record stays in the write buffer
    engine.ingest(ChangeRecord::put("a", 9, "w")).unwrap();
    assert_eq!(engine.stats().unwrap().buffered_records, 1);
    let state = engine
        .reconstruct_state(seq(9), None, &CancelToken::new())
        .unwrap();
    assert_eq!(state.get(b"a".as_slice()), Some(&b"w".to_vec()));
    assert_eq!(state.len(), 3);
    assert_eq!(engine.read_at(b"a", seq(8)).unwrap(), Some(b"x".to_vec()));
}

#[test]
fn test_reconstruct_state_with_prefix() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let state = engine
        .reconstruct_state(seq(8), Some(b"c"), &CancelToken::new())
        .unwrap();
    assert_eq!(state.len(), 1);
    assert_eq!(state.get(b"c".as_slice()), Some(&b"2".to_vec()));
}

#[test]
fn test_reconstruct_state_ahead_of_watermark() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let err = engine
        .reconstruct_state(seq(9), None, &CancelToken::new())
        .unwrap_err();
    assert!(matches!(err, VaultError::InvalidRange { .. }));
}

#[test]
fn test_out_of_order_record_rejected() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let err = engine.ingest(ChangeRecord::put("z", 8, "late")).unwrap_err();
    assert_eq!(err.code(), "VAULT_SEQUENCE_OUT_OF_ORDER");
    assert_eq!(engine.watermark().unwrap(), seq(8));
    assert_eq!(engine.read_at(b"z", seq(8)).unwrap(), None);
    assert_eq!(engine.metrics().records_rejected, 1);
}

// =============================================================================
// Diffs
// =============================================================================

#[test]
fn test_diff_splits_layers_by_coverage() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let report = engine.diff(seq(2), seq(6), None).unwrap();
    assert_eq!(report.same_files, ids(&[1]));
    assert_eq!(report.files, ids(&[2, 3]));

    let kinds: Vec<(&[u8], ChangeKind)> = report
        .entries
        .iter()
        .map(|e| (e.key.as_slice(), e.kind))
        .collect();
    assert_eq!(
        kinds,
        vec![
            (b"a".as_slice(), ChangeKind::Reverted),
            (b"b".as_slice(), ChangeKind::Deleted),
            (b"c".as_slice(), ChangeKind::Created),
        ]
    );
}

#[test]
fn test_diff_classifies_changes() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let report = engine.diff(seq(5), seq(8), None).unwrap();
    let c = report.entries.iter().find(|e| e.key == b"c").unwrap();
    assert_eq!(c.kind, ChangeKind::Modified);
    assert_eq!(c.before.as_deref(), Some(b"1".as_slice()));
    assert_eq!(c.after.as_deref(), Some(b"2".as_slice()));

    let d = report.entries.iter().find(|e| e.key == b"d").unwrap();
    assert_eq!(d.kind, ChangeKind::Created);
    assert_eq!(d.before, None);

    assert!(report.entries.iter().all(|e| e.key != b"a"));
}

#[test]
fn test_diff_same_sequence_is_empty() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    for at in [0, 4, 8] {
        let report = engine.diff(seq(at), seq(at), None).unwrap();
        assert!(report.entries.is_empty());
        assert!(report.files.is_empty());
    }
}

#[test]
fn test_diff_grows_with_upper_bound() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let mut previous = 0;
    for to in 1..=8 {
        let count = engine.diff(seq(1), seq(to), None).unwrap().entries.len();
        assert!(count >= previous, "diff(1, {to}) shrank to {count}");
        previous = count;
    }
    assert_eq!(previous, 4);
}

#[test]
fn test_diff_with_prefix() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let report = engine.diff(seq(0), seq(8), Some(b"c")).unwrap();
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].key, b"c".to_vec());
    assert_eq!(report.entries[0].kind, ChangeKind::Created);
}

#[test]
fn test_diff_includes_buffered_records() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));
    engine.ingest(ChangeRecord::put("e", 9, "1")).unwrap();

    let report = engine.diff(seq(8), seq(9), None).unwrap();
    assert!(report.files.is_empty());
    assert_eq!(report.entries.len(), 1);
    assert_eq!(report.entries[0].key, b"e".to_vec());
}

#[test]
fn test_diff_rejects_invalid_ranges() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let err = engine.diff(seq(6), seq(2), None).unwrap_err();
    assert_eq!(err.code(), "VAULT_INVALID_RANGE");
    let err = engine.diff(seq(2), seq(9), None).unwrap_err();
    assert_eq!(err.code(), "VAULT_INVALID_RANGE");
}

#[test]
fn test_diff_cancelled() {
    let dir = TempDir::new().unwrap();
    let engine = scripted_engine(test_config(&dir));

    let cancel = CancelToken::new();
    cancel.cancel();
    let err = engine
        .diff_with_cancel(seq(2), seq(8), None, &cancel)
        .unwrap_err();
    assert!(matches!(err, VaultError::Cancelled));
    assert_eq!(engine.metrics().diffs_cancelled, 1);
    assert_eq!(engine.metrics().diffs, 0);
}

#[test]
fn test_diff_across_compaction_lineage() {
    let dir = TempDir::new().unwrap();
    let mut config = test_config(&dir);
    config.compaction_max_inputs = 2;
    let engine = scripted_engine(config);

    let before: Vec<_> = [(2, 8), (4, 8), (1, 6)]
        .iter()
        .map(|(a, b)| engine.diff(seq(*a), seq(*b), None).unwrap().entries)
        .collect();

    // Layers 1 and 2 merge into layer 5, visible from watermark 8
    let report = engine.compact().unwrap().unwrap();
    assert_eq!(report.inputs.len(), 2);
    assert_eq!(report.outputs.len(), 1);
    assert_eq!(report.range, SequenceRange::new(seq(1), seq(5)));
    assert_eq!(report.records_dropped, 0);

    engine.ingest(ChangeRecord::put("e", 9, "1")).unwrap();
    engine.ingest(ChangeRecord::put("a", 10, "q")).unwrap();

    let stats = engine.stats().unwrap();
    assert_eq!(stats.current_layers, 4);
    assert_eq!(stats.delta_layers, 6);

    let report = engine.diff(seq(8), seq(10), None).unwrap();
    assert_eq!(report.same_files, ids(&[3, 4, 5]));
    assert_eq!(report.files, ids(&[6]));

    let report = engine.diff(seq(6), seq(10), None).unwrap();
    assert_eq!(report.same_files, ids(&[3, 5]));
    assert_eq!(report.files, ids(&[4, 6]));

    let report = engine.diff(seq(2), seq(10), None).unwrap();
    assert!(report.same_files.is_empty());
    assert_eq!(report.files, ids(&[3, 4, 5, 6]));

    let after: Vec<_> = [(2, 8), (4, 8), (1, 6)]
        .iter()
        .map(|(a, b)| engine.diff(seq(*a), seq(*b), None).unwrap().entries)
        .collect();
    assert_eq!(before, after);
}
