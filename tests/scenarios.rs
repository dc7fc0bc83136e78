//! Literal end-to-end scenarios against the public engine API, plus property tests for the
//! partition-invariance and spill-threshold-invariance laws.

use std::ops::ControlFlow;
use std::path::{Path, PathBuf};

use flowbin::field::{CustomField, FieldKind, FieldList, FlowRecord};
use flowbin::presorted::{PresortedEngine, RecordCodec};
use flowbin::unsorted::UnsortedEngine;

#[derive(Debug, Clone, Copy, Default)]
struct Flow {
    protocol: u8,
    packets: u64,
    src_v4: [u8; 4],
    dst_v4: [u8; 4],
    src_port: u16,
    custom: u32,
}

impl FlowRecord for Flow {
    fn protocol(&self) -> u8 {
        self.protocol
    }
    fn packets(&self) -> u64 {
        self.packets
    }
    fn src_addr_v4(&self) -> [u8; 4] {
        self.src_v4
    }
    fn dst_addr_v4(&self) -> [u8; 4] {
        self.dst_v4
    }
    fn src_port(&self) -> u16 {
        self.src_port
    }
}

fn by_protocol_sum_packets() -> (FieldList<Flow>, FieldList<Flow>, FieldList<Flow>) {
    let mut keys: FieldList<Flow> = FieldList::keys();
    keys.add_known(FieldKind::Protocol).unwrap();
    let mut values: FieldList<Flow> = FieldList::values();
    values.add_known(FieldKind::SumPackets).unwrap();
    let distinct: FieldList<Flow> = FieldList::keys();
    (keys, values, distinct)
}

/// S1: unsorted-output preserves first-seen key order; sorted-output orders ascending. Both
/// agree on the summed value per key.
#[test]
fn s1_sums_packets_per_protocol_in_both_output_orders() {
    let records = [(6u8, 10u64), (17, 2), (6, 5), (17, 3), (6, 1)];

    for sorted in [false, true] {
        let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
        engine.set_sorted_output(sorted).unwrap();
        let (keys, values, distinct) = by_protocol_sum_packets();
        engine.prepare_for_input(keys, values, distinct, vec![]).unwrap();

        for (protocol, packets) in records {
            engine.add_record(&Flow { protocol, packets, ..Default::default() }).unwrap();
        }
        engine.prepare_for_output().unwrap();

        let mut rows = Vec::new();
        while let Some(row) = engine.next().unwrap() {
            let total = u64::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
            rows.push((row.key.as_bytes()[0], total));
        }
        assert_eq!(rows, vec![(6, 16), (17, 5)], "sorted={sorted}");
    }
}

/// S2: distinct counting per key, with sorted output ordering keys by raw source-address bytes.
#[test]
fn s2_counts_distinct_destinations_per_source() {
    let addr_a = [1, 0, 0, 0];
    let addr_b = [2, 0, 0, 0];
    let addr_x = [10, 0, 0, 0];
    let addr_y = [20, 0, 0, 0];
    let addr_z = [30, 0, 0, 0];

    let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
    let mut keys: FieldList<Flow> = FieldList::keys();
    keys.add_known(FieldKind::SrcAddrV4).unwrap();
    let values: FieldList<Flow> = FieldList::values();
    let mut distinct: FieldList<Flow> = FieldList::keys();
    let handle = distinct.add_known(FieldKind::DstAddrV4).unwrap();

    engine.prepare_for_input(keys, values, distinct, vec![handle]).unwrap();

    for (src, dst) in [(addr_a, addr_x), (addr_a, addr_y), (addr_a, addr_x), (addr_b, addr_z)] {
        engine.add_record(&Flow { src_v4: src, dst_v4: dst, ..Default::default() }).unwrap();
    }
    engine.prepare_for_output().unwrap();

    let mut rows = Vec::new();
    while let Some(row) = engine.next().unwrap() {
        rows.push((row.key.as_bytes().to_vec(), row.distincts[0].len()));
    }
    assert_eq!(rows, vec![(addr_a.to_vec(), 2), (addr_b.to_vec(), 1)]);
}

/// S3: a tiny memory budget forces repeated spilling; the merged output must still match an
/// unbudgeted reference run over the same input, bin-for-bin.
#[test]
fn s3_spilled_output_matches_unbudgeted_reference() {
    const NUM_RECORDS: u32 = 10_000;
    const NUM_KEYS: u32 = 2_500;

    let make_record = |i: u32| Flow {
        src_port: (i % NUM_KEYS) as u16,
        packets: 1,
        dst_v4: (i % 7_500).to_ne_bytes(),
        ..Default::default()
    };

    let reference = {
        let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
        let mut keys: FieldList<Flow> = FieldList::keys();
        keys.add_known(FieldKind::SrcPort).unwrap();
        let mut values: FieldList<Flow> = FieldList::values();
        values.add_known(FieldKind::SumPackets).unwrap();
        let mut distinct: FieldList<Flow> = FieldList::keys();
        let handle = distinct.add_known(FieldKind::DstAddrV4).unwrap();
        engine.prepare_for_input(keys, values, distinct, vec![handle]).unwrap();

        for i in 0..NUM_RECORDS {
            engine.add_record(&make_record(i)).unwrap();
        }
        engine.prepare_for_output().unwrap();

        let mut rows = Vec::new();
        while let Some(row) = engine.next().unwrap() {
            let total = u64::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
            rows.push((row.key.as_bytes().to_vec(), total, row.distincts[0].len()));
        }
        rows
    };
    assert_eq!(reference.len(), NUM_KEYS as usize);

    let dir = tempfile::tempdir().unwrap();
    let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
    engine.set_temp_directory(dir.path().to_path_buf()).unwrap();
    engine.set_memory_budget(2_000).unwrap();

    let mut keys: FieldList<Flow> = FieldList::keys();
    keys.add_known(FieldKind::SrcPort).unwrap();
    let mut values: FieldList<Flow> = FieldList::values();
    values.add_known(FieldKind::SumPackets).unwrap();
    let mut distinct: FieldList<Flow> = FieldList::keys();
    let handle = distinct.add_known(FieldKind::DstAddrV4).unwrap();
    engine.prepare_for_input(keys, values, distinct, vec![handle]).unwrap();

    for i in 0..NUM_RECORDS {
        engine.add_record(&make_record(i)).unwrap();
    }
    engine.prepare_for_output().unwrap();

    let mut rows = Vec::new();
    while let Some(row) = engine.next().unwrap() {
        let total = u64::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
        rows.push((row.key.as_bytes().to_vec(), total, row.distincts[0].len()));
    }

    assert_eq!(rows.len(), NUM_KEYS as usize);
    assert_eq!(rows, reference);
}

#[derive(Debug)]
struct PresortedRec {
    key: u16,
}

impl FlowRecord for PresortedRec {
    fn src_port(&self) -> u16 {
        self.key
    }
}

impl RecordCodec for PresortedRec {
    fn decode(reader: &mut dyn std::io::BufRead) -> std::io::Result<Option<Self>> {
        let mut line = String::new();
        let n = reader.read_line(&mut line)?;
        if n == 0 {
            return Ok(None);
        }
        Ok(Some(PresortedRec {
            key: line.trim().parse().unwrap(),
        }))
    }
}

fn write_lines(dir: &Path, name: &str, lines: &[&str]) -> PathBuf {
    use std::io::Write;
    let path = dir.join(name);
    let mut file = std::fs::File::create(&path).unwrap();
    for line in lines {
        writeln!(file, "{line}").unwrap();
    }
    path
}

/// S4: presorted merge across two already key-sorted inputs, counting contributions per key via
/// a record-count value field.
#[test]
fn s4_merges_presorted_inputs_counting_contributions() {
    let dir = tempfile::tempdir().unwrap();
    let file1 = write_lines(dir.path(), "file1", &["1", "1", "2"]);
    let file2 = write_lines(dir.path(), "file2", &["1", "3"]);

    let mut engine: PresortedEngine<PresortedRec> = PresortedEngine::new();
    engine.add_input(file1).unwrap();
    engine.add_input(file2).unwrap();

    let mut keys: FieldList<PresortedRec> = FieldList::keys();
    keys.add_known(FieldKind::SrcPort).unwrap();
    let mut values: FieldList<PresortedRec> = FieldList::values();
    values.add_known(FieldKind::SumRecords).unwrap();
    let distinct: FieldList<PresortedRec> = FieldList::keys();

    engine.prepare_for_input(keys, values, distinct, vec![]).unwrap();

    let mut rows = Vec::new();
    engine
        .process(|row| {
            let key = u16::from_ne_bytes(row.key.as_bytes().try_into().unwrap());
            let contributions = u64::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
            rows.push((key, contributions));
            Ok(ControlFlow::Continue(()))
        })
        .unwrap();

    assert_eq!(rows, vec![(1, 4), (2, 1), (3, 1)]);
}

/// S5: a narrower-than-native sum field saturates at its own width's maximum, not at u64::MAX.
#[test]
fn s5_narrow_custom_sum_saturates_at_its_own_width() {
    let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
    let keys: FieldList<Flow> = FieldList::keys();
    let mut values: FieldList<Flow> = FieldList::values();
    values
        .add_custom(
            0,
            CustomField {
                width: 4,
                initial: vec![0u8; 4],
                extract: Box::new(|record: &Flow, out: &mut [u8]| out.copy_from_slice(&record.custom.to_ne_bytes())),
                compare: Box::new(|a, b| a.cmp(b)),
                merge: Box::new(|acc, incoming| {
                    let a = u32::from_ne_bytes(acc.try_into().unwrap());
                    let b = u32::from_ne_bytes(incoming.try_into().unwrap());
                    acc.copy_from_slice(&a.saturating_add(b).to_ne_bytes());
                }),
            },
        )
        .unwrap();
    let distinct: FieldList<Flow> = FieldList::keys();

    engine.prepare_for_input(keys, values, distinct, vec![]).unwrap();
    engine.add_record(&Flow { custom: 0xFFFF_FFF0, ..Default::default() }).unwrap();
    engine.add_record(&Flow { custom: 0x20, ..Default::default() }).unwrap();
    engine.prepare_for_output().unwrap();

    let row = engine.next().unwrap().unwrap();
    let total = u32::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
    assert_eq!(total, 0xFFFF_FFFF);
    assert!(engine.next().unwrap().is_none());
}

/// S6: an early-stop signal from a Presorted callback ends the merge without error and without
/// a third emission; the temp directory is left with no stray files afterward.
#[test]
fn s6_presorted_cancellation_is_not_an_error_and_leaks_no_files() {
    let dir = tempfile::tempdir().unwrap();
    let file1 = write_lines(dir.path(), "f1", &["1", "2", "3"]);

    {
        let mut engine: PresortedEngine<PresortedRec> = PresortedEngine::new();
        engine.add_input(file1).unwrap();

        let mut keys: FieldList<PresortedRec> = FieldList::keys();
        keys.add_known(FieldKind::SrcPort).unwrap();
        let mut values: FieldList<PresortedRec> = FieldList::values();
        values.add_known(FieldKind::SumRecords).unwrap();
        let distinct: FieldList<PresortedRec> = FieldList::keys();
        engine.prepare_for_input(keys, values, distinct, vec![]).unwrap();

        let mut emitted = 0;
        let result = engine.process(|_row| {
            emitted += 1;
            if emitted == 2 {
                Ok(ControlFlow::Break(()))
            } else {
                Ok(ControlFlow::Continue(()))
            }
        });

        assert!(result.is_ok());
        assert_eq!(emitted, 2);
    }

    let leftover: Vec<_> = std::fs::read_dir(dir.path())
        .unwrap()
        .map(|entry| entry.unwrap().file_name())
        .filter(|name| name.to_string_lossy().starts_with("flowbin-"))
        .collect();
    assert!(leftover.is_empty());
}

mod properties {
    use super::*;
    use proptest::prelude::*;

    fn run_unsorted(records: &[(u8, u64)], memory_budget: Option<usize>, temp_dir: Option<PathBuf>) -> Vec<(u8, u64)> {
        let mut engine: UnsortedEngine<Flow> = UnsortedEngine::new();
        if let Some(dir) = temp_dir {
            engine.set_temp_directory(dir).unwrap();
        }
        if let Some(budget) = memory_budget {
            engine.set_memory_budget(budget).unwrap();
        }
        let (keys, values, distinct) = by_protocol_sum_packets();
        engine.prepare_for_input(keys, values, distinct, vec![]).unwrap();

        for &(protocol, packets) in records {
            engine.add_record(&Flow { protocol, packets, ..Default::default() }).unwrap();
        }
        engine.prepare_for_output().unwrap();

        let mut rows = Vec::new();
        while let Some(row) = engine.next().unwrap() {
            let total = u64::from_ne_bytes(row.value.as_bytes().try_into().unwrap());
            rows.push((row.key.as_bytes()[0], total));
        }
        rows
    }

    proptest! {
        /// Law 1: splitting an input stream into two arbitrary partitions and feeding each
        /// through its own engine, then concatenating, yields the same key->sum mapping as
        /// feeding everything through one engine (up to key order, which both runs produce
        /// ascending anyway).
        #[test]
        fn law1_partition_invariance(
            records in prop::collection::vec((0u8..4, 1u64..1000), 0..200),
            split in 0usize..200,
        ) {
            let split = split.min(records.len());
            let whole = run_unsorted(&records, None, None);

            let (left_records, right_records) = records.split_at(split);
            let left = run_unsorted(left_records, None, None);
            let right = run_unsorted(right_records, None, None);

            let mut merged = std::collections::BTreeMap::new();
            for (proto, sum) in left.into_iter().chain(right) {
                let entry = merged.entry(proto).or_insert(0u64);
                *entry = entry.saturating_add(sum);
            }
            let merged: Vec<(u8, u64)> = merged.into_iter().collect();

            prop_assert_eq!(whole, merged);
        }

        /// Law 5: the spill threshold only affects performance, never the output. The same
        /// input run through a range of budgets (tiny enough to force many spills, large enough
        /// to force none) must produce identical output.
        #[test]
        fn law5_spill_threshold_invariance(
            records in prop::collection::vec((0u8..4, 1u64..1000), 0..300),
            budget in prop_oneof![Just(1usize), Just(10), Just(1_000), Just(1_000_000)],
        ) {
            let dir = tempfile::tempdir().unwrap();
            let with_budget = run_unsorted(&records, Some(budget), Some(dir.path().to_path_buf()));
            let unbudgeted = run_unsorted(&records, None, None);
            prop_assert_eq!(with_budget, unbudgeted);
        }
    }
}
