//! End-to-end behaviour of the packer over in-memory, faulty and file views.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use proptest::prelude::*;
use stow_view::{collect_keys, FileView, InMemoryView, StorageView};

use crate::bucket::Bucket;
use crate::codec::{Codec, Framing};
use crate::config::PackerConfig;
use crate::error::ErrorKind;
use crate::item::Item;
use crate::testutil::{colliding_ids, ctx, incompressible, open, small_config, Fault, FaultyView};

const BUCKETS: &str = "packer/buckets/";

/// Decode every stored bucket, asserting each entry respects `max`.
fn stored_buckets(view: &dyn StorageView, max: usize) -> Vec<Bucket> {
    let codec = Codec::new(true);
    collect_keys(view, &ctx(), BUCKETS)
        .unwrap()
        .iter()
        .map(|key| {
            let bytes = view.get(&ctx(), key).unwrap().unwrap();
            assert!(bytes.len() <= max, "{key} is {} bytes", bytes.len());
            codec.decode(&bytes).unwrap()
        })
        .collect()
}

/// How many stored buckets hold each item id.
fn occurrences(buckets: &[Bucket]) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for bucket in buckets {
        for item in bucket.items() {
            *counts.entry(item.id).or_insert(0) += 1;
        }
    }
    counts
}

fn assert_single_owner(view: &dyn StorageView, max: usize, ids: &[String]) {
    let counts = occurrences(&stored_buckets(view, max));
    for id in ids {
        assert_eq!(counts.get(id), Some(&1), "{id} stored {:?} times", counts.get(id));
    }
}

fn has_children(keys: &[String]) -> bool {
    keys.iter()
        .filter_map(|k| k.strip_prefix(BUCKETS))
        .any(|k| k.contains('/'))
}

// ---------------------------------------------------------------------------
// Seed scenarios
// ---------------------------------------------------------------------------

#[test]
fn s1_thousand_items_force_sharding() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));

    let payloads: Vec<Vec<u8>> = (1..=1000).map(|_| incompressible(900)).collect();
    for (n, payload) in (1..=1000).zip(&payloads) {
        packer
            .put_item(&ctx(), &Item::new(n.to_string(), payload.clone()))
            .unwrap();
    }
    for (n, payload) in (1..=1000).zip(&payloads) {
        let item = packer.get_item(&ctx(), &n.to_string()).unwrap().unwrap();
        assert_eq!(&item.payload, payload);
    }

    let root = packer.bucket_view().list(&ctx(), "").unwrap();
    let split = root
        .iter()
        .filter(|name| !name.ends_with('/'))
        .find(|name| root.contains(&format!("{name}/")))
        .expect("at least one primary should have an external child");
    let children = packer.bucket_view().list(&ctx(), &format!("{split}/")).unwrap();
    assert!(!children.is_empty());

    stored_buckets(view.as_ref(), 4096);
}

#[test]
fn s2_colliding_pair_is_split_apart() {
    let view = Arc::new(InMemoryView::new());
    // Zero payloads compress away; store raw so the pair cannot share a bucket.
    let config = PackerConfig {
        compress: false,
        ..small_config(4096)
    };
    let packer = open(view.clone(), config);

    let a = "A".to_string();
    let primary = packer.addresser().primary_index(&a);
    let b = colliding_ids(&primary, 1).remove(0);

    packer.put_item(&ctx(), &Item::new(a.clone(), vec![0u8; 3000])).unwrap();
    packer.put_item(&ctx(), &Item::new(b.clone(), vec![0u8; 3000])).unwrap();

    assert_eq!(packer.get_item(&ctx(), &a).unwrap().unwrap().payload.len(), 3000);
    assert_eq!(packer.get_item(&ctx(), &b).unwrap().unwrap().payload.len(), 3000);

    let owner_a = packer.bucket_for(&ctx(), &a).unwrap().unwrap();
    let owner_b = packer.bucket_for(&ctx(), &b).unwrap().unwrap();
    assert_ne!(owner_a.key, owner_b.key);
    assert!(owner_a.depth > 0 || owner_b.depth > 0);
    assert_single_owner(view.as_ref(), 4096, &[a, b]);
}

#[test]
fn s3_delete_never_unshards() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));

    let mut ids = colliding_ids("ab", 20);
    ids.extend((0..80).map(|n| format!("plain-{n}")));
    for id in &ids {
        packer
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(600)))
            .unwrap();
    }
    let before = collect_keys(view.as_ref(), &ctx(), BUCKETS).unwrap();
    assert!(has_children(&before));

    for id in &ids {
        packer.delete_item(&ctx(), id).unwrap();
    }
    let after = collect_keys(view.as_ref(), &ctx(), BUCKETS).unwrap();
    assert_eq!(before, after);
    assert!(packer.all_items(&ctx()).unwrap().is_empty());

    let primary = packer.bucket_view().get(&ctx(), "ab").unwrap().unwrap();
    assert_eq!(Codec::new(true).decode(&primary).unwrap().item_count(), 0);
}

#[test]
fn s4_corrupt_primary_is_isolated() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let ids: Vec<String> = (1..=50).map(|n| n.to_string()).collect();
    for id in &ids {
        packer.put_item(&ctx(), &Item::new(id.clone(), b"value".to_vec())).unwrap();
    }

    let victim = &ids[0];
    let primary = packer.addresser().primary_index(victim);
    let key = format!("{BUCKETS}{primary}");
    let mut bytes = view.get(&ctx(), &key).unwrap().unwrap();
    bytes[0] = 0xFF;
    view.put(&ctx(), &key, &bytes).unwrap();
    packer.clear_cache();

    let err = packer.get_item(&ctx(), victim).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::Corrupt);

    let healthy = ids
        .iter()
        .find(|id| packer.addresser().primary_index(id) != primary)
        .unwrap();
    assert!(packer.get_item(&ctx(), healthy).unwrap().is_some());
}

#[test]
fn s5_concurrent_writers_converge() {
    let packer = open(Arc::new(InMemoryView::new()), small_config(4096));
    let p1 = vec![1u8; 700];
    let p2 = vec![2u8; 900];
    for _ in 0..25 {
        thread::scope(|s| {
            s.spawn(|| packer.put_item(&ctx(), &Item::new("X", p1.clone())).unwrap());
            s.spawn(|| packer.put_item(&ctx(), &Item::new("X", p2.clone())).unwrap());
        });
        let got = packer.get_item(&ctx(), "X").unwrap().unwrap().payload;
        assert!(got == p1 || got == p2);
    }
}

#[test]
fn s6_base_bits_frozen_across_restart() {
    let view: Arc<InMemoryView> = Arc::new(InMemoryView::new());
    let first = open(view.clone(), PackerConfig::default());
    let before = first.addresser().primary_index("1");
    for n in 0..100 {
        first
            .put_item(&ctx(), &Item::new(n.to_string(), vec![n as u8; 8]))
            .unwrap();
    }
    drop(first);

    let restarted = open(
        view.clone(),
        PackerConfig {
            base_bits: 12,
            ..PackerConfig::default()
        },
    );
    assert_eq!(restarted.config().base_bits, 8);
    assert_eq!(restarted.addresser().primary_index("1"), before);
    assert_eq!(before.len(), 2);
    for n in 0..100 {
        let item = restarted.get_item(&ctx(), &n.to_string()).unwrap().unwrap();
        assert_eq!(item.payload, vec![n as u8; 8]);
    }
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn roundtrip_routing_and_delete(
        entries in prop::collection::vec(
            ("[a-z0-9]{1,10}", prop::collection::vec(any::<u8>(), 0..300)),
            1..60,
        )
    ) {
        let packer = open(Arc::new(InMemoryView::new()), small_config(4096));
        let mut expected = BTreeMap::new();
        for (id, payload) in &entries {
            let landed = packer.put_item(&ctx(), &Item::new(id.clone(), payload.clone())).unwrap();
            let primary = packer.addresser().primary_index(id);
            prop_assert_eq!(landed.split('/').next(), Some(primary.as_str()));
            expected.insert(id.clone(), payload.clone());
        }
        for (id, payload) in &expected {
            let item = packer.get_item(&ctx(), id).unwrap();
            prop_assert_eq!(item.map(|i| i.payload), Some(payload.clone()));
        }
        for id in expected.keys().step_by(2) {
            packer.delete_item(&ctx(), id).unwrap();
        }
        for (n, id) in expected.keys().enumerate() {
            let present = packer.get_item(&ctx(), id).unwrap().is_some();
            prop_assert_eq!(present, n % 2 == 1);
        }
    }
}

#[test]
fn repeated_put_is_idempotent() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let items: Vec<Item> = colliding_ids("c", 40)
        .into_iter()
        .map(|id| Item::new(id, incompressible(300)))
        .collect();
    for item in &items {
        packer.put_item(&ctx(), item).unwrap();
    }
    let keys = view.keys();
    for item in &items {
        packer.put_item(&ctx(), item).unwrap();
        assert_eq!(packer.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }
    assert_eq!(view.keys(), keys);
    assert_eq!(packer.all_items(&ctx()).unwrap().len(), items.len());
    let ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
    assert_single_owner(view.as_ref(), 4096, &ids);
}

#[test]
fn deep_splits_keep_one_owner_per_item() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let ids = colliding_ids("ab", 200);
    for id in &ids {
        packer
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(300)))
            .unwrap();
    }

    let buckets = stored_buckets(view.as_ref(), 4096);
    assert!(buckets.iter().any(|b| b.depth >= 2));
    assert_single_owner(view.as_ref(), 4096, &ids);

    let mut all: Vec<String> = packer.all_items(&ctx()).unwrap().into_iter().map(|i| i.id).collect();
    all.sort();
    let mut want = ids.clone();
    want.sort();
    assert_eq!(all, want);

    let stats = packer.stats(&ctx()).unwrap();
    assert_eq!(stats.items, 200);
    assert_eq!(stats.buckets, buckets.len());
    assert!(stats.largest_bucket <= 4096);
}

#[test]
fn near_limit_item_is_isolated_by_split() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let ids = colliding_ids("5e", 2);
    let big = incompressible(3900);
    packer.put_item(&ctx(), &Item::new(ids[0].clone(), big.clone())).unwrap();
    packer.put_item(&ctx(), &Item::new(ids[1].clone(), b"small".to_vec())).unwrap();

    assert_eq!(packer.get_item(&ctx(), &ids[0]).unwrap().unwrap().payload, big);
    assert_eq!(packer.get_item(&ctx(), &ids[1]).unwrap().unwrap().payload, b"small");
    assert_single_owner(view.as_ref(), 4096, &ids);
}

#[test]
fn failed_parent_write_recovers_through_adoption() {
    let view = Arc::new(FaultyView::new());
    let packer = open(view.clone(), small_config(10_000));
    let ids = [
        colliding_ids("000", 10),
        colliding_ids("001", 10),
        colliding_ids("003", 10),
    ];
    let items: Vec<Item> = (0..30)
        .map(|i| Item::new(ids[i % 3][i / 3].clone(), incompressible(1000)))
        .collect();

    // Every write to the primary fails; stop at the first one that had
    // already persisted a child bucket.
    let primary_key = format!("{BUCKETS}00");
    let mut split_at = None;
    for (i, item) in items.iter().enumerate() {
        view.fail_puts(Fault::Exact(primary_key.clone()));
        let attempt = packer.put_item(&ctx(), item);
        view.heal();
        assert_eq!(attempt.unwrap_err().kind(), ErrorKind::StorageUnavailable);
        if has_children(&view.keys()) {
            split_at = Some(i);
            break;
        }
        packer.put_item(&ctx(), item).unwrap();
    }
    let split_at = split_at.expect("a split should have been attempted");

    // The child written before the failure is adopted, so even the item
    // whose put failed is visible.
    for item in &items[..=split_at] {
        assert_eq!(packer.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }
    let reopened = open(view.clone(), small_config(10_000));
    for item in &items[..=split_at] {
        assert_eq!(reopened.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }

    for item in &items[split_at + 1..] {
        reopened.put_item(&ctx(), item).unwrap();
    }
    for item in &items {
        assert_eq!(reopened.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }
    let all_ids: Vec<String> = items.iter().map(|i| i.id.clone()).collect();
    assert_single_owner(view.as_ref(), 10_000, &all_ids);
}

#[test]
fn restored_primary_after_crash_still_reads_everything() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(10_000));
    let ids = [
        colliding_ids("000", 10),
        colliding_ids("001", 10),
        colliding_ids("003", 10),
    ];
    let items: Vec<Item> = (0..30)
        .map(|i| Item::new(ids[i % 3][i / 3].clone(), incompressible(1000)))
        .collect();

    let primary_key = format!("{BUCKETS}00");
    let mut saved = None;
    let mut split_at = None;
    for (i, item) in items.iter().enumerate() {
        let before = view.get(&ctx(), &primary_key).unwrap();
        packer.put_item(&ctx(), item).unwrap();
        if has_children(&view.keys()) {
            saved = before;
            split_at = Some(i);
            break;
        }
    }
    let split_at = split_at.expect("bucket 00 should split");
    assert!(packer.locate(&ctx(), &items[split_at].id).unwrap().starts_with("00/"));

    // Simulate a crash between the child write and the parent write.
    view.put(&ctx(), &primary_key, &saved.unwrap()).unwrap();
    drop(packer);

    let recovered = open(view.clone(), small_config(10_000));
    for item in &items[..=split_at] {
        assert_eq!(recovered.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }
    for item in &items[split_at + 1..] {
        recovered.put_item(&ctx(), item).unwrap();
    }
    for item in &items {
        assert_eq!(recovered.get_item(&ctx(), &item.id).unwrap().as_ref(), Some(item));
    }
}

#[test]
fn failed_child_write_leaves_parent_intact() {
    let view = Arc::new(FaultyView::new());
    let packer = open(view.clone(), small_config(10_000));
    let ids = colliding_ids("00", 20);
    let items: Vec<Item> = ids
        .iter()
        .map(|id| Item::new(id.clone(), incompressible(1000)))
        .collect();

    view.fail_puts(Fault::Prefix(format!("{BUCKETS}00/")));
    let mut stored = 0;
    let failed = loop {
        let item = &items[stored];
        match packer.put_item(&ctx(), item) {
            Ok(_) => stored += 1,
            Err(err) => break (err, item),
        }
    };
    assert_eq!(failed.0.kind(), ErrorKind::StorageUnavailable);
    assert!(!has_children(&view.keys()));
    for item in &items[..stored] {
        assert!(packer.get_item(&ctx(), &item.id).unwrap().is_some());
    }
    assert!(packer.get_item(&ctx(), &failed.1.id).unwrap().is_none());

    view.heal();
    packer.put_item(&ctx(), failed.1).unwrap();
    assert!(has_children(&view.keys()));
    assert!(packer.get_item(&ctx(), &failed.1.id).unwrap().is_some());
}

#[test]
fn missing_external_bucket_is_corrupt() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let ids = colliding_ids("7f", 30);
    for id in &ids {
        packer
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(400)))
            .unwrap();
    }
    let (id, owner) = ids
        .iter()
        .find_map(|id| {
            let bucket = packer.bucket_for(&ctx(), id).unwrap()?;
            (bucket.depth > 0).then_some((id, bucket))
        })
        .expect("some item should live in a child bucket");

    view.delete(&ctx(), &format!("{BUCKETS}{}", owner.key)).unwrap();
    packer.clear_cache();
    assert_eq!(packer.get_item(&ctx(), id).unwrap_err().kind(), ErrorKind::Corrupt);
}

#[test]
fn concurrent_puts_to_different_ids() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    let ids = colliding_ids("e", 400);
    thread::scope(|s| {
        for chunk in ids.chunks(50) {
            let packer = &packer;
            s.spawn(move || {
                for id in chunk {
                    packer
                        .put_item(&ctx(), &Item::new(id.clone(), id.as_bytes().repeat(20)))
                        .unwrap();
                }
            });
        }
    });
    for id in &ids {
        let item = packer.get_item(&ctx(), id).unwrap().unwrap();
        assert_eq!(item.payload, id.as_bytes().repeat(20));
    }
    assert_single_owner(view.as_ref(), 4096, &ids);
}

#[test]
fn concurrent_reads_never_see_torn_payloads() {
    let packer = open(Arc::new(InMemoryView::new()), small_config(4096));
    packer.put_item(&ctx(), &Item::new("X", vec![1u8; 500])).unwrap();
    let stop = AtomicBool::new(false);
    thread::scope(|s| {
        s.spawn(|| {
            for round in 0..200 {
                let fill = if round % 2 == 0 { 2u8 } else { 1u8 };
                packer.put_item(&ctx(), &Item::new("X", vec![fill; 500])).unwrap();
            }
            stop.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !stop.load(Ordering::SeqCst) {
                let payload = packer.get_item(&ctx(), "X").unwrap().unwrap().payload;
                assert_eq!(payload.len(), 500);
                assert!(payload.iter().all(|&b| b == payload[0]));
                assert!(payload[0] == 1 || payload[0] == 2);
            }
        });
    });
}

#[test]
fn raw_and_compressed_framings_both_read_back() {
    let view = Arc::new(InMemoryView::new());
    let raw = open(
        view.clone(),
        PackerConfig {
            compress: false,
            ..small_config(4096)
        },
    );
    raw.put_item(&ctx(), &Item::new("legacy", vec![7u8; 400])).unwrap();
    let primary = raw.addresser().primary_index("legacy");
    let key = format!("{BUCKETS}{primary}");
    assert_eq!(view.get(&ctx(), &key).unwrap().unwrap()[0], Framing::Raw as u8);
    drop(raw);

    let compressed = open(view.clone(), small_config(4096));
    assert_eq!(
        compressed.get_item(&ctx(), "legacy").unwrap().unwrap().payload,
        vec![7u8; 400]
    );
    compressed.put_item(&ctx(), &Item::new("legacy", vec![8u8; 400])).unwrap();
    assert_eq!(view.get(&ctx(), &key).unwrap().unwrap()[0], Framing::Zstd as u8);

    let reopened = open(view.clone(), small_config(4096));
    assert_eq!(
        reopened.get_item(&ctx(), "legacy").unwrap().unwrap().payload,
        vec![8u8; 400]
    );
}

// ---------------------------------------------------------------------------
// Configuration drift, iteration and backends
// ---------------------------------------------------------------------------

#[test]
fn shard_width_may_change_between_restarts() {
    let view = Arc::new(InMemoryView::new());
    let first = open(view.clone(), small_config(4096));
    let ids = colliding_ids("9", 300);
    for id in &ids[..150] {
        first
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(300)))
            .unwrap();
    }
    drop(first);

    let wider = open(
        view.clone(),
        PackerConfig {
            shard_bits: 8,
            ..small_config(4096)
        },
    );
    assert_eq!(wider.config().shard_bits, 8);
    for id in &ids[150..] {
        wider
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(300)))
            .unwrap();
    }
    for id in &ids {
        assert!(wider.get_item(&ctx(), id).unwrap().is_some(), "{id} lost");
    }
    assert_single_owner(view.as_ref(), 4096, &ids);
}

#[test]
fn iterate_filters_by_location_prefix() {
    let packer = open(Arc::new(InMemoryView::new()), small_config(4096));
    let inside = colliding_ids("ab", 60);
    let outside: Vec<String> = (0..60)
        .map(|n| format!("other-{n}"))
        .filter(|id| packer.addresser().primary_index(id) != "ab")
        .collect();
    for id in inside.iter().chain(&outside) {
        packer
            .put_item(&ctx(), &Item::new(id.clone(), incompressible(200)))
            .unwrap();
    }

    let mut found: Vec<String> = packer
        .iterate(&ctx(), "ab")
        .map(|item| item.unwrap().id)
        .collect();
    found.sort();
    let mut want = inside.clone();
    want.sort();
    assert_eq!(found, want);

    let everything = packer.iterate(&ctx(), "").count();
    assert_eq!(everything, inside.len() + outside.len());
}

#[test]
fn iterate_surfaces_corruption_once() {
    let view = Arc::new(InMemoryView::new());
    let packer = open(view.clone(), small_config(4096));
    packer.put_item(&ctx(), &Item::new("a", b"x".to_vec())).unwrap();
    let primary = packer.addresser().primary_index("a");
    view.put(&ctx(), &format!("{BUCKETS}{primary}"), &[0xFF, 0, 0]).unwrap();
    packer.clear_cache();

    let results: Vec<_> = packer.iterate(&ctx(), "").collect();
    assert_eq!(results.len(), 1);
    assert_eq!(results[0].as_ref().unwrap_err().kind(), ErrorKind::Corrupt);
}

#[test]
fn file_backed_packer_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let ids = colliding_ids("c", 300);
    {
        let view = Arc::new(FileView::open(dir.path()).unwrap());
        let packer = open(view, small_config(4096));
        for id in &ids {
            packer
                .put_item(&ctx(), &Item::new(id.clone(), id.as_bytes().repeat(10)))
                .unwrap();
        }
    }

    let view = Arc::new(FileView::open(dir.path()).unwrap());
    let packer = open(view.clone(), small_config(4096));
    for id in &ids {
        let item = packer.get_item(&ctx(), id).unwrap().unwrap();
        assert_eq!(item.payload, id.as_bytes().repeat(10));
    }
    assert_eq!(packer.all_items(&ctx()).unwrap().len(), ids.len());
    assert_single_owner(view.as_ref(), 4096, &ids);
}
