//! End-to-end ingestion: binary frames through the decoder into the cache,
//! and the snapshot semantics the Worker relies on.

use std::sync::Arc;
use std::time::Duration;

use prost::Message as _;
use serde_json::json;

use ecoflow_api::cache::QuotaCache;
use ecoflow_api::proto::{self, DisplayPropertyUpload, Header, SendHeaderMsg};
use ecoflow_core::QuotaMap;

fn frame(upload: &DisplayPropertyUpload, enc_type: i32, src: i32, seq: i32) -> Vec<u8> {
    let mut pdata = upload.encode_to_vec();
    if enc_type == 1 && src != 32 {
        pdata = proto::xor_decode(&pdata, seq);
    }
    SendHeaderMsg {
        msg: vec![Header {
            pdata,
            src,
            enc_type,
            cmd_func: 254,
            cmd_id: 21,
            seq,
            ..Default::default()
        }],
    }
    .encode_to_vec()
}

#[test]
fn binary_frames_accumulate_in_the_cache() {
    let cache = QuotaCache::new();

    let first = DisplayPropertyUpload {
        bms_batt_soc: Some(85.0),
        pow_in_sum_w: Some(120.5),
        ..Default::default()
    };
    cache.apply(&proto::decode(&frame(&first, 0, 0, 0)));

    // A later partial upload updates one key and leaves the other alone.
    let second = DisplayPropertyUpload {
        bms_batt_soc: Some(84.0),
        ..Default::default()
    };
    cache.apply(&proto::decode(&frame(&second, 1, 0, 42)));

    let snapshot = cache.snapshot();
    assert_eq!(snapshot["bms_batt_soc"], json!(84.0));
    assert_eq!(snapshot["pow_in_sum_w"], json!(120.5));
}

#[test]
fn obfuscated_and_plain_frames_are_equivalent() {
    let upload = DisplayPropertyUpload {
        bms_batt_soc: Some(85.0),
        bms_max_cell_temp: Some(31),
        ..Default::default()
    };
    for seq in [0, 1, 42, 255, 256, 300] {
        assert_eq!(
            proto::decode(&frame(&upload, 1, 0, seq)),
            proto::decode(&frame(&upload, 0, 0, 0)),
            "seq={}",
            seq
        );
    }
}

#[test]
fn decode_failures_leave_the_cache_untouched() {
    let cache = QuotaCache::new();
    let mut delta = QuotaMap::new();
    delta.insert("soc".to_string(), json!(85));
    cache.apply(&delta);

    cache.apply(&proto::decode(b"\xde\xad\xbe\xef"));
    assert_eq!(cache.snapshot().len(), 1);
}

#[test]
fn readers_see_whole_message_updates() {
    let cache = Arc::new(QuotaCache::new());
    let writer_cache = cache.clone();

    let writer = std::thread::spawn(move || {
        for i in 0..200u32 {
            let mut delta = QuotaMap::new();
            delta.insert("a".to_string(), json!(i));
            delta.insert("b".to_string(), json!(i));
            writer_cache.apply(&delta);
        }
    });

    // Both keys always arrive in one apply; a snapshot must never show them
    // out of step.
    for _ in 0..200 {
        let snapshot = cache.snapshot();
        if let (Some(a), Some(b)) = (snapshot.get("a"), snapshot.get("b")) {
            assert_eq!(a, b);
        }
    }
    writer.join().unwrap();

    assert!(!cache.stale(Duration::from_secs(60)));
}
