//! Integration tests for RequestQueueManager.

use nano_decode::config::{DecodeConfig, KvCacheDtype, ModelParams, PagedKVCacheParams, QueueConfig};
use nano_decode::scheduler::{InputBatch, RequestQueueManager, Responder};
use nano_decode::{Error, RequestId};
use parking_lot::Mutex;

#[derive(Default)]
struct CountingResponder {
    errors: Mutex<Vec<String>>,
}

impl CountingResponder {
    fn error_count(&self) -> usize {
        self.errors.lock().len()
    }

    fn last_error(&self) -> Option<String> {
        self.errors.lock().last().cloned()
    }
}

impl Responder for CountingResponder {
    fn send_error(&self, error: &Error) {
        self.errors.lock().push(error.to_string());
    }

    fn send_response(&self, _request_id: RequestId, _results: &[Vec<u32>]) {}
}

fn model_params(top_k: i32, device_block_count: usize) -> ModelParams {
    ModelParams {
        max_seq_len: 512,
        transformer_block_count: 42,
        attn_head_dim: 42,
        prefill_batch_sizes: vec![4],
        decode_batch_sizes: vec![2],
        top_k,
        paged_kv_cache: PagedKVCacheParams {
            block_seq_stride: 2,
            attention_head_count_kv: 42,
            device_block_count,
            kv_cache_dtype: KvCacheDtype::Float16,
        },
    }
}

fn manager(top_k: i32, device_block_count: usize) -> RequestQueueManager {
    RequestQueueManager::new(
        model_params(top_k, device_block_count),
        QueueConfig { max_queue_size: 3 },
    )
}

fn decode_config(max_completion_tokens: usize) -> DecodeConfig {
    DecodeConfig {
        num_beams: 1,
        top_k: 5,
        use_beam_search: false,
        max_completion_tokens,
        ..Default::default()
    }
}

fn prompt(len: u32) -> InputBatch {
    InputBatch::Pretokenized(vec![(1..=len).collect()])
}

#[test]
fn test_admit_and_remove_round_trip() {
    let mut manager = manager(5, 100);
    let responder = CountingResponder::default();

    let id = manager
        .add_to_queue(vec![decode_config(10)], prompt(4), &responder)
        .unwrap();
    assert_eq!(manager.request_pages(id), Some(7));
    assert_eq!(manager.available_page_count(), 93);
    assert_eq!(manager.current_queue_size(), 1);

    let entry = manager.remove_from_queue(id).unwrap();
    assert_eq!(entry.page_count, 7);
    assert_eq!(manager.available_page_count(), 100);
    assert_eq!(manager.current_queue_size(), 0);
    assert!(manager.current_tasks().is_empty());
    assert_eq!(responder.error_count(), 0);
}

#[test]
fn test_queue_full_rejects_with_one_error() {
    let mut manager = manager(5, 100);
    let responder = CountingResponder::default();
    for _ in 0..3 {
        assert!(manager
            .add_to_queue(vec![decode_config(10)], prompt(2), &responder)
            .is_some());
    }
    let available = manager.available_page_count();

    let rejected = manager.add_to_queue(vec![decode_config(10)], prompt(2), &responder);
    assert!(rejected.is_none());
    assert_eq!(responder.error_count(), 1);
    assert!(responder.last_error().unwrap().contains("full"));
    assert_eq!(manager.available_page_count(), available);
}

#[test]
fn test_top_k_mismatch_rejected() {
    let mut manager = manager(2, 100);
    let responder = CountingResponder::default();

    let rejected = manager.add_to_queue(vec![decode_config(10)], prompt(2), &responder);
    assert!(rejected.is_none());
    assert_eq!(responder.error_count(), 1);
    let message = responder.last_error().unwrap();
    assert!(message.contains("expects 2"));
    assert!(message.contains("asked for 5"));
    assert_eq!(manager.available_page_count(), 100);
}

#[test]
fn test_out_of_memory_rejected() {
    let mut manager = manager(5, 1);
    let responder = CountingResponder::default();

    let rejected = manager.add_to_queue(vec![decode_config(100)], prompt(4), &responder);
    assert!(rejected.is_none());
    assert_eq!(responder.error_count(), 1);
    assert!(responder.last_error().unwrap().contains("need 52"));
    assert_eq!(manager.current_queue_size(), 0);
}

#[test]
fn test_remove_unknown_request() {
    let mut manager = manager(5, 100);
    assert!(matches!(
        manager.remove_from_queue(999),
        Err(Error::NotFound(999))
    ));
}

#[test]
fn test_remove_twice_fails() {
    let mut manager = manager(5, 100);
    let responder = CountingResponder::default();
    let id = manager
        .add_to_queue(vec![decode_config(10)], prompt(2), &responder)
        .unwrap();

    manager.remove_from_queue(id).unwrap();
    assert!(matches!(manager.remove_from_queue(id), Err(Error::NotFound(_))));
    assert_eq!(manager.available_page_count(), 100);
}

#[test]
fn test_current_tasks_ascending() {
    let mut manager = manager(5, 100);
    let responder = CountingResponder::default();
    let first = manager
        .add_to_queue(vec![decode_config(4)], prompt(2), &responder)
        .unwrap();
    let second = manager
        .add_to_queue(vec![decode_config(4)], prompt(2), &responder)
        .unwrap();
    let third = manager
        .add_to_queue(vec![decode_config(4)], prompt(2), &responder)
        .unwrap();

    manager.remove_from_queue(second).unwrap();
    assert_eq!(manager.current_tasks(), vec![first, third]);
    assert!(first < third);
}

#[test]
fn test_model_params_from_json() {
    let json = r#"{
        "max_seq_len": 512,
        "transformer_block_count": 42,
        "attn_head_dim": 42,
        "prefill_batch_sizes": [4],
        "decode_batch_sizes": [2],
        "top_k": 5,
        "paged_kv_cache": {
            "block_seq_stride": 2,
            "attention_head_count_kv": 42,
            "device_block_count": 100,
            "kv_cache_dtype": "float16"
        }
    }"#;
    let params = ModelParams::from_json(json).unwrap();
    assert_eq!(params.top_k, 5);
    assert_eq!(params.block_seq_stride(), 2);

    let mut manager = RequestQueueManager::new(params, QueueConfig::default());
    assert_eq!(manager.available_page_count(), 100);
    assert!(manager
        .add_to_queue(vec![decode_config(10)], prompt(4), &CountingResponder::default())
        .is_some());
}

#[test]
fn test_top_k_mismatch_regardless_of_pages() {
    let mut manager = manager(5, 100);
    let responder = CountingResponder::default();
    let config = DecodeConfig {
        top_k: 2,
        ..decode_config(1)
    };

    assert!(manager
        .add_to_queue(vec![config], prompt(2), &responder)
        .is_none());
    assert_eq!(responder.error_count(), 1);
    assert!(responder.last_error().unwrap().contains("top_k mismatch"));
}
