mod common;

use std::sync::{Arc, Barrier, Mutex};
use std::thread;
use std::time::Duration;

use common::CountingLoader;
use openmath_inference::device::CapabilityConfig;
use openmath_inference::{CacheStatus, InferenceError, ModelCache};

fn cpu_cache(loader: CountingLoader) -> ModelCache {
    ModelCache::with_probe(loader, || CapabilityConfig::CPU_ONLY)
}

#[test]
fn concurrent_first_callers_share_one_load() {
    let loader = CountingLoader::slow(Duration::from_millis(100));
    let cache = Arc::new(cpu_cache(loader.clone()));
    let callers = 8;
    let barrier = Arc::new(Barrier::new(callers));

    let handles: Vec<_> = (0..callers)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get().unwrap()
            })
        })
        .collect();

    let results: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

    assert_eq!(loader.calls(), 1);
    for handle in &results[1..] {
        assert!(Arc::ptr_eq(&results[0], handle));
    }
    assert_eq!(cache.status(), CacheStatus::Ready);
}

#[test]
fn concurrent_first_callers_share_one_failure() {
    let mut loader = CountingLoader::slow(Duration::from_millis(50));
    loader.fail_with = Some("adapter_config.json missing".to_string());
    let cache = Arc::new(cpu_cache(loader.clone()));
    let barrier = Arc::new(Barrier::new(6));

    let messages: Vec<String> = (0..6)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                cache.get().unwrap_err().to_string()
            })
        })
        .collect::<Vec<_>>()
        .into_iter()
        .map(|h| h.join().unwrap())
        .collect();

    assert_eq!(loader.calls(), 1);
    assert!(messages.iter().all(|m| m == &messages[0]));
    assert!(messages[0].contains("adapter_config.json missing"));
}

#[test]
fn failure_is_sticky() {
    let loader = CountingLoader::failing("out of memory");
    let cache = cpu_cache(loader.clone());

    let first = cache.get().unwrap_err();
    assert!(matches!(first, InferenceError::CachedLoad(_)));

    for _ in 0..5 {
        let again = cache.get().unwrap_err();
        assert_eq!(again.to_string(), first.to_string());
    }
    assert_eq!(loader.calls(), 1);
    assert_eq!(cache.status(), CacheStatus::Error(first.to_string()));
}

#[test]
fn loaded_handle_is_served_to_many_readers_without_reloading() {
    let loader = CountingLoader::default();
    let cache = Arc::new(cpu_cache(loader.clone()));
    let first = cache.get().unwrap();

    let readers: Vec<_> = (0..8)
        .map(|_| {
            let cache = Arc::clone(&cache);
            let first = Arc::clone(&first);
            thread::spawn(move || {
                for _ in 0..1000 {
                    assert!(Arc::ptr_eq(&first, &cache.get().unwrap()));
                }
            })
        })
        .collect();
    for reader in readers {
        reader.join().unwrap();
    }

    assert_eq!(loader.calls(), 1);
    assert!(cache.is_loaded());
}

#[test]
fn status_does_not_trigger_a_load() {
    let loader = CountingLoader::default();
    let cache = cpu_cache(loader.clone());

    assert_eq!(cache.status(), CacheStatus::Loading);
    assert!(!cache.is_loaded());
    assert_eq!(loader.calls(), 0);

    cache.get().unwrap();
    assert!(cache.is_loaded());
    assert_eq!(cache.status(), CacheStatus::Ready);
}

#[test]
fn status_stays_responsive_during_a_load() {
    let loader = CountingLoader::slow(Duration::from_millis(300));
    let cache = Arc::new(cpu_cache(loader));

    let loading = {
        let cache = Arc::clone(&cache);
        thread::spawn(move || cache.get().map(|_| ()))
    };
    thread::sleep(Duration::from_millis(50));

    assert_eq!(cache.status(), CacheStatus::Loading);
    loading.join().unwrap().unwrap();
    assert_eq!(cache.status(), CacheStatus::Ready);
}

#[test]
fn probe_result_reaches_the_loader() {
    struct RecordingLoader(Arc<Mutex<Option<CapabilityConfig>>>);

    impl openmath_inference::ModelLoader for RecordingLoader {
        fn load(&self, capability: CapabilityConfig) -> openmath_inference::Result<openmath_inference::ModelHandle> {
            *self.0.lock().unwrap() = Some(capability);
            Ok(common::scripted_handle())
        }
    }

    let seen = Arc::new(Mutex::new(None));
    let injected = CapabilityConfig {
        use_accelerator: true,
        quantize: false,
    };
    let cache = ModelCache::with_probe(RecordingLoader(Arc::clone(&seen)), move || injected);

    cache.get().unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(injected));
}

#[test]
fn reset_clears_failure_but_keeps_a_loaded_model() {
    let failing = CountingLoader::failing("weights missing");
    let cache = cpu_cache(failing.clone());
    cache.get().unwrap_err();

    assert!(cache.reset());
    assert_eq!(cache.status(), CacheStatus::Loading);
    cache.get().unwrap_err();
    assert_eq!(failing.calls(), 2);

    let healthy = cpu_cache(CountingLoader::default());
    let handle = healthy.get().unwrap();
    assert!(!healthy.reset());
    assert!(Arc::ptr_eq(&handle, &healthy.get().unwrap()));
}
