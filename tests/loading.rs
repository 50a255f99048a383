//! Background loading across components

use std::sync::mpsc;
use std::time::{Duration, Instant};
use voice_mcp::loading::{ComponentLoadingCoordinator, ComponentStatus, ComponentType, Loader};

fn loader<F>(f: F) -> Loader
where
    F: FnOnce() -> anyhow::Result<bool> + Send + 'static,
{
    Box::new(f)
}

#[test]
fn slow_component_does_not_hold_up_others() {
    let coordinator = ComponentLoadingCoordinator::new();
    let (release_tx, release_rx) = mpsc::channel::<()>();

    let started = Instant::now();
    assert!(coordinator.start_background_loading(vec![
        (
            ComponentType::Stt,
            loader(move || {
                let _ = release_rx.recv_timeout(Duration::from_secs(10));
                Ok(true)
            }),
        ),
        (ComponentType::Tts, loader(|| Ok(true))),
        (ComponentType::Hotkey, loader(|| anyhow::bail!("no display"))),
    ]));
    // Starting returns without running any loader
    assert!(started.elapsed() < Duration::from_secs(1));

    assert!(coordinator.wait_for_ready(ComponentType::Tts, Duration::from_secs(2)));
    assert!(!coordinator.wait_for_ready(ComponentType::Hotkey, Duration::from_secs(2)));
    assert_eq!(coordinator.get_status(ComponentType::Hotkey), ComponentStatus::Failed);
    assert!(coordinator.is_loading(ComponentType::Stt));

    let snapshot = coordinator.overall_status();
    assert_eq!(snapshot.len(), 3);
    let json = serde_json::to_value(&snapshot).unwrap();
    assert_eq!(json[0]["component"], "tts");
    assert_eq!(json[0]["status"], "ready");
    assert_eq!(json[1]["status"], "loading");
    assert_eq!(json[2]["error"], "Error during hotkey preloading: no display");

    release_tx.send(()).unwrap();
    assert!(coordinator.wait_for_ready(ComponentType::Stt, Duration::from_secs(2)));
}

#[test]
fn settle_waits_for_in_flight_load() {
    let coordinator = ComponentLoadingCoordinator::new();
    coordinator.start_background_loading(vec![(
        ComponentType::Tts,
        loader(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(true)
        }),
    )]);

    let deadline = Instant::now() + Duration::from_secs(2);
    while !coordinator.is_loading(ComponentType::Tts) && Instant::now() < deadline {
        std::thread::sleep(Duration::from_millis(5));
    }
    assert_eq!(
        coordinator.settle(ComponentType::Tts, Duration::from_secs(2)),
        ComponentStatus::Ready
    );
}

#[test]
fn results_finishing_after_shutdown_are_discarded() {
    let coordinator = ComponentLoadingCoordinator::new();
    coordinator.start_background_loading(vec![(
        ComponentType::Stt,
        loader(|| {
            std::thread::sleep(Duration::from_millis(200));
            Ok(true)
        }),
    )]);

    coordinator.shutdown();
    assert!(!coordinator.is_started());
    std::thread::sleep(Duration::from_millis(300));
    assert_eq!(coordinator.get_status(ComponentType::Stt), ComponentStatus::NotStarted);
}
