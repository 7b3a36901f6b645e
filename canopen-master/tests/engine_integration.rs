//! End-to-end tests: the full engine (reader thread + dispatch task)
//! talking to a mock CANopen node over the in-memory loopback bus.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use canopen_master::transport::{CanTransport, LoopbackBus};
use canopen_master::{BusEvent, Engine, EngineConfig, EventKind, Frame, NmtStatus, SdoError};
use mock_canopen_node::{MockNode, ObjectDictionary};

fn test_config() -> EngineConfig {
    EngineConfig {
        interface: "loopback".to_string(),
        sdo_timeout_ms: 100,
        sdo_retries: 2,
        ..Default::default()
    }
}

async fn open_engine(bus: &LoopbackBus) -> Engine {
    Engine::open_with(Box::new(bus.attach()), test_config())
        .await
        .expect("engine opens over loopback")
}

/// Runs a mock node on its own thread until dropped.
struct NodeGuard {
    stop: Arc<AtomicBool>,
    handle: Option<std::thread::JoinHandle<()>>,
}

impl Drop for NodeGuard {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::SeqCst);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn spawn_node(bus: &LoopbackBus, node_id: u8) -> NodeGuard {
    let mut transport = bus.attach();
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();

    let handle = std::thread::spawn(move || {
        let mut od = ObjectDictionary::new();
        od.add_test_objects();
        let mut node =
            MockNode::new(node_id, od).with_heartbeat_period(Duration::from_millis(50));

        let _ = transport.send(&node.bootup_frame());

        while !stop_flag.load(Ordering::SeqCst) {
            match transport.try_recv() {
                Ok(Some(frame)) => {
                    for response in node.handle_frame(&frame) {
                        let _ = transport.send(&response);
                    }
                }
                Ok(None) => std::thread::sleep(Duration::from_millis(1)),
                Err(_) => break,
            }
            if let Some(heartbeat) = node.heartbeat_due(Instant::now()) {
                let _ = transport.send(&heartbeat);
            }
        }
    });

    NodeGuard { stop, handle: Some(handle) }
}

#[tokio::test]
async fn expedited_read() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    let value = engine.sdo_read(4, 0x1000, 0x00).await.unwrap();
    assert_eq!(value, 0x191u32.to_le_bytes().to_vec());

    engine.close().await;
    assert!(!engine.is_open());
}

#[tokio::test]
async fn expedited_write_then_read_back() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    engine.sdo_write(4, 0x2003, 0x01, &[0xAA, 0x55]).await.unwrap();
    assert_eq!(engine.sdo_read(4, 0x2003, 0x01).await.unwrap(), vec![0xAA, 0x55]);

    engine.close().await;
}

#[tokio::test]
async fn numeric_write_serializes_little_endian() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    engine.sdo_write_value(4, 0x1017, 0x00, 1000u16).await.unwrap();
    assert_eq!(engine.sdo_read(4, 0x1017, 0x00).await.unwrap(), vec![0xE8, 0x03]);

    engine.close().await;
}

#[tokio::test]
async fn segmented_read_reassembles_long_value() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    let name = engine.sdo_read(4, 0x1008, 0x00).await.unwrap();
    assert_eq!(name, b"MockCANopenNode".to_vec());

    engine.close().await;
}

#[tokio::test]
async fn segmented_write_round_trip() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    let label = b"integration label";
    engine.sdo_write(4, 0x2006, 0x00, label).await.unwrap();
    assert_eq!(engine.sdo_read(4, 0x2006, 0x00).await.unwrap(), label.to_vec());

    engine.close().await;
}

#[tokio::test]
async fn read_of_missing_object_reports_remote_abort() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    let result = engine.sdo_read(4, 0x5555, 0x00).await;
    assert_eq!(result, Err(SdoError::Abort { code: 0x0602_0000 }));

    engine.close().await;
}

#[tokio::test]
async fn silent_node_times_out_exactly_once() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    let result = engine.sdo_read(9, 0x1000, 0x00).await;
    assert_eq!(result, Err(SdoError::Timeout));

    // The node slot is free again afterwards.
    let result = engine.sdo_read(9, 0x1000, 0x00).await;
    assert_eq!(result, Err(SdoError::Timeout));

    engine.close().await;
}

#[tokio::test]
async fn concurrent_requests_to_one_node_are_serialized() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    let (a, b, c, d) = tokio::join!(
        engine.sdo_read(4, 0x1000, 0x00),
        engine.sdo_read(4, 0x1001, 0x00),
        engine.sdo_read(4, 0x1008, 0x00),
        engine.sdo_read(4, 0x1018, 0x01),
    );
    assert_eq!(a.unwrap(), 0x191u32.to_le_bytes().to_vec());
    assert_eq!(b.unwrap(), vec![0x00]);
    assert_eq!(c.unwrap(), b"MockCANopenNode".to_vec());
    assert_eq!(d.unwrap(), 0x1u32.to_le_bytes().to_vec());

    engine.close().await;
}

#[tokio::test]
async fn queue_depth_counts_queued_and_active() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    // Node 9 never answers, so the first read stays active while the
    // others wait in its queue.
    let (r1, r2, r3, depth) = tokio::join!(
        engine.sdo_read(9, 0x1000, 0x00),
        engine.sdo_read(9, 0x1001, 0x00),
        engine.sdo_read(9, 0x1002, 0x00),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.sdo_queue_depth().await.unwrap()
        },
    );
    assert_eq!(depth, 3);
    assert!(r1.is_err() && r2.is_err() && r3.is_err());

    engine.close().await;
}

#[tokio::test]
async fn flush_cancels_queued_requests() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    let (active, queued, _) = tokio::join!(
        engine.sdo_read(9, 0x1000, 0x00),
        engine.sdo_read(9, 0x1001, 0x00),
        async {
            tokio::time::sleep(Duration::from_millis(30)).await;
            engine.flush_sdo_queue().unwrap();
        },
    );
    // The in-flight request runs its course; the queued one is cancelled.
    assert_eq!(active, Err(SdoError::Timeout));
    assert_eq!(queued, Err(SdoError::Cancelled));

    engine.close().await;
}

#[tokio::test]
async fn heartbeats_populate_the_nmt_table() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    let booted = Arc::new(AtomicBool::new(false));
    let flag = booted.clone();
    engine
        .nmt_set_boot_callback(7, move |_| {
            flag.store(true, Ordering::SeqCst);
        })
        .unwrap();

    assert!(!engine.nmt_is_known(7).await.unwrap());
    assert_eq!(engine.nmt_status(7).await.unwrap(), NmtStatus::Unknown);

    let _node = spawn_node(&bus, 7);

    let mut known = false;
    for _ in 0..200 {
        if engine.nmt_is_known(7).await.unwrap() {
            known = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(known, "node 7 never became known");
    assert!(booted.load(Ordering::SeqCst), "boot callback did not fire");
    assert!(engine.nmt_check_liveness(7, Duration::from_secs(1)).await.unwrap());

    // A node nobody has heard from stays unknown and dead.
    assert!(!engine.nmt_is_known(33).await.unwrap());
    assert!(!engine.nmt_check_liveness(33, Duration::from_secs(1)).await.unwrap());

    engine.close().await;
}

#[tokio::test]
async fn nmt_broadcast_starts_the_node() {
    let bus = LoopbackBus::new();
    let _node = spawn_node(&bus, 4);
    let mut engine = open_engine(&bus).await;

    engine.nmt_start(0).unwrap();

    let mut operational = false;
    for _ in 0..200 {
        if engine.nmt_status(4).await.unwrap() == NmtStatus::Operational {
            operational = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(operational, "node 4 never reported operational");

    engine.close().await;
}

#[tokio::test]
async fn pdo_binding_and_batch_event() {
    let bus = LoopbackBus::new();
    let mut peer = bus.attach();
    let mut engine = open_engine(&bus).await;

    let (seen_tx, seen_rx) = std::sync::mpsc::channel();
    engine
        .register_pdo(0x185, move |data| {
            let _ = seen_tx.send(data.to_vec());
        })
        .unwrap();
    let mut batch_rx = engine.subscribe(EventKind::PdoBatch).unwrap();

    // Give the registration command time to land on the dispatch task.
    tokio::time::sleep(Duration::from_millis(20)).await;
    peer.send(&Frame::new(0x185, &[1, 2, 3]).unwrap()).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), batch_rx.recv())
        .await
        .expect("batch event before timeout")
        .expect("dispatch task alive");
    match event {
        BusEvent::PdoBatch(frames) => {
            assert!(frames.iter().any(|f| f.cob() == 0x185 && f.data() == [1, 2, 3]));
        }
        other => panic!("unexpected event {:?}", other),
    }
    assert_eq!(seen_rx.recv_timeout(Duration::from_secs(1)).unwrap(), vec![1, 2, 3]);

    engine.close().await;
}

#[tokio::test]
async fn echo_makes_own_traffic_observable() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    let mut sdo_rx = engine.subscribe(EventKind::Sdo).unwrap();
    tokio::time::sleep(Duration::from_millis(20)).await;

    // An SDO request we send shows up on our own SDO stream via echo.
    let request = Frame::new(0x601, &[0x40, 0x00, 0x10, 0x00, 0, 0, 0, 0]).unwrap();
    engine.send_frame(&request).unwrap();

    let event = tokio::time::timeout(Duration::from_secs(2), sdo_rx.recv())
        .await
        .expect("echoed frame before timeout")
        .expect("dispatch task alive");
    match event {
        BusEvent::Frame(frame) => assert_eq!(frame, request),
        other => panic!("unexpected event {:?}", other),
    }

    engine.close().await;
}

#[tokio::test]
async fn close_is_idempotent_and_rejects_further_use() {
    let bus = LoopbackBus::new();
    let mut engine = open_engine(&bus).await;

    engine.close().await;
    engine.close().await;

    assert!(engine.send_frame(&Frame::new(0x181, &[]).unwrap()).is_err());
    assert_eq!(engine.sdo_read(4, 0x1000, 0x00).await, Err(SdoError::Closed));
}
