//! Runs the mock node on a SocketCAN interface.
//!
//! ```bash
//! # Start the mock node on vcan0 with node ID 4
//! cargo run -p mock-canopen-node -- --interface vcan0 --node-id 4
//! ```

use std::time::{Duration, Instant};

use socketcan::{CanFrame, CanSocket, Socket};

use canopen_common::Frame;
use mock_canopen_node::{MockNode, ObjectDictionary};

fn main() {
    // Parse command line arguments (simplified for now)
    let args: Vec<String> = std::env::args().collect();

    let interface = args
        .get(1)
        .and_then(|arg| if arg == "--interface" { args.get(2) } else { None })
        .map(|s| s.as_str())
        .unwrap_or("vcan0");

    let node_id = args
        .get(3)
        .and_then(|arg| if arg == "--node-id" { args.get(4) } else { None })
        .and_then(|s| s.parse::<u8>().ok())
        .unwrap_or(4);

    println!("Mock CANopen Node starting...");
    println!("   Interface: {}", interface);
    println!("   Node ID: {}", node_id);
    println!();

    let socket = match CanSocket::open(interface) {
        Ok(sock) => {
            println!("✓ CAN socket opened successfully");
            sock
        }
        Err(e) => {
            eprintln!("✗ Failed to open CAN socket: {}", e);
            eprintln!("\nTroubleshooting:");
            eprintln!("  1. Create virtual CAN interface:");
            eprintln!("     sudo modprobe vcan");
            eprintln!("     sudo ip link add dev vcan0 type vcan");
            eprintln!("     sudo ip link set up vcan0");
            eprintln!("  2. Check interface exists: ip link show");
            std::process::exit(1);
        }
    };

    // Set read timeout to avoid busy-waiting
    socket
        .set_read_timeout(Duration::from_millis(10))
        .expect("Failed to set socket timeout");

    let mut object_dict = ObjectDictionary::new();
    object_dict.add_test_objects();

    println!("✓ Object dictionary loaded with {} objects", object_dict.len());
    println!("\nAvailable SDO objects:");
    object_dict.print_summary();
    println!();

    let mut node = MockNode::new(node_id, object_dict);

    println!("Mock node is running!");
    println!("   Answering SDO requests on COB-ID 0x{:03X}", 0x600 + node_id as u16);
    println!("   Broadcasting TPDO1 on COB-ID 0x{:03X} every 100ms", 0x180 + node_id as u16);
    println!("   Press Ctrl+C to stop\n");

    let send = |socket: &CanSocket, frame: &Frame| {
        if let Ok(can) = CanFrame::try_from(frame) {
            if let Err(e) = socket.write_frame(&can) {
                eprintln!("⚠ Failed to send frame: {}", e);
            }
        }
    };

    // Announce ourselves the way a freshly powered device would.
    send(&socket, &node.bootup_frame());

    // TPDO broadcasting state
    let mut last_tpdo_time = Instant::now();
    let tpdo_interval = Duration::from_millis(100);
    let mut temperature: u16 = 2350; // 23.50°C
    let mut pressure: u16 = 1013; // 1013 hPa
    let mut status: u8 = 1;

    loop {
        match socket.read_frame() {
            Ok(can) => {
                if let Ok(frame) = Frame::try_from(&can) {
                    for response in node.handle_frame(&frame) {
                        send(&socket, &response);
                    }
                }
            }
            Err(err) => {
                // Timeout or no data - this is normal, just continue
                if err.kind() != std::io::ErrorKind::WouldBlock
                    && err.kind() != std::io::ErrorKind::TimedOut
                {
                    eprintln!("⚠ CAN read error: {}", err);
                }
            }
        }

        let now = Instant::now();
        if let Some(heartbeat) = node.heartbeat_due(now) {
            send(&socket, &heartbeat);
        }

        // Broadcast TPDO periodically
        if last_tpdo_time.elapsed() >= tpdo_interval {
            temperature = (temperature + 1) % 3000;
            pressure = 1000 + (pressure - 1000 + 1) % 50;
            status = if status == 1 { 2 } else { 1 };

            // TPDO1 mapping: Temperature (16-bit), Pressure (16-bit), Status (8-bit)
            let tpdo_cob_id = 0x180 + node_id as u16;
            let mut data = [0u8; 5];
            data[0..2].copy_from_slice(&temperature.to_le_bytes());
            data[2..4].copy_from_slice(&pressure.to_le_bytes());
            data[4] = status;

            if let Ok(frame) = Frame::new(tpdo_cob_id, &data) {
                send(&socket, &frame);
            }

            last_tpdo_time = Instant::now();
        }
    }
}
