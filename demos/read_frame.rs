#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> canport::CanResult<()> {
    use std::time::Duration;

    use canport::{Bus, lin_can::SocketCanTransport};

    tracing_subscriber::fmt::init();

    let interface = std::env::args()
        .nth(1)
        .expect("Usage: read_frame <interface>");

    let bus = Bus::new(SocketCanTransport::open(&interface)?);

    println!("Listening on CAN interface: {}", interface);

    // Loop to read and print incoming CAN frames
    loop {
        if let Some(frame) = bus.recv(Some(Duration::from_secs(1))).await? {
            println!(
                "{:9.4} ID=0x{:X} Extended={} RTR={} Error={} [{}]",
                frame.timestamp().unwrap_or(0.0),
                frame.id(),
                frame.is_extended(),
                frame.is_rtr(),
                frame.is_error(),
                frame
                    .data()
                    .iter()
                    .map(|b| format!("{:02X}", b))
                    .collect::<Vec<_>>()
                    .join(" "),
            );
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("read_frame requires Linux SocketCAN");
}
