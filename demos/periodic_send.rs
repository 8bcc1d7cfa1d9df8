#[cfg(target_os = "linux")]
#[tokio::main]
async fn main() -> canport::CanResult<()> {
    use std::time::Duration;

    use canport::{Bus, CanFrame, lin_can::SocketCanTransport};

    tracing_subscriber::fmt::init();

    let interface = std::env::args()
        .nth(1)
        .expect("Usage: periodic_send <interface>");

    let bus = Bus::new(SocketCanTransport::open(&interface)?);

    let frame = CanFrame::new_eff(
        0xC0FFEF,
        &[0xDE, 0xAD, 0xBE, 0xEF, 0xDE, 0xAD, 0xBE, 0xEF],
    )?;
    let task = bus.send_periodic(frame, Duration::from_millis(200))?;

    println!("Transmitting on {} every 200 ms for 10 s", interface);
    tokio::time::sleep(Duration::from_secs(10)).await;

    task.stop().await;
    if let Some(err) = task.take_error() {
        eprintln!("periodic task faulted: {}", err);
    }
    bus.shutdown().await;
    Ok(())
}

#[cfg(not(target_os = "linux"))]
fn main() {
    eprintln!("periodic_send requires Linux SocketCAN");
}
