//! RTMP publisher example
//!
//! Run with: cargo run --example publisher -- rtmp://localhost/live/test_key
//!
//! Connects, completes the handshake and pushes synthetic video messages,
//! printing status changes and bitrate reports.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use rtmp_publish::protocol::constants::{CSID_VIDEO, MSG_VIDEO};
use rtmp_publish::protocol::Message;
use rtmp_publish::{RtmpSession, SessionConfig, SessionState, TcpTransport};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("rtmp_publish=debug".parse()?)
                .add_directive("publisher=info".parse()?),
        )
        .init();

    // Get URL from command line
    let url = std::env::args().nth(1).unwrap_or_else(|| {
        eprintln!("Usage: publisher <rtmp_url>");
        eprintln!("Example: publisher rtmp://localhost/live/test_key");
        std::process::exit(1);
    });

    println!("Connecting to {}", url);

    let config = SessionConfig::default().chunk_size(4096);
    let (session, mut status) = RtmpSession::new(Arc::new(TcpTransport::new()), config)?;

    session.detect_byte_rate(|report| {
        println!(
            "Bitrate: {:?} detected={:.0} B/s sustainable={:.0} B/s",
            report.vector, report.detected_bytes_per_sec, report.sustainable_bytes_per_sec
        );
    });
    session.connect(&url).await?;

    // Wait for the server to accept connect
    while let Some(update) = status.recv().await {
        println!("Status: {:?}", update);
        if update.ready {
            break;
        }
        if update.state.is_terminal() {
            eprintln!("Connection failed: {:?}", update.state);
            return Ok(());
        }
    }

    // Push ten seconds of synthetic 25 fps video, a key frame every 25 frames
    let mut ticker = tokio::time::interval(Duration::from_millis(40));
    for frame in 0u32..250 {
        ticker.tick().await;
        let is_keyframe = frame % 25 == 0;
        let header: &[u8] = if is_keyframe { &[0x17, 0x01] } else { &[0x27, 0x01] };
        let mut payload = header.to_vec();
        payload.resize(4096, 0);

        let msg = Message::new(CSID_VIDEO, frame * 40, MSG_VIDEO, 1, Bytes::from(payload));
        if let Err(e) = session.send_message(&msg, is_keyframe) {
            eprintln!("Send failed: {}", e);
            break;
        }
        if session.status().state != SessionState::HandshakeComplete {
            break;
        }
    }

    println!("Queued bytes at close: {}", session.queued_bytes());
    session.close();

    Ok(())
}
