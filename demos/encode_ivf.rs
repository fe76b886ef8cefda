//! Example: AV1 encode to an IVF file
//!
//! Drives an encode session against the synthetic device and writes the
//! temporal units to `output.ivf` (or the path given as first argument).
//! The input is a moving luma gradient generated on the fly.

use av1_hwenc::{
    Av1Encoder, BRefType, EncodeConfig, RateControlMode, RawSurface, SyntheticDevice,
};
use std::fs::File;
use std::io::Write;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, Layer};

const WIDTH: u32 = 320;
const HEIGHT: u32 = 240;
const NUM_FRAMES: u32 = 60;

fn gradient_frame(n: u32) -> RawSurface {
    let luma_size = (WIDTH * HEIGHT) as usize;
    let mut data = vec![128u8; luma_size * 3 / 2];
    for (i, px) in data[..luma_size].iter_mut().enumerate() {
        let x = i as u32 % WIDTH;
        let y = i as u32 / WIDTH;
        *px = ((x + y + n * 4) % 256) as u8;
    }
    RawSurface {
        data,
        timestamp: u64::from(n),
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_filter(tracing_subscriber::filter::LevelFilter::INFO),
        )
        .init();

    let output_path = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "output.ivf".to_string());

    println!("AV1 IVF Encode Example\n");

    // Configure encoder.
    let config = EncodeConfig::av1(WIDTH, HEIGHT)
        .with_rate_control(RateControlMode::Cbr, 1_000)
        .with_frame_rate(30, 1)
        .with_gop(30, 4)
        .with_b_ref_type(BRefType::Pyramid)
        .with_enc_tools(true);

    let device = Box::new(SyntheticDevice::new(WIDTH, HEIGHT).with_latency(2));
    let mut encoder = Av1Encoder::new(config, device, None)?;
    let param = encoder.video_param();
    println!(
        "Config: {:?} {} kbps, GOP={}, GopRefDist={}, {} tasks (init status {:?})\n",
        param.rate_control_mode,
        param.target_kbps,
        param.gop_pic_size,
        param.gop_ref_dist,
        encoder.num_task(),
        encoder.init_status()
    );

    let mut file = File::create(&output_path)?;
    let mut total_bytes = 0usize;
    let mut num_packets = 0usize;
    let mut write_packets = |packets: Vec<av1_hwenc::EncodedPacket>,
                             file: &mut File|
     -> std::io::Result<()> {
        for packet in packets {
            println!(
                "  packet {:3}: display={:3} type={:?} key={} show_existing={} {} bytes",
                packet.dts,
                packet.display_order,
                packet.frame_type,
                packet.is_key_frame,
                packet.show_existing,
                packet.data.len()
            );
            total_bytes += packet.data.len();
            num_packets += 1;
            file.write_all(&packet.data)?;
        }
        Ok(())
    };

    for n in 0..NUM_FRAMES {
        let packets = encoder.encode(gradient_frame(n), None)?;
        write_packets(packets, &mut file)?;
    }
    let packets = encoder.flush()?;
    write_packets(packets, &mut file)?;
    encoder.close()?;

    println!(
        "\nWrote {num_packets} packets, {total_bytes} bytes to {output_path}"
    );
    Ok(())
}
